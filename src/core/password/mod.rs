// Remembered passwords and the machine that picks one for an archive
pub mod resolver;
pub mod store;

pub use resolver::{PasswordPrompt, PasswordProbe, PasswordResolver, Resolution, ResolutionState};
pub use store::{PasswordEntry, PasswordStore};
