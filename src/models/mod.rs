pub mod config;
pub mod error;
pub mod item;
pub mod task;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{CompressError, CtxError, EngineError, ExtractError, OpenError};
pub use item::{ArchiveItem, FileEntry};
pub use task::{CompressRequest, ExtractDestination, ExtractRequest, TransferOutcome};
