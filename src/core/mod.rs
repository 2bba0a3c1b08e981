pub mod compression;
pub mod file_ops;
pub mod password;
pub mod session;
