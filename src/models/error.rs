use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::core::session::SessionState;

/// Errors raised by an archive engine while decoding or encoding.
///
/// Engines never see the higher-level error types; the session maps these
/// onto `OpenError`, `ExtractError` or `CompressError`.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("operation aborted by callback")]
    Aborted,

    #[error("wrong password")]
    WrongPassword,

    #[error("unsupported archive: {0}")]
    Unsupported(String),

    #[error("corrupt archive: {0}")]
    Corrupt(String),

    #[error("checksum mismatch for {0}")]
    Checksum(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Data-level failures that an incorrect key typically produces.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            EngineError::Checksum(_) | EngineError::Codec(_) | EngineError::Corrupt(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("archive not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("unsupported archive format: {0}")]
    FormatUnsupported(String),

    #[error("corrupt archive: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("wrong password")]
    WrongPassword,

    #[error("extraction cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("engine error: {0}")]
    Engine(EngineError),

    #[error("invalid session state: {0:?}")]
    InvalidState(SessionState),
}

#[derive(Error, Debug)]
pub enum CompressError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("engine error: {0}")]
    Engine(EngineError),

    #[error("compression cancelled")]
    Cancelled,

    #[error("invalid session state: {0:?}")]
    InvalidState(SessionState),
}

/// Top-level error for one transfer request
#[derive(Error, Debug)]
pub enum CtxError {
    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Compress(#[from] CompressError),

    #[error("no working password was supplied")]
    PasswordGivenUp,

    #[error("nothing to compress")]
    NoSources,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = CtxError> = std::result::Result<T, E>;
