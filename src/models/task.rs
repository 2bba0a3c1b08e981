use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::compression::FormatId;

/// Where an extraction writes its output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractDestination {
    /// The directory containing the archive
    Here,
    /// `<archive dir>/<archive stem>/`
    Subfolder,
    Explicit(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub archive: PathBuf,
    pub destination: ExtractDestination,
    /// Skip the overwrite confirmation
    pub overwrite: bool,
}

impl ExtractRequest {
    pub fn new(archive: impl Into<PathBuf>, destination: ExtractDestination) -> Self {
        Self {
            archive: archive.into(),
            destination,
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressRequest {
    pub sources: Vec<PathBuf>,
    /// Output archive; derived from the sources when absent
    pub output: Option<PathBuf>,
    pub format: Option<FormatId>,
}

impl CompressRequest {
    pub fn new(sources: Vec<PathBuf>) -> Self {
        Self {
            sources,
            output: None,
            format: None,
        }
    }
}

/// Result of a transfer that did not fail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum TransferOutcome {
    Completed {
        path: PathBuf,
        bytes: u64,
        /// Non-empty password used to decrypt, if any
        #[serde(skip)]
        password: Option<String>,
    },
    Cancelled,
    /// The user declined to overwrite existing files
    Skipped,
}

impl TransferOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TransferOutcome::Completed { .. })
    }
}
