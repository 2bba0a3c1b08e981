use serde::Serialize;
use std::path::PathBuf;
use std::time::SystemTime;

pub const FILE_ATTRIBUTE_READONLY: u32 = 0x01;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x10;
/// Set when the high 16 bits carry a Unix mode
pub const FILE_ATTRIBUTE_UNIX_EXTENSION: u32 = 0x8000;

/// One entry of an opened archive as reported by the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveItem {
    /// Archive-internal path, `/` separated
    pub path: String,
    pub size: u64,
    pub packed_size: u64,
    pub is_dir: bool,
    pub is_encrypted: bool,
    #[serde(skip)]
    pub modified: Option<SystemTime>,
    pub crc: Option<u32>,
}

/// A filesystem object queued for compression
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Absolute (or caller-relative) location on disk
    pub full_path: PathBuf,
    /// Path inside the archive, always `/` separated
    pub relative_path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: SystemTime,
    /// Platform attribute bits: the mode on Unix, file attributes on Windows
    pub attributes: u32,
}

impl FileEntry {
    /// Attribute word in the convention 7z archives store.
    #[cfg(unix)]
    pub fn windows_attributes(&self) -> u32 {
        let mut attrs = (self.attributes << 16) | FILE_ATTRIBUTE_UNIX_EXTENSION;
        if self.is_dir {
            attrs |= FILE_ATTRIBUTE_DIRECTORY;
        }
        if self.attributes & 0o222 == 0 {
            attrs |= FILE_ATTRIBUTE_READONLY;
        }
        attrs
    }

    #[cfg(not(unix))]
    pub fn windows_attributes(&self) -> u32 {
        if self.is_dir {
            self.attributes | FILE_ATTRIBUTE_DIRECTORY
        } else {
            self.attributes
        }
    }

    /// Permission bits, when the platform has them
    pub fn unix_mode(&self) -> Option<u32> {
        if cfg!(unix) {
            Some(self.attributes & 0o7777)
        } else {
            None
        }
    }
}
