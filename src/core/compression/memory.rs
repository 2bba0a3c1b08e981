//! In-memory engine for session and resolution tests.
//!
//! Serves a fixed item list for any `*.mem` file. Encrypted items decode to
//! scrambled bytes under a wrong key, so the CRC check fails the way a real
//! codec does.

use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::compression::common::{
    stream_item, ArchiveHandler, ExtractCallback, OpenOptions, OpenedArchive, Selection,
    UpdateCallback,
};
use crate::core::compression::FormatId;
use crate::core::file_ops::streams::{InFileStream, OutFileStream};
use crate::models::{ArchiveItem, EngineError};

#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub path: String,
    /// `None` marks a directory
    pub data: Option<Vec<u8>>,
    pub password: Option<String>,
}

impl MemoryEntry {
    pub fn file(path: &str, data: &[u8]) -> Self {
        Self {
            path: path.to_string(),
            data: Some(data.to_vec()),
            password: None,
        }
    }

    pub fn dir(path: &str) -> Self {
        Self {
            path: path.to_string(),
            data: None,
            password: None,
        }
    }

    pub fn encrypted(path: &str, data: &[u8], password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            ..Self::file(path, data)
        }
    }
}

pub struct MemoryHandler {
    entries: Vec<MemoryEntry>,
    /// Bytes handed out per read, so one item produces several progress ticks
    chunk: usize,
    pub extractions: Arc<AtomicUsize>,
}

impl MemoryHandler {
    pub fn new(entries: Vec<MemoryEntry>) -> Self {
        Self {
            entries,
            chunk: 4,
            extractions: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ArchiveHandler for MemoryHandler {
    fn format(&self) -> FormatId {
        FormatId::SevenZ
    }

    fn supports(&self, path: &Path) -> bool {
        path.extension().map_or(false, |e| e == "mem")
    }

    fn matches_signature(&self, head: &[u8]) -> bool {
        head.starts_with(b"MEMARC")
    }

    fn open(
        &self,
        stream: InFileStream,
        _options: &OpenOptions,
    ) -> Result<Box<dyn OpenedArchive>, EngineError> {
        let items = self
            .entries
            .iter()
            .map(|e| ArchiveItem {
                path: e.path.clone(),
                size: e.data.as_ref().map_or(0, |d| d.len() as u64),
                packed_size: e.data.as_ref().map_or(0, |d| d.len() as u64),
                is_dir: e.data.is_none(),
                is_encrypted: e.password.is_some(),
                modified: None,
                crc: e.data.as_ref().map(|d| crc32fast::hash(d)),
            })
            .collect();

        Ok(Box::new(MemoryArchive {
            _stream: stream,
            entries: self.entries.clone(),
            items,
            chunk: self.chunk,
            extractions: Arc::clone(&self.extractions),
        }))
    }

    fn can_update(&self) -> bool {
        false
    }

    fn update_items(
        &self,
        _out: &mut OutFileStream,
        _callback: &mut dyn UpdateCallback,
    ) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("memory archives are read-only".into()))
    }
}

struct MemoryArchive {
    _stream: InFileStream,
    entries: Vec<MemoryEntry>,
    items: Vec<ArchiveItem>,
    chunk: usize,
    extractions: Arc<AtomicUsize>,
}

impl OpenedArchive for MemoryArchive {
    fn items(&self) -> &[ArchiveItem] {
        &self.items
    }

    fn extract(
        &mut self,
        indices: Option<&[u32]>,
        test_mode: bool,
        callback: &mut dyn ExtractCallback,
    ) -> Result<(), EngineError> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        let selection = Selection::new(indices, self.items.len());
        callback.set_total(selection.total_size(&self.items));

        let mut password: Option<String> = None;
        let mut completed = 0u64;

        for (i, (entry, item)) in self.entries.iter().zip(&self.items).enumerate() {
            let index = i as u32;
            if !selection.contains(index) {
                continue;
            }
            let mut data = entry.data.clone().unwrap_or_default();
            if let Some(expected) = &entry.password {
                let key = password.get_or_insert_with(|| callback.crypto_password().unwrap_or_default());
                if key.as_str() != expected.as_str() {
                    for byte in &mut data {
                        *byte ^= 0x5A;
                    }
                }
            }
            let mut reader = ChunkedReader {
                data,
                pos: 0,
                chunk: self.chunk,
            };
            stream_item(index, item, &mut reader, test_mode, callback, &mut completed)?;
        }
        Ok(())
    }

    fn close(&mut self) {}
}

struct ChunkedReader {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len()).min(self.chunk);
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}
