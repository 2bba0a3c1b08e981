// Engine contract shared by every archive format

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::SystemTime;

use super::FormatId;
use crate::core::file_ops::streams::{InFileStream, OutFileStream};
use crate::models::item::FILE_ATTRIBUTE_UNIX_EXTENSION;
use crate::models::{ArchiveItem, EngineError};

/// Item properties exchanged across the engine boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropId {
    Path,
    IsDir,
    Size,
    PackedSize,
    Encrypted,
    Modified,
    Attributes,
    Crc,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Empty,
    Str(String),
    Bool(bool),
    U32(u32),
    U64(u64),
    Time(SystemTime),
}

impl PropValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropValue::U64(v) => Some(*v),
            PropValue::U32(v) => Some(u64::from(*v)),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            PropValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<SystemTime> {
        match self {
            PropValue::Time(t) => Some(*t),
            _ => None,
        }
    }
}

/// What the engine intends to do with an item's data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskMode {
    Extract,
    /// Decode and verify only
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Ok,
    Unsupported,
    DataError,
    CrcError,
    WrongPassword,
}

#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Bytes from the start of the file searched for the format signature
    pub max_check_start: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            max_check_start: 1 << 22,
        }
    }
}

/// Progress half of both callback protocols
pub trait ProgressCallback {
    fn set_total(&mut self, total: u64);

    /// Returns `Err(EngineError::Aborted)` when the operation must stop.
    fn set_completed(&mut self, completed: u64) -> Result<(), EngineError>;
}

/// Callbacks an engine drives while extracting or testing
pub trait ExtractCallback: ProgressCallback {
    /// Destination for one item; `None` skips the item's data.
    fn get_stream(&mut self, index: u32, mode: AskMode) -> io::Result<Option<Box<dyn Write>>>;

    /// Asked at most once per operation, before the first encrypted item.
    fn crypto_password(&mut self) -> Option<String>;

    fn set_operation_result(&mut self, index: u32, result: OperationResult);
}

/// Callbacks an engine drives while writing a new archive
pub trait UpdateCallback: ProgressCallback {
    fn item_count(&self) -> u32;

    fn property(&self, index: u32, prop: PropId) -> PropValue;

    /// Content of a file item, opened lazily
    fn get_stream(&mut self, index: u32) -> io::Result<Option<Box<dyn Read>>>;

    fn set_operation_result(&mut self, index: u32, result: OperationResult);
}

/// An archive whose headers have been parsed
pub trait OpenedArchive: Send {
    /// Item records cached at open time
    fn items(&self) -> &[ArchiveItem];

    fn item_count(&self) -> u32 {
        self.items().len() as u32
    }

    fn property(&self, index: u32, prop: PropId) -> PropValue {
        match self.items().get(index as usize) {
            Some(item) => item_property(item, prop),
            None => PropValue::Empty,
        }
    }

    /// Decode the selected items (all when `indices` is `None`) in archive order
    fn extract(
        &mut self,
        indices: Option<&[u32]>,
        test_mode: bool,
        callback: &mut dyn ExtractCallback,
    ) -> Result<(), EngineError>;

    fn close(&mut self);
}

/// Archive engine for one format
pub trait ArchiveHandler: Send + Sync {
    fn format(&self) -> FormatId;

    /// Check if this handler claims the given path by extension
    fn supports(&self, path: &Path) -> bool {
        FormatId::from_path(path) == Some(self.format())
    }

    /// Check the leading bytes of a file
    fn matches_signature(&self, head: &[u8]) -> bool;

    fn open(
        &self,
        stream: InFileStream,
        options: &OpenOptions,
    ) -> Result<Box<dyn OpenedArchive>, EngineError>;

    fn can_update(&self) -> bool {
        true
    }

    /// Write every item the callback describes into `out`
    fn update_items(
        &self,
        out: &mut OutFileStream,
        callback: &mut dyn UpdateCallback,
    ) -> Result<(), EngineError>;
}

pub fn item_property(item: &ArchiveItem, prop: PropId) -> PropValue {
    match prop {
        PropId::Path => PropValue::Str(item.path.clone()),
        PropId::IsDir => PropValue::Bool(item.is_dir),
        PropId::Size => PropValue::U64(item.size),
        PropId::PackedSize => PropValue::U64(item.packed_size),
        PropId::Encrypted => PropValue::Bool(item.is_encrypted),
        PropId::Modified => item.modified.map_or(PropValue::Empty, PropValue::Time),
        PropId::Attributes => PropValue::Empty,
        PropId::Crc => item.crc.map_or(PropValue::Empty, PropValue::U32),
    }
}

/// Indices chosen for one extraction
pub struct Selection {
    chosen: Option<Vec<bool>>,
}

impl Selection {
    pub fn new(indices: Option<&[u32]>, count: usize) -> Self {
        let chosen = indices.map(|indices| {
            let mut chosen = vec![false; count];
            for &index in indices {
                if let Some(slot) = chosen.get_mut(index as usize) {
                    *slot = true;
                }
            }
            chosen
        });
        Self { chosen }
    }

    pub fn contains(&self, index: u32) -> bool {
        match &self.chosen {
            Some(chosen) => chosen.get(index as usize).copied().unwrap_or(false),
            None => true,
        }
    }

    /// Bytes the selected file items will produce
    pub fn total_size(&self, items: &[ArchiveItem]) -> u64 {
        items
            .iter()
            .enumerate()
            .filter(|(i, item)| !item.is_dir && self.contains(*i as u32))
            .map(|(_, item)| item.size)
            .sum()
    }

    pub fn any_encrypted(&self, items: &[ArchiveItem]) -> bool {
        items
            .iter()
            .enumerate()
            .any(|(i, item)| item.is_encrypted && self.contains(i as u32))
    }
}

/// Reader that reports cumulative progress after every read
///
/// A stop request from the callback turns the read into an error before the
/// bytes are handed on, so nothing past the aborted tick is written.
pub struct ProgressReader<'a, R, C: ?Sized> {
    inner: R,
    callback: &'a mut C,
    position: u64,
    hasher: crc32fast::Hasher,
    aborted: bool,
}

impl<'a, R: Read, C: ProgressCallback + ?Sized> ProgressReader<'a, R, C> {
    pub fn new(inner: R, callback: &'a mut C, start: u64) -> Self {
        Self {
            inner,
            callback,
            position: start,
            hasher: crc32fast::Hasher::new(),
            aborted: false,
        }
    }

    /// Cumulative byte count including the starting offset
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// CRC-32 of the bytes read through this adapter
    pub fn crc(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

impl<R: Read, C: ProgressCallback + ?Sized> Read for ProgressReader<'_, R, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.aborted {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "operation aborted"));
        }
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.position += n as u64;
            if self.callback.set_completed(self.position).is_err() {
                self.aborted = true;
                return Err(io::Error::new(io::ErrorKind::Other, "operation aborted"));
            }
            self.hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}

/// Stream one decoded item into the destination the callback provides
///
/// # Behavior
/// - Directories get their stream request but no data
/// - A stored CRC, when known, is compared with the produced bytes
/// - Every outcome is reported through `set_operation_result`
pub fn stream_item(
    index: u32,
    item: &ArchiveItem,
    data: &mut dyn Read,
    test_mode: bool,
    callback: &mut dyn ExtractCallback,
    completed: &mut u64,
) -> Result<(), EngineError> {
    let mode = if test_mode { AskMode::Test } else { AskMode::Extract };
    let out = callback.get_stream(index, mode)?;

    let mut out = match out {
        Some(out) if !item.is_dir => out,
        _ => {
            callback.set_operation_result(index, OperationResult::Ok);
            return Ok(());
        }
    };

    let mut reader = ProgressReader::new(data, &mut *callback, *completed);
    let copied = io::copy(&mut reader, &mut out);
    let aborted = reader.aborted();
    let crc = reader.crc();
    *completed = reader.position();

    if aborted {
        return Err(EngineError::Aborted);
    }
    if let Err(e) = copied {
        callback.set_operation_result(index, OperationResult::DataError);
        return Err(EngineError::Codec(format!("Failed to decode {}: {}", item.path, e)));
    }
    out.flush()?;
    drop(out);

    if let Some(expected) = item.crc {
        if expected != crc {
            callback.set_operation_result(index, OperationResult::CrcError);
            return Err(EngineError::Checksum(item.path.clone()));
        }
    }

    callback.set_operation_result(index, OperationResult::Ok);
    Ok(())
}

/// Copy one file item into an archive writer with progress
pub fn pump_into<W: Write + ?Sized>(
    source: Box<dyn Read>,
    sink: &mut W,
    callback: &mut dyn UpdateCallback,
    completed: &mut u64,
) -> Result<(), EngineError> {
    let mut reader = ProgressReader::new(source, callback, *completed);
    let copied = io::copy(&mut reader, sink);
    *completed = reader.position();
    if reader.aborted() {
        return Err(EngineError::Aborted);
    }
    copied?;
    Ok(())
}

/// Search the first `window` bytes for any of `signatures`
///
/// Returns the offset of the earliest match and rewinds the reader.
pub fn find_signature<R: Read + Seek>(
    reader: &mut R,
    signatures: &[&[u8]],
    window: u64,
) -> io::Result<Option<u64>> {
    const CHUNK: usize = 64 * 1024;
    let longest = signatures.iter().map(|s| s.len()).max().unwrap_or(0);
    if longest == 0 {
        return Ok(None);
    }

    reader.seek(SeekFrom::Start(0))?;
    let mut buf: Vec<u8> = Vec::with_capacity(CHUNK + longest);
    let mut base = 0u64;
    let mut scanned = 0u64;
    let mut chunk = vec![0u8; CHUNK];
    let mut found = None;

    while scanned < window {
        let want = CHUNK.min((window - scanned) as usize);
        let n = reader.read(&mut chunk[..want])?;
        if n == 0 {
            break;
        }
        scanned += n as u64;
        buf.extend_from_slice(&chunk[..n]);

        let hit = (0..buf.len()).find(|&pos| {
            signatures
                .iter()
                .any(|sig| buf.len() - pos >= sig.len() && &buf[pos..pos + sig.len()] == *sig)
        });
        if let Some(pos) = hit {
            found = Some(base + pos as u64);
            break;
        }

        // keep a tail so signatures spanning two chunks are still seen
        let keep = (longest - 1).min(buf.len());
        let drop_len = buf.len() - keep;
        buf.drain(..drop_len);
        base += drop_len as u64;
    }

    reader.seek(SeekFrom::Start(0))?;
    Ok(found)
}

/// Unix permission bits carried in a 7z style attribute word
pub fn unix_mode_from_attributes(attributes: u32) -> Option<u32> {
    if attributes & FILE_ATTRIBUTE_UNIX_EXTENSION != 0 {
        Some((attributes >> 16) & 0o7777)
    } else {
        None
    }
}

/// Normalize an archive-internal path: `/` separators, no trailing slash
pub fn normalize_item_path(raw: &str) -> String {
    raw.replace('\\', "/").trim_end_matches('/').to_string()
}

/// Read typed properties of one update item, with defaults for absent values
pub struct UpdateItem {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub attributes: Option<u32>,
}

impl UpdateItem {
    pub fn fetch(callback: &dyn UpdateCallback, index: u32) -> Self {
        Self {
            path: callback
                .property(index, PropId::Path)
                .as_str()
                .map(normalize_item_path)
                .unwrap_or_default(),
            is_dir: callback.property(index, PropId::IsDir).as_bool().unwrap_or(false),
            size: callback.property(index, PropId::Size).as_u64().unwrap_or(0),
            modified: callback.property(index, PropId::Modified).as_time(),
            attributes: callback.property(index, PropId::Attributes).as_u32(),
        }
    }

    /// Bytes the update will read from file items
    pub fn total_size(callback: &dyn UpdateCallback) -> u64 {
        (0..callback.item_count())
            .map(|index| Self::fetch(callback, index))
            .filter(|item| !item.is_dir)
            .map(|item| item.size)
            .sum()
    }
}
