//! Per-operation state handed to engines as callback objects.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::core::compression::common::{
    AskMode, ExtractCallback, OperationResult, ProgressCallback, PropId, PropValue, UpdateCallback,
};
use crate::core::file_ops::streams::{InFileStream, OutFileStream};
use crate::models::{ArchiveItem, EngineError, FileEntry};

/// Progress sink: `(completed, total) -> keep going`
pub type ProgressFn<'a> = dyn FnMut(u64, u64) -> bool + 'a;

fn aborted_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "operation aborted")
}

/// Shared bookkeeping for both directions
struct Ticker<'a> {
    progress: &'a mut ProgressFn<'a>,
    total: u64,
    completed: u64,
    cancelled: bool,
}

impl<'a> Ticker<'a> {
    fn new(progress: &'a mut ProgressFn<'a>) -> Self {
        Self {
            progress,
            total: 0,
            completed: 0,
            cancelled: false,
        }
    }

    fn set_total(&mut self, total: u64) {
        self.total = self.total.max(total);
        if self.cancelled {
            return;
        }
        if !(self.progress)(self.completed, self.total) {
            self.cancelled = true;
        }
    }

    fn set_completed(&mut self, completed: u64) -> Result<(), EngineError> {
        if self.cancelled {
            return Err(EngineError::Aborted);
        }
        self.completed = completed;
        // totals only ever move up
        if completed > self.total {
            self.total = completed;
        }
        if (self.progress)(self.completed, self.total) {
            Ok(())
        } else {
            self.cancelled = true;
            Err(EngineError::Aborted)
        }
    }
}

/// Resolve an archive-internal path below `root`
///
/// Empty, `.` and `..` components and drive prefixes are dropped, so the
/// result never escapes `root`. Returns `None` when nothing is left.
pub fn join_archive_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    let mut pushed = false;
    for part in relative.split(['/', '\\']) {
        if part.is_empty() || part == "." || part == ".." || part.ends_with(':') {
            continue;
        }
        path.push(part);
        pushed = true;
    }
    pushed.then_some(path)
}

/// Callback state for one extraction, probe or integrity test
pub struct ExtractContext<'a> {
    output_dir: &'a Path,
    password: &'a str,
    items: &'a [ArchiveItem],
    ticker: Ticker<'a>,
    password_requested: bool,
    pending_time: Option<(PathBuf, SystemTime)>,
    failures: Vec<(u32, OperationResult)>,
    files_written: u32,
}

impl<'a> ExtractContext<'a> {
    pub fn new(
        output_dir: &'a Path,
        password: &'a str,
        items: &'a [ArchiveItem],
        progress: &'a mut ProgressFn<'a>,
    ) -> Self {
        Self {
            output_dir,
            password,
            items,
            ticker: Ticker::new(progress),
            password_requested: false,
            pending_time: None,
            failures: Vec::new(),
            files_written: 0,
        }
    }

    pub fn password_requested(&self) -> bool {
        self.password_requested
    }

    pub fn cancelled(&self) -> bool {
        self.ticker.cancelled
    }

    pub fn completed(&self) -> u64 {
        self.ticker.completed
    }

    pub fn files_written(&self) -> u32 {
        self.files_written
    }

    pub fn failures(&self) -> &[(u32, OperationResult)] {
        &self.failures
    }
}

impl ProgressCallback for ExtractContext<'_> {
    fn set_total(&mut self, total: u64) {
        self.ticker.set_total(total);
    }

    fn set_completed(&mut self, completed: u64) -> Result<(), EngineError> {
        self.ticker.set_completed(completed)
    }
}

impl ExtractCallback for ExtractContext<'_> {
    fn get_stream(&mut self, index: u32, mode: AskMode) -> io::Result<Option<Box<dyn Write>>> {
        if self.ticker.cancelled {
            return Err(aborted_error());
        }
        if mode == AskMode::Test {
            return Ok(Some(Box::new(io::sink())));
        }

        let item = match self.items.get(index as usize) {
            Some(item) => item,
            None => return Ok(None),
        };
        let path = match join_archive_path(self.output_dir, &item.path) {
            Some(path) => path,
            None => {
                tracing::warn!(item = %item.path, "skipping item with empty path");
                return Ok(None);
            }
        };

        if item.is_dir {
            fs::create_dir_all(&path)?;
            return Ok(None);
        }

        tracing::debug!(path = %path.display(), "extracting");
        let out = OutFileStream::create(&path)?;
        self.pending_time = item.modified.map(|t| (path, t));
        self.files_written += 1;
        Ok(Some(Box::new(out)))
    }

    fn crypto_password(&mut self) -> Option<String> {
        self.password_requested = true;
        Some(self.password.to_string())
    }

    fn set_operation_result(&mut self, index: u32, result: OperationResult) {
        let pending = self.pending_time.take();
        if result != OperationResult::Ok {
            tracing::debug!(index, ?result, "item failed");
            self.failures.push((index, result));
            return;
        }
        if let Some((path, modified)) = pending {
            let applied = File::options()
                .write(true)
                .open(&path)
                .and_then(|f| f.set_modified(modified));
            if let Err(e) = applied {
                tracing::warn!(path = %path.display(), "failed to set modification time: {}", e);
            }
        }
    }
}

/// Callback state for one compression
pub struct UpdateContext<'a> {
    entries: &'a [FileEntry],
    ticker: Ticker<'a>,
    failures: Vec<(u32, OperationResult)>,
}

impl<'a> UpdateContext<'a> {
    pub fn new(entries: &'a [FileEntry], progress: &'a mut ProgressFn<'a>) -> Self {
        Self {
            entries,
            ticker: Ticker::new(progress),
            failures: Vec::new(),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.ticker.cancelled
    }

    pub fn completed(&self) -> u64 {
        self.ticker.completed
    }
}

impl ProgressCallback for UpdateContext<'_> {
    fn set_total(&mut self, total: u64) {
        self.ticker.set_total(total);
    }

    fn set_completed(&mut self, completed: u64) -> Result<(), EngineError> {
        self.ticker.set_completed(completed)
    }
}

impl UpdateCallback for UpdateContext<'_> {
    fn item_count(&self) -> u32 {
        self.entries.len() as u32
    }

    fn property(&self, index: u32, prop: PropId) -> PropValue {
        let entry = match self.entries.get(index as usize) {
            Some(entry) => entry,
            None => return PropValue::Empty,
        };
        match prop {
            PropId::Path => PropValue::Str(entry.relative_path.clone()),
            PropId::IsDir => PropValue::Bool(entry.is_dir),
            PropId::Size => PropValue::U64(entry.size),
            PropId::Modified => PropValue::Time(entry.modified),
            PropId::Attributes => PropValue::U32(entry.windows_attributes()),
            PropId::PackedSize | PropId::Encrypted | PropId::Crc => PropValue::Empty,
        }
    }

    fn get_stream(&mut self, index: u32) -> io::Result<Option<Box<dyn Read>>> {
        if self.ticker.cancelled {
            return Err(aborted_error());
        }
        match self.entries.get(index as usize) {
            Some(entry) if !entry.is_dir => {
                tracing::debug!(path = %entry.full_path.display(), "compressing");
                Ok(Some(Box::new(InFileStream::open(&entry.full_path)?)))
            }
            _ => Ok(None),
        }
    }

    fn set_operation_result(&mut self, index: u32, result: OperationResult) {
        if result != OperationResult::Ok {
            self.failures.push((index, result));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_join_archive_path_stays_inside_root() {
        let root = Path::new("/out");
        assert_eq!(join_archive_path(root, "a/b.txt"), Some(PathBuf::from("/out/a/b.txt")));
        assert_eq!(join_archive_path(root, "a\\b.txt"), Some(PathBuf::from("/out/a/b.txt")));
        assert_eq!(join_archive_path(root, "../../etc/passwd"), Some(PathBuf::from("/out/etc/passwd")));
        assert_eq!(join_archive_path(root, "/abs/x"), Some(PathBuf::from("/out/abs/x")));
        assert_eq!(join_archive_path(root, "C:/x"), Some(PathBuf::from("/out/x")));
        assert_eq!(join_archive_path(root, "./"), None);
    }

    #[test]
    fn test_ticker_revises_total_upward_and_stops() {
        let mut seen = Vec::new();
        let mut sink = |completed: u64, total: u64| {
            seen.push((completed, total));
            completed < 30
        };
        {
            let mut ticker = Ticker::new(&mut sink);
            ticker.set_total(20);
            assert!(ticker.set_completed(10).is_ok());
            assert!(ticker.set_completed(25).is_ok());
            assert!(ticker.set_completed(30).is_err());
            assert!(ticker.set_completed(31).is_err());
            ticker.set_total(5);
            assert_eq!(ticker.total, 30);
        }
        assert_eq!(seen, vec![(0, 20), (10, 20), (25, 25), (30, 30)]);
    }

    #[test]
    fn test_extract_context_creates_directories_and_files() {
        let temp_dir = TempDir::new().unwrap();
        let items = vec![
            ArchiveItem {
                path: "docs".into(),
                size: 0,
                packed_size: 0,
                is_dir: true,
                is_encrypted: false,
                modified: None,
                crc: None,
            },
            ArchiveItem {
                path: "docs/a.txt".into(),
                size: 3,
                packed_size: 3,
                is_dir: false,
                is_encrypted: false,
                modified: Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000)),
                crc: None,
            },
        ];
        let mut sink = |_: u64, _: u64| true;
        let mut context = ExtractContext::new(temp_dir.path(), "", &items, &mut sink);

        assert!(context.get_stream(0, AskMode::Extract).unwrap().is_none());
        assert!(temp_dir.path().join("docs").is_dir());

        let mut out = context.get_stream(1, AskMode::Extract).unwrap().unwrap();
        out.write_all(b"abc").unwrap();
        drop(out);
        context.set_operation_result(1, OperationResult::Ok);

        let path = temp_dir.path().join("docs/a.txt");
        assert_eq!(fs::read(&path).unwrap(), b"abc");
        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(modified, SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000));
        assert!(!context.password_requested());
        assert_eq!(context.files_written(), 1);
    }
}
