// Archive session: one open archive plus the operations run against it
pub mod callbacks;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::compression::common::{ArchiveHandler, OpenOptions, OpenedArchive};
use crate::core::compression::{FormatId, HandlerRegistry};
use crate::core::file_ops::streams::{InFileStream, OutFileStream};
use crate::core::file_ops::temp_manager::TempWorkspace;
use crate::core::password::PasswordProbe;
use crate::models::{ArchiveItem, CompressError, EngineError, ExtractError, FileEntry, OpenError};
use callbacks::{join_archive_path, ExtractContext, ProgressFn, UpdateContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Extracting,
    Compressing,
}

/// A handle on at most one open archive
///
/// Operations take `&mut self`, so a session runs one operation at a time.
/// Dropping the session closes the archive.
pub struct ArchiveSession {
    registry: Arc<HandlerRegistry>,
    options: OpenOptions,
    state: SessionState,
    archive: Option<Box<dyn OpenedArchive>>,
    path: Option<PathBuf>,
    format: Option<FormatId>,
    needs_password: bool,
    password_requested: bool,
}

impl ArchiveSession {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self::with_options(registry, OpenOptions::default())
    }

    pub fn with_options(registry: Arc<HandlerRegistry>, options: OpenOptions) -> Self {
        Self {
            registry,
            options,
            state: SessionState::Closed,
            archive: None,
            path: None,
            format: None,
            needs_password: false,
            password_requested: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn format(&self) -> Option<FormatId> {
        self.format
    }

    /// True when any item is encrypted or an engine asked for a key
    pub fn needs_password(&self) -> bool {
        self.needs_password
    }

    /// Whether the last probe or extraction asked for a password
    pub fn password_requested(&self) -> bool {
        self.password_requested
    }

    /// Open an archive, closing whatever was open before
    ///
    /// # Arguments
    /// * `path` - Archive file; its format comes from the extension, then
    ///   the leading bytes, then defaults to 7z
    ///
    /// # Returns
    /// * `Ok(())` - The session is `Open` and items can be listed
    /// * `Err(OpenError)` - The session is `Closed`
    pub fn open(&mut self, path: &Path) -> Result<(), OpenError> {
        self.close();
        self.state = SessionState::Opening;

        match self.open_archive(path) {
            Ok((archive, format)) => {
                let needs_password = archive.items().iter().any(|item| item.is_encrypted);
                tracing::info!(
                    path = %path.display(),
                    format = format.name(),
                    items = archive.item_count(),
                    needs_password,
                    "archive opened"
                );
                self.archive = Some(archive);
                self.path = Some(path.to_path_buf());
                self.format = Some(format);
                self.needs_password = needs_password;
                self.state = SessionState::Open;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "failed to open archive: {}", e);
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    fn open_archive(&self, path: &Path) -> Result<(Box<dyn OpenedArchive>, FormatId), OpenError> {
        let mut stream = InFileStream::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => OpenError::NotFound(path.to_path_buf()),
            _ => OpenError::Io(e),
        })?;

        let handler = self
            .registry
            .select_for_open(path, &mut stream)?
            .ok_or_else(|| OpenError::FormatUnsupported(path.display().to_string()))?;

        let archive = handler.open(stream, &self.options).map_err(|e| match e {
            EngineError::Unsupported(msg) => OpenError::FormatUnsupported(msg),
            EngineError::WrongPassword => {
                OpenError::FormatUnsupported("archive headers are encrypted".to_string())
            }
            EngineError::Io(e) => OpenError::Io(e),
            other => OpenError::Corrupt(other.to_string()),
        })?;

        Ok((archive, handler.format()))
    }

    fn expect_open(&self) -> Result<&dyn OpenedArchive, ExtractError> {
        match (&self.archive, self.state) {
            (Some(archive), SessionState::Open) => Ok(archive.as_ref()),
            _ => Err(ExtractError::InvalidState(self.state)),
        }
    }

    pub fn item_count(&self) -> Result<u32, ExtractError> {
        Ok(self.expect_open()?.item_count())
    }

    /// Snapshot of every item in archive order
    pub fn list_items(&self) -> Result<Vec<ArchiveItem>, ExtractError> {
        Ok(self.expect_open()?.items().to_vec())
    }

    /// Try one candidate password against a single item
    ///
    /// The first encrypted file item is decoded into a throwaway directory,
    /// or the first file item when none is flagged encrypted. An archive
    /// without file items accepts every candidate.
    pub fn test_password(&mut self, candidate: &str) -> bool {
        let items = match self.list_items() {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!("cannot probe password: {}", e);
                return false;
            }
        };
        let probe = items
            .iter()
            .position(|item| !item.is_dir && item.is_encrypted)
            .or_else(|| items.iter().position(|item| !item.is_dir));
        let index = match probe {
            Some(index) => index as u32,
            None => {
                self.password_requested = false;
                return true;
            }
        };

        let workspace = match TempWorkspace::new("probe") {
            Ok(workspace) => workspace,
            Err(e) => {
                tracing::warn!("failed to create probe directory: {}", e);
                return false;
            }
        };

        let mut keep_going = |_: u64, _: u64| true;
        let mut context = ExtractContext::new(workspace.path(), candidate, &items, &mut keep_going);
        let archive = match self.archive.as_mut() {
            Some(archive) => archive,
            None => return false,
        };

        self.state = SessionState::Extracting;
        let result = archive.extract(Some(&[index]), false, &mut context);
        self.state = SessionState::Open;

        self.password_requested = context.password_requested();
        if self.password_requested {
            self.needs_password = true;
        }
        tracing::debug!(
            item = %items[index as usize].path,
            accepted = result.is_ok(),
            requested = self.password_requested,
            "password probe"
        );
        result.is_ok()
    }

    /// Extract every item below `output_dir`
    pub fn extract(
        &mut self,
        output_dir: &Path,
        password: &str,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<(), ExtractError> {
        self.run_extract(None, Some(output_dir), password, on_progress)
    }

    /// Extract the given item indices below `output_dir`
    pub fn extract_items(
        &mut self,
        indices: &[u32],
        output_dir: &Path,
        password: &str,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<(), ExtractError> {
        self.run_extract(Some(indices), Some(output_dir), password, on_progress)
    }

    /// Decode every item without writing anything
    pub fn test_integrity(
        &mut self,
        password: &str,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<(), ExtractError> {
        self.run_extract(None, None, password, on_progress)
    }

    fn run_extract(
        &mut self,
        indices: Option<&[u32]>,
        output_dir: Option<&Path>,
        password: &str,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<(), ExtractError> {
        let items = self.list_items()?;
        if let Some(dir) = output_dir {
            fs::create_dir_all(dir)?;
        }
        let root = output_dir.unwrap_or_else(|| Path::new(""));

        let mut context = ExtractContext::new(root, password, &items, on_progress);
        let archive = self
            .archive
            .as_mut()
            .ok_or(ExtractError::InvalidState(SessionState::Closed))?;

        self.state = SessionState::Extracting;
        let result = archive.extract(indices, output_dir.is_none(), &mut context);
        self.state = SessionState::Open;

        let requested = context.password_requested();
        self.password_requested = requested;
        if requested {
            self.needs_password = true;
        }
        tracing::debug!(
            completed = context.completed(),
            files = context.files_written(),
            failures = context.failures().len(),
            "extraction finished"
        );
        classify_extract(result, context.cancelled(), requested)
    }

    /// Paths under `output_dir` that an extraction would overwrite
    pub fn conflicting_paths(&self, output_dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        Ok(self
            .expect_open()?
            .items()
            .iter()
            .filter(|item| !item.is_dir)
            .filter_map(|item| join_archive_path(output_dir, &item.path))
            .filter(|path| path.exists())
            .collect())
    }

    /// Write `entries` into a new archive at `output`
    ///
    /// # Behavior
    /// - The format is `format`, else the output extension, else 7z
    /// - Works from `Closed` or `Open`; an open archive stays open
    /// - Data goes to a staging file beside `output` that is renamed over it
    ///   only on success; on failure the staging file is deleted and an
    ///   existing `output` is left as it was
    pub fn compress(
        &mut self,
        entries: &[FileEntry],
        output: &Path,
        format: Option<FormatId>,
        on_progress: &mut ProgressFn<'_>,
    ) -> Result<(), CompressError> {
        if !matches!(self.state, SessionState::Closed | SessionState::Open) {
            return Err(CompressError::InvalidState(self.state));
        }
        let handler = self
            .registry
            .select_for_update(output, format, FormatId::SevenZ)
            .ok_or_else(|| CompressError::Engine(EngineError::Unsupported("no writable format".into())))?;

        tracing::info!(
            output = %output.display(),
            format = handler.format().name(),
            items = entries.len(),
            "compressing"
        );

        let previous = self.state;
        self.state = SessionState::Compressing;
        let result = write_archive(handler.as_ref(), entries, output, on_progress);
        self.state = previous;

        if let Err(e) = &result {
            tracing::warn!(output = %output.display(), "compression failed: {}", e);
        }
        result
    }

    /// Release the archive; safe to call repeatedly
    pub fn close(&mut self) {
        if let Some(mut archive) = self.archive.take() {
            archive.close();
            tracing::debug!(path = ?self.path, "archive closed");
        }
        self.path = None;
        self.format = None;
        self.needs_password = false;
        self.password_requested = false;
        self.state = SessionState::Closed;
    }
}

impl Drop for ArchiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl PasswordProbe for ArchiveSession {
    fn test_password(&mut self, candidate: &str) -> bool {
        ArchiveSession::test_password(self, candidate)
    }

    fn password_requested(&self) -> bool {
        self.password_requested
    }
}

fn write_archive(
    handler: &dyn ArchiveHandler,
    entries: &[FileEntry],
    output: &Path,
    on_progress: &mut ProgressFn<'_>,
) -> Result<(), CompressError> {
    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    // removed on drop unless persisted
    let staging = tempfile::Builder::new()
        .prefix(".ctxarc-")
        .suffix(".part")
        .tempfile_in(dir)?
        .into_temp_path();

    let mut out = OutFileStream::create(&staging)?;
    let mut context = UpdateContext::new(entries, on_progress);
    let result = handler.update_items(&mut out, &mut context);
    let closed = out.close();

    match result {
        Ok(()) => {
            closed?;
            staging.persist(output).map_err(|e| CompressError::Io(e.error))?;
            tracing::debug!(bytes = context.completed(), "archive written");
            Ok(())
        }
        Err(_) if context.cancelled() => Err(CompressError::Cancelled),
        Err(EngineError::Aborted) => Err(CompressError::Cancelled),
        Err(EngineError::Io(e)) => Err(CompressError::Io(e)),
        Err(e) => Err(CompressError::Engine(e)),
    }
}

/// Map an engine result onto the caller-facing error
///
/// Data errors count as a wrong password only when the engine asked for one.
fn classify_extract(
    result: Result<(), EngineError>,
    cancelled: bool,
    password_requested: bool,
) -> Result<(), ExtractError> {
    match result {
        Ok(()) if cancelled => Err(ExtractError::Cancelled),
        Ok(()) => Ok(()),
        Err(_) if cancelled => Err(ExtractError::Cancelled),
        Err(EngineError::Aborted) => Err(ExtractError::Cancelled),
        Err(EngineError::WrongPassword) => Err(ExtractError::WrongPassword),
        Err(e) if password_requested && e.is_data_error() => Err(ExtractError::WrongPassword),
        Err(EngineError::Io(e)) => Err(ExtractError::Io(e)),
        Err(e) => Err(ExtractError::Engine(e)),
    }
}
