use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::compression::common::OpenOptions;
use crate::core::compression::{FormatId, HandlerRegistry};
use crate::core::file_ops::scanner::FileScanner;
use crate::core::password::{PasswordPrompt, PasswordResolver, PasswordStore, Resolution};
use crate::core::session::ArchiveSession;
use crate::models::error::Result;
use crate::models::{
    AppConfig, ArchiveItem, CompressError, CompressRequest, CtxError, ExtractDestination,
    ExtractError, ExtractRequest, TransferOutcome,
};
use crate::utils::progress::ProgressTracker;

/// Questions the orchestrator may need answered mid-transfer
pub trait Interaction {
    /// `None` or an empty string abandons the archive
    fn prompt_password(&mut self, archive: &Path, attempt: u32) -> Option<String>;

    fn confirm_retry(&mut self) -> bool;

    /// Asked once with every file an extraction would replace
    fn confirm_overwrite(&mut self, conflicts: &[PathBuf]) -> bool;

    /// Called once every question is settled, right before data starts to stream
    fn transfer_starting(&mut self) {}

    /// Called after a password successfully decrypted an archive
    fn notify_password_used(&mut self, _password: &str) {}
}

struct PromptAdapter<'a> {
    archive: &'a Path,
    interaction: &'a mut dyn Interaction,
}

impl PasswordPrompt for PromptAdapter<'_> {
    fn prompt_password(&mut self, attempt: u32) -> Option<String> {
        self.interaction.prompt_password(self.archive, attempt)
    }

    fn confirm_retry(&mut self) -> bool {
        self.interaction.confirm_retry()
    }
}

/// Runs one extract, compress, list or test request at a time
///
/// Owns the handler registry and the password store for the whole process.
pub struct Orchestrator {
    registry: Arc<HandlerRegistry>,
    store: PasswordStore,
    config: AppConfig,
}

impl Orchestrator {
    pub fn new(registry: Arc<HandlerRegistry>, store: PasswordStore, config: AppConfig) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// Built-in handlers plus the configured password file
    pub fn from_config(config: AppConfig) -> Self {
        let store = PasswordStore::open(config.password_file_path());
        Self::new(Arc::new(HandlerRegistry::new()), store, config)
    }

    pub fn store(&self) -> &PasswordStore {
        &self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Fresh tracker honouring the configured pause interval
    pub fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::new(ProgressTracker::with_pause_poll(Duration::from_millis(
            self.config.pause_poll_ms,
        )))
    }

    fn session(&self) -> ArchiveSession {
        ArchiveSession::with_options(
            Arc::clone(&self.registry),
            OpenOptions {
                max_check_start: self.config.probe_window,
            },
        )
    }

    /// Extract an archive
    ///
    /// # Flow
    /// 1. Open the archive and work out the destination
    /// 2. Ask before overwriting existing files unless `request.overwrite`
    /// 3. Resolve a password when the archive is encrypted
    /// 4. Tell `interaction` the transfer starts; no question follows
    /// 5. Stream every item, reporting through `tracker`
    /// 6. Remember the password that worked
    ///
    /// A cancelled extraction leaves the files written so far in place.
    pub fn extract(
        &mut self,
        request: &ExtractRequest,
        interaction: &mut dyn Interaction,
        tracker: &ProgressTracker,
    ) -> Result<TransferOutcome> {
        let mut session = self.session();
        session.open(&request.archive)?;

        let destination = extract_destination(&request.archive, &request.destination);
        if !request.overwrite {
            let conflicts = session.conflicting_paths(&destination)?;
            if !conflicts.is_empty() && !interaction.confirm_overwrite(&conflicts) {
                tracing::info!(conflicts = conflicts.len(), "extraction skipped, overwrite declined");
                return Ok(TransferOutcome::Skipped);
            }
        }

        let password = self.resolve_password(&mut session, &request.archive, interaction)?;

        tracing::info!(
            archive = %request.archive.display(),
            destination = %destination.display(),
            "extracting"
        );
        interaction.transfer_starting();
        let mut sink = |completed: u64, total: u64| tracker.on_progress(completed, total);
        match session.extract(&destination, &password, &mut sink) {
            Ok(()) => {}
            Err(ExtractError::Cancelled) => {
                tracing::info!("extraction cancelled, partial output kept");
                return Ok(TransferOutcome::Cancelled);
            }
            Err(e) => return Err(e.into()),
        }

        if !password.is_empty() {
            self.store.record_use(&password);
            interaction.notify_password_used(&password);
        }

        Ok(TransferOutcome::Completed {
            path: destination,
            bytes: tracker.state().completed(),
            password: (!password.is_empty()).then_some(password),
        })
    }

    /// Decode every item of an archive without writing anything
    pub fn test(
        &mut self,
        archive: &Path,
        interaction: &mut dyn Interaction,
        tracker: &ProgressTracker,
    ) -> Result<TransferOutcome> {
        let mut session = self.session();
        session.open(archive)?;
        let password = self.resolve_password(&mut session, archive, interaction)?;

        interaction.transfer_starting();
        let mut sink = |completed: u64, total: u64| tracker.on_progress(completed, total);
        match session.test_integrity(&password, &mut sink) {
            Ok(()) => {}
            Err(ExtractError::Cancelled) => return Ok(TransferOutcome::Cancelled),
            Err(e) => return Err(e.into()),
        }

        if !password.is_empty() {
            self.store.record_use(&password);
            interaction.notify_password_used(&password);
        }
        tracing::info!(archive = %archive.display(), "archive is intact");
        Ok(TransferOutcome::Completed {
            path: archive.to_path_buf(),
            bytes: tracker.state().completed(),
            password: (!password.is_empty()).then_some(password),
        })
    }

    /// Items of an archive, in archive order
    pub fn list(&self, archive: &Path) -> Result<Vec<ArchiveItem>> {
        let mut session = self.session();
        session.open(archive)?;
        Ok(session.list_items()?)
    }

    /// Compress the request's sources into one archive
    ///
    /// Without an explicit output, a single source is archived beside itself
    /// under its own name (a file drops its extension) and several sources
    /// are named after their shared parent.
    /// A derived name never replaces an existing file; a numbered name is
    /// chosen instead. An explicit output is replaced only once the new
    /// archive is complete.
    pub fn compress(&self, request: &CompressRequest, tracker: &ProgressTracker) -> Result<TransferOutcome> {
        if request.sources.is_empty() {
            return Err(CtxError::NoSources);
        }

        let format = request.format.unwrap_or_else(|| {
            request
                .output
                .as_deref()
                .and_then(FormatId::from_path)
                .unwrap_or_else(|| self.config.default_format_id())
        });
        let output = match &request.output {
            Some(output) => output.clone(),
            None => unique_path(compress_output(&request.sources, format)),
        };

        let scanner = if self.config.follow_links {
            FileScanner::new()
        } else {
            FileScanner::without_links()
        };
        let entries = scanner.scan(&request.sources)?;
        if entries.is_empty() {
            return Err(CtxError::NoSources);
        }
        let total = FileScanner::total_bytes(&entries);

        let mut session = self.session();
        let mut sink = |completed: u64, total: u64| tracker.on_progress(completed, total);
        match session.compress(&entries, &output, Some(format), &mut sink) {
            Ok(()) => {
                tracing::info!(output = %output.display(), bytes = total, "archive created");
                Ok(TransferOutcome::Completed {
                    path: output,
                    bytes: total,
                    password: None,
                })
            }
            Err(CompressError::Cancelled) => Ok(TransferOutcome::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    fn resolve_password(
        &self,
        session: &mut ArchiveSession,
        archive: &Path,
        interaction: &mut dyn Interaction,
    ) -> Result<String> {
        if !session.needs_password() {
            return Ok(String::new());
        }

        let mut prompt = PromptAdapter { archive, interaction };
        let mut resolver = PasswordResolver::new().with_max_prompts(self.config.max_password_prompts);
        match resolver.resolve(session, &self.store, &mut prompt) {
            Resolution::Resolved(password) => {
                tracing::debug!(attempts = resolver.attempts(), "password resolved");
                Ok(password)
            }
            Resolution::GivenUp => Err(CtxError::PasswordGivenUp),
        }
    }
}

/// Directory an extraction writes into
///
/// `Subfolder` drops the archive extension, double ones such as `.tar.gz`
/// included.
pub fn extract_destination(archive: &Path, destination: &ExtractDestination) -> PathBuf {
    let parent = match archive.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    match destination {
        ExtractDestination::Here => parent,
        ExtractDestination::Explicit(dir) => dir.clone(),
        ExtractDestination::Subfolder => {
            let name = archive
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stem = match FormatId::from_path(archive) {
                Some(format) => format.strip_extension(&name),
                None => archive
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or(name),
            };
            parent.join(stem)
        }
    }
}

/// Default archive path for a set of sources
pub fn compress_output(sources: &[PathBuf], format: FormatId) -> PathBuf {
    let base = match sources {
        [single] => single.clone(),
        _ => {
            let first = sources.first().cloned().unwrap_or_default();
            match first.parent() {
                Some(parent) => match parent.file_name() {
                    Some(name) => parent.join(name),
                    None => parent.join("archive"),
                },
                None => PathBuf::from("archive"),
            }
        }
    };

    let stem = if base.is_file() {
        base.file_stem().map(|s| s.to_os_string())
    } else {
        base.file_name().map(|s| s.to_os_string())
    }
    .unwrap_or_else(|| "archive".into());

    let mut name = stem;
    name.push(".");
    name.push(format.extension());
    base.with_file_name(name)
}

/// `path`, or `name (2).ext`, `name (3).ext`, ... when taken
fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let format = FormatId::from_path(&path);
    let (stem, ext) = match format {
        Some(format) => {
            let stem = format.strip_extension(&name);
            let ext = name[stem.len()..].to_string();
            (stem, ext)
        }
        None => (name, String::new()),
    };

    (2u32..)
        .map(|n| path.with_file_name(format!("{} ({}){}", stem, n, ext)))
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}
