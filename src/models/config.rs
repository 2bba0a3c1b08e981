use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::compression::FormatId;
use crate::models::CtxError;

/// Environment variable overriding the password file location
pub const PASSWORD_FILE_ENV: &str = "CTXARC_PASSWORD_FILE";

const APP_DIR: &str = "ctxarc";
const PASSWORD_FILE_NAME: &str = "passwords.txt";

/// Runtime configuration
///
/// Read from a JSON file; every field is optional and falls back to its default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Password store location (default: `~/.local/share/ctxarc/passwords.txt`)
    pub password_file: Option<PathBuf>,
    /// Bytes from the start of an archive searched for its signature
    pub probe_window: u64,
    /// Upper bound of the pause back-off interval
    pub pause_poll_ms: u64,
    /// Format used for compression when the output has no known extension
    pub default_format: String,
    /// Stop prompting after this many rejected passwords (unbounded if absent)
    pub max_password_prompts: Option<u32>,
    /// Traverse symbolic links found while collecting files to compress
    pub follow_links: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            password_file: None,
            probe_window: 1 << 22,
            pause_poll_ms: 100,
            default_format: "7z".to_string(),
            max_password_prompts: None,
            follow_links: true,
        }
    }
}

impl AppConfig {
    /// Load configuration
    ///
    /// # Arguments
    /// * `explicit` - Config file given on the command line; must exist
    ///
    /// # Behavior
    /// - Without an explicit file, `~/.config/ctxarc/config.json` is read when present
    /// - Otherwise defaults are used
    pub fn load(explicit: Option<&Path>) -> Result<Self, CtxError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, CtxError> {
        let text = fs::read_to_string(path).map_err(|e| {
            CtxError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: AppConfig = serde_json::from_str(&text).map_err(|e| {
            CtxError::InvalidConfig(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    fn validate(&self) -> Result<(), CtxError> {
        if self.probe_window == 0 {
            return Err(CtxError::InvalidConfig("probeWindow must be positive".into()));
        }
        if self.pause_poll_ms == 0 {
            return Err(CtxError::InvalidConfig("pausePollMs must be positive".into()));
        }
        if FormatId::from_name(&self.default_format).is_none() {
            return Err(CtxError::InvalidConfig(format!(
                "unknown defaultFormat: {}",
                self.default_format
            )));
        }
        Ok(())
    }

    pub fn default_format_id(&self) -> FormatId {
        FormatId::from_name(&self.default_format).unwrap_or(FormatId::SevenZ)
    }

    /// Effective password file: environment, then config, then the data directory.
    pub fn password_file_path(&self) -> PathBuf {
        if let Some(path) = std::env::var_os(PASSWORD_FILE_ENV) {
            return PathBuf::from(path);
        }
        if let Some(path) = &self.password_file {
            return path.clone();
        }
        match home::home_dir() {
            Some(home) => home
                .join(".local")
                .join("share")
                .join(APP_DIR)
                .join(PASSWORD_FILE_NAME),
            None => PathBuf::from(PASSWORD_FILE_NAME),
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(".config").join(APP_DIR).join("config.json"))
}
