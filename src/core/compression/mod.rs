// Archive engines and the registry that picks one per file
pub mod common;
pub mod tar_handler;
pub mod zip_handler;

#[path = "7z_handler.rs"]
pub mod sevenz_handler;

#[cfg(test)]
pub mod memory;

use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::file_ops::streams::InFileStream;
use common::ArchiveHandler;
use sevenz_handler::SevenZHandler;
use tar_handler::TarHandler;
use zip_handler::ZipHandler;

/// Bytes read from the head of a file when sniffing its format
const SNIFF_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatId {
    SevenZ,
    Zip,
    Tar,
    TarGz,
}

/// Static description of one archive format
#[derive(Debug, Clone, Copy)]
pub struct FormatInfo {
    pub id: FormatId,
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    pub can_update: bool,
}

pub static FORMATS: [FormatInfo; 4] = [
    FormatInfo {
        id: FormatId::SevenZ,
        name: "7z",
        extensions: &["7z"],
        can_update: true,
    },
    FormatInfo {
        id: FormatId::Zip,
        name: "zip",
        extensions: &["zip"],
        can_update: true,
    },
    FormatInfo {
        id: FormatId::Tar,
        name: "tar",
        extensions: &["tar"],
        can_update: true,
    },
    FormatInfo {
        id: FormatId::TarGz,
        name: "tar.gz",
        extensions: &["tar.gz", "tgz"],
        can_update: true,
    },
];

impl FormatId {
    pub fn info(self) -> &'static FormatInfo {
        match self {
            FormatId::SevenZ => &FORMATS[0],
            FormatId::Zip => &FORMATS[1],
            FormatId::Tar => &FORMATS[2],
            FormatId::TarGz => &FORMATS[3],
        }
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Primary extension, without the leading dot
    pub fn extension(self) -> &'static str {
        self.info().extensions[0]
    }

    /// Parse a user-supplied format name such as `7z`, `zip` or `tgz`
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim_start_matches('.').to_ascii_lowercase();
        FORMATS
            .iter()
            .find(|f| f.name == lower || f.extensions.contains(&lower.as_str()))
            .map(|f| f.id)
    }

    /// Detect format from a file name, longest extension first
    ///
    /// # Example
    /// ```ignore
    /// FormatId::from_path(Path::new("backup.tar.gz")) == Some(FormatId::TarGz)
    /// ```
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        let mut best: Option<(usize, FormatId)> = None;
        for format in &FORMATS {
            for ext in format.extensions {
                let suffix = format!(".{}", ext);
                if name.ends_with(&suffix) && name.len() > suffix.len() {
                    if best.map_or(true, |(len, _)| suffix.len() > len) {
                        best = Some((suffix.len(), format.id));
                    }
                }
            }
        }
        best.map(|(_, id)| id)
    }

    /// File name with the format's extension removed
    pub fn strip_extension(self, file_name: &str) -> String {
        let lower = file_name.to_ascii_lowercase();
        for ext in self.info().extensions {
            let suffix = format!(".{}", ext);
            if lower.ends_with(&suffix) && file_name.len() > suffix.len() {
                return file_name[..file_name.len() - suffix.len()].to_string();
            }
        }
        file_name.to_string()
    }
}

/// Registry of archive handlers
///
/// Handler selection:
/// 1. By file extension
/// 2. By signature sniffing when the extension is unknown
/// 3. Falling back to the 7z handler
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ArchiveHandler>>,
}

impl HandlerRegistry {
    /// Create a registry with all built-in handlers
    pub fn new() -> Self {
        Self::with_handlers(vec![
            Arc::new(SevenZHandler::new()),
            Arc::new(ZipHandler::new()),
            Arc::new(TarHandler::plain()),
            Arc::new(TarHandler::gzip()),
        ])
    }

    pub fn with_handlers(handlers: Vec<Arc<dyn ArchiveHandler>>) -> Self {
        Self { handlers }
    }

    pub fn handler(&self, format: FormatId) -> Option<Arc<dyn ArchiveHandler>> {
        self.handlers
            .iter()
            .find(|h| h.format() == format)
            .map(Arc::clone)
    }

    /// Handler claiming the path by extension
    pub fn handler_for_path(&self, path: &Path) -> Option<Arc<dyn ArchiveHandler>> {
        self.handlers
            .iter()
            .find(|h| h.supports(path))
            .map(Arc::clone)
    }

    /// Sniff the leading bytes of an open stream; the stream is rewound afterwards.
    pub fn detect<R: Read + Seek>(&self, stream: &mut R) -> io::Result<Option<Arc<dyn ArchiveHandler>>> {
        stream.seek(SeekFrom::Start(0))?;
        let mut head = Vec::with_capacity(SNIFF_LEN);
        stream.by_ref().take(SNIFF_LEN as u64).read_to_end(&mut head)?;
        stream.seek(SeekFrom::Start(0))?;

        Ok(self
            .handlers
            .iter()
            .find(|h| h.matches_signature(&head))
            .map(Arc::clone))
    }

    /// Choose the handler used to open `path`
    pub fn select_for_open(
        &self,
        path: &Path,
        stream: &mut InFileStream,
    ) -> io::Result<Option<Arc<dyn ArchiveHandler>>> {
        if let Some(handler) = self.handler_for_path(path) {
            return Ok(Some(handler));
        }
        if let Some(handler) = self.detect(stream)? {
            tracing::debug!(format = handler.format().name(), "format detected by signature");
            return Ok(Some(handler));
        }
        Ok(self.handler(FormatId::SevenZ))
    }

    /// Choose the handler used to write `output`
    ///
    /// An explicit format wins, then the output extension, then `default`.
    /// Formats that cannot be written fall back to 7z.
    pub fn select_for_update(
        &self,
        output: &Path,
        format: Option<FormatId>,
        default: FormatId,
    ) -> Option<Arc<dyn ArchiveHandler>> {
        let wanted = format
            .and_then(|f| self.handler(f))
            .or_else(|| self.handler_for_path(output))
            .or_else(|| self.handler(default));

        match wanted {
            Some(handler) if handler.can_update() => Some(handler),
            Some(handler) => {
                tracing::warn!(
                    format = handler.format().name(),
                    "format cannot be written, falling back to 7z"
                );
                self.handler(FormatId::SevenZ)
            }
            None => self.handler(FormatId::SevenZ),
        }
    }

    /// Check if a file is a supported archive format
    pub fn is_supported(&self, path: &Path) -> bool {
        self.handlers.iter().any(|h| h.supports(path))
    }

    pub fn formats(&self) -> Vec<&'static FormatInfo> {
        self.handlers.iter().map(|h| h.format().info()).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_format_from_path() {
        assert_eq!(FormatId::from_path(Path::new("a.7z")), Some(FormatId::SevenZ));
        assert_eq!(FormatId::from_path(Path::new("A.ZIP")), Some(FormatId::Zip));
        assert_eq!(FormatId::from_path(Path::new("a.tar")), Some(FormatId::Tar));
        assert_eq!(FormatId::from_path(Path::new("a.tar.gz")), Some(FormatId::TarGz));
        assert_eq!(FormatId::from_path(Path::new("a.tgz")), Some(FormatId::TarGz));
        assert_eq!(FormatId::from_path(Path::new("a.rar")), None);
        assert_eq!(FormatId::from_path(Path::new(".7z")), None);
    }

    #[test]
    fn test_format_from_name() {
        assert_eq!(FormatId::from_name("7z"), Some(FormatId::SevenZ));
        assert_eq!(FormatId::from_name(".zip"), Some(FormatId::Zip));
        assert_eq!(FormatId::from_name("tgz"), Some(FormatId::TarGz));
        assert_eq!(FormatId::from_name("tar.gz"), Some(FormatId::TarGz));
        assert_eq!(FormatId::from_name("rar"), None);
    }

    #[test]
    fn test_strip_extension() {
        assert_eq!(FormatId::TarGz.strip_extension("backup.tar.gz"), "backup");
        assert_eq!(FormatId::TarGz.strip_extension("backup.TGZ"), "backup");
        assert_eq!(FormatId::SevenZ.strip_extension("photos.7z"), "photos");
        assert_eq!(FormatId::Zip.strip_extension("noext"), "noext");
    }

    #[test]
    fn test_handler_for_path() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_supported(Path::new("test.zip")));
        assert!(registry.is_supported(Path::new("test.7z")));
        assert!(registry.is_supported(Path::new("test.tar.gz")));
        assert!(!registry.is_supported(Path::new("test.rar")));

        let handler = registry.handler_for_path(Path::new("x.tar.gz")).unwrap();
        assert_eq!(handler.format(), FormatId::TarGz);
    }

    #[test]
    fn test_detect_by_signature() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("archive.bin");
        let mut data = sevenz_handler::SIGNATURE.to_vec();
        data.extend_from_slice(&[0u8; 32]);
        fs::write(&path, &data).unwrap();

        let registry = HandlerRegistry::new();
        let mut stream = InFileStream::open(&path).unwrap();
        let handler = registry.select_for_open(&path, &mut stream).unwrap().unwrap();
        assert_eq!(handler.format(), FormatId::SevenZ);

        fs::write(&path, b"PK\x05\x06rest-of-record").unwrap();
        let mut stream = InFileStream::open(&path).unwrap();
        let handler = registry.select_for_open(&path, &mut stream).unwrap().unwrap();
        assert_eq!(handler.format(), FormatId::Zip);
    }

    #[test]
    fn test_unknown_content_falls_back_to_7z() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mystery.dat");
        fs::write(&path, b"nothing recognisable").unwrap();

        let registry = HandlerRegistry::new();
        let mut stream = InFileStream::open(&path).unwrap();
        let handler = registry.select_for_open(&path, &mut stream).unwrap().unwrap();
        assert_eq!(handler.format(), FormatId::SevenZ);
    }

    #[test]
    fn test_select_for_update() {
        let registry = HandlerRegistry::new();
        let pick = |out: &str, format| {
            registry
                .select_for_update(Path::new(out), format, FormatId::SevenZ)
                .unwrap()
                .format()
        };
        assert_eq!(pick("out.zip", None), FormatId::Zip);
        assert_eq!(pick("out.zip", Some(FormatId::Tar)), FormatId::Tar);
        assert_eq!(pick("out.unknown", None), FormatId::SevenZ);
    }
}
