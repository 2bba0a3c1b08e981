use std::io;
use std::time::SystemTime;

use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::core::compression::common::{
    find_signature, normalize_item_path, pump_into, stream_item, unix_mode_from_attributes,
    ArchiveHandler, ExtractCallback, OpenOptions, OpenedArchive, OperationResult, Selection,
    UpdateCallback, UpdateItem,
};
use crate::core::compression::FormatId;
use crate::core::file_ops::streams::{InFileStream, OutFileStream};
use crate::models::{ArchiveItem, EngineError};

const LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const END_OF_CENTRAL_DIR: &[u8] = b"PK\x05\x06";

/// ZIP archive handler
///
/// Handles listing, extraction (including ZipCrypto and AES entries) and
/// creation of ZIP archives.
pub struct ZipHandler;

impl ZipHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ZipHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveHandler for ZipHandler {
    fn format(&self) -> FormatId {
        FormatId::Zip
    }

    fn matches_signature(&self, head: &[u8]) -> bool {
        head.starts_with(LOCAL_HEADER) || head.starts_with(END_OF_CENTRAL_DIR)
    }

    /// Read the central directory
    ///
    /// # Behavior
    /// - A local header or end record must appear within the probe window
    /// - Entry names that are not UTF-8 are decoded as GBK when that is
    ///   lossless, otherwise as CP437
    fn open(
        &self,
        mut stream: InFileStream,
        options: &OpenOptions,
    ) -> Result<Box<dyn OpenedArchive>, EngineError> {
        if find_signature(
            &mut stream,
            &[LOCAL_HEADER, END_OF_CENTRAL_DIR],
            options.max_check_start,
        )?
        .is_none()
        {
            return Err(EngineError::Unsupported("zip signature not found".into()));
        }

        let mut archive = ZipArchive::new(stream).map_err(map_open_error)?;
        let mut items = Vec::with_capacity(archive.len());

        for i in 0..archive.len() {
            let mut item = {
                let file = archive.by_index_raw(i).map_err(|e| {
                    EngineError::Corrupt(format!("Failed to read entry at index {}: {}", i, e))
                })?;
                ArchiveItem {
                    path: normalize_item_path(&decode_name(file.name_raw(), file.name())),
                    size: file.size(),
                    packed_size: file.compressed_size(),
                    is_dir: file.is_dir(),
                    is_encrypted: file.encrypted(),
                    modified: file.last_modified().and_then(zip_time_to_system),
                    crc: Some(file.crc32()),
                }
            };
            // AE-2 entries store a zero CRC; their data is authenticated by the AES MAC
            if item.is_encrypted && is_aes_entry(&mut archive, i) {
                item.crc = None;
            }
            items.push(item);
        }

        tracing::debug!(items = items.len(), "opened zip archive");
        Ok(Box::new(ZipArchiveHandle {
            archive: Some(archive),
            items,
        }))
    }

    /// Create a ZIP archive from the items the callback describes
    ///
    /// # Behavior
    /// - Already-compressed formats (PNG, JPG, MP3…) are stored without re-compression
    /// - Everything else uses Deflate
    /// - Unix permissions and modification times are kept when available
    fn update_items(
        &self,
        out: &mut OutFileStream,
        callback: &mut dyn UpdateCallback,
    ) -> Result<(), EngineError> {
        callback.set_total(UpdateItem::total_size(&*callback));

        let mut zip = ZipWriter::new(&mut *out);
        let mut completed = 0u64;

        for index in 0..callback.item_count() {
            let item = UpdateItem::fetch(&*callback, index);

            let method = if item.is_dir || is_already_compressed(&item.path) {
                CompressionMethod::Stored
            } else {
                CompressionMethod::Deflated
            };
            let mut options = FileOptions::<()>::default()
                .compression_method(method)
                .large_file(item.size >= u64::from(u32::MAX));
            if let Some(mode) = item.attributes.and_then(unix_mode_from_attributes) {
                options = options.unix_permissions(mode);
            }
            if let Some(modified) = item.modified.and_then(system_to_zip_time) {
                options = options.last_modified_time(modified);
            }

            if item.is_dir {
                zip.add_directory(item.path.as_str(), options)
                    .map_err(|e| EngineError::Codec(format!("Failed to add directory {}: {}", item.path, e)))?;
            } else {
                zip.start_file(item.path.as_str(), options)
                    .map_err(|e| EngineError::Codec(format!("Failed to start file {}: {}", item.path, e)))?;
                if let Some(source) = callback.get_stream(index)? {
                    pump_into(source, &mut zip, callback, &mut completed)?;
                }
            }
            callback.set_operation_result(index, OperationResult::Ok);
        }

        zip.finish()
            .map_err(|e| EngineError::Codec(format!("Failed to finalize ZIP archive: {}", e)))?;
        Ok(())
    }
}

struct ZipArchiveHandle {
    archive: Option<ZipArchive<InFileStream>>,
    items: Vec<ArchiveItem>,
}

impl OpenedArchive for ZipArchiveHandle {
    fn items(&self) -> &[ArchiveItem] {
        &self.items
    }

    fn extract(
        &mut self,
        indices: Option<&[u32]>,
        test_mode: bool,
        callback: &mut dyn ExtractCallback,
    ) -> Result<(), EngineError> {
        let archive = self
            .archive
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "zip archive is closed"))?;
        let selection = Selection::new(indices, self.items.len());
        callback.set_total(selection.total_size(&self.items));

        let mut password: Option<String> = None;
        let mut completed = 0u64;

        for (i, item) in self.items.iter().enumerate() {
            let index = i as u32;
            if !selection.contains(index) {
                continue;
            }
            if item.is_dir {
                stream_item(index, item, &mut io::empty(), test_mode, callback, &mut completed)?;
                continue;
            }

            let opened = if item.is_encrypted {
                let key = password.get_or_insert_with(|| callback.crypto_password().unwrap_or_default());
                archive.by_index_decrypt(i, key.as_bytes())
            } else {
                archive.by_index(i)
            };

            let mut file = match opened {
                Ok(file) => file,
                Err(ZipError::InvalidPassword) => {
                    callback.set_operation_result(index, OperationResult::WrongPassword);
                    return Err(EngineError::WrongPassword);
                }
                Err(ZipError::UnsupportedArchive(msg)) => {
                    callback.set_operation_result(index, OperationResult::Unsupported);
                    return Err(EngineError::Unsupported(msg.to_string()));
                }
                Err(e) => {
                    callback.set_operation_result(index, OperationResult::DataError);
                    return Err(EngineError::Codec(format!("Failed to read {}: {}", item.path, e)));
                }
            };

            stream_item(index, item, &mut file, test_mode, callback, &mut completed)?;
        }

        Ok(())
    }

    fn close(&mut self) {
        self.archive.take();
    }
}

fn map_open_error(e: ZipError) -> EngineError {
    match e {
        ZipError::UnsupportedArchive(msg) => EngineError::Unsupported(msg.to_string()),
        ZipError::Io(e) => EngineError::Io(e),
        other => EngineError::Corrupt(other.to_string()),
    }
}

fn is_aes_entry(archive: &mut ZipArchive<InFileStream>, index: usize) -> bool {
    match archive.get_aes_verification_key_and_salt(index) {
        Ok(info) => info.is_some(),
        Err(e) => {
            tracing::debug!(index, "cannot read AES header: {}", e);
            false
        }
    }
}

/// Decode an entry name, preferring UTF-8, then lossless GBK
fn decode_name(raw: &[u8], fallback: &str) -> String {
    if let Ok(name) = std::str::from_utf8(raw) {
        return name.to_string();
    }
    let (decoded, _, had_errors) = encoding_rs::GBK.decode(raw);
    if had_errors {
        fallback.to_string()
    } else {
        decoded.into_owned()
    }
}

fn zip_time_to_system(dt: DateTime) -> Option<SystemTime> {
    let month = time::Month::try_from(dt.month()).ok()?;
    let date = time::Date::from_calendar_date(i32::from(dt.year()), month, dt.day()).ok()?;
    let clock = time::Time::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    Some(time::PrimitiveDateTime::new(date, clock).assume_utc().into())
}

/// DOS timestamps only cover 1980..=2107; anything else is dropped
fn system_to_zip_time(t: SystemTime) -> Option<DateTime> {
    let t = time::OffsetDateTime::from(t);
    let year = u16::try_from(t.year()).ok()?;
    DateTime::from_date_and_time(year, u8::from(t.month()), t.day(), t.hour(), t.minute(), t.second())
        .ok()
}

/// Returns true for formats that are already compressed and won't benefit from Deflate.
fn is_already_compressed(name: &str) -> bool {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    matches!(
        ext.as_str(),
        "png" | "jpg" | "jpeg" | "gif" | "webp"
            | "mp3" | "mp4" | "ogg" | "aac" | "flac"
            | "zip" | "7z" | "rar" | "gz" | "xz" | "zst"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compression::common::{AskMode, ProgressCallback};
    use std::fs;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct ToDir {
        dir: PathBuf,
        password: Option<String>,
        asked: u32,
    }

    impl ProgressCallback for ToDir {
        fn set_total(&mut self, _total: u64) {}
        fn set_completed(&mut self, _completed: u64) -> Result<(), EngineError> {
            Ok(())
        }
    }

    impl ExtractCallback for ToDir {
        fn get_stream(&mut self, index: u32, _mode: AskMode) -> io::Result<Option<Box<dyn Write>>> {
            Ok(Some(Box::new(fs::File::create(self.dir.join(format!("item{}", index)))?)))
        }
        fn crypto_password(&mut self) -> Option<String> {
            self.asked += 1;
            self.password.clone()
        }
        fn set_operation_result(&mut self, _index: u32, _result: OperationResult) {}
    }

    fn write_encrypted_zip(path: &Path, password: &str) {
        let file = fs::File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::<()>::default().with_aes_encryption(zip::AesMode::Aes256, password);
        zip.start_file("secret.txt", options).unwrap();
        zip.write_all(b"top secret").unwrap();
        zip.start_file("other.txt", options).unwrap();
        zip.write_all(b"also secret").unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn test_supports() {
        let handler = ZipHandler::new();
        assert!(handler.supports(Path::new("archive.zip")));
        assert!(handler.supports(Path::new("ARCHIVE.ZIP")));
        assert!(!handler.supports(Path::new("archive.7z")));
        assert!(!handler.supports(Path::new("noextension")));
    }

    #[test]
    fn test_encrypted_entries_are_flagged() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("secret.zip");
        write_encrypted_zip(&path, "right");

        let stream = InFileStream::open(&path).unwrap();
        let archive = ZipHandler::new().open(stream, &OpenOptions::default()).unwrap();
        assert_eq!(archive.item_count(), 2);
        assert!(archive.items().iter().all(|i| i.is_encrypted));
        assert!(archive.items().iter().all(|i| i.crc.is_none()));
    }

    #[test]
    fn test_extract_with_password() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("secret.zip");
        write_encrypted_zip(&path, "right");

        let stream = InFileStream::open(&path).unwrap();
        let mut archive = ZipHandler::new().open(stream, &OpenOptions::default()).unwrap();

        let mut wrong = ToDir {
            dir: temp_dir.path().to_path_buf(),
            password: Some("wrong".into()),
            asked: 0,
        };
        assert!(matches!(
            archive.extract(None, false, &mut wrong),
            Err(EngineError::WrongPassword)
        ));

        let mut right = ToDir {
            dir: temp_dir.path().to_path_buf(),
            password: Some("right".into()),
            asked: 0,
        };
        archive.extract(None, false, &mut right).unwrap();
        assert_eq!(right.asked, 1);
        assert_eq!(fs::read(temp_dir.path().join("item0")).unwrap(), b"top secret");
        assert_eq!(fs::read(temp_dir.path().join("item1")).unwrap(), b"also secret");
    }

    #[test]
    fn test_time_conversion() {
        let dt = DateTime::from_date_and_time(2020, 2, 29, 13, 45, 10).unwrap();
        let system = zip_time_to_system(dt).unwrap();
        let back = system_to_zip_time(system).unwrap();
        assert_eq!(back.year(), 2020);
        assert_eq!(back.month(), 2);
        assert_eq!(back.day(), 29);
        assert_eq!(back.second(), 10);

        assert!(system_to_zip_time(SystemTime::UNIX_EPOCH).is_none());
    }

    #[test]
    fn test_decode_name() {
        assert_eq!(decode_name("plain.txt".as_bytes(), "plain.txt"), "plain.txt");
        // "中文" in GBK
        assert_eq!(decode_name(&[0xD6, 0xD0, 0xCE, 0xC4], "????"), "中文");
    }

    #[test]
    fn test_is_already_compressed() {
        assert!(is_already_compressed("photo.JPG"));
        assert!(is_already_compressed("nested.7z"));
        assert!(!is_already_compressed("notes.txt"));
    }
}
