use std::io;
use std::time::SystemTime;

use sevenz_rust::nt_time::FileTime;
use sevenz_rust::{Archive, BlockDecoder, Password, SevenZArchiveEntry, SevenZWriter};

use crate::core::compression::common::{
    find_signature, normalize_item_path, stream_item, ArchiveHandler, ExtractCallback, OpenOptions,
    OpenedArchive, OperationResult, ProgressReader, Selection, UpdateCallback, UpdateItem,
};
use crate::core::compression::FormatId;
use crate::core::file_ops::streams::{InFileStream, OutFileStream};
use crate::models::{ArchiveItem, EngineError};

pub const SIGNATURE: [u8; 6] = [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];

/// Coder id of 7zAES (AES-256 + SHA-256 key derivation)
const AES_METHOD_ID: [u8; 4] = [0x06, 0xF1, 0x07, 0x01];

/// 7z archive handler
///
/// Reads and writes 7z archives using sevenz-rust. Encrypted content is
/// supported for reading; archives with encrypted headers are not.
pub struct SevenZHandler;

impl SevenZHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SevenZHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveHandler for SevenZHandler {
    fn format(&self) -> FormatId {
        FormatId::SevenZ
    }

    fn matches_signature(&self, head: &[u8]) -> bool {
        head.starts_with(&SIGNATURE)
    }

    /// Parse the archive headers
    ///
    /// # Behavior
    /// - The signature must sit at offset 0; one found later in the probe
    ///   window means a self-extracting stub, which is rejected
    /// - Item records and encryption flags are cached for listing
    fn open(
        &self,
        mut stream: InFileStream,
        options: &OpenOptions,
    ) -> Result<Box<dyn OpenedArchive>, EngineError> {
        match find_signature(&mut stream, &[&SIGNATURE], options.max_check_start)? {
            Some(0) => {}
            Some(offset) => {
                return Err(EngineError::Unsupported(format!(
                    "7z data starts at offset {}; self-extracting archives are not supported",
                    offset
                )))
            }
            None => return Err(EngineError::Unsupported("7z signature not found".into())),
        }

        let len = stream.len()?;
        let archive = Archive::read(&mut stream, len, &[]).map_err(|e| map_open_error(&e))?;
        let items = collect_items(&archive);

        tracing::debug!(
            items = items.len(),
            folders = archive.folders.len(),
            path = %stream.path().display(),
            "opened 7z archive"
        );
        Ok(Box::new(SevenZArchive {
            stream,
            archive,
            items,
        }))
    }

    /// Create a 7z archive from the items the callback describes
    ///
    /// # Behavior
    /// - Uses the writer's default LZMA2 settings
    /// - File data is pulled from the callback one item at a time
    fn update_items(
        &self,
        out: &mut OutFileStream,
        callback: &mut dyn UpdateCallback,
    ) -> Result<(), EngineError> {
        callback.set_total(UpdateItem::total_size(&*callback));

        let mut writer = SevenZWriter::new(&mut *out)
            .map_err(|e| EngineError::Codec(format!("Failed to create 7z writer: {}", e)))?;
        let mut completed = 0u64;

        for index in 0..callback.item_count() {
            let item = UpdateItem::fetch(&*callback, index);
            let mut entry = SevenZArchiveEntry::new();
            entry.name = item.path.clone();
            entry.is_directory = item.is_dir;
            entry.has_stream = !item.is_dir;
            if let Some(attributes) = item.attributes {
                entry.has_windows_attributes = true;
                entry.windows_attributes = attributes;
            }
            if let Some(modified) = item.modified.and_then(|t| FileTime::try_from(t).ok()) {
                entry.has_last_modified_date = true;
                entry.last_modified_date = modified;
            }

            let source = if item.is_dir { None } else { callback.get_stream(index)? };

            match source {
                None => {
                    entry.has_stream = false;
                    writer
                        .push_archive_entry::<&[u8]>(entry, None)
                        .map_err(|e| EngineError::Codec(format!("Failed to add {}: {}", item.path, e)))?;
                }
                Some(source) => {
                    let mut reader = ProgressReader::new(source, &mut *callback, completed);
                    let pushed = writer.push_archive_entry(entry, Some(&mut reader)).map(|_| ());
                    completed = reader.position();
                    if reader.aborted() {
                        return Err(EngineError::Aborted);
                    }
                    pushed.map_err(|e| EngineError::Codec(format!("Failed to add {}: {}", item.path, e)))?;
                }
            }
            callback.set_operation_result(index, OperationResult::Ok);
        }

        writer
            .finish()
            .map_err(|e| EngineError::Codec(format!("Failed to finalize 7z archive: {}", e)))?;
        Ok(())
    }
}

struct SevenZArchive {
    stream: InFileStream,
    archive: Archive,
    items: Vec<ArchiveItem>,
}

impl OpenedArchive for SevenZArchive {
    fn items(&self) -> &[ArchiveItem] {
        &self.items
    }

    /// Decode the selected items
    ///
    /// # Behavior
    /// - Only folders holding a selected item are decoded, and each stops
    ///   after its last selected item; data errors elsewhere in the archive
    ///   never reach the callback
    /// - Items without data (directories, empty files) are reported in
    ///   archive order alongside the decoded ones
    fn extract(
        &mut self,
        indices: Option<&[u32]>,
        test_mode: bool,
        callback: &mut dyn ExtractCallback,
    ) -> Result<(), EngineError> {
        let selection = Selection::new(indices, self.items.len());
        callback.set_total(selection.total_size(&self.items));

        let password = if selection.any_encrypted(&self.items) {
            callback.crypto_password().unwrap_or_default()
        } else {
            String::new()
        };
        let password = if password.is_empty() {
            Password::empty()
        } else {
            Password::from(password.as_str())
        };

        let archive = &self.archive;
        let items = &self.items;
        let mut completed = 0u64;
        let mut decoded = vec![false; archive.folders.len()];

        for index in 0..items.len() {
            if !selection.contains(index as u32) {
                continue;
            }
            let folder = archive.stream_map.file_folder_index.get(index).copied().flatten();
            match folder {
                None => {
                    stream_item(
                        index as u32,
                        &items[index],
                        &mut io::empty(),
                        test_mode,
                        &mut *callback,
                        &mut completed,
                    )?;
                }
                Some(folder) if decoded.get(folder) == Some(&false) => {
                    decoded[folder] = true;
                    decode_folder(
                        archive,
                        folder,
                        password.as_slice(),
                        &mut self.stream,
                        items,
                        &selection,
                        test_mode,
                        &mut *callback,
                        &mut completed,
                    )?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stream.close();
    }
}

/// Run one folder's decoder up to its last selected item
#[allow(clippy::too_many_arguments)]
fn decode_folder(
    archive: &Archive,
    folder: usize,
    password: &[u8],
    stream: &mut InFileStream,
    items: &[ArchiveItem],
    selection: &Selection,
    test_mode: bool,
    callback: &mut dyn ExtractCallback,
    completed: &mut u64,
) -> Result<(), EngineError> {
    let first = archive
        .stream_map
        .folder_first_file_index
        .get(folder)
        .copied()
        .ok_or_else(|| EngineError::Corrupt(format!("folder {} has no file table entry", folder)))?;
    let count = archive.folders[folder].num_unpack_sub_streams;
    let last = match (first..first + count).rev().find(|&i| selection.contains(i as u32)) {
        Some(last) => last,
        None => return Ok(()),
    };

    // the decoder hands out entries in file-table order starting at `first`
    let mut next = first;
    let mut failure: Option<EngineError> = None;
    let result = BlockDecoder::new(folder, archive, password, stream).for_each_entries(
        &mut |_entry: &SevenZArchiveEntry, data: &mut dyn io::Read| {
            let index = next;
            next += 1;
            let item = match items.get(index) {
                Some(item) if selection.contains(index as u32) => item,
                _ => {
                    io::copy(data, &mut io::sink()).map_err(sevenz_rust::Error::io)?;
                    return Ok(true);
                }
            };
            if let Err(e) = stream_item(index as u32, item, data, test_mode, &mut *callback, &mut *completed) {
                failure = Some(e);
                return Ok(false);
            }
            Ok(index < last)
        },
    );

    if let Some(e) = failure {
        return Err(e);
    }
    result.map(|_| ()).map_err(|e| map_extract_error(&e))
}

fn collect_items(archive: &Archive) -> Vec<ArchiveItem> {
    archive
        .files
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let is_encrypted = archive
                .stream_map
                .file_folder_index
                .get(i)
                .copied()
                .flatten()
                .and_then(|folder| archive.folders.get(folder))
                .map(|folder| {
                    folder
                        .coders
                        .iter()
                        .any(|coder| coder.decompression_method_id() == AES_METHOD_ID)
                })
                .unwrap_or(false);

            let modified = if entry.has_last_modified_date {
                let time: SystemTime = entry.last_modified_date().into();
                Some(time)
            } else {
                None
            };

            ArchiveItem {
                path: normalize_item_path(entry.name()),
                size: entry.size(),
                packed_size: entry.compressed_size,
                is_dir: entry.is_directory(),
                is_encrypted,
                modified,
                crc: if entry.has_crc { Some(entry.crc as u32) } else { None },
            }
        })
        .collect()
}

fn map_open_error(e: &sevenz_rust::Error) -> EngineError {
    match e {
        sevenz_rust::Error::PasswordRequired => {
            EngineError::Unsupported("archive headers are encrypted".into())
        }
        other => {
            let msg = other.to_string();
            if msg.contains("signature") || msg.contains("Unsupported") {
                EngineError::Unsupported(msg)
            } else {
                EngineError::Corrupt(msg)
            }
        }
    }
}

fn map_extract_error(e: &sevenz_rust::Error) -> EngineError {
    match e {
        sevenz_rust::Error::PasswordRequired => EngineError::WrongPassword,
        other => {
            let msg = other.to_string();
            if msg.contains("assword") {
                EngineError::WrongPassword
            } else {
                EngineError::Codec(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compression::common::{AskMode, ProgressCallback, PropId, PropValue};
    use std::fs;
    use std::io::{Read, Write};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Minimal update provider over (name, content) pairs; `None` content is a directory.
    struct Items(Vec<(String, Option<Vec<u8>>)>);

    impl ProgressCallback for Items {
        fn set_total(&mut self, _total: u64) {}
        fn set_completed(&mut self, _completed: u64) -> Result<(), EngineError> {
            Ok(())
        }
    }

    impl UpdateCallback for Items {
        fn item_count(&self) -> u32 {
            self.0.len() as u32
        }
        fn property(&self, index: u32, prop: PropId) -> PropValue {
            let (name, data) = &self.0[index as usize];
            match prop {
                PropId::Path => PropValue::Str(name.clone()),
                PropId::IsDir => PropValue::Bool(data.is_none()),
                PropId::Size => PropValue::U64(data.as_ref().map_or(0, |d| d.len() as u64)),
                _ => PropValue::Empty,
            }
        }
        fn get_stream(&mut self, index: u32) -> io::Result<Option<Box<dyn Read>>> {
            Ok(self.0[index as usize]
                .1
                .clone()
                .map(|d| Box::new(io::Cursor::new(d)) as Box<dyn Read>))
        }
        fn set_operation_result(&mut self, _index: u32, _result: OperationResult) {}
    }

    /// Extraction target collecting files under a directory
    struct ToDir(PathBuf, Vec<(u32, OperationResult)>);

    impl ProgressCallback for ToDir {
        fn set_total(&mut self, _total: u64) {}
        fn set_completed(&mut self, _completed: u64) -> Result<(), EngineError> {
            Ok(())
        }
    }

    impl ExtractCallback for ToDir {
        fn get_stream(&mut self, index: u32, _mode: AskMode) -> io::Result<Option<Box<dyn Write>>> {
            let path = self.0.join(format!("item{}", index));
            Ok(Some(Box::new(fs::File::create(path)?)))
        }
        fn crypto_password(&mut self) -> Option<String> {
            None
        }
        fn set_operation_result(&mut self, index: u32, result: OperationResult) {
            self.1.push((index, result));
        }
    }

    fn write_archive(path: &Path, items: Vec<(String, Option<Vec<u8>>)>) {
        let mut out = OutFileStream::create(path).unwrap();
        SevenZHandler::new().update_items(&mut out, &mut Items(items)).unwrap();
        out.close().unwrap();
    }

    #[test]
    fn test_supports() {
        let handler = SevenZHandler::new();
        assert!(handler.supports(Path::new("archive.7z")));
        assert!(handler.supports(Path::new("ARCHIVE.7Z")));
        assert!(!handler.supports(Path::new("archive.zip")));
        assert!(!handler.supports(Path::new("noextension")));
        assert!(handler.matches_signature(&SIGNATURE));
        assert!(!handler.matches_signature(b"PK\x03\x04"));
    }

    #[test]
    fn test_create_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("test.7z");
        write_archive(
            &archive_path,
            vec![
                ("docs".into(), None),
                ("docs/readme.txt".into(), Some(b"read me".to_vec())),
                ("notes.txt".into(), Some(b"n".to_vec())),
            ],
        );

        let stream = InFileStream::open(&archive_path).unwrap();
        let archive = SevenZHandler::new().open(stream, &OpenOptions::default()).unwrap();
        let items = archive.items();

        assert_eq!(items.len(), 3);
        let readme = items.iter().find(|i| i.path == "docs/readme.txt").unwrap();
        assert_eq!(readme.size, 7);
        assert!(!readme.is_encrypted);
        assert!(items.iter().any(|i| i.path == "docs" && i.is_dir));
    }

    #[test]
    fn test_extract_selected_item() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("test.7z");
        write_archive(
            &archive_path,
            vec![
                ("one.txt".into(), Some(b"first".to_vec())),
                ("two.txt".into(), Some(b"second".to_vec())),
            ],
        );

        let stream = InFileStream::open(&archive_path).unwrap();
        let mut archive = SevenZHandler::new().open(stream, &OpenOptions::default()).unwrap();
        let index = archive.items().iter().position(|i| i.path == "two.txt").unwrap() as u32;

        let out_dir = temp_dir.path().join("out");
        fs::create_dir_all(&out_dir).unwrap();
        let mut target = ToDir(out_dir.clone(), Vec::new());
        archive.extract(Some(&[index]), false, &mut target).unwrap();

        assert_eq!(fs::read(out_dir.join(format!("item{}", index))).unwrap(), b"second");
        assert_eq!(target.1, vec![(index, OperationResult::Ok)]);
        assert_eq!(fs::read_dir(&out_dir).unwrap().count(), 1);
    }

    #[test]
    fn test_open_rejects_other_data() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fake.7z");
        fs::write(&path, b"definitely not an archive").unwrap();

        let stream = InFileStream::open(&path).unwrap();
        let result = SevenZHandler::new().open(stream, &OpenOptions::default());
        assert!(matches!(result, Err(EngineError::Unsupported(_))));
    }
}
