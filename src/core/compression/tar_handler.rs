use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{EntryType, Header};

use crate::core::compression::common::{
    normalize_item_path, stream_item, unix_mode_from_attributes, ArchiveHandler, ExtractCallback,
    OpenOptions, OpenedArchive, OperationResult, ProgressReader, Selection, UpdateCallback,
    UpdateItem,
};
use crate::core::compression::FormatId;
use crate::core::file_ops::streams::{InFileStream, OutFileStream};
use crate::models::{ArchiveItem, EngineError};

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const USTAR_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8] = b"ustar";

/// Tar archive handler, plain or gzip-compressed
///
/// Only regular files and directories are listed; links and special
/// entries are skipped on both listing and extraction.
pub struct TarHandler {
    gzip: bool,
}

impl TarHandler {
    pub fn plain() -> Self {
        Self { gzip: false }
    }

    pub fn gzip() -> Self {
        Self { gzip: true }
    }
}

impl ArchiveHandler for TarHandler {
    fn format(&self) -> FormatId {
        if self.gzip {
            FormatId::TarGz
        } else {
            FormatId::Tar
        }
    }

    fn matches_signature(&self, head: &[u8]) -> bool {
        if self.gzip {
            head.starts_with(&GZIP_MAGIC)
        } else {
            head.get(USTAR_OFFSET..USTAR_OFFSET + USTAR_MAGIC.len()) == Some(USTAR_MAGIC)
        }
    }

    /// Walk every header once to build the item list
    fn open(
        &self,
        mut stream: InFileStream,
        options: &OpenOptions,
    ) -> Result<Box<dyn OpenedArchive>, EngineError> {
        let window = options.max_check_start.min(512) as usize;
        let mut head = vec![0u8; window];
        let n = read_up_to(&mut stream, &mut head)?;
        if !self.matches_signature(&head[..n]) {
            return Err(EngineError::Unsupported(format!(
                "{} signature not found",
                self.format().name()
            )));
        }

        stream.seek(SeekFrom::Start(0))?;
        let mut items = Vec::new();
        {
            let mut archive = tar::Archive::new(decoder(self.gzip, &mut stream));
            let entries = archive.entries().map_err(corrupt)?;
            for entry in entries {
                let entry = entry.map_err(corrupt)?;
                let header = entry.header();
                let entry_type = header.entry_type();
                if !is_listed(entry_type) {
                    continue;
                }
                let path = entry.path().map_err(corrupt)?;
                let size = if entry_type.is_dir() { 0 } else { entry.size() };
                items.push(ArchiveItem {
                    path: normalize_item_path(&path.to_string_lossy()),
                    size,
                    packed_size: size,
                    is_dir: entry_type.is_dir(),
                    is_encrypted: false,
                    modified: header
                        .mtime()
                        .ok()
                        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
                    crc: None,
                });
            }
        }

        tracing::debug!(items = items.len(), gzip = self.gzip, "opened tar archive");
        Ok(Box::new(TarArchive {
            stream,
            items,
            gzip: self.gzip,
        }))
    }

    fn update_items(
        &self,
        out: &mut OutFileStream,
        callback: &mut dyn UpdateCallback,
    ) -> Result<(), EngineError> {
        callback.set_total(UpdateItem::total_size(&*callback));

        if self.gzip {
            let encoder = write_entries(GzEncoder::new(&mut *out, Compression::default()), callback)?;
            encoder.finish()?;
        } else {
            write_entries(&mut *out, callback)?;
        }
        Ok(())
    }
}

struct TarArchive {
    stream: InFileStream,
    items: Vec<ArchiveItem>,
    gzip: bool,
}

impl OpenedArchive for TarArchive {
    fn items(&self) -> &[ArchiveItem] {
        &self.items
    }

    fn extract(
        &mut self,
        indices: Option<&[u32]>,
        test_mode: bool,
        callback: &mut dyn ExtractCallback,
    ) -> Result<(), EngineError> {
        let selection = Selection::new(indices, self.items.len());
        callback.set_total(selection.total_size(&self.items));

        self.stream.seek(SeekFrom::Start(0))?;
        let mut archive = tar::Archive::new(decoder(self.gzip, &mut self.stream));
        let mut completed = 0u64;
        let mut ordinal = 0u32;

        for entry in archive.entries().map_err(corrupt)? {
            let mut entry = entry.map_err(corrupt)?;
            if !is_listed(entry.header().entry_type()) {
                continue;
            }
            let index = ordinal;
            ordinal += 1;

            let item = match self.items.get(index as usize) {
                Some(item) => item,
                None => return Err(EngineError::Corrupt("archive changed since it was opened".into())),
            };
            if selection.contains(index) {
                stream_item(index, item, &mut entry, test_mode, callback, &mut completed)?;
            }
        }

        Ok(())
    }

    fn close(&mut self) {
        self.stream.close();
    }
}

fn decoder<'a>(gzip: bool, stream: &'a mut InFileStream) -> Box<dyn Read + 'a> {
    if gzip {
        Box::new(GzDecoder::new(stream))
    } else {
        Box::new(stream)
    }
}

fn is_listed(entry_type: EntryType) -> bool {
    entry_type.is_file() || entry_type.is_dir() || entry_type == EntryType::Continuous
}

fn corrupt(e: io::Error) -> EngineError {
    EngineError::Corrupt(e.to_string())
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn write_entries<W: Write>(sink: W, callback: &mut dyn UpdateCallback) -> Result<W, EngineError> {
    let mut builder = tar::Builder::new(sink);
    let mut completed = 0u64;

    for index in 0..callback.item_count() {
        let item = UpdateItem::fetch(&*callback, index);

        let mut header = Header::new_gnu();
        let default_mode = if item.is_dir { 0o755 } else { 0o644 };
        header.set_mode(item.attributes.and_then(unix_mode_from_attributes).unwrap_or(default_mode));
        header.set_mtime(
            item.modified
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs()),
        );

        if item.is_dir {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder
                .append_data(&mut header, format!("{}/", item.path), io::empty())
                .map_err(|e| EngineError::Codec(format!("Failed to add directory {}: {}", item.path, e)))?;
        } else {
            header.set_entry_type(EntryType::Regular);
            match callback.get_stream(index)? {
                Some(source) => {
                    header.set_size(item.size);
                    let mut reader = ProgressReader::new(source, &mut *callback, completed);
                    let appended = builder.append_data(&mut header, &item.path, &mut reader);
                    completed = reader.position();
                    if reader.aborted() {
                        return Err(EngineError::Aborted);
                    }
                    appended.map_err(|e| EngineError::Codec(format!("Failed to add {}: {}", item.path, e)))?;
                }
                None => {
                    header.set_size(0);
                    builder
                        .append_data(&mut header, &item.path, io::empty())
                        .map_err(|e| EngineError::Codec(format!("Failed to add {}: {}", item.path, e)))?;
                }
            }
        }
        callback.set_operation_result(index, OperationResult::Ok);
    }

    builder
        .into_inner()
        .map_err(|e| EngineError::Codec(format!("Failed to finalize tar archive: {}", e)))
}
