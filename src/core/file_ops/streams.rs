//! File-backed stream adapters handed to archive engines.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

fn closed_error(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("stream for {} is closed", path.display()),
    )
}

/// Seekable read adapter over an exclusively owned file
#[derive(Debug)]
pub struct InFileStream {
    file: Option<File>,
    path: PathBuf,
}

impl InFileStream {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length of the underlying file
    pub fn len(&self) -> io::Result<u64> {
        match &self.file {
            Some(file) => Ok(file.metadata()?.len()),
            None => Err(closed_error(&self.path)),
        }
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Release the file handle. Safe to call more than once.
    pub fn close(&mut self) {
        self.file.take();
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn file_mut(&mut self) -> io::Result<&mut File> {
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(closed_error(&self.path)),
        }
    }
}

impl Read for InFileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file_mut()?.read(buf)
    }
}

impl Seek for InFileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file_mut()?.seek(pos)
    }
}

/// Seekable write adapter; creates missing parent directories and truncates.
#[derive(Debug)]
pub struct OutFileStream {
    file: Option<File>,
    path: PathBuf,
}

impl OutFileStream {
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate or extend the file to `len` bytes
    pub fn set_size(&mut self, len: u64) -> io::Result<()> {
        self.file_mut()?.set_len(len)
    }

    /// Flush and release the file handle. Safe to call more than once.
    pub fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn file_mut(&mut self) -> io::Result<&mut File> {
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(closed_error(&self.path)),
        }
    }
}

impl Write for OutFileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_mut()?.flush()
    }
}

impl Seek for OutFileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file_mut()?.seek(pos)
    }
}

impl Drop for OutFileStream {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(path = %self.path.display(), "failed to flush on drop: {}", e);
        }
    }
}
