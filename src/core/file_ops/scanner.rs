use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::models::FileEntry;

/// Recursive scanner turning source paths into a flat compression list
///
/// Directories precede their descendants; children appear in the order the
/// directory is read. Relative paths start with the source's own name.
pub struct FileScanner {
    follow_links: bool,
}

impl FileScanner {
    pub fn new() -> Self {
        Self { follow_links: true }
    }

    /// Leave out symbolic links found below a source directory
    ///
    /// Sources named directly are still resolved.
    pub fn without_links() -> Self {
        Self {
            follow_links: false,
        }
    }

    /// Scan every source path
    ///
    /// # Arguments
    /// * `sources` - Files or directories selected by the user
    ///
    /// # Returns
    /// * Pre-ordered `FileEntry` list
    ///
    /// # Behavior
    /// - A missing source is a `NotFound` error
    /// - Unreadable subdirectories are skipped with a warning
    /// - Link cycles are detected by walkdir and skipped
    /// - Without link following, links inside directories are left out
    pub fn scan(&self, sources: &[PathBuf]) -> io::Result<Vec<FileEntry>> {
        let mut entries = Vec::new();

        for source in sources {
            let metadata = fs::metadata(source).map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to read source {}: {}", source.display(), e),
                )
            })?;
            let name = source_name(source);

            if !metadata.is_dir() {
                entries.push(make_entry(source, name, &metadata));
                continue;
            }

            for item in WalkDir::new(source).follow_links(self.follow_links) {
                let item = match item {
                    Ok(item) => item,
                    Err(e) => {
                        tracing::warn!("skipping unreadable path: {}", e);
                        continue;
                    }
                };

                if !self.follow_links && item.path_is_symlink() {
                    tracing::debug!(path = %item.path().display(), "skipping symbolic link");
                    continue;
                }

                let relative = match item.path().strip_prefix(source) {
                    Ok(relative) => relative,
                    Err(_) => continue,
                };
                let relative = if relative.as_os_str().is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", name, to_archive_path(relative))
                };

                match item.metadata() {
                    Ok(metadata) => entries.push(make_entry(item.path(), relative, &metadata)),
                    Err(e) => tracing::warn!(path = %item.path().display(), "skipping: {}", e),
                }
            }
        }

        tracing::debug!(count = entries.len(), "enumerated sources");
        Ok(entries)
    }

    /// Sum of file sizes; directories count as zero
    pub fn total_bytes(entries: &[FileEntry]) -> u64 {
        entries.iter().filter(|e| !e.is_dir).map(|e| e.size).sum()
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn source_name(source: &Path) -> String {
    match source.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        // "." or "/" style sources
        None => fs::canonicalize(source)
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "root".to_string()),
    }
}

/// Join path components with `/` regardless of platform
fn to_archive_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn make_entry(full_path: &Path, relative_path: String, metadata: &Metadata) -> FileEntry {
    let is_dir = metadata.is_dir();
    FileEntry {
        full_path: full_path.to_path_buf(),
        relative_path,
        is_dir,
        size: if is_dir { 0 } else { metadata.len() },
        modified: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
        attributes: platform_attributes(metadata),
    }
}

#[cfg(unix)]
fn platform_attributes(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(windows)]
fn platform_attributes(metadata: &Metadata) -> u32 {
    use std::os::windows::fs::MetadataExt;
    metadata.file_attributes()
}

#[cfg(not(any(unix, windows)))]
fn platform_attributes(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        crate::models::item::FILE_ATTRIBUTE_READONLY
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_structure() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path();

        fs::write(base.join("a.txt"), b"alpha").unwrap();
        fs::create_dir_all(base.join("b")).unwrap();
        fs::write(base.join("b/c.txt"), b"charlie!").unwrap();

        temp_dir
    }

    #[test]
    fn test_scan_file_and_directory() {
        let temp_dir = create_test_structure();
        let base = temp_dir.path();
        let scanner = FileScanner::new();

        let entries = scanner
            .scan(&[base.join("a.txt"), base.join("b")])
            .unwrap();

        let names: Vec<&str> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b", "b/c.txt"]);
        assert!(!entries[0].is_dir);
        assert!(entries[1].is_dir);
        assert_eq!(entries[1].size, 0);
        assert_eq!(entries[2].size, 8);
    }

    #[test]
    fn test_directory_precedes_descendants() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path();
        fs::create_dir_all(base.join("root/x/y/z")).unwrap();
        fs::create_dir_all(base.join("root/w")).unwrap();
        fs::write(base.join("root/x/y/z/deep.txt"), b"deep").unwrap();
        fs::write(base.join("root/w/one.txt"), b"1").unwrap();

        let entries = FileScanner::new().scan(&[base.join("root")]).unwrap();
        assert_eq!(entries[0].relative_path, "root");

        for (index, entry) in entries.iter().enumerate() {
            if let Some((parent, _)) = entry.relative_path.rsplit_once('/') {
                let parent_index = entries
                    .iter()
                    .position(|e| e.relative_path == parent)
                    .expect("parent must be listed");
                assert!(parent_index < index, "{} listed before its parent", entry.relative_path);
            }
        }
        assert_eq!(entries.len(), 7);
    }

    #[test]
    fn test_total_bytes() {
        let temp_dir = create_test_structure();
        let entries = FileScanner::new().scan(&[temp_dir.path().join("b"), temp_dir.path().join("a.txt")]).unwrap();
        assert_eq!(FileScanner::total_bytes(&entries), 13);
    }

    #[test]
    fn test_missing_source() {
        let err = FileScanner::new()
            .scan(&[PathBuf::from("/nonexistent/source")])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_subdirectory_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = create_test_structure();
        let locked = temp_dir.path().join("b/locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("hidden.txt"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let result = FileScanner::new().scan(&[temp_dir.path().join("b")]);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let entries = result.unwrap();
        assert!(entries.iter().any(|e| e.relative_path == "b/c.txt"));
        assert!(entries.iter().any(|e| e.relative_path == "b/locked"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle_terminates() {
        let temp_dir = create_test_structure();
        std::os::unix::fs::symlink(temp_dir.path().join("b"), temp_dir.path().join("b/loop")).unwrap();

        let entries = FileScanner::new().scan(&[temp_dir.path().join("b")]).unwrap();
        assert!(entries.iter().any(|e| e.relative_path == "b/c.txt"));
        assert!(entries.len() < 10);
    }

    #[cfg(unix)]
    #[test]
    fn test_without_links_leaves_links_out() {
        let temp_dir = create_test_structure();
        let base = temp_dir.path();
        std::os::unix::fs::symlink(base.join("a.txt"), base.join("b/a-link.txt")).unwrap();
        std::os::unix::fs::symlink(base.join("b"), base.join("b/again")).unwrap();

        let entries = FileScanner::without_links().scan(&[base.join("b")]).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(names, vec!["b", "b/c.txt"]);

        let followed = FileScanner::new().scan(&[base.join("b")]).unwrap();
        assert!(followed.iter().any(|e| e.relative_path == "b/a-link.txt" && e.size == 5));
    }
}
