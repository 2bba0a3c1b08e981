use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// One remembered password and how often it opened an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordEntry {
    pub password: String,
    pub usage_count: u32,
}

/// Usage-ranked password list persisted as `count<TAB>password` lines
///
/// Every mutation is written through to disk. Write failures are logged and
/// the in-memory list stays usable for the rest of the process.
#[derive(Debug)]
pub struct PasswordStore {
    path: PathBuf,
    entries: Vec<PasswordEntry>,
}

impl PasswordStore {
    /// Create a store backed by `path` and load it
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let mut store = Self {
            path: path.into(),
            entries: Vec::new(),
        };
        store.load();
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory list with the file's contents
    ///
    /// # Behavior
    /// - A missing file gives an empty store
    /// - Lines without a tab, with a non-numeric count or an empty password
    ///   are skipped
    /// - A repeated password keeps its first occurrence
    pub fn load(&mut self) {
        self.entries.clear();
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no password file yet");
                return;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "failed to read password file: {}", e);
                return;
            }
        };

        let mut skipped = 0usize;
        for line in content.lines() {
            match parse_line(line) {
                Some(entry) if !self.entries.iter().any(|e| e.password == entry.password) => {
                    self.entries.push(entry);
                }
                _ => skipped += 1,
            }
        }
        self.sort();

        tracing::debug!(
            path = %self.path.display(),
            entries = self.entries.len(),
            skipped,
            "password file loaded"
        );
    }

    /// Passwords, most used first
    pub fn all_passwords(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.password.clone()).collect()
    }

    pub fn entries(&self) -> &[PasswordEntry] {
        &self.entries
    }

    pub fn usage_count(&self, password: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.password == password)
            .map(|e| e.usage_count)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count one successful use of `password` and persist the list
    pub fn record_use(&mut self, password: &str) {
        if password.is_empty() {
            return;
        }
        match self.entries.iter_mut().find(|e| e.password == password) {
            Some(entry) => entry.usage_count = entry.usage_count.saturating_add(1),
            None => self.entries.push(PasswordEntry {
                password: password.to_string(),
                usage_count: 1,
            }),
        }
        self.sort();

        if let Err(e) = self.save() {
            tracing::warn!(path = %self.path.display(), "failed to save password file: {}", e);
        }
    }

    /// Write the list through a sibling temp file renamed over the target
    pub fn save(&self) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut file = NamedTempFile::new_in(dir)?;
        for entry in &self.entries {
            writeln!(file, "{}\t{}", entry.usage_count, entry.password)?;
        }
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    fn sort(&mut self) {
        // stable: ties keep their current order
        self.entries.sort_by(|a, b| b.usage_count.cmp(&a.usage_count));
    }
}

fn parse_line(line: &str) -> Option<PasswordEntry> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let (count, password) = line.split_once('\t')?;
    let usage_count = count.trim().parse().ok()?;
    if password.is_empty() {
        return None;
    }
    Some(PasswordEntry {
        password: password.to_string(),
        usage_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = PasswordStore::open(temp_dir.path().join("passwords.txt"));
        assert!(store.is_empty());
        assert!(store.all_passwords().is_empty());
    }

    #[test]
    fn test_load_skips_bad_lines_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("passwords.txt");
        fs::write(
            &path,
            "1\talpha\nnot a line\n7\tbeta\nx\tgamma\n3\t\n7\tdelta\n2\talpha\n4\twith\ttab\r\n",
        )
        .unwrap();

        let store = PasswordStore::open(&path);
        assert_eq!(store.all_passwords(), vec!["beta", "delta", "with\ttab", "alpha"]);
        assert_eq!(store.usage_count("alpha"), Some(1));
        assert_eq!(store.usage_count("gamma"), None);
    }

    #[test]
    fn test_record_use_twice() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("passwords.txt");
        fs::write(&path, "1\tother\n").unwrap();

        let mut store = PasswordStore::open(&path);
        store.record_use("fresh");
        store.record_use("fresh");
        assert_eq!(store.usage_count("fresh"), Some(2));
        assert_eq!(store.all_passwords(), vec!["fresh", "other"]);

        let reloaded = PasswordStore::open(&path);
        assert_eq!(reloaded.entries(), store.entries());
        assert_eq!(fs::read_to_string(&path).unwrap(), "2\tfresh\n1\tother\n");
    }

    #[test]
    fn test_empty_password_never_stored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("passwords.txt");
        let mut store = PasswordStore::open(&path);
        store.record_use("");
        assert!(store.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/dir/passwords.txt");
        let mut store = PasswordStore::open(&path);
        store.record_use("pw");
        assert_eq!(fs::read_to_string(&path).unwrap(), "1\tpw\n");
    }

    #[test]
    fn test_save_failure_keeps_memory_state() {
        let temp_dir = TempDir::new().unwrap();
        // a directory in place of the file makes the rename fail
        let path = temp_dir.path().join("taken");
        fs::create_dir_all(path.join("child")).unwrap();

        let mut store = PasswordStore::open(&path);
        store.record_use("pw");
        assert_eq!(store.usage_count("pw"), Some(1));
    }
}
