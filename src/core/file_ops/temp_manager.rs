use std::io;
use std::path::Path;
use tempfile::TempDir;

/// Throwaway directory for probe extractions
///
/// Everything written below it is removed when the workspace is dropped,
/// whether or not the probe succeeded.
pub struct TempWorkspace {
    temp_dir: TempDir,
}

impl TempWorkspace {
    /// Create a new temporary workspace
    ///
    /// # Arguments
    /// * `label` - Short tag embedded in the directory name (for debugging)
    pub fn new(label: &str) -> io::Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("ctxarc_{}_", label))
            .tempdir()?;
        Ok(Self { temp_dir })
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}
