//! Scoped deletion of partially-written files.

use std::path::{Path, PathBuf};

/// Owns a filesystem path for the duration of one fetch attempt.
///
/// Dropping the guard removes the file (best-effort) unless [`commit`] was
/// called, so a failed download, decode, or prepare never leaves partial
/// artifacts behind.
///
/// [`commit`]: FileGuard::commit
#[must_use = "dropping the guard immediately deletes the file"]
pub struct FileGuard {
    path: PathBuf,
    committed: bool,
}

impl FileGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            committed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file; ownership passes to the cache record being published.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_removes_uncommitted_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("partial.img");
        std::fs::write(&path, b"partial").unwrap();

        {
            let _guard = FileGuard::new(&path);
        }

        assert!(!path.exists());
    }

    #[test]
    fn commit_keeps_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("done.img");
        std::fs::write(&path, b"done").unwrap();

        let guard = FileGuard::new(&path);
        guard.commit();

        assert!(path.exists());
    }

    #[test]
    fn drop_tolerates_missing_file() {
        let _guard = FileGuard::new("/nonexistent/never-written.img");
    }
}
