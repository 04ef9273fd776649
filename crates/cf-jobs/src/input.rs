//! Ownership of uploaded input files.

use std::fmt;
use std::path::{Path, PathBuf};

use tempfile::TempPath;

/// Owns an input file and deletes it exactly once.
///
/// The guard travels with the job: from the upload handler into the queue,
/// and from the queue into the executor. Whichever holder lets go of it last
/// (success, failure, timeout, cancellation while queued, rejected
/// admission, or a panic unwinding through the executor) removes the file.
pub struct InputGuard {
    path: TempPath,
}

impl InputGuard {
    /// Take ownership of an existing temporary file.
    pub fn new(path: TempPath) -> Self {
        Self { path }
    }

    /// Take ownership of an arbitrary file on disk.
    pub fn adopt(path: impl Into<PathBuf>) -> Self {
        Self {
            path: TempPath::from_path(path.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the input now, reporting failures instead of swallowing them.
    pub fn release(self) {
        let shown = self.path.display().to_string();
        match self.path.close() {
            Ok(()) => tracing::debug!("removed input {shown}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("input {shown} was already gone");
            }
            Err(e) => tracing::warn!("failed to remove input {shown}: {e}"),
        }
    }
}

impl fmt::Debug for InputGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputGuard")
            .field("path", &self.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"video bytes").unwrap();
        path
    }

    #[test]
    fn release_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch(&dir, "a.mp4");
        let guard = InputGuard::adopt(&path);
        assert_eq!(guard.path(), path.as_path());
        guard.release();
        assert!(!path.exists());
    }

    #[test]
    fn drop_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch(&dir, "b.mp4");
        drop(InputGuard::adopt(&path));
        assert!(!path.exists());
    }

    #[test]
    fn release_of_missing_file_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch(&dir, "c.mp4");
        let guard = InputGuard::adopt(&path);
        std::fs::remove_file(&path).unwrap();
        guard.release();
    }

    #[test]
    fn panic_unwinding_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = scratch(&dir, "d.mp4");
        let guard = InputGuard::adopt(&path);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _held = guard;
            panic!("engine crashed");
        }));
        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn wraps_named_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        let guard = InputGuard::new(file.into_temp_path());
        let path = guard.path().to_path_buf();
        assert!(path.exists());
        guard.release();
        assert!(!path.exists());
    }
}
