//! Advisory directory locks.
//!
//! CNI configuration directories are shared with other tools, so conflist
//! edits hold an exclusive `flock` on the directory itself for the whole
//! read-modify-write.

use std::fs::File;
use std::path::{Path, PathBuf};

use rustix::fs::{FlockOperation, flock};
use tern_common::{TernError, TernResult};

/// Exclusive lock on a directory, released on drop.
#[derive(Debug)]
pub struct DirLock {
    dir: PathBuf,
    file: File,
}

impl DirLock {
    /// Block until the directory lock is acquired.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be opened or locked.
    pub fn acquire(dir: &Path) -> TernResult<Self> {
        let file = File::open(dir).map_err(|e| {
            TernError::Io(e).context(format!("open lock directory {}", dir.display()))
        })?;

        flock(&file, FlockOperation::LockExclusive).map_err(|e| {
            TernError::Io(e.into()).context(format!("lock directory {}", dir.display()))
        })?;

        tracing::trace!(dir = %dir.display(), "Directory lock acquired");
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
        })
    }

    /// The locked directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.file, FlockOperation::Unlock) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to release directory lock");
        }
    }
}

/// Run `f` while holding the lock on `dir`.
///
/// # Errors
///
/// Returns the lock error or whatever `f` returns.
pub fn with_dir_lock<T>(dir: &Path, f: impl FnOnce() -> TernResult<T>) -> TernResult<T> {
    let _lock = DirLock::acquire(dir)?;
    f()
}
