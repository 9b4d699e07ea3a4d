//! Advisory file locks for cross-process exclusion.
//!
//! Lock files live in the per-target state directory:
//! - `update.lock`: one update session per target
//! - `monitor.lock`: one watchdog per target
//! - `restore.lock`: one restore per target
//! - `flag.lock`: serializes failure-flag transitions
//!
//! Locks are released when the [`FileLock`] is dropped. The lock file is
//! left in place; removing it would race with a concurrent acquirer.
//!
//! `flock` on unix, `LockFileEx` on Windows, both through `fs2`.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock held by another process: {0}")]
    Unavailable(PathBuf),

    #[error("lock I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<LockError> for gu_common::Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Unavailable(path) => {
                gu_common::Error::LockUnavailable(path.display().to_string())
            }
            LockError::Io { source, .. } => gu_common::Error::Io(source),
        }
    }
}

/// Held exclusive advisory lock.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Take the lock without waiting.
    pub fn try_acquire(path: &Path) -> Result<Self, LockError> {
        Self::acquire_inner(path, false)
    }

    /// Take the lock, waiting for the current holder to release it.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        Self::acquire_inner(path, true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn acquire_inner(path: &Path, blocking: bool) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)?;

        let locked = if blocking {
            file.lock_exclusive()
        } else {
            file.try_lock_exclusive()
        };
        if let Err(err) = locked {
            if is_contended(&err) {
                return Err(LockError::Unavailable(path.to_path_buf()));
            }
            return Err(io_err(err));
        }

        // Holder pid is informational only.
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
