//! Run-level mutual exclusion.
//!
//! A non-blocking advisory lock on a sentinel file (`run.lock`) rejects a
//! second pipeline invocation before any state work begins. The sentinel
//! carries no data; only its lock state matters. Because the lock is owned
//! by the file descriptor, it evaporates when the process dies, so a crash
//! never leaves a stale lock behind.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

pub const RUN_LOCK_FILE: &str = "run.lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another slipway run is already in progress (run lock {path})")]
    AlreadyRunning { path: PathBuf },
    #[error("failed to set up run lock {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive run-lock handle; released on drop or [`RunLock::release`].
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: Option<File>,
}

impl RunLock {
    /// Acquire the run lock, failing fast if another live process holds it.
    ///
    /// With `force = true` the contention check is bypassed entirely. This
    /// is unsafe in the operational sense: two runs may interleave stage
    /// work and duplicate collaborator calls. It exists for recovering from
    /// wedged environments, not for routine use.
    pub fn acquire(state_dir: &Path, force: bool) -> Result<Self, LockError> {
        let path = state_dir.join(RUN_LOCK_FILE);
        fs::create_dir_all(state_dir)
            .map_err(|source| LockError::Io { path: path.clone(), source })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::Io { path: path.clone(), source })?;

        if force {
            // Still take the lock opportunistically so a forced run holds it
            // whenever it is actually free.
            let _ = file.try_lock_exclusive();
            return Ok(Self { path, file: Some(file) });
        }

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { path, file: Some(file) }),
            Err(err) => {
                if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                    Err(LockError::AlreadyRunning { path })
                } else {
                    Err(LockError::Io { path, source: err })
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock. The sentinel file is left in place; deleting it
    /// would race a concurrent acquire on the old inode.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.release();
    }
}
