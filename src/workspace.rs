//! Exclusive temporary workspace for a download run.
//!
//! Only one run may use a temporary directory at a time. The holder keeps an
//! advisory lock on `<dir>/.seqdd.lock`; anything else found in the directory
//! when the lock is taken belongs to a run that died and is removed.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the lock file kept inside the workspace.
pub const LOCK_FILE_NAME: &str = ".seqdd.lock";

/// Errors raised while preparing the workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Another process holds the workspace lock.
    #[error("temporary directory {path} is in use by another seqdd run")]
    Locked {
        /// Workspace directory.
        path: PathBuf,
    },

    /// Creating, locking or sweeping the directory failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl WorkspaceError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A locked temporary directory. The lock is released on drop.
#[derive(Debug)]
pub struct TmpWorkspace {
    dir: PathBuf,
    lock: File,
}

impl TmpWorkspace {
    /// Creates `dir`, locks it and removes leftovers of earlier runs.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Locked`] if another run holds the lock and
    /// [`WorkspaceError::Io`] for filesystem failures.
    pub fn prepare(dir: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| WorkspaceError::io(&dir, e))?;

        let lock_path = dir.join(LOCK_FILE_NAME);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| WorkspaceError::io(&lock_path, e))?;
        if let Err(e) = lock.try_lock_exclusive() {
            return Err(if e.kind() == fs2::lock_contended_error().kind() {
                WorkspaceError::Locked { path: dir }
            } else {
                WorkspaceError::io(&lock_path, e)
            });
        }

        let swept = sweep(&dir)?;
        if swept > 0 {
            warn!(dir = %dir.display(), entries = swept, "removed leftovers of an interrupted run");
        }
        info!(dir = %dir.display(), "temporary workspace ready");
        Ok(Self { dir, lock })
    }

    /// Returns the workspace directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for TmpWorkspace {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock) {
            debug!(dir = %self.dir.display(), error = %e, "failed to release workspace lock");
        }
    }
}

fn sweep(dir: &Path) -> Result<usize, WorkspaceError> {
    let mut removed = 0;
    for entry in fs::read_dir(dir).map_err(|e| WorkspaceError::io(dir, e))? {
        let entry = entry.map_err(|e| WorkspaceError::io(dir, e))?;
        if entry.file_name() == LOCK_FILE_NAME {
            continue;
        }
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| WorkspaceError::io(&path, e))?;
        removed += 1;
    }
    Ok(removed)
}
