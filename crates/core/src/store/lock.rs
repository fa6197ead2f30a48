//! Advisory exclusivity lock for one repository.
//!
//! Exactly one merge or commit may run against a repository at a time. The
//! lock is a file created with `create_new` semantics inside the git
//! directory; its presence means "held". The guard removes the file when
//! dropped, so every exit path (success, error, panic unwinding) releases it.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::RepositoryError;

/// Metadata written into the lock file for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    pub pid: u32,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
}

/// RAII guard over the repository lock file.
#[derive(Debug)]
pub struct RepositoryLock {
    path: PathBuf,
    meta: LockMeta,
    released: bool,
}

impl RepositoryLock {
    /// Acquire the lock at `path` for `operation`.
    ///
    /// Fails with [`RepositoryError::RepositoryUnavailable`] when another
    /// holder already owns it. Never waits.
    pub fn acquire(path: impl Into<PathBuf>, operation: &str) -> Result<Self, RepositoryError> {
        let path = path.into();
        let meta = LockMeta {
            pid: std::process::id(),
            operation: operation.to_string(),
            acquired_at: Utc::now(),
        };

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let reason = match read_lock_meta(&path) {
                    Some(held) => format!(
                        "locked by pid {} for '{}' since {}",
                        held.pid,
                        held.operation,
                        held.acquired_at.to_rfc3339()
                    ),
                    None => format!("lock file {} exists", path.display()),
                };
                warn!(path = %path.display(), %reason, "repository lock contention");
                return Err(RepositoryError::RepositoryUnavailable {
                    path: path.display().to_string(),
                    reason,
                });
            }
            Err(e) => return Err(RepositoryError::IoError(e)),
        };

        let json = serde_json::to_string(&meta)
            .map_err(|e| RepositoryError::IoError(io::Error::new(io::ErrorKind::Other, e)))?;
        if let Err(e) = file.write_all(json.as_bytes()) {
            let _ = fs::remove_file(&path);
            return Err(RepositoryError::IoError(e));
        }

        debug!(path = %path.display(), operation, "repository lock acquired");
        Ok(Self {
            path,
            meta,
            released: false,
        })
    }

    pub fn meta(&self) -> &LockMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, surfacing removal errors.
    pub fn release(mut self) -> Result<(), RepositoryError> {
        if !self.released {
            fs::remove_file(&self.path)?;
            self.released = true;
            debug!(path = %self.path.display(), "repository lock released");
        }
        Ok(())
    }
}

impl Drop for RepositoryLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Read the metadata of a held lock, if any.
pub fn read_lock_meta(path: &Path) -> Option<LockMeta> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}
