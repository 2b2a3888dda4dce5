//! Exclusive operation lock.
//!
//! Only one apply/rotate/remove pass may run system-wide at a time. The
//! lock is a marker file created with `O_EXCL` semantics: acquisition
//! either succeeds immediately or fails fast with a busy error. Rotation
//! is inherently approximate, so a losing contender aborts and retries on
//! its next poll instead of queueing.
//!
//! The returned [`LockGuard`] removes the marker on drop, so the lock is
//! released on every exit path, including error paths.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::error::{ObfsError, ObfsResult};

/// Exclusive non-blocking lock backed by a marker file.
#[derive(Debug, Clone)]
pub struct OpLock {
    path: PathBuf,
}

impl OpLock {
    /// Creates a lock handle for the given marker path.
    ///
    /// No filesystem access happens until [`OpLock::acquire`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the marker path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensures the directory holding the marker exists.
    ///
    /// Called once at daemon startup; a failure here is fatal
    /// ([`ObfsError::LockSetup`]).
    pub fn ensure_parent_dir(&self) -> ObfsResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ObfsError::LockSetup {
                path: self.path.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// The owning pid is recorded in the marker so a stale lock left by a
    /// crashed process is easy to identify. Returns
    /// [`ObfsError::LockContention`] immediately if the marker exists.
    pub fn acquire(&self) -> ObfsResult<LockGuard> {
        self.ensure_parent_dir()?;

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                trace!(lock = %self.path.display(), "Acquired operation lock");
                Ok(LockGuard {
                    path: self.path.clone(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(lock = %self.path.display(), "Operation lock busy");
                Err(ObfsError::LockContention {
                    path: self.path.display().to_string(),
                })
            }
            Err(e) => Err(ObfsError::LockSetup {
                path: self.path.display().to_string(),
                source: e,
            }),
        }
    }
}

/// RAII guard for an acquired [`OpLock`].
///
/// Dropping the guard removes the marker file and releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            // Nothing to do beyond reporting: the marker may have been
            // cleaned up externally.
            debug!(lock = %self.path.display(), error = %e, "Failed to remove lock marker");
        } else {
            trace!(lock = %self.path.display(), "Released operation lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_in_tempdir() -> (tempfile::TempDir, OpLock) {
        let dir = tempfile::tempdir().unwrap();
        let lock = OpLock::new(dir.path().join("rotation.lock"));
        (dir, lock)
    }

    #[test]
    fn test_acquire_and_release() {
        let (_dir, lock) = lock_in_tempdir();

        let guard = lock.acquire().unwrap();
        assert!(lock.path().exists());

        drop(guard);
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_contention_fails_fast() {
        let (_dir, lock) = lock_in_tempdir();

        let _guard = lock.acquire().unwrap();
        match lock.acquire() {
            Err(ObfsError::LockContention { path }) => {
                assert!(path.ends_with("rotation.lock"));
            }
            other => panic!("Expected LockContention, got {:?}", other),
        }
    }

    #[test]
    fn test_reacquire_after_release() {
        let (_dir, lock) = lock_in_tempdir();

        drop(lock.acquire().unwrap());
        let second = lock.acquire();
        assert!(second.is_ok());
    }

    #[test]
    fn test_exactly_one_winner() {
        let (_dir, lock) = lock_in_tempdir();
        let a = lock.acquire();
        let b = lock.acquire();

        let winners = [a.is_ok(), b.is_ok()].iter().filter(|w| **w).count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_marker_records_pid() {
        let (_dir, lock) = lock_in_tempdir();

        let _guard = lock.acquire().unwrap();
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn test_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let lock = OpLock::new(dir.path().join("nested/dir/rotation.lock"));

        let guard = lock.acquire().unwrap();
        assert!(lock.path().exists());
        drop(guard);
    }
}
