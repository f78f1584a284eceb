//! The process-wide exclusive lock file.
//!
//! Held for the daemon's entire lifetime; dropping it releases the lock.
//! A second instance starting while the lock is held must fail fast with
//! [`Error::LockBusy`] rather than silently fighting the first over USB
//! devices.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fd_lock::{RwLock, RwLockWriteGuard};

use crate::error::{Error, Result};

pub fn default_path() -> PathBuf {
    PathBuf::from("/var/ipp-usb/lock/ipp-usb.lock")
}

/// An acquired exclusive lock; the lock is released when this is dropped.
pub struct LockFile {
    lock: RwLock<File>,
}

impl LockFile {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            lock: RwLock::new(file),
        })
    }

    /// Try to take the lock without blocking; fails with `LockBusy` if some
    /// other process already holds it.
    pub fn try_guard(&mut self) -> Result<RwLockWriteGuard<'_, File>> {
        self.lock.try_write().map_err(|_| Error::LockBusy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_in_same_process_is_reentrant_via_separate_fd() {
        // fd-lock advisory locks are per-process on most platforms when
        // acquired through distinct file descriptors pointed at the same
        // inode in the same process; this test only exercises that the
        // happy path acquires cleanly.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipp-usb.lock");
        let mut lock = LockFile::acquire(&path).unwrap();
        let _guard = lock.try_guard().unwrap();
    }
}
