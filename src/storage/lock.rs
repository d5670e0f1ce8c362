//! Advisory inter-process locks
//!
//! Cooperative whole-file locks (flock-style via `fs2`). They only exclude
//! other processes that also take them; the in-process lock lives on the
//! store itself.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use fs2::FileExt;

use crate::error::{MapKvError, Result};

/// A lock file (or descriptor) used to serialize processes
#[derive(Debug, Clone)]
pub struct FileLock {
    file: Arc<File>,
}

impl FileLock {
    /// Open or create a dedicated lock file
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::from_file(file))
    }

    pub fn from_file(file: File) -> Self {
        Self {
            file: Arc::new(file),
        }
    }

    /// Block until the shared lock is held
    pub fn shared(&self) -> Result<FileLockGuard> {
        FileExt::lock_shared(self.file.as_ref())?;
        Ok(FileLockGuard {
            file: Arc::clone(&self.file),
        })
    }

    /// Block until the exclusive lock is held
    pub fn exclusive(&self) -> Result<FileLockGuard> {
        FileExt::lock_exclusive(self.file.as_ref())?;
        Ok(FileLockGuard {
            file: Arc::clone(&self.file),
        })
    }

    /// Convert a held shared lock to exclusive. The conversion is not atomic;
    /// another process may get in between, so re-read state afterwards.
    pub fn upgrade(&self) -> Result<()> {
        FileExt::lock_exclusive(self.file.as_ref())?;
        Ok(())
    }
}

/// Releases the lock on drop
#[derive(Debug)]
pub struct FileLockGuard {
    file: Arc<File>,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(self.file.as_ref());
    }
}

/// Try to hold a long-lived lock on `file` without blocking: shared when
/// `shared`, exclusive otherwise. Returns false when another holder
/// conflicts.
pub fn try_hold(file: &File, shared: bool) -> Result<bool> {
    let attempt = if shared {
        FileExt::try_lock_shared(file)
    } else {
        FileExt::try_lock_exclusive(file)
    };

    match attempt {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(MapKvError::Io(e)),
    }
}
