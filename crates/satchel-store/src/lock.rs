//! Advisory file locking for the single-process-per-database rule.

use std::fs::{File, OpenOptions};
use std::path::Path;


use crate::error::StoreError;

/// Holds an advisory lock on a database's metadata file for the
/// lifetime of the value.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Writers take the lock exclusively, readers shared. With
    /// `blocking` unset a busy lock fails fast with
    /// [`StoreError::LockBusy`].
    pub fn acquire(path: &Path, exclusive: bool, blocking: bool) -> Result<FileLock, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let outcome = match (exclusive, blocking) {
            (true, true) => fs2::FileExt::lock_exclusive(&file),
            (true, false) => fs2::FileExt::try_lock_exclusive(&file),
            (false, true) => fs2::FileExt::lock_shared(&file),
            (false, false) => fs2::FileExt::try_lock_shared(&file),
        };
        match outcome {
            Ok(()) => Ok(FileLock { file }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(StoreError::LockBusy),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
