use std::fmt;
use std::io;

/// Errors surfaced by the record store, the B+ tree and the WAL.
#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    /// On-disk structure is inconsistent; the message names the check.
    Corrupt(String),
    /// The store failed an alignment or structure check earlier in this
    /// process lifetime and refuses further writes.
    Broken,
    /// A read error demoted the handle to read-only until reopen.
    ReadOnly,
    /// `put` in keep mode found the key already present.
    KeyExists,
    NotFound,
    /// Transaction begin/commit/abort called out of order.
    TxState(&'static str),
    /// Advisory lock is held by another process.
    LockBusy,
    InvalidOptions(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "i/o error: {e}"),
            StoreError::Corrupt(what) => write!(f, "corrupt store: {what}"),
            StoreError::Broken => write!(f, "store is marked broken"),
            StoreError::ReadOnly => write!(f, "store is read-only"),
            StoreError::KeyExists => write!(f, "key already exists"),
            StoreError::NotFound => write!(f, "record not found"),
            StoreError::TxState(what) => write!(f, "transaction state error: {what}"),
            StoreError::LockBusy => write!(f, "database is locked by another process"),
            StoreError::InvalidOptions(what) => write!(f, "invalid store options: {what}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> StoreError {
        StoreError::Io(e)
    }
}
