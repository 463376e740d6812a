use serde::{Deserialize, Serialize};

/// How a database directory is opened.
#[derive(Debug, Clone)]
pub struct OpenMode {
    pub read_only: bool,
    pub create: bool,
    pub truncate: bool,
    /// Skip the advisory file lock entirely.
    pub no_lock: bool,
    /// Fail fast instead of blocking on a busy lock.
    pub lock_non_blocking: bool,
    /// fsync the main file at every transaction commit.
    pub sync_tx: bool,
}

impl Default for OpenMode {
    fn default() -> OpenMode {
        OpenMode {
            read_only: false,
            create: true,
            truncate: false,
            no_lock: false,
            lock_non_blocking: false,
            sync_tx: false,
        }
    }
}

impl OpenMode {
    pub fn reader() -> OpenMode {
        OpenMode {
            read_only: true,
            create: false,
            ..OpenMode::default()
        }
    }
}

/// Per-query resource bounds.
#[derive(Debug, Clone, Default)]
pub struct QueryLimits {
    /// Result count ceiling before an in-memory sort; `None` means
    /// unlimited, exceeding it fails the query instead of swapping
    /// the host to death.
    pub max_sort_buffer: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub mode: OpenMode,
    pub limits: QueryLimits,
}

impl Default for DatabaseOptions {
    fn default() -> DatabaseOptions {
        DatabaseOptions {
            mode: OpenMode::default(),
            limits: QueryLimits::default(),
        }
    }
}

/// Immutable collection tuning, persisted in the metadata store at
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionOptions {
    /// Bucket count hint for the record store.
    pub buckets: u64,
    /// 6-byte bucket offsets for files past 2 GiB.
    pub large: bool,
    /// DEFLATE each stored record.
    pub deflate: bool,
    /// Cached index page budget.
    pub cached_records: usize,
}

impl Default for CollectionOptions {
    fn default() -> CollectionOptions {
        CollectionOptions {
            buckets: 131071,
            large: false,
            deflate: false,
            cached_records: 256,
        }
    }
}
