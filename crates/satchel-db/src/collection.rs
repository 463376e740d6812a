//! The collection layer: one record store plus its secondary indexes.
//!
//! Writes compute per-index contribution deltas between the pre-image
//! and the new document and apply exactly the difference. During a
//! transaction the deltas are buffered in memory and applied at
//! commit, so abort and crash recovery never have to roll an index
//! file back. Mass updates batch deltas the same way and flush every
//! 512 documents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use satchel_document::{Document, KeyMode, Oid, Value, decode, encode};
use satchel_store::{DOC_COLUMN, HashStore, OpenOptions, PutMode, StoreOptions, decode_columns,
                    encode_columns};

use crate::error::DbError;
use crate::index::{Index, IndexKind, IndexMetaRecord, IndexOp};
use crate::options::CollectionOptions;

/// Deferred index updates flush after this many touched documents.
pub(crate) const DEFERRED_FLUSH_THRESHOLD: usize = 512;

struct PendingDelta {
    index: Arc<Index>,
    key: Vec<u8>,
    oid: Oid,
    add: bool,
}

#[derive(Default)]
struct DeltaBuffer {
    deltas: Vec<PendingDelta>,
    docs: usize,
}

pub struct Collection {
    name: String,
    store: HashStore,
    store_path: PathBuf,
    options: CollectionOptions,
    /// Collection-level reader-writer lock; queries take it in read
    /// mode unless they carry update operators.
    pub(crate) lock: RwLock<()>,
    indexes: RwLock<Vec<Arc<Index>>>,
    /// `Some` while a transaction is open: deltas wait for commit.
    tx_buffer: Mutex<Option<DeltaBuffer>>,
    /// `Some` while a mass update batches index maintenance.
    deferred: Mutex<Option<DeltaBuffer>>,
}

impl Collection {
    pub(crate) fn open(
        name: &str,
        dir: &Path,
        options: CollectionOptions,
        index_meta: &[(String, IndexMetaRecord)],
        create: bool,
        sync_tx: bool,
    ) -> Result<Collection, DbError> {
        let store_path = dir.join(format!("meta_{name}"));
        let store = HashStore::open(
            &store_path,
            StoreOptions {
                bnum: options.buckets,
                large: options.large,
                deflate: options.deflate,
                ..StoreOptions::default()
            },
            OpenOptions {
                create,
                sync_tx,
                ..OpenOptions::default()
            },
        )?;
        let mut indexes = Vec::new();
        for (path, record) in index_meta {
            for letter in &record.kinds {
                let Some(kind) = IndexKind::from_letter(*letter) else {
                    return Err(DbError::InvalidMetadata(format!(
                        "unknown index kind letter {letter}"
                    )));
                };
                indexes.push(Arc::new(Index::open(
                    &store_path,
                    path,
                    kind,
                    options.cached_records,
                )?));
            }
        }
        Ok(Collection {
            name: name.to_string(),
            store,
            store_path,
            options,
            lock: RwLock::new(()),
            indexes: RwLock::new(indexes),
            tx_buffer: Mutex::new(None),
            deferred: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }

    pub(crate) fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn count(&self) -> Result<u64, DbError> {
        Ok(self.store.count()?)
    }

    /// Names of every file backing this collection.
    pub(crate) fn file_paths(&self) -> Vec<PathBuf> {
        let mut files = vec![self.store_path.clone()];
        for index in self.indexes.read().iter() {
            files.push(index.tree.path().to_path_buf());
        }
        files
    }

    // ── Documents ───────────────────────────────────────────────

    /// Save a document. Generates and injects an `_id` when absent;
    /// with `merge` the pre-image is recursively merged with the new
    /// content instead of replaced.
    pub fn save(&self, doc: &Document, merge: bool) -> Result<Oid, DbError> {
        doc.validate_keys(KeyMode::Store)
            .map_err(|e| DbError::InvalidDocument(e.to_string()))?;
        let _guard = self.lock.write();
        self.save_locked(doc, merge)
    }

    pub(crate) fn save_locked(&self, doc: &Document, merge: bool) -> Result<Oid, DbError> {
        let oid = match doc.get(satchel_document::ID_FIELD) {
            Some(Value::ObjectId(oid)) => *oid,
            Some(other) => {
                return Err(DbError::InvalidOid(format!(
                    "_id must be an object id, got {other:?}"
                )));
            }
            None => Oid::generate(),
        };
        let pre = self.load_raw(oid)?;

        let mut new_doc = if merge {
            match &pre {
                Some(before) => {
                    let mut merged = before.clone();
                    satchel_document::merge_into(&mut merged, doc, true);
                    merged
                }
                None => doc.clone(),
            }
        } else {
            doc.clone()
        };
        if new_doc.get(satchel_document::ID_FIELD).is_none() {
            let mut with_id = Document::with_capacity(new_doc.len() + 1);
            with_id.push(satchel_document::ID_FIELD, Value::ObjectId(oid));
            for (k, v) in new_doc.iter() {
                with_id.push(k, v.clone());
            }
            new_doc = with_id;
        }

        self.put_record(oid, &new_doc)?;
        self.apply_index_updates(oid, pre.as_ref(), Some(&new_doc))?;
        Ok(oid)
    }

    /// Re-store an already-validated document under an existing OID;
    /// the executor's update path.
    pub(crate) fn restore_locked(
        &self,
        oid: Oid,
        pre: &Document,
        new_doc: &Document,
    ) -> Result<(), DbError> {
        self.put_record(oid, new_doc)?;
        self.apply_index_updates(oid, Some(pre), Some(new_doc))
    }

    fn put_record(&self, oid: Oid, doc: &Document) -> Result<(), DbError> {
        let bytes = encode(doc).map_err(|e| DbError::InvalidDocument(e.to_string()))?;
        let record = encode_columns(&[(DOC_COLUMN, bytes.as_slice())]);
        self.store.put(oid.as_bytes(), &record, PutMode::Replace)?;
        Ok(())
    }

    pub fn load(&self, oid: Oid) -> Result<Option<Document>, DbError> {
        let _guard = self.lock.read();
        self.load_raw(oid)
    }

    pub(crate) fn load_raw(&self, oid: Oid) -> Result<Option<Document>, DbError> {
        let Some(record) = self.store.get(oid.as_bytes())? else {
            return Ok(None);
        };
        decode_record(&record).map(Some)
    }

    /// Remove a document and its index entries. Returns whether it
    /// existed.
    pub fn rm(&self, oid: Oid) -> Result<bool, DbError> {
        let _guard = self.lock.write();
        self.rm_locked(oid)
    }

    pub(crate) fn rm_locked(&self, oid: Oid) -> Result<bool, DbError> {
        let Some(pre) = self.load_raw(oid)? else {
            return Ok(false);
        };
        self.apply_index_updates(oid, Some(&pre), None)?;
        self.store.out(oid.as_bytes())?;
        Ok(true)
    }

    /// Walk every stored document in disk order under the collection
    /// read lock. The callback returns `false` to stop.
    pub fn for_each<F>(&self, f: F) -> Result<(), DbError>
    where
        F: FnMut(Oid, Document) -> Result<bool, DbError>,
    {
        let _guard = self.lock.read();
        self.scan_locked(f)
    }

    /// Walk every stored document in disk order. The callback returns
    /// `false` to stop.
    pub(crate) fn scan_locked<F>(&self, mut f: F) -> Result<(), DbError>
    where
        F: FnMut(Oid, Document) -> Result<bool, DbError>,
    {
        let mut outer: Result<(), DbError> = Ok(());
        self.store.for_each(|key, record| {
            let oid = match <[u8; 12]>::try_from(key) {
                Ok(bytes) => Oid::from_bytes(bytes),
                Err(_) => {
                    outer = Err(DbError::InvalidMetadata("record key is not an oid".into()));
                    return Ok(false);
                }
            };
            match decode_record(&record).and_then(|doc| f(oid, doc)) {
                Ok(keep_going) => Ok(keep_going),
                Err(e) => {
                    outer = Err(e);
                    Ok(false)
                }
            }
        })?;
        outer
    }

    /// Flush async buffers and fsync the store and every index file.
    pub fn sync(&self) -> Result<(), DbError> {
        let _guard = self.lock.write();
        self.store.sync()?;
        for index in self.indexes.read().iter() {
            index.tree.flush()?;
        }
        Ok(())
    }

    // ── Transactions ────────────────────────────────────────────

    /// Acquire the store's transaction latch. Deliberately does not
    /// hold the collection lock while spinning: a second transaction
    /// waiting here must not block the first one's commit.
    pub fn begin_tx(&self) -> Result<(), DbError> {
        self.store.begin_tx()?;
        *self.tx_buffer.lock() = Some(DeltaBuffer::default());
        Ok(())
    }

    pub fn commit_tx(&self) -> Result<(), DbError> {
        let _guard = self.lock.write();
        let buffer = self
            .tx_buffer
            .lock()
            .take()
            .ok_or(DbError::InvalidCommand("commit without begin".into()))?;
        // deltas land before the log truncates: a crash in between
        // leaves dangling index entries, which scans tolerate, never
        // missing ones
        apply_deltas(buffer)?;
        self.store.commit_tx()?;
        Ok(())
    }

    pub fn abort_tx(&self) -> Result<(), DbError> {
        let _guard = self.lock.write();
        if self.tx_buffer.lock().take().is_none() {
            return Err(DbError::InvalidCommand("abort without begin".into()));
        }
        self.store.abort_tx()?;
        Ok(())
    }

    pub fn tx_active(&self) -> bool {
        self.store.tx_active()
    }

    // ── Index maintenance ───────────────────────────────────────

    pub(crate) fn indexes(&self) -> Vec<Arc<Index>> {
        self.indexes.read().clone()
    }

    pub(crate) fn index_for(&self, path: &str, kind: IndexKind) -> Option<Arc<Index>> {
        self.indexes
            .read()
            .iter()
            .find(|i| i.path == path && i.kind == kind)
            .cloned()
    }

    /// Batch index deltas until [`Collection::end_deferred`]; flushes
    /// itself every [`DEFERRED_FLUSH_THRESHOLD`] touched documents.
    pub(crate) fn begin_deferred(&self) {
        *self.deferred.lock() = Some(DeltaBuffer::default());
    }

    pub(crate) fn end_deferred(&self) -> Result<(), DbError> {
        if let Some(buffer) = self.deferred.lock().take() {
            apply_deltas(buffer)?;
        }
        Ok(())
    }

    fn apply_index_updates(
        &self,
        oid: Oid,
        pre: Option<&Document>,
        new_doc: Option<&Document>,
    ) -> Result<(), DbError> {
        let indexes = self.indexes.read();
        if indexes.is_empty() {
            return Ok(());
        }
        let mut deltas = Vec::new();
        for index in indexes.iter() {
            let old_keys = pre.map(|d| index.contribution(d)).unwrap_or_default();
            let new_keys = new_doc.map(|d| index.contribution(d)).unwrap_or_default();
            for key in &old_keys {
                if new_keys.binary_search(key).is_err() {
                    deltas.push(PendingDelta {
                        index: Arc::clone(index),
                        key: key.clone(),
                        oid,
                        add: false,
                    });
                }
            }
            for key in &new_keys {
                if old_keys.binary_search(key).is_err() {
                    deltas.push(PendingDelta {
                        index: Arc::clone(index),
                        key: key.clone(),
                        oid,
                        add: true,
                    });
                }
            }
        }
        drop(indexes);

        {
            let mut tx = self.tx_buffer.lock();
            if let Some(buffer) = tx.as_mut() {
                buffer.deltas.extend(deltas);
                buffer.docs += 1;
                return Ok(());
            }
        }
        {
            let mut deferred = self.deferred.lock();
            if let Some(buffer) = deferred.as_mut() {
                buffer.deltas.extend(deltas);
                buffer.docs += 1;
                if buffer.docs >= DEFERRED_FLUSH_THRESHOLD {
                    let full = std::mem::take(buffer);
                    drop(deferred);
                    return apply_deltas(full);
                }
                return Ok(());
            }
        }
        apply_deltas(DeltaBuffer { deltas, docs: 1 })
    }

    /// Create, rebuild, drop or optimize indexes on a field path.
    /// Returns the updated metadata record to persist (None when the
    /// path no longer has any index).
    pub fn set_index(
        &self,
        path: &str,
        kinds: &[IndexKind],
        op: IndexOp,
    ) -> Result<Option<IndexMetaRecord>, DbError> {
        if path.is_empty() {
            return Err(DbError::InvalidFieldPath(path.to_string()));
        }
        let _guard = self.lock.write();
        match op {
            IndexOp::Ensure => self.ensure_indexes(path, kinds, false)?,
            IndexOp::Rebuild => self.ensure_indexes(path, kinds, true)?,
            IndexOp::Drop => self.drop_indexes(path, kinds)?,
            IndexOp::DropAll => self.drop_indexes(path, &IndexKind::ALL)?,
            IndexOp::Optimize => {
                for index in self.indexes.read().iter() {
                    if index.path == path && (kinds.is_empty() || kinds.contains(&index.kind)) {
                        index.tree.optimize()?;
                    }
                }
            }
        }
        let kinds: Vec<char> = self
            .indexes
            .read()
            .iter()
            .filter(|i| i.path == path)
            .map(|i| i.kind.letter())
            .collect();
        if kinds.is_empty() {
            Ok(None)
        } else {
            Ok(Some(IndexMetaRecord { kinds }))
        }
    }

    fn ensure_indexes(&self, path: &str, kinds: &[IndexKind], rebuild: bool) -> Result<(), DbError> {
        for kind in kinds {
            let existing = self.index_for(path, *kind);
            let index = match existing {
                Some(_) if !rebuild => continue,
                Some(index) => {
                    // rebuild: drop the file and start over
                    self.remove_index_entry(path, *kind);
                    let file = index.tree.path().to_path_buf();
                    drop(index);
                    let _ = std::fs::remove_file(&file);
                    Arc::new(Index::open(
                        &self.store_path,
                        path,
                        *kind,
                        self.options.cached_records,
                    )?)
                }
                None => Arc::new(Index::open(
                    &self.store_path,
                    path,
                    *kind,
                    self.options.cached_records,
                )?),
            };

            // backfill by streaming the record store
            self.scan_locked(|oid, doc| {
                for key in index.contribution(&doc) {
                    index.tree.put(&key, *oid.as_bytes())?;
                }
                Ok(true)
            })?;
            index.tree.flush()?;
            self.indexes.write().push(index);
        }
        Ok(())
    }

    fn drop_indexes(&self, path: &str, kinds: &[IndexKind]) -> Result<(), DbError> {
        let mut dropped = Vec::new();
        {
            let mut indexes = self.indexes.write();
            indexes.retain(|index| {
                let hit = index.path == path && kinds.contains(&index.kind);
                if hit {
                    dropped.push(index.tree.path().to_path_buf());
                }
                !hit
            });
        }
        for file in dropped {
            let _ = std::fs::remove_file(file);
        }
        Ok(())
    }

    fn remove_index_entry(&self, path: &str, kind: IndexKind) {
        self.indexes
            .write()
            .retain(|i| !(i.path == path && i.kind == kind));
    }
}

fn apply_deltas(buffer: DeltaBuffer) -> Result<(), DbError> {
    for delta in buffer.deltas {
        if delta.add {
            delta.index.tree.put(&delta.key, *delta.oid.as_bytes())?;
        } else {
            delta.index.tree.remove(&delta.key, *delta.oid.as_bytes())?;
        }
    }
    Ok(())
}

fn decode_record(record: &[u8]) -> Result<Document, DbError> {
    let columns = decode_columns(record)?;
    let doc_bytes = columns
        .iter()
        .find(|(name, _)| name == DOC_COLUMN)
        .map(|(_, bytes)| bytes)
        .ok_or_else(|| DbError::InvalidMetadata("record lacks the document column".into()))?;
    decode(doc_bytes).map_err(|e| DbError::InvalidDocument(e.to_string()))
}
