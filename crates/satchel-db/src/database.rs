//! The database container: a directory of files, exactly one process
//! at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use satchel_document::{Document, NestedArrays, Oid, Value, compare_values, get_path};
use satchel_query::Query;
use satchel_store::{FileLock, HashStore, OpenOptions, StoreOptions};

use crate::collection::Collection;
use crate::error::DbError;
use crate::executor::{self, ExecFlags, QueryResult};
use crate::index::{IndexKind, IndexMetaRecord, IndexOp, meta_key};
use crate::options::{CollectionOptions, DatabaseOptions, OpenMode, QueryLimits};
use crate::visitor::QueryCtl;

/// Two-byte metadata magic, little-endian `0xEBB1`.
const META_MAGIC: [u8; 2] = [0xb1, 0xeb];
/// `100000·major + 1000·minor + patch`.
const FORMAT_VERSION: u32 = 1000;
const MAX_COLLECTIONS: usize = 1024;

pub struct Database {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

pub(crate) struct DbInner {
    dir: PathBuf,
    meta: HashStore,
    registry: ArcSwap<HashMap<String, Arc<Collection>>>,
    /// Database-level lock guarding collection add/remove/rename.
    registry_lock: RwLock<()>,
    _file_lock: Option<FileLock>,
    mode: OpenMode,
    limits: QueryLimits,
}

impl Database {
    /// Open (or create) a database directory.
    pub fn open(dir: impl AsRef<Path>, options: DatabaseOptions) -> Result<Database, DbError> {
        let dir = dir.as_ref().to_path_buf();
        let mode = options.mode.clone();
        if mode.create && !mode.read_only {
            std::fs::create_dir_all(&dir)?;
        }
        if !dir.is_dir() {
            return Err(DbError::InvalidMetadata(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        let meta_path = dir.join("meta");
        if mode.truncate && !mode.read_only {
            truncate_directory(&dir)?;
        }

        let file_lock = if mode.no_lock {
            None
        } else {
            Some(FileLock::acquire(
                &meta_path,
                !mode.read_only,
                !mode.lock_non_blocking,
            )?)
        };

        let meta = HashStore::open(
            &meta_path,
            StoreOptions {
                bnum: 4093,
                fpow: 8,
                ..StoreOptions::default()
            },
            OpenOptions {
                read_only: mode.read_only,
                create: mode.create,
                truncate: false,
                ..OpenOptions::default()
            },
        )?;

        // version gate: magic is stamped on creation only; anything
        // else without it is a hard failure, never silently adopted
        let opaque = meta.read_opaque();
        if opaque[..2] == META_MAGIC {
            let version = u32::from_le_bytes(opaque[2..6].try_into().unwrap());
            if version > FORMAT_VERSION {
                return Err(DbError::InvalidMetadata(format!(
                    "database format {version} is newer than supported {FORMAT_VERSION}"
                )));
            }
        } else if opaque[..6] == [0u8; 6] && meta.count()? == 0 && !mode.read_only {
            let mut stamp = [0u8; 6];
            stamp[..2].copy_from_slice(&META_MAGIC);
            stamp[2..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
            meta.write_opaque(&stamp)?;
        } else {
            return Err(DbError::InvalidMetadata("metadata magic mismatch".into()));
        }

        let inner = DbInner {
            dir,
            meta,
            registry: ArcSwap::from_pointee(HashMap::new()),
            registry_lock: RwLock::new(()),
            _file_lock: file_lock,
            mode,
            limits: options.limits,
        };
        inner.load_collections()?;
        Ok(Database {
            inner: Arc::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    // ── Collections ─────────────────────────────────────────────

    pub fn collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.inner.registry.load().get(name).cloned()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.registry.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a collection, creating its files when absent.
    pub fn get_or_create(
        &self,
        name: &str,
        options: CollectionOptions,
    ) -> Result<Arc<Collection>, DbError> {
        validate_collection_name(name)?;
        if let Some(existing) = self.collection(name) {
            return Ok(existing);
        }
        if self.inner.mode.read_only {
            return Err(DbError::CollectionNotFound(name.to_string()));
        }
        let _guard = self.inner.registry_lock.write();
        if let Some(existing) = self.inner.registry.load().get(name) {
            return Ok(Arc::clone(existing));
        }
        if self.inner.registry.load().len() >= MAX_COLLECTIONS {
            return Err(DbError::TooManyCollections);
        }
        let collection = Arc::new(Collection::open(
            name,
            &self.inner.dir,
            options.clone(),
            &[],
            true,
            self.inner.mode.sync_tx,
        )?);
        let mut key = vec![b'c'];
        key.extend_from_slice(name.as_bytes());
        self.inner.meta.put(
            &key,
            serde_json::to_string(&options)?.as_bytes(),
            satchel_store::PutMode::Replace,
        )?;
        self.inner.register(name, Arc::clone(&collection));
        Ok(collection)
    }

    /// Deregister a collection; with `delete_files` its record store,
    /// log and index files are removed from disk.
    pub fn remove_collection(&self, name: &str, delete_files: bool) -> Result<(), DbError> {
        let _guard = self.inner.registry_lock.write();
        let Some(collection) = self.inner.registry.load().get(name).cloned() else {
            return Err(DbError::CollectionNotFound(name.to_string()));
        };
        let files = collection.file_paths();
        let wal = wal_companion(collection.store_path());
        self.inner.deregister(name);
        self.inner.purge_meta(name)?;
        drop(collection);
        if delete_files {
            for file in files {
                let _ = std::fs::remove_file(file);
            }
            let _ = std::fs::remove_file(wal);
        }
        Ok(())
    }

    /// Rename a collection and every file backing it.
    pub fn rename_collection(&self, old: &str, new: &str) -> Result<(), DbError> {
        validate_collection_name(new)?;
        let _guard = self.inner.registry_lock.write();
        if self.inner.registry.load().contains_key(new) {
            return Err(DbError::InvalidCollectionName(format!(
                "{new} already exists"
            )));
        }
        let Some(collection) = self.inner.registry.load().get(old).cloned() else {
            return Err(DbError::CollectionNotFound(old.to_string()));
        };
        let options = collection.options().clone();
        let index_meta = self.inner.index_meta_for(old)?;
        let files = collection.file_paths();
        let old_store = collection.store_path().to_path_buf();
        self.inner.deregister(old);
        drop(collection);

        let old_prefix = format!("meta_{old}");
        let new_prefix = format!("meta_{new}");
        for file in files {
            let name = file.file_name().unwrap_or_default().to_string_lossy().to_string();
            if let Some(rest) = name.strip_prefix(&old_prefix) {
                std::fs::rename(&file, self.inner.dir.join(format!("{new_prefix}{rest}")))?;
            }
        }
        let wal = wal_companion(&old_store);
        if wal.exists() {
            std::fs::rename(&wal, self.inner.dir.join(format!("{new_prefix}.wal")))?;
        }

        self.inner.purge_meta(old)?;
        let mut key = vec![b'c'];
        key.extend_from_slice(new.as_bytes());
        self.inner.meta.put(
            &key,
            serde_json::to_string(&options)?.as_bytes(),
            satchel_store::PutMode::Replace,
        )?;
        for (path, record) in &index_meta {
            self.inner.meta.put(
                &meta_key(new, path),
                serde_json::to_string(record)?.as_bytes(),
                satchel_store::PutMode::Replace,
            )?;
        }

        let reopened = Arc::new(Collection::open(
            new,
            &self.inner.dir,
            options,
            &index_meta,
            false,
            self.inner.mode.sync_tx,
        )?);
        self.inner.register(new, reopened);
        Ok(())
    }

    // ── Documents ───────────────────────────────────────────────

    pub fn save(&self, collection: &str, doc: &Document) -> Result<Oid, DbError> {
        self.get_or_create(collection, CollectionOptions::default())?
            .save(doc, false)
    }

    pub fn load(&self, collection: &str, oid: Oid) -> Result<Option<Document>, DbError> {
        match self.collection(collection) {
            Some(c) => c.load(oid),
            None => Err(DbError::CollectionNotFound(collection.to_string())),
        }
    }

    pub fn rm(&self, collection: &str, oid: Oid) -> Result<bool, DbError> {
        match self.collection(collection) {
            Some(c) => c.rm(oid),
            None => Err(DbError::CollectionNotFound(collection.to_string())),
        }
    }

    // ── Indexes ─────────────────────────────────────────────────

    /// Apply an index operation and persist the resulting metadata.
    pub fn set_index(
        &self,
        collection: &str,
        path: &str,
        kinds: &[IndexKind],
        op: IndexOp,
    ) -> Result<(), DbError> {
        let col = self
            .collection(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let record = col.set_index(path, kinds, op)?;
        let key = meta_key(collection, path);
        match record {
            Some(record) => self.inner.meta.put(
                &key,
                serde_json::to_string(&record)?.as_bytes(),
                satchel_store::PutMode::Replace,
            )?,
            None => {
                self.inner.meta.out(&key)?;
            }
        }
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────

    /// Run a query, streaming each result into `visitor` while the
    /// collection lock is held. The control handle may pause, resume
    /// or abort between candidate documents.
    pub fn execute(
        &self,
        collection: &str,
        query: &Query,
        flags: ExecFlags,
        ctl: Option<&QueryCtl>,
        visitor: &mut dyn FnMut(&Document) -> bool,
    ) -> Result<QueryResult, DbError> {
        let col = self
            .collection(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let registry = Arc::clone(&self.inner);
        let resolve = move |name: &str| registry.registry.load().get(name).cloned();
        executor::execute(&col, query, flags, &self.inner.limits, ctl, &resolve, visitor)
    }

    pub fn find(&self, collection: &str, query: &Query) -> Result<Vec<Document>, DbError> {
        let mut docs = Vec::new();
        self.execute(collection, query, ExecFlags::default(), None, &mut |doc| {
            docs.push(doc.clone());
            true
        })?;
        Ok(docs)
    }

    pub fn find_one(&self, collection: &str, query: &Query) -> Result<Option<Document>, DbError> {
        let mut found = None;
        self.execute(
            collection,
            query,
            ExecFlags {
                find_one: true,
                ..ExecFlags::default()
            },
            None,
            &mut |doc| {
                found = Some(doc.clone());
                false
            },
        )?;
        Ok(found)
    }

    pub fn count(&self, collection: &str, query: &Query) -> Result<u64, DbError> {
        let result = self.execute(
            collection,
            query,
            ExecFlags {
                count_only: true,
                ..ExecFlags::default()
            },
            None,
            &mut |_| true,
        )?;
        Ok(result.count)
    }

    /// Run an update query; returns the updated-document count.
    pub fn update(&self, collection: &str, query: &Query) -> Result<u64, DbError> {
        if !query.is_update() {
            return Err(DbError::InvalidCommand(
                "query carries no update operators".into(),
            ));
        }
        let result = self.execute(
            collection,
            query,
            ExecFlags {
                count_only: true,
                ..ExecFlags::default()
            },
            None,
            &mut |_| true,
        )?;
        Ok(result.updated)
    }

    /// Distinct values of a field among matching documents: the query
    /// runs projected to the path and ordered by it, and consecutive
    /// equal values collapse.
    pub fn distinct(
        &self,
        collection: &str,
        path: &str,
        query: &Query,
    ) -> Result<Vec<Value>, DbError> {
        let mut forced = query.clone();
        forced.hints.fields = Some(satchel_query::FieldsSpec {
            include: true,
            paths: vec![path.to_string()],
        });
        forced.hints.order_by = vec![(path.to_string(), satchel_query::SortDir::Asc)];
        forced.hints.skip = 0;
        forced.hints.max = None;

        let mut values: Vec<Value> = Vec::new();
        self.execute(collection, &forced, ExecFlags::default(), None, &mut |doc| {
            if let Some(value) = get_path(doc, path, NestedArrays::ReturnArray) {
                let is_new = values
                    .last()
                    .is_none_or(|prev| compare_values(prev, value) != std::cmp::Ordering::Equal);
                if is_new {
                    values.push(value.clone());
                }
            }
            true
        })?;
        Ok(values)
    }

    // ── Introspection and maintenance ───────────────────────────

    /// A document describing the database: collections, their
    /// options, record counts and indexes.
    pub fn describe(&self) -> Result<Document, DbError> {
        let mut collections = Vec::new();
        for name in self.collection_names() {
            let Some(col) = self.collection(&name) else {
                continue;
            };
            let mut entry = Document::new();
            entry.set("name", Value::String(name.clone()));
            entry.set(
                "file",
                Value::String(col.store_path().display().to_string()),
            );
            entry.set("records", Value::Int64(col.count()? as i64));

            let mut opts = Document::new();
            opts.set("buckets", Value::Int64(col.options().buckets as i64));
            opts.set("large", Value::Bool(col.options().large));
            opts.set("compressed", Value::Bool(col.options().deflate));
            opts.set(
                "cachedrecords",
                Value::Int64(col.options().cached_records as i64),
            );
            entry.set("options", Value::Object(opts));

            let mut indexes = Vec::new();
            for index in col.indexes() {
                let stats = index.stats();
                let mut idoc = Document::new();
                idoc.set("field", Value::String(index.path.clone()));
                idoc.set("type", Value::String(index.kind.letter().to_string()));
                idoc.set("records", Value::Int64(stats.pairs as i64));
                indexes.push(Value::Object(idoc));
            }
            entry.set("indexes", Value::Array(indexes));
            collections.push(Value::Object(entry));
        }
        let mut doc = Document::new();
        doc.set("file", Value::String(self.inner.dir.display().to_string()));
        doc.set("collections", Value::Array(collections));
        Ok(doc)
    }

    /// Flush async buffers and fsync everything.
    pub fn sync(&self) -> Result<(), DbError> {
        for name in self.collection_names() {
            if let Some(col) = self.collection(&name) {
                col.sync()?;
            }
        }
        self.inner.meta.sync()?;
        Ok(())
    }

    /// Close the database: collections flush on drop, the metadata
    /// store syncs, the directory lock releases.
    pub fn close(self) -> Result<(), DbError> {
        self.sync()
    }
}

impl Clone for Database {
    fn clone(&self) -> Database {
        Database {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl DbInner {
    fn register(&self, name: &str, collection: Arc<Collection>) {
        let mut map = HashMap::clone(&self.registry.load());
        map.insert(name.to_string(), collection);
        self.registry.store(Arc::new(map));
    }

    fn deregister(&self, name: &str) {
        let mut map = HashMap::clone(&self.registry.load());
        map.remove(name);
        self.registry.store(Arc::new(map));
    }

    fn purge_meta(&self, name: &str) -> Result<(), DbError> {
        let mut key = vec![b'c'];
        key.extend_from_slice(name.as_bytes());
        self.meta.out(&key)?;
        for (path, _) in self.index_meta_for(name)? {
            self.meta.out(&meta_key(name, &path))?;
        }
        Ok(())
    }

    fn index_meta_for(&self, name: &str) -> Result<Vec<(String, IndexMetaRecord)>, DbError> {
        let mut prefix = vec![b'i'];
        prefix.extend_from_slice(name.as_bytes());
        prefix.push(0);
        let mut out = Vec::new();
        let mut parse_error = None;
        self.meta.for_each(|key, value| {
            if key.starts_with(&prefix) {
                let path = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
                match serde_json::from_slice::<IndexMetaRecord>(&value) {
                    Ok(record) => out.push((path, record)),
                    Err(e) => parse_error = Some(DbError::from(e)),
                }
            }
            Ok(true)
        })?;
        match parse_error {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    fn load_collections(&self) -> Result<(), DbError> {
        let mut names: Vec<(String, CollectionOptions)> = Vec::new();
        let mut parse_error = None;
        self.meta.for_each(|key, value| {
            if key.first() == Some(&b'c') {
                let name = String::from_utf8_lossy(&key[1..]).to_string();
                match serde_json::from_slice::<CollectionOptions>(&value) {
                    Ok(options) => names.push((name, options)),
                    Err(e) => parse_error = Some(DbError::from(e)),
                }
            }
            Ok(true)
        })?;
        if let Some(e) = parse_error {
            return Err(e);
        }

        let mut map = HashMap::new();
        for (name, options) in names {
            let index_meta = self.index_meta_for(&name)?;
            let collection = Collection::open(
                &name,
                &self.dir,
                options,
                &index_meta,
                false,
                self.mode.sync_tx,
            )?;
            map.insert(name, Arc::new(collection));
        }
        self.registry.store(Arc::new(map));
        Ok(())
    }
}

fn validate_collection_name(name: &str) -> Result<(), DbError> {
    if name.is_empty() || name.len() > 127 || name.contains('.') || name.contains('$') {
        return Err(DbError::InvalidCollectionName(name.to_string()));
    }
    Ok(())
}

fn wal_companion(store_path: &Path) -> PathBuf {
    let mut name = store_path.file_name().unwrap_or_default().to_os_string();
    name.push(".wal");
    store_path.with_file_name(name)
}

/// Truncate-open: drop every database file in the directory.
fn truncate_directory(dir: &Path) -> Result<(), DbError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "meta" || name.starts_with("meta_") || name.starts_with("meta.") {
            let _ = std::fs::remove_file(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names_are_validated() {
        assert!(validate_collection_name("books").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("a.b").is_err());
        assert!(validate_collection_name("a$b").is_err());
        assert!(validate_collection_name(&"x".repeat(128)).is_err());
    }
}
