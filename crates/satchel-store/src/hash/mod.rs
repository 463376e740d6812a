//! Bucketed on-disk hash table with BST-chained collisions.
//!
//! File layout: fixed 256-byte header, persisted free-pool region,
//! bucket array of apow-shifted offsets, then the dynamic region of
//! records and free blocks. Each bucket chain is a binary search tree
//! ordered by `(hash residue, key bytes)`, making chain walks
//! logarithmic in chain length.

mod header;
mod record;

use std::collections::HashMap;
use std::fs::{File, OpenOptions as FsOpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::Compression;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::free::FreePool;
use crate::hashing;
use crate::varint;
use crate::wal::{self, Wal};

use header::{FLAG_DEFLATE, FLAG_LARGE, HEADER_SIZE, Header, OPAQUE_LEN};
use record::{FREE_HEADER, FREE_MAGIC, REC_MAGIC, RecordHead};

/// Immutable per-file tuning, fixed at creation.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Bucket count hint.
    pub bnum: u64,
    /// Record alignment power of two.
    pub apow: u8,
    /// Free-pool region size power of two (entry count).
    pub fpow: u8,
    /// 6-byte bucket offsets for files past 2 GiB.
    pub large: bool,
    /// DEFLATE each record value.
    pub deflate: bool,
    /// Async buffer flush threshold in bytes.
    pub async_limit: usize,
}

impl Default for StoreOptions {
    fn default() -> StoreOptions {
        StoreOptions {
            bnum: 131071,
            apow: 4,
            fpow: 10,
            large: false,
            deflate: false,
            async_limit: 1 << 20,
        }
    }
}

impl StoreOptions {
    fn validate(&self) -> Result<(), StoreError> {
        if self.bnum == 0 {
            return Err(StoreError::InvalidOptions("bucket count must be positive".into()));
        }
        if !(3..=16).contains(&self.apow) {
            return Err(StoreError::InvalidOptions("apow out of range".into()));
        }
        if !(4..=24).contains(&self.fpow) {
            return Err(StoreError::InvalidOptions("fpow out of range".into()));
        }
        Ok(())
    }
}

/// Per-open behavior.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub read_only: bool,
    pub create: bool,
    pub truncate: bool,
    /// Skip the write-ahead log entirely; transactions lose abort.
    pub no_wal: bool,
    /// fsync the main file before a commit truncates the log.
    pub sync_tx: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    Replace,
    /// Fail if the key exists.
    Keep,
    /// Append to the existing value.
    Cat,
}

/// The link that references a BST node: a bucket head or a parent
/// child pointer.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Bucket(u64),
    Child { rec_off: u64, right: bool },
}

struct Search {
    slot: Slot,
    found: Option<(u64, RecordHead)>,
}

#[derive(Default)]
struct Pending {
    map: HashMap<Vec<u8>, Vec<u8>>,
    order: Vec<Vec<u8>>,
    bytes: usize,
}

struct TxState {
    wal: Option<Wal>,
    base_fsiz: u64,
}

pub struct HashStore {
    path: PathBuf,
    wal_path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    header: Header,
    free: FreePool,
    pending: Pending,
    tx: Option<TxState>,
    async_limit: usize,
    read_only: bool,
    broken: bool,
    no_wal: bool,
    sync_tx: bool,
}

pub(crate) fn wal_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".wal");
    path.with_file_name(name)
}

impl HashStore {
    pub fn open(
        path: impl AsRef<Path>,
        options: StoreOptions,
        open: OpenOptions,
    ) -> Result<HashStore, StoreError> {
        let path = path.as_ref().to_path_buf();
        let wal_path = wal_path_for(&path);
        let inner = Inner::open(&path, &wal_path, &options, &open)?;
        Ok(HashStore {
            path,
            wal_path,
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn put(&self, key: &[u8], value: &[u8], mode: PutMode) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.pending.map.contains_key(key) {
            inner.flush_pending()?;
        }
        inner.put_locked(key, value, mode)
    }

    /// Defer the write to the coalescing buffer; flushed when the
    /// buffer fills, on any non-async touch of the key, on sync and
    /// on close.
    pub fn put_async(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.check_writable()?;
        let pending = &mut inner.pending;
        match pending.map.get_mut(key) {
            Some(slot) => {
                let old = std::mem::replace(slot, value.to_vec());
                pending.bytes = pending.bytes + value.len() - old.len();
            }
            None => {
                pending.order.push(key.to_vec());
                pending.bytes += key.len() + value.len();
                pending.map.insert(key.to_vec(), value.to_vec());
            }
        }
        if inner.pending.bytes > inner.async_limit {
            inner.flush_pending()?;
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let mut inner = self.inner.lock();
        if inner.pending.map.contains_key(key) {
            inner.flush_pending()?;
        }
        inner.get_locked(key)
    }

    /// Remove a record. Returns whether the key was present.
    pub fn out(&self, key: &[u8]) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.pending.map.contains_key(key) {
            inner.flush_pending()?;
        }
        inner.out_locked(key)
    }

    /// Walk physical records tail-to-head order of the file layout;
    /// disk order, not insertion order. The callback returns `false`
    /// to stop early.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&[u8], Vec<u8>) -> Result<bool, StoreError>,
    {
        let mut inner = self.inner.lock();
        inner.flush_pending()?;
        inner.iterate(&mut f)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        inner.flush_pending()?;
        Ok(inner.header.rnum)
    }

    pub fn file_size(&self) -> u64 {
        self.inner.lock().header.fsiz
    }

    pub fn deflate(&self) -> bool {
        self.inner.lock().header.deflate()
    }

    /// Flush the async buffer, persist the free pool and fsync.
    pub fn sync(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.flush_pending()?;
        inner.persist_pool()?;
        inner.store_header()?;
        inner.file.sync_data()?;
        Ok(())
    }

    // ── Transactions ────────────────────────────────────────────

    /// Acquire the store's transaction latch, spinning with
    /// exponential backoff while another transaction holds it.
    pub fn begin_tx(&self) -> Result<(), StoreError> {
        let mut delay = Duration::from_micros(50);
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.tx.is_none() {
                    return inner.begin_tx_locked(&self.wal_path);
                }
            }
            std::thread::sleep(delay);
            if delay < Duration::from_millis(10) {
                delay *= 2;
            }
        }
    }

    pub fn commit_tx(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.flush_pending()?;
        let tx = inner.tx.take().ok_or(StoreError::TxState("commit without begin"))?;
        inner.persist_pool()?;
        inner.store_header()?;
        if inner.sync_tx {
            inner.file.sync_data()?;
        }
        if let Some(wal) = tx.wal {
            wal.commit()?;
        }
        Ok(())
    }

    pub fn abort_tx(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let tx = inner.tx.take().ok_or(StoreError::TxState("abort without begin"))?;
        // deferred writes queued inside the transaction die with it
        inner.pending = Pending::default();
        let Some(wal) = tx.wal else {
            return Err(StoreError::TxState("abort requires the write-ahead log"));
        };
        wal.abort(&inner.file)?;
        inner.reload_from_disk()
    }

    pub fn tx_active(&self) -> bool {
        self.inner.lock().tx.is_some()
    }

    // ── Maintenance ─────────────────────────────────────────────

    /// Header opaque region, free for the embedding layer.
    pub fn read_opaque(&self) -> [u8; OPAQUE_LEN] {
        self.inner.lock().header.opaque
    }

    pub fn write_opaque(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        let n = bytes.len().min(OPAQUE_LEN);
        inner.header.opaque[..n].copy_from_slice(&bytes[..n]);
        inner.store_header()
    }

    /// Rewrite the whole store into a fresh file with new tuning.
    pub fn optimize(&self, options: StoreOptions) -> Result<(), StoreError> {
        options.validate()?;
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        inner.flush_pending()?;
        if inner.tx.is_some() {
            return Err(StoreError::TxState("optimize inside a transaction"));
        }

        let tmp_path = self.path.with_extension("opt");
        let tmp_wal = wal_path_for(&tmp_path);
        let _ = std::fs::remove_file(&tmp_path);
        let mut tmp = Inner::open(
            &tmp_path,
            &tmp_wal,
            &options,
            &OpenOptions {
                create: true,
                truncate: true,
                ..OpenOptions::default()
            },
        )?;
        inner.iterate(&mut |key, value| {
            tmp.put_locked(key, &value, PutMode::Replace)?;
            Ok(true)
        })?;
        tmp.close();
        drop(tmp);
        std::fs::rename(&tmp_path, &self.path)?;
        let _ = std::fs::remove_file(&tmp_wal);

        let reopen = OpenOptions {
            no_wal: inner.no_wal,
            sync_tx: inner.sync_tx,
            ..OpenOptions::default()
        };
        *inner = Inner::open(&self.path, &self.wal_path, &options, &reopen)?;
        Ok(())
    }

    /// Coalesce up to `unit` free runs (0 = all) and shift following
    /// records down; trailing free space is truncated away.
    pub fn defrag(&self, unit: usize) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        inner.flush_pending()?;
        inner.defrag_locked(unit)
    }

    pub fn close(&self) {
        self.inner.lock().close();
    }
}

impl Drop for HashStore {
    fn drop(&mut self) {
        self.inner.lock().close();
    }
}

impl Inner {
    fn open(
        path: &Path,
        wal_path: &Path,
        options: &StoreOptions,
        open: &OpenOptions,
    ) -> Result<Inner, StoreError> {
        options.validate()?;
        if open.truncate {
            let _ = std::fs::remove_file(path);
            let _ = std::fs::remove_file(wal_path);
        }
        let file = FsOpenOptions::new()
            .read(true)
            .write(!open.read_only)
            .create(open.create && !open.read_only)
            .open(path)?;
        let len = file.metadata()?.len();

        let mut inner = if len == 0 {
            if open.read_only {
                return Err(StoreError::Corrupt("empty record store".into()));
            }
            let mut flags = 0u8;
            if options.large {
                flags |= FLAG_LARGE;
            }
            if options.deflate {
                flags |= FLAG_DEFLATE;
            }
            let mut header = Header {
                flags,
                apow: options.apow,
                fpow: options.fpow,
                clean: false,
                bnum: options.bnum,
                rnum: 0,
                fsiz: 0,
                frec: 0,
                opaque: [0u8; OPAQUE_LEN],
            };
            header.frec = header.compute_frec();
            header.fsiz = header.frec;
            // fresh file: the bucket array and pool region read back
            // as zeros without being written
            file.set_len(header.fsiz)?;
            file.write_all_at(&header.encode(), 0)?;
            file.sync_data()?;
            Inner {
                file,
                header,
                free: FreePool::new(),
                pending: Pending::default(),
                tx: None,
                async_limit: options.async_limit,
                read_only: false,
                broken: false,
                no_wal: open.no_wal,
                sync_tx: open.sync_tx,
            }
        } else {
            wal::recover(wal_path, &file)?;
            let mut head_bytes = vec![0u8; HEADER_SIZE as usize];
            file.read_exact_at(&mut head_bytes, 0)?;
            let header = Header::decode(&head_bytes)?;
            let mut inner = Inner {
                file,
                header,
                free: FreePool::new(),
                pending: Pending::default(),
                tx: None,
                async_limit: options.async_limit,
                read_only: open.read_only,
                broken: false,
                no_wal: open.no_wal,
                sync_tx: open.sync_tx,
            };
            if inner.header.clean {
                let mut region = vec![0u8; inner.header.fbp_len() as usize];
                inner.file.read_exact_at(&mut region, inner.header.fbp_off())?;
                inner.free = FreePool::deserialize(&region);
            } else {
                tracing::warn!(path = %path.display(), "store not closed cleanly, rebuilding free pool");
                inner.rebuild_pool()?;
            }
            inner
        };

        if !open.read_only {
            inner.header.clean = false;
            inner.store_header()?;
        }
        Ok(inner)
    }

    fn close(&mut self) {
        if self.read_only || self.broken {
            return;
        }
        let _ = self.flush_pending();
        let _ = self.persist_pool();
        self.header.clean = true;
        let _ = self.store_header();
        let _ = self.file.sync_data();
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.broken {
            return Err(StoreError::Broken);
        }
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    // ── Raw file access ─────────────────────────────────────────

    fn fread(&mut self, off: u64, buf: &mut [u8]) -> Result<(), StoreError> {
        match self.file.read_exact_at(buf, off) {
            Ok(()) => Ok(()),
            Err(e) => {
                // a failed read demotes the handle until reopen
                self.read_only = true;
                Err(e.into())
            }
        }
    }

    /// All mutations go through here so a live transaction records the
    /// pre-image of every byte about to be overwritten.
    fn fwrite(&mut self, off: u64, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(tx) = &mut self.tx {
            if let Some(wal) = &mut tx.wal {
                let end = (off + bytes.len() as u64).min(tx.base_fsiz);
                if off < end {
                    let mut pre = vec![0u8; (end - off) as usize];
                    self.file.read_exact_at(&mut pre, off)?;
                    wal.record(off, &pre)?;
                }
            }
        }
        self.file.write_all_at(bytes, off)?;
        Ok(())
    }

    fn store_header(&mut self) -> Result<(), StoreError> {
        let bytes = self.header.encode();
        self.fwrite(0, &bytes)
    }

    fn persist_pool(&mut self) -> Result<(), StoreError> {
        let mut region = vec![0u8; self.header.fbp_len() as usize];
        self.free.serialize(&mut region);
        self.fwrite(self.header.fbp_off(), &region)
    }

    // ── Buckets and BST links ───────────────────────────────────

    fn read_bucket(&mut self, bucket: u64) -> Result<u64, StoreError> {
        let width = self.header.bucket_width() as usize;
        let mut buf = [0u8; 8];
        let slot = self.header.bucket_slot(bucket);
        self.fread(slot, &mut buf[..width])?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_bucket(&mut self, bucket: u64, shifted: u64) -> Result<(), StoreError> {
        let width = self.header.bucket_width() as usize;
        let slot = self.header.bucket_slot(bucket);
        let bytes = shifted.to_le_bytes();
        self.fwrite(slot, &bytes[..width])
    }

    fn write_child(&mut self, rec_off: u64, right: bool, shifted: u64) -> Result<(), StoreError> {
        let mut buf = [0u8; varint::FIXED_LEN];
        varint::write_fixed(&mut buf, shifted);
        let at = rec_off + if right { record::RIGHT_AT } else { record::LEFT_AT } as u64;
        self.fwrite(at, &buf)
    }

    fn relink(&mut self, slot: Slot, shifted: u64) -> Result<(), StoreError> {
        match slot {
            Slot::Bucket(b) => self.write_bucket(b, shifted),
            Slot::Child { rec_off, right } => self.write_child(rec_off, right, shifted),
        }
    }

    // ── Records ─────────────────────────────────────────────────

    fn read_head(&mut self, off: u64) -> Result<RecordHead, StoreError> {
        if off < self.header.frec
            || off >= self.header.fsiz
            || off & (self.header.align() - 1) != 0
        {
            self.broken = true;
            return Err(StoreError::Corrupt(format!("record offset {off} fails alignment check")));
        }
        let want = 40.min(self.header.fsiz - off) as usize;
        let mut buf = vec![0u8; want];
        self.fread(off, &mut buf)?;
        match RecordHead::decode(&buf) {
            Ok(head) => Ok(head),
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    fn read_key(&mut self, off: u64, head: &RecordHead) -> Result<Vec<u8>, StoreError> {
        let mut key = vec![0u8; head.ksiz as usize];
        self.fread(head.key_off(off), &mut key)?;
        Ok(key)
    }

    fn read_value(&mut self, off: u64, head: &RecordHead) -> Result<Vec<u8>, StoreError> {
        let mut value = vec![0u8; head.vsiz as usize];
        self.fread(head.value_off(off), &mut value)?;
        Ok(value)
    }

    fn write_record(
        &mut self,
        off: u64,
        head: &RecordHead,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StoreError> {
        let mut buf = head.encode();
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        self.fwrite(off, &buf)
    }

    /// Descend the bucket BST. Returns the link referencing the found
    /// record, or the link a new record should attach to.
    fn search(&mut self, key: &[u8]) -> Result<Search, StoreError> {
        let bucket = hashing::bucket(key, self.header.bnum);
        let residue = hashing::residue(key);
        let mut slot = Slot::Bucket(bucket);
        let mut shifted = self.read_bucket(bucket)?;
        while shifted != 0 {
            let off = shifted << self.header.apow;
            let head = self.read_head(off)?;
            // unequal residues decide a direction without the key read
            let ord = match residue.cmp(&head.residue) {
                std::cmp::Ordering::Equal => {
                    let rec_key = self.read_key(off, &head)?;
                    key.cmp(&rec_key[..])
                }
                other => other,
            };
            match ord {
                std::cmp::Ordering::Equal => {
                    return Ok(Search {
                        slot,
                        found: Some((off, head)),
                    });
                }
                std::cmp::Ordering::Less => {
                    slot = Slot::Child { rec_off: off, right: false };
                    shifted = head.left;
                }
                std::cmp::Ordering::Greater => {
                    slot = Slot::Child { rec_off: off, right: true };
                    shifted = head.right;
                }
            }
        }
        Ok(Search { slot, found: None })
    }

    // ── Allocation ──────────────────────────────────────────────

    /// Best-fit from the pool, else append at the file tail. Returns
    /// `(offset, region_size)`.
    fn allocate(&mut self, need: u64) -> Result<(u64, u64), StoreError> {
        let align = self.header.align();
        let need_al = self.header.align_up(need);
        if let Some((off, size)) = self.free.allocate(need_al as u32) {
            let size = size as u64;
            if size - need_al >= align {
                let (r_off, r_size) = self.free.insert(off + need_al, (size - need_al) as u32);
                let free_head = record::encode_free(r_size);
                self.fwrite(r_off, &free_head)?;
                return Ok((off, need_al));
            }
            return Ok((off, size));
        }
        let off = self.header.fsiz;
        self.header.fsiz = off + need_al;
        self.file.set_len(self.header.fsiz)?;
        Ok((off, need_al))
    }

    fn free_region(&mut self, off: u64, size: u64) -> Result<(), StoreError> {
        let (m_off, m_size) = self.free.insert(off, size as u32);
        let head = record::encode_free(m_size);
        self.fwrite(m_off, &head)
    }

    // ── Value packing ───────────────────────────────────────────

    fn pack_value(&self, raw: &[u8]) -> Result<Vec<u8>, StoreError> {
        if !self.header.deflate() {
            return Ok(raw.to_vec());
        }
        let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(raw)?;
        Ok(enc.finish()?)
    }

    fn unpack_value(&self, stored: Vec<u8>) -> Result<Vec<u8>, StoreError> {
        if !self.header.deflate() {
            return Ok(stored);
        }
        let mut dec = flate2::write::DeflateDecoder::new(Vec::new());
        dec.write_all(&stored)?;
        dec.finish().map_err(StoreError::from)
    }

    // ── Core operations ─────────────────────────────────────────

    fn put_locked(&mut self, key: &[u8], value: &[u8], mode: PutMode) -> Result<(), StoreError> {
        self.check_writable()?;
        let search = self.search(key)?;
        match search.found {
            Some((off, old_head)) => {
                if mode == PutMode::Keep {
                    return Err(StoreError::KeyExists);
                }
                let packed = if mode == PutMode::Cat {
                    let old_raw = {
                        let stored = self.read_value(off, &old_head)?;
                        self.unpack_value(stored)?
                    };
                    let mut joined = old_raw;
                    joined.extend_from_slice(value);
                    self.pack_value(&joined)?
                } else {
                    self.pack_value(value)?
                };
                self.overwrite(key, &packed, search.slot, off, old_head)
            }
            None => {
                let packed = self.pack_value(value)?;
                let ksiz = key.len() as u64;
                let vsiz = packed.len() as u64;
                let need = RecordHead::len_for(ksiz, vsiz) + ksiz + vsiz;
                let (off, region) = self.allocate(need)?;
                let head = RecordHead {
                    residue: hashing::residue(key),
                    left: 0,
                    right: 0,
                    psiz: region - need,
                    ksiz,
                    vsiz,
                    header_len: RecordHead::len_for(ksiz, vsiz),
                };
                self.write_record(off, &head, key, &packed)?;
                self.relink(search.slot, off >> self.header.apow)?;
                self.header.rnum += 1;
                self.store_header()
            }
        }
    }

    /// Overwrite in place when the new record fits in the old slot
    /// plus padding, else relocate and rewire the parent link.
    fn overwrite(
        &mut self,
        key: &[u8],
        packed: &[u8],
        slot: Slot,
        off: u64,
        old_head: RecordHead,
    ) -> Result<(), StoreError> {
        let ksiz = key.len() as u64;
        let vsiz = packed.len() as u64;
        let header_len = RecordHead::len_for(ksiz, vsiz);
        let need = header_len + ksiz + vsiz;
        let old_region = old_head.region();

        if need <= old_region {
            let head = RecordHead {
                residue: old_head.residue,
                left: old_head.left,
                right: old_head.right,
                psiz: old_region - need,
                ksiz,
                vsiz,
                header_len,
            };
            self.write_record(off, &head, key, packed)?;
            return self.store_header();
        }

        let (new_off, region) = self.allocate(need)?;
        let head = RecordHead {
            residue: old_head.residue,
            left: old_head.left,
            right: old_head.right,
            psiz: region - need,
            ksiz,
            vsiz,
            header_len,
        };
        self.write_record(new_off, &head, key, packed)?;
        self.relink(slot, new_off >> self.header.apow)?;
        self.free_region(off, old_region)?;
        self.store_header()
    }

    fn get_locked(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if self.broken {
            return Err(StoreError::Broken);
        }
        let search = self.search(key)?;
        match search.found {
            Some((off, head)) => {
                let stored = self.read_value(off, &head)?;
                Ok(Some(self.unpack_value(stored)?))
            }
            None => Ok(None),
        }
    }

    fn out_locked(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        self.check_writable()?;
        let search = self.search(key)?;
        let Some((off, head)) = search.found else {
            return Ok(false);
        };
        let apow = self.header.apow;
        let replacement = match (head.left, head.right) {
            (0, r) => r,
            (l, 0) => l,
            (l, r) => {
                // promote the in-order successor: leftmost of the
                // right subtree
                let mut succ_parent: Option<u64> = None;
                let mut succ = r;
                let succ_head = loop {
                    let s_off = succ << apow;
                    let s_head = self.read_head(s_off)?;
                    if s_head.left == 0 {
                        break s_head;
                    }
                    succ_parent = Some(s_off);
                    succ = s_head.left;
                };
                let succ_off = succ << apow;
                match succ_parent {
                    None => {
                        // successor is the right child itself
                        self.write_child(succ_off, false, l)?;
                    }
                    Some(parent_off) => {
                        self.write_child(parent_off, false, succ_head.right)?;
                        self.write_child(succ_off, false, l)?;
                        self.write_child(succ_off, true, r)?;
                    }
                }
                succ
            }
        };
        self.relink(search.slot, replacement)?;
        self.free_region(off, head.region())?;
        self.header.rnum -= 1;
        self.store_header()?;
        Ok(true)
    }

    fn iterate<F>(&mut self, f: &mut F) -> Result<(), StoreError>
    where
        F: FnMut(&[u8], Vec<u8>) -> Result<bool, StoreError>,
    {
        let mut off = self.header.frec;
        while off < self.header.fsiz {
            let mut magic = [0u8; 1];
            self.fread(off, &mut magic)?;
            match magic[0] {
                FREE_MAGIC => {
                    let mut buf = [0u8; FREE_HEADER as usize];
                    self.fread(off, &mut buf)?;
                    off += record::decode_free_size(&buf)? as u64;
                }
                REC_MAGIC => {
                    let head = self.read_head(off)?;
                    let key = self.read_key(off, &head)?;
                    let stored = self.read_value(off, &head)?;
                    let value = self.unpack_value(stored)?;
                    if !f(&key, value)? {
                        return Ok(());
                    }
                    off += head.region();
                }
                _ => {
                    self.broken = true;
                    return Err(StoreError::Corrupt(format!("unknown region magic at {off}")));
                }
            }
        }
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<(), StoreError> {
        if self.pending.map.is_empty() {
            self.pending.order.clear();
            self.pending.bytes = 0;
            return Ok(());
        }
        let order = std::mem::take(&mut self.pending.order);
        let mut map = std::mem::take(&mut self.pending.map);
        self.pending.bytes = 0;
        for key in order {
            if let Some(value) = map.remove(&key) {
                self.put_locked(&key, &value, PutMode::Replace)?;
            }
        }
        Ok(())
    }

    // ── Transactions ────────────────────────────────────────────

    fn begin_tx_locked(&mut self, wal_path: &Path) -> Result<(), StoreError> {
        self.check_writable()?;
        // the pre-transaction state must be on disk before logging starts
        self.flush_pending()?;
        self.persist_pool()?;
        self.store_header()?;
        let base_fsiz = self.header.fsiz;
        let wal = if self.no_wal {
            None
        } else {
            Some(Wal::begin(wal_path, base_fsiz, true)?)
        };
        self.tx = Some(TxState { wal, base_fsiz });
        Ok(())
    }

    fn reload_from_disk(&mut self) -> Result<(), StoreError> {
        let mut head_bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact_at(&mut head_bytes, 0)?;
        self.header = Header::decode(&head_bytes)?;
        self.rebuild_pool()
    }

    /// Scan the dynamic region and re-derive the free pool.
    fn rebuild_pool(&mut self) -> Result<(), StoreError> {
        self.free = FreePool::new();
        let mut off = self.header.frec;
        while off < self.header.fsiz {
            let mut magic = [0u8; 1];
            self.fread(off, &mut magic)?;
            match magic[0] {
                FREE_MAGIC => {
                    let mut buf = [0u8; FREE_HEADER as usize];
                    self.fread(off, &mut buf)?;
                    let size = record::decode_free_size(&buf)?;
                    self.free.insert(off, size);
                    off += size as u64;
                }
                REC_MAGIC => {
                    let head = self.read_head(off)?;
                    off += head.region();
                }
                _ => {
                    return Err(StoreError::Corrupt(format!("unknown region magic at {off}")));
                }
            }
        }
        Ok(())
    }

    // ── Defrag ──────────────────────────────────────────────────

    fn defrag_locked(&mut self, unit: usize) -> Result<usize, StoreError> {
        let mut shifted_runs = 0usize;
        let mut off = self.header.frec;
        while off < self.header.fsiz {
            let mut magic = [0u8; 1];
            self.fread(off, &mut magic)?;
            if magic[0] == REC_MAGIC {
                let head = self.read_head(off)?;
                off += head.region();
                continue;
            }
            if magic[0] != FREE_MAGIC {
                self.broken = true;
                return Err(StoreError::Corrupt(format!("unknown region magic at {off}")));
            }

            // coalesce the run of adjacent free regions
            let mut run = 0u64;
            let mut end = off;
            while end < self.header.fsiz {
                let mut m = [0u8; 1];
                self.fread(end, &mut m)?;
                if m[0] != FREE_MAGIC {
                    break;
                }
                let mut buf = [0u8; FREE_HEADER as usize];
                self.fread(end, &mut buf)?;
                let size = record::decode_free_size(&buf)? as u64;
                self.free.take_at(end);
                run += size;
                end += size;
            }

            if end >= self.header.fsiz {
                // trailing free space: shrink the file
                self.header.fsiz = off;
                self.file.set_len(off)?;
                self.store_header()?;
                break;
            }

            // move the following record down over the gap
            let head = self.read_head(end)?;
            let region = head.region();
            let mut raw = vec![0u8; region as usize];
            self.fread(end, &mut raw)?;
            let key = self.read_key(end, &head)?;
            self.fwrite(off, &raw)?;
            self.relink_record(&key, end >> self.header.apow, off >> self.header.apow)?;

            // the gap follows the moved record now
            let gap_off = off + region;
            let (m_off, m_size) = self.free.insert(gap_off, run as u32);
            let free_head = record::encode_free(m_size);
            self.fwrite(m_off, &free_head)?;

            off += region;
            shifted_runs += 1;
            if unit > 0 && shifted_runs >= unit {
                break;
            }
        }
        self.persist_pool()?;
        self.store_header()?;
        Ok(shifted_runs)
    }

    /// Rewire whatever link references `old_shifted` for `key`.
    fn relink_record(
        &mut self,
        key: &[u8],
        old_shifted: u64,
        new_shifted: u64,
    ) -> Result<(), StoreError> {
        let bucket = hashing::bucket(key, self.header.bnum);
        let residue = hashing::residue(key);
        let mut cur = self.read_bucket(bucket)?;
        if cur == old_shifted {
            return self.write_bucket(bucket, new_shifted);
        }
        while cur != 0 {
            let off = cur << self.header.apow;
            let head = self.read_head(off)?;
            let ord = match residue.cmp(&head.residue) {
                std::cmp::Ordering::Equal => {
                    let rec_key = self.read_key(off, &head)?;
                    key.cmp(&rec_key[..])
                }
                other => other,
            };
            let (next, right) = match ord {
                std::cmp::Ordering::Less => (head.left, false),
                std::cmp::Ordering::Greater => (head.right, true),
                std::cmp::Ordering::Equal => {
                    return Err(StoreError::Corrupt("relink hit the record itself".into()));
                }
            };
            if next == old_shifted {
                return self.write_child(off, right, new_shifted);
            }
            cur = next;
        }
        Err(StoreError::Corrupt("relink found no referencing link".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_options() -> StoreOptions {
        StoreOptions {
            bnum: 64,
            apow: 4,
            fpow: 6,
            ..StoreOptions::default()
        }
    }

    fn open_store(dir: &tempfile::TempDir, options: StoreOptions) -> HashStore {
        HashStore::open(
            dir.path().join("data"),
            options,
            OpenOptions {
                create: true,
                ..OpenOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, small_options());
        store.put(b"alpha", b"one", PutMode::Replace).unwrap();
        store.put(b"beta", b"two", PutMode::Replace).unwrap();
        assert_eq!(store.get(b"alpha").unwrap().unwrap(), b"one");
        assert_eq!(store.get(b"beta").unwrap().unwrap(), b"two");
        assert_eq!(store.get(b"gamma").unwrap(), None);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn overwrite_in_place_and_relocated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, small_options());
        store.put(b"k", b"short", PutMode::Replace).unwrap();
        let size_before = store.file_size();
        // same slot: fits in old region + padding
        store.put(b"k", b"tiny", PutMode::Replace).unwrap();
        assert_eq!(store.file_size(), size_before);
        assert_eq!(store.get(b"k").unwrap().unwrap(), b"tiny");
        // forces relocation
        let big = vec![7u8; 500];
        store.put(b"k", &big, PutMode::Replace).unwrap();
        assert_eq!(store.get(b"k").unwrap().unwrap(), big);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn keep_and_cat_modes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, small_options());
        store.put(b"k", b"abc", PutMode::Keep).unwrap();
        assert!(matches!(
            store.put(b"k", b"xyz", PutMode::Keep),
            Err(StoreError::KeyExists)
        ));
        store.put(b"k", b"def", PutMode::Cat).unwrap();
        assert_eq!(store.get(b"k").unwrap().unwrap(), b"abcdef");
    }

    #[test]
    fn out_unlinks_and_reuses_space() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, small_options());
        // enough keys to exercise BST chains inside 64 buckets
        for i in 0..512u32 {
            store
                .put(format!("key-{i}").as_bytes(), &i.to_le_bytes(), PutMode::Replace)
                .unwrap();
        }
        for i in (0..512u32).step_by(2) {
            assert!(store.out(format!("key-{i}").as_bytes()).unwrap());
        }
        assert_eq!(store.count().unwrap(), 256);
        for i in 0..512u32 {
            let got = store.get(format!("key-{i}").as_bytes()).unwrap();
            if i % 2 == 0 {
                assert!(got.is_none(), "key-{i} should be gone");
            } else {
                assert_eq!(got.unwrap(), i.to_le_bytes());
            }
        }
        // freed regions get reused instead of growing the tail
        let size_before = store.file_size();
        for i in (0..512u32).step_by(2) {
            store
                .put(format!("key-{i}").as_bytes(), &i.to_le_bytes(), PutMode::Replace)
                .unwrap();
        }
        assert_eq!(store.file_size(), size_before);
    }

    #[test]
    fn iterate_visits_every_live_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, small_options());
        for i in 0..100u32 {
            store
                .put(format!("k{i}").as_bytes(), &i.to_le_bytes(), PutMode::Replace)
                .unwrap();
        }
        store.out(b"k10").unwrap();
        store.out(b"k20").unwrap();
        let mut seen = std::collections::HashSet::new();
        store
            .for_each(|key, _value| {
                seen.insert(String::from_utf8(key.to_vec()).unwrap());
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen.len(), 98);
        assert!(!seen.contains("k10"));
    }

    #[test]
    fn close_and_reopen_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir, small_options());
            for i in 0..50u32 {
                store
                    .put(format!("k{i}").as_bytes(), &i.to_le_bytes(), PutMode::Replace)
                    .unwrap();
            }
            store.out(b"k7").unwrap();
        }
        let store = HashStore::open(
            dir.path().join("data"),
            small_options(),
            OpenOptions::default(),
        )
        .unwrap();
        assert_eq!(store.count().unwrap(), 49);
        assert_eq!(store.get(b"k3").unwrap().unwrap(), 3u32.to_le_bytes());
        assert!(store.get(b"k7").unwrap().is_none());
    }

    #[test]
    fn abort_restores_pre_transaction_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, small_options());
        store.put(b"keep", b"original", PutMode::Replace).unwrap();
        store.begin_tx().unwrap();
        store.put(b"keep", b"changed", PutMode::Replace).unwrap();
        store.put(b"new", b"value", PutMode::Replace).unwrap();
        store.abort_tx().unwrap();
        assert_eq!(store.get(b"keep").unwrap().unwrap(), b"original");
        assert!(store.get(b"new").unwrap().is_none());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn commit_keeps_transaction_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, small_options());
        store.begin_tx().unwrap();
        store.put(b"a", b"1", PutMode::Replace).unwrap();
        store.commit_tx().unwrap();
        assert_eq!(store.get(b"a").unwrap().unwrap(), b"1");
        assert!(!store.tx_active());
    }

    #[test]
    fn async_puts_coalesce_and_flush_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, small_options());
        store.put_async(b"k", b"first").unwrap();
        store.put_async(b"k", b"second").unwrap();
        store.put_async(b"other", b"x").unwrap();
        // the read of a buffered key forces the flush
        assert_eq!(store.get(b"k").unwrap().unwrap(), b"second");
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn deflate_stores_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(
            &dir,
            StoreOptions {
                deflate: true,
                ..small_options()
            },
        );
        let value = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".repeat(10);
        store.put(b"z", &value, PutMode::Replace).unwrap();
        assert_eq!(store.get(b"z").unwrap().unwrap(), value);
        store.put(b"z", &value[..10], PutMode::Cat).unwrap();
        let mut expect = value.clone();
        expect.extend_from_slice(&value[..10]);
        assert_eq!(store.get(b"z").unwrap().unwrap(), expect);
    }

    #[test]
    fn defrag_compacts_trailing_space() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, small_options());
        for i in 0..64u32 {
            store
                .put(format!("k{i}").as_bytes(), &[0u8; 100], PutMode::Replace)
                .unwrap();
        }
        for i in 0..64u32 {
            if i % 2 == 1 {
                store.out(format!("k{i}").as_bytes()).unwrap();
            }
        }
        let before = store.file_size();
        store.defrag(0).unwrap();
        assert!(store.file_size() < before, "defrag should shrink the file");
        for i in (0..64u32).step_by(2) {
            assert!(store.get(format!("k{i}").as_bytes()).unwrap().is_some());
        }
    }

    #[test]
    fn optimize_rewrites_with_new_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, small_options());
        for i in 0..200u32 {
            store
                .put(format!("k{i}").as_bytes(), &i.to_le_bytes(), PutMode::Replace)
                .unwrap();
        }
        for i in 0..100u32 {
            store.out(format!("k{i}").as_bytes()).unwrap();
        }
        store
            .optimize(StoreOptions {
                bnum: 128,
                ..small_options()
            })
            .unwrap();
        assert_eq!(store.count().unwrap(), 100);
        assert_eq!(store.get(b"k150").unwrap().unwrap(), 150u32.to_le_bytes());
    }
}
