//! File-backed B+ tree for secondary indexes.
//!
//! Keys are canonical byte strings prepared by the collection layer;
//! values are sorted lists of fixed-width record keys (OIDs), and
//! insertion is idempotent per `(key, oid)` pair. Leaves are doubly
//! linked for range scans. Nodes occupy one or more contiguous
//! page-size units; an LRU page cache sits over the file.

mod node;

use std::collections::HashMap;
use std::fs::{File, OpenOptions as FsOpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::error::StoreError;

use node::{LeafEntry, Node, OID_LEN};

const MAGIC: &[u8; 16] = b"satchel-btree\0\0\0";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 80;

#[derive(Debug, Clone)]
pub struct BTreeOptions {
    pub page_size: u32,
    /// Cached node budget for the LRU page cache.
    pub cache_pages: usize,
}

impl Default for BTreeOptions {
    fn default() -> BTreeOptions {
        BTreeOptions {
            page_size: 4096,
            cache_pages: 256,
        }
    }
}

/// Aggregates kept in the tree header for planner scoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeStats {
    /// Total `(key, oid)` pairs.
    pub pairs: u64,
    /// Distinct keys.
    pub keys: u64,
    /// Sum of distinct key lengths.
    pub key_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

pub struct BTree {
    path: PathBuf,
    inner: Mutex<TreeInner>,
}

struct Slot {
    node: Node,
    units: u16,
    dirty: bool,
    used: u64,
}

struct TreeInner {
    file: File,
    page_size: u64,
    cache_cap: usize,
    root: u64,
    first_leaf: u64,
    last_leaf: u64,
    npages: u64,
    stats: TreeStats,
    cache: HashMap<u64, Slot>,
    stamp: u64,
    free_spans: Vec<(u64, u16)>,
    header_dirty: bool,
}

impl BTree {
    pub fn open(path: impl AsRef<Path>, options: BTreeOptions) -> Result<BTree, StoreError> {
        let path = path.as_ref().to_path_buf();
        let inner = TreeInner::open(&path, &options)?;
        Ok(BTree {
            path,
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> TreeStats {
        self.inner.lock().stats
    }

    /// Idempotent insert of a `(key, oid)` pair. Returns whether the
    /// pair was new.
    pub fn put(&self, key: &[u8], oid: [u8; OID_LEN]) -> Result<bool, StoreError> {
        self.inner.lock().insert(key, oid)
    }

    /// Remove one `(key, oid)` pair. Returns whether it existed.
    pub fn remove(&self, key: &[u8], oid: [u8; OID_LEN]) -> Result<bool, StoreError> {
        self.inner.lock().remove(key, oid)
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<[u8; OID_LEN]>, StoreError> {
        self.inner.lock().lookup(key)
    }

    /// Position before the smallest (forward) or largest (reverse) key.
    pub fn cursor(&self, dir: Direction) -> Result<Cursor<'_>, StoreError> {
        let pos = self.inner.lock().edge_position(dir)?;
        Ok(Cursor { tree: self, dir, pos })
    }

    /// `jump`: position at the first entry ≥ `key` (forward) or the
    /// last entry ≤ `key` (reverse).
    pub fn cursor_at(&self, key: &[u8], dir: Direction) -> Result<Cursor<'_>, StoreError> {
        let pos = self.inner.lock().seek_position(key, dir)?;
        Ok(Cursor { tree: self, dir, pos })
    }

    /// Write every dirty node and the header, then fsync.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.inner.lock().flush()
    }

    /// Compact rewrite into a fresh file.
    pub fn optimize(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.flush()?;
        let tmp_path = self.path.with_extension("opt");
        let _ = std::fs::remove_file(&tmp_path);
        let tmp = BTree::open(
            &tmp_path,
            BTreeOptions {
                page_size: inner.page_size as u32,
                cache_pages: inner.cache_cap,
            },
        )?;
        {
            let mut tmp_inner = tmp.inner.lock();
            let mut pos = inner.edge_position(Direction::Forward)?;
            while let Some((leaf, idx)) = pos {
                let (entry, next) = inner.read_and_step(leaf, idx, Direction::Forward)?;
                for oid in &entry.oids {
                    tmp_inner.insert(&entry.key, *oid)?;
                }
                pos = next;
            }
            tmp_inner.flush()?;
        }
        drop(tmp);
        std::fs::rename(&tmp_path, &self.path)?;
        let reopen = BTreeOptions {
            page_size: inner.page_size as u32,
            cache_pages: inner.cache_cap,
        };
        *inner = TreeInner::open(&self.path, &reopen)?;
        Ok(())
    }
}

impl Drop for BTree {
    fn drop(&mut self) {
        let _ = self.inner.lock().flush();
    }
}

/// Range cursor; stable under concurrent readers only. Writers on the
/// same index require the collection write lock, which excludes open
/// cursors.
pub struct Cursor<'a> {
    tree: &'a BTree,
    dir: Direction,
    pos: Option<(u64, usize)>,
}

impl Cursor<'_> {
    /// Yield the current entry and advance in the cursor's direction.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<[u8; OID_LEN]>)>, StoreError> {
        let Some((leaf, idx)) = self.pos else {
            return Ok(None);
        };
        let mut inner = self.tree.inner.lock();
        let (entry, next) = inner.read_and_step(leaf, idx, self.dir)?;
        self.pos = next;
        Ok(Some((entry.key, entry.oids)))
    }
}

impl TreeInner {
    fn open(path: &Path, options: &BTreeOptions) -> Result<TreeInner, StoreError> {
        let file = FsOpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            let inner = TreeInner {
                file,
                page_size: options.page_size as u64,
                cache_cap: options.cache_pages.max(8),
                root: 0,
                first_leaf: 0,
                last_leaf: 0,
                npages: 1,
                stats: TreeStats::default(),
                cache: HashMap::new(),
                stamp: 0,
                free_spans: Vec::new(),
                header_dirty: true,
            };
            inner.file.set_len(inner.page_size)?;
            inner.write_header()?;
            return Ok(inner);
        }
        let mut head = [0u8; HEADER_LEN];
        file.read_exact_at(&mut head, 0)?;
        if &head[..16] != MAGIC || head[16] != FORMAT_VERSION {
            return Err(StoreError::Corrupt("index tree magic".into()));
        }
        Ok(TreeInner {
            page_size: LittleEndian::read_u32(&head[20..24]) as u64,
            cache_cap: options.cache_pages.max(8),
            root: LittleEndian::read_u64(&head[24..32]),
            first_leaf: LittleEndian::read_u64(&head[32..40]),
            last_leaf: LittleEndian::read_u64(&head[40..48]),
            npages: LittleEndian::read_u64(&head[48..56]),
            stats: TreeStats {
                pairs: LittleEndian::read_u64(&head[56..64]),
                keys: LittleEndian::read_u64(&head[64..72]),
                key_bytes: LittleEndian::read_u64(&head[72..80]),
            },
            file,
            cache: HashMap::new(),
            stamp: 0,
            free_spans: Vec::new(),
            header_dirty: false,
        })
    }

    fn write_header(&self) -> Result<(), StoreError> {
        let mut head = [0u8; HEADER_LEN];
        head[..16].copy_from_slice(MAGIC);
        head[16] = FORMAT_VERSION;
        LittleEndian::write_u32(&mut head[20..24], self.page_size as u32);
        LittleEndian::write_u64(&mut head[24..32], self.root);
        LittleEndian::write_u64(&mut head[32..40], self.first_leaf);
        LittleEndian::write_u64(&mut head[40..48], self.last_leaf);
        LittleEndian::write_u64(&mut head[48..56], self.npages);
        LittleEndian::write_u64(&mut head[56..64], self.stats.pairs);
        LittleEndian::write_u64(&mut head[64..72], self.stats.keys);
        LittleEndian::write_u64(&mut head[72..80], self.stats.key_bytes);
        self.file.write_all_at(&head, 0)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        let ids: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, s)| s.dirty)
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            let (bytes, off) = {
                let slot = self.cache.get_mut(&id).unwrap();
                slot.dirty = false;
                (slot.node.encode(slot.units), id * self.page_size)
            };
            self.file.write_all_at(&bytes, off)?;
        }
        self.write_header()?;
        self.header_dirty = false;
        self.file.sync_data()?;
        Ok(())
    }

    // ── Node cache ──────────────────────────────────────────────

    fn take_node(&mut self, id: u64) -> Result<(Node, u16, bool), StoreError> {
        if let Some(slot) = self.cache.remove(&id) {
            return Ok((slot.node, slot.units, slot.dirty));
        }
        let mut first = vec![0u8; self.page_size as usize];
        self.file.read_exact_at(&mut first, id * self.page_size)?;
        let total = LittleEndian::read_u32(&first[1..5]) as usize;
        let bytes = if total > first.len() {
            let mut all = vec![0u8; total.div_ceil(self.page_size as usize) * self.page_size as usize];
            self.file.read_exact_at(&mut all, id * self.page_size)?;
            all
        } else {
            first
        };
        let (node, units) = Node::decode(&bytes)?;
        Ok((node, units, false))
    }

    fn put_node(&mut self, id: u64, node: Node, units: u16, dirty: bool) -> Result<(), StoreError> {
        self.stamp += 1;
        let used = self.stamp;
        self.cache.insert(id, Slot { node, units, dirty, used });
        self.evict_if_needed()
    }

    fn evict_if_needed(&mut self) -> Result<(), StoreError> {
        while self.cache.len() > self.cache_cap {
            let victim = self
                .cache
                .iter()
                .min_by_key(|(_, s)| s.used)
                .map(|(&id, _)| id)
                .unwrap();
            let slot = self.cache.remove(&victim).unwrap();
            if slot.dirty {
                let bytes = slot.node.encode(slot.units);
                self.file.write_all_at(&bytes, victim * self.page_size)?;
            }
        }
        Ok(())
    }

    // ── Span allocation ─────────────────────────────────────────

    fn units_for(&self, encoded_len: usize) -> u16 {
        (encoded_len as u64).div_ceil(self.page_size).max(1) as u16
    }

    fn alloc_span(&mut self, units: u16) -> Result<u64, StoreError> {
        for i in 0..self.free_spans.len() {
            let (id, have) = self.free_spans[i];
            if have >= units {
                if have > units {
                    self.free_spans[i] = (id + units as u64, have - units);
                } else {
                    self.free_spans.swap_remove(i);
                }
                return Ok(id);
            }
        }
        let id = self.npages;
        self.npages += units as u64;
        self.file.set_len(self.npages * self.page_size)?;
        self.header_dirty = true;
        Ok(id)
    }

    fn free_span(&mut self, id: u64, units: u16) {
        self.free_spans.push((id, units));
    }

    /// Store a node back, relocating when it outgrew its span.
    /// Returns the node's (possibly new) id.
    fn save_node(&mut self, id: u64, node: Node, units: u16) -> Result<u64, StoreError> {
        let needed = self.units_for(node.encoded_len());
        if needed <= units {
            self.put_node(id, node, units, true)?;
            return Ok(id);
        }
        let new_units = needed.max(units.saturating_mul(2));
        let new_id = self.alloc_span(new_units)?;
        self.free_span(id, units);
        self.put_node(new_id, node, new_units, true)?;
        Ok(new_id)
    }

    /// After a relocation, rewire the parent link, the leaf chain and
    /// the root/edge bookkeeping.
    fn fix_references(
        &mut self,
        old: u64,
        new: u64,
        path: &[(u64, usize)],
        moved: &Node,
    ) -> Result<(), StoreError> {
        match path.last() {
            None => {
                self.root = new;
                self.header_dirty = true;
            }
            Some(&(pid, idx)) => {
                let (pnode, punits, _) = self.take_node(pid)?;
                let Node::Internal { keys, mut children } = pnode else {
                    return Err(StoreError::Corrupt("leaf parent is not internal".into()));
                };
                debug_assert_eq!(children[idx], old);
                children[idx] = new;
                self.put_node(pid, Node::Internal { keys, children }, punits, true)?;
            }
        }
        if let Node::Leaf { prev, next, .. } = moved {
            let (prev, next) = (*prev, *next);
            if prev != 0 {
                let (mut n, u, _) = self.take_node(prev)?;
                if let Node::Leaf { next: pn, .. } = &mut n {
                    *pn = new;
                }
                self.put_node(prev, n, u, true)?;
            } else {
                self.first_leaf = new;
                self.header_dirty = true;
            }
            if next != 0 {
                let (mut n, u, _) = self.take_node(next)?;
                if let Node::Leaf { prev: np, .. } = &mut n {
                    *np = new;
                }
                self.put_node(next, n, u, true)?;
            } else {
                self.last_leaf = new;
                self.header_dirty = true;
            }
        }
        Ok(())
    }

    // ── Insert ──────────────────────────────────────────────────

    fn insert(&mut self, key: &[u8], oid: [u8; OID_LEN]) -> Result<bool, StoreError> {
        if self.root == 0 {
            let id = self.alloc_span(1)?;
            let node = Node::Leaf {
                prev: 0,
                next: 0,
                entries: vec![LeafEntry {
                    key: key.to_vec(),
                    oids: vec![oid],
                }],
            };
            self.root = id;
            self.first_leaf = id;
            self.last_leaf = id;
            self.stats.pairs += 1;
            self.stats.keys += 1;
            self.stats.key_bytes += key.len() as u64;
            self.header_dirty = true;
            self.put_node(id, node, 1, true)?;
            return Ok(true);
        }

        let mut path: Vec<(u64, usize)> = Vec::new();
        let mut id = self.root;
        loop {
            let (node, units, dirty) = self.take_node(id)?;
            match node {
                Node::Internal { keys, children } => {
                    let idx = keys.partition_point(|k| k.as_slice() <= key);
                    let child = children[idx];
                    self.put_node(id, Node::Internal { keys, children }, units, dirty)?;
                    path.push((id, idx));
                    id = child;
                }
                Node::Leaf { prev, next, mut entries } => {
                    let pos = entries.partition_point(|e| e.key.as_slice() < key);
                    let added = if pos < entries.len() && entries[pos].key == key {
                        match entries[pos].oids.binary_search(&oid) {
                            Ok(_) => false,
                            Err(i) => {
                                entries[pos].oids.insert(i, oid);
                                self.stats.pairs += 1;
                                true
                            }
                        }
                    } else {
                        entries.insert(
                            pos,
                            LeafEntry {
                                key: key.to_vec(),
                                oids: vec![oid],
                            },
                        );
                        self.stats.pairs += 1;
                        self.stats.keys += 1;
                        self.stats.key_bytes += key.len() as u64;
                        true
                    };
                    if added {
                        self.header_dirty = true;
                    }
                    let node = Node::Leaf { prev, next, entries };
                    self.store_leaf(id, node, units, path)?;
                    return Ok(added);
                }
            }
        }
    }

    fn store_leaf(
        &mut self,
        id: u64,
        node: Node,
        units: u16,
        path: Vec<(u64, usize)>,
    ) -> Result<(), StoreError> {
        let len = node.encoded_len() as u64;
        let splittable = matches!(&node, Node::Leaf { entries, .. } if entries.len() >= 2);
        if len > self.page_size && splittable {
            return self.split_leaf(id, node, units, path);
        }
        let new_id = self.save_node(id, node, units)?;
        if new_id != id {
            let moved = self.cache.get(&new_id).unwrap().node.clone();
            self.fix_references(id, new_id, &path, &moved)?;
        }
        Ok(())
    }

    fn split_leaf(
        &mut self,
        id: u64,
        node: Node,
        units: u16,
        path: Vec<(u64, usize)>,
    ) -> Result<(), StoreError> {
        let Node::Leaf { prev, next, mut entries } = node else {
            return Err(StoreError::Corrupt("split_leaf on internal node".into()));
        };
        let mid = entries.len() / 2;
        let right_entries = entries.split_off(mid);
        let sep = right_entries[0].key.clone();

        let right = Node::Leaf {
            prev: id,
            next,
            entries: right_entries,
        };
        let right_units = self.units_for(right.encoded_len());
        let right_id = self.alloc_span(right_units)?;

        if next != 0 {
            let (mut n, u, _) = self.take_node(next)?;
            if let Node::Leaf { prev: np, .. } = &mut n {
                *np = right_id;
            }
            self.put_node(next, n, u, true)?;
        } else {
            self.last_leaf = right_id;
            self.header_dirty = true;
        }
        self.put_node(right_id, right, right_units, true)?;

        let left = Node::Leaf {
            prev,
            next: right_id,
            entries,
        };
        let left_id = self.save_node(id, left, units)?;
        if left_id != id {
            let moved = self.cache.get(&left_id).unwrap().node.clone();
            self.fix_references(id, left_id, &path, &moved)?;
        }

        self.insert_separator(path, sep, left_id, right_id)
    }

    fn insert_separator(
        &mut self,
        mut path: Vec<(u64, usize)>,
        sep: Vec<u8>,
        left_id: u64,
        right_id: u64,
    ) -> Result<(), StoreError> {
        match path.pop() {
            None => {
                let node = Node::Internal {
                    keys: vec![sep],
                    children: vec![left_id, right_id],
                };
                let units = self.units_for(node.encoded_len());
                let root_id = self.alloc_span(units)?;
                self.put_node(root_id, node, units, true)?;
                self.root = root_id;
                self.header_dirty = true;
                Ok(())
            }
            Some((pid, idx)) => {
                let (pnode, punits, _) = self.take_node(pid)?;
                let Node::Internal { mut keys, mut children } = pnode else {
                    return Err(StoreError::Corrupt("separator parent is not internal".into()));
                };
                debug_assert_eq!(children[idx], left_id);
                keys.insert(idx, sep);
                children.insert(idx + 1, right_id);
                let node = Node::Internal { keys, children };
                self.store_internal(pid, node, punits, path)
            }
        }
    }

    fn store_internal(
        &mut self,
        id: u64,
        node: Node,
        units: u16,
        path: Vec<(u64, usize)>,
    ) -> Result<(), StoreError> {
        let len = node.encoded_len() as u64;
        let splittable = matches!(&node, Node::Internal { keys, .. } if keys.len() >= 3);
        if len > self.page_size && splittable {
            let Node::Internal { mut keys, mut children } = node else {
                unreachable!()
            };
            let mid = keys.len() / 2;
            let up = keys[mid].clone();
            let right_keys = keys.split_off(mid + 1);
            keys.pop();
            let right_children = children.split_off(mid + 1);

            let right = Node::Internal {
                keys: right_keys,
                children: right_children,
            };
            let right_units = self.units_for(right.encoded_len());
            let right_id = self.alloc_span(right_units)?;
            self.put_node(right_id, right, right_units, true)?;

            let left = Node::Internal { keys, children };
            let left_id = self.save_node(id, left, units)?;
            if left_id != id {
                let moved = self.cache.get(&left_id).unwrap().node.clone();
                self.fix_references(id, left_id, &path, &moved)?;
            }
            return self.insert_separator(path, up, left_id, right_id);
        }
        let new_id = self.save_node(id, node, units)?;
        if new_id != id {
            let moved = self.cache.get(&new_id).unwrap().node.clone();
            self.fix_references(id, new_id, &path, &moved)?;
        }
        Ok(())
    }

    // ── Remove / lookup ─────────────────────────────────────────

    fn leaf_for(&mut self, key: &[u8]) -> Result<Option<u64>, StoreError> {
        if self.root == 0 {
            return Ok(None);
        }
        let mut id = self.root;
        loop {
            let (node, units, dirty) = self.take_node(id)?;
            match node {
                Node::Internal { keys, children } => {
                    let idx = keys.partition_point(|k| k.as_slice() <= key);
                    let child = children[idx];
                    self.put_node(id, Node::Internal { keys, children }, units, dirty)?;
                    id = child;
                }
                leaf @ Node::Leaf { .. } => {
                    self.put_node(id, leaf, units, dirty)?;
                    return Ok(Some(id));
                }
            }
        }
    }

    fn remove(&mut self, key: &[u8], oid: [u8; OID_LEN]) -> Result<bool, StoreError> {
        let Some(id) = self.leaf_for(key)? else {
            return Ok(false);
        };
        let (node, units, dirty) = self.take_node(id)?;
        let Node::Leaf { prev, next, mut entries } = node else {
            return Err(StoreError::Corrupt("leaf_for returned internal".into()));
        };
        let mut removed = false;
        if let Some(pos) = entries.iter().position(|e| e.key.as_slice() == key) {
            if let Ok(i) = entries[pos].oids.binary_search(&oid) {
                entries[pos].oids.remove(i);
                self.stats.pairs -= 1;
                removed = true;
                if entries[pos].oids.is_empty() {
                    self.stats.keys -= 1;
                    self.stats.key_bytes -= key.len() as u64;
                    entries.remove(pos);
                }
                self.header_dirty = true;
            }
        }
        // shrinking always fits back into its span
        self.put_node(id, Node::Leaf { prev, next, entries }, units, dirty || removed)?;
        Ok(removed)
    }

    fn lookup(&mut self, key: &[u8]) -> Result<Vec<[u8; OID_LEN]>, StoreError> {
        let Some(id) = self.leaf_for(key)? else {
            return Ok(Vec::new());
        };
        let (node, units, dirty) = self.take_node(id)?;
        let oids = match &node {
            Node::Leaf { entries, .. } => entries
                .iter()
                .find(|e| e.key.as_slice() == key)
                .map(|e| e.oids.clone())
                .unwrap_or_default(),
            Node::Internal { .. } => Vec::new(),
        };
        self.put_node(id, node, units, dirty)?;
        Ok(oids)
    }

    // ── Cursor support ──────────────────────────────────────────

    fn edge_position(&mut self, dir: Direction) -> Result<Option<(u64, usize)>, StoreError> {
        match dir {
            Direction::Forward => {
                if self.first_leaf == 0 {
                    return Ok(None);
                }
                self.normalize_forward(self.first_leaf, 0)
            }
            Direction::Reverse => {
                if self.last_leaf == 0 {
                    return Ok(None);
                }
                self.normalize_reverse_from_tail(self.last_leaf)
            }
        }
    }

    fn seek_position(
        &mut self,
        key: &[u8],
        dir: Direction,
    ) -> Result<Option<(u64, usize)>, StoreError> {
        let Some(id) = self.leaf_for(key)? else {
            return Ok(None);
        };
        let (node, units, dirty) = self.take_node(id)?;
        let Node::Leaf { prev, entries, .. } = &node else {
            return Err(StoreError::Corrupt("leaf_for returned internal".into()));
        };
        let result = match dir {
            Direction::Forward => {
                let idx = entries.partition_point(|e| e.key.as_slice() < key);
                Some((id, idx))
            }
            Direction::Reverse => {
                let pp = entries.partition_point(|e| e.key.as_slice() <= key);
                if pp == 0 {
                    let prev = *prev;
                    if prev == 0 { None } else { Some((prev, usize::MAX)) }
                } else {
                    Some((id, pp - 1))
                }
            }
        };
        self.put_node(id, node, units, dirty)?;
        match (result, dir) {
            (None, _) => Ok(None),
            (Some((leaf, idx)), Direction::Forward) => self.normalize_forward(leaf, idx),
            (Some((leaf, idx)), Direction::Reverse) => {
                if idx == usize::MAX {
                    self.normalize_reverse_from_tail(leaf)
                } else {
                    Ok(Some((leaf, idx)))
                }
            }
        }
    }

    /// Skip past-the-end positions and empty leaves going forward.
    fn normalize_forward(
        &mut self,
        mut leaf: u64,
        mut idx: usize,
    ) -> Result<Option<(u64, usize)>, StoreError> {
        loop {
            let (node, units, dirty) = self.take_node(leaf)?;
            let (len, next) = match &node {
                Node::Leaf { entries, next, .. } => (entries.len(), *next),
                Node::Internal { .. } => {
                    return Err(StoreError::Corrupt("leaf chain hit internal node".into()));
                }
            };
            self.put_node(leaf, node, units, dirty)?;
            if idx < len {
                return Ok(Some((leaf, idx)));
            }
            if next == 0 {
                return Ok(None);
            }
            leaf = next;
            idx = 0;
        }
    }

    /// Last entry at or before `leaf`'s tail, walking prev links past
    /// empty leaves.
    fn normalize_reverse_from_tail(
        &mut self,
        mut leaf: u64,
    ) -> Result<Option<(u64, usize)>, StoreError> {
        loop {
            let (node, units, dirty) = self.take_node(leaf)?;
            let (len, prev) = match &node {
                Node::Leaf { entries, prev, .. } => (entries.len(), *prev),
                Node::Internal { .. } => {
                    return Err(StoreError::Corrupt("leaf chain hit internal node".into()));
                }
            };
            self.put_node(leaf, node, units, dirty)?;
            if len > 0 {
                return Ok(Some((leaf, len - 1)));
            }
            if prev == 0 {
                return Ok(None);
            }
            leaf = prev;
        }
    }

    /// Read the entry at a position and compute the next position in
    /// the given direction.
    fn read_and_step(
        &mut self,
        leaf: u64,
        idx: usize,
        dir: Direction,
    ) -> Result<(LeafEntry, Option<(u64, usize)>), StoreError> {
        let (node, units, dirty) = self.take_node(leaf)?;
        let Node::Leaf { prev, next, entries } = &node else {
            return Err(StoreError::Corrupt("cursor left the leaf chain".into()));
        };
        let entry = entries
            .get(idx)
            .cloned()
            .ok_or_else(|| StoreError::Corrupt("cursor position out of range".into()))?;
        let (prev, next, len) = (*prev, *next, entries.len());
        self.put_node(leaf, node, units, dirty)?;
        let step = match dir {
            Direction::Forward => {
                if idx + 1 < len {
                    Some((leaf, idx + 1))
                } else if next != 0 {
                    self.normalize_forward(next, 0)?
                } else {
                    None
                }
            }
            Direction::Reverse => {
                if idx > 0 {
                    Some((leaf, idx - 1))
                } else if prev != 0 {
                    self.normalize_reverse_from_tail(prev)?
                } else {
                    None
                }
            }
        };
        Ok((entry, step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u32) -> [u8; 12] {
        let mut b = [0u8; 12];
        b[8..12].copy_from_slice(&n.to_be_bytes());
        b
    }

    fn small_tree(dir: &tempfile::TempDir) -> BTree {
        BTree::open(
            dir.path().join("idx"),
            BTreeOptions {
                page_size: 256,
                cache_pages: 16,
            },
        )
        .unwrap()
    }

    #[test]
    fn put_get_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let tree = small_tree(&dir);
        assert!(tree.put(b"alpha", oid(1)).unwrap());
        assert!(tree.put(b"alpha", oid(2)).unwrap());
        assert!(!tree.put(b"alpha", oid(1)).unwrap(), "duplicate pair is a no-op");
        assert_eq!(tree.get(b"alpha").unwrap(), vec![oid(1), oid(2)]);
        assert!(tree.get(b"beta").unwrap().is_empty());
        let stats = tree.stats();
        assert_eq!(stats.pairs, 2);
        assert_eq!(stats.keys, 1);
    }

    #[test]
    fn many_keys_split_and_scan_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let tree = small_tree(&dir);
        // insert shuffled so splits happen away from the tail
        let mut keys: Vec<u32> = (0..500).collect();
        keys.reverse();
        for k in &keys {
            tree.put(format!("{k:08}").as_bytes(), oid(*k)).unwrap();
        }
        let mut cursor = tree.cursor(Direction::Forward).unwrap();
        let mut seen = Vec::new();
        while let Some((key, oids)) = cursor.next().unwrap() {
            assert_eq!(oids.len(), 1);
            seen.push(String::from_utf8(key).unwrap());
        }
        assert_eq!(seen.len(), 500);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted, "forward scan must be key-ordered");
    }

    #[test]
    fn jump_positions_at_first_geq() {
        let dir = tempfile::tempdir().unwrap();
        let tree = small_tree(&dir);
        for k in [10u32, 20, 30, 40] {
            tree.put(format!("{k:08}").as_bytes(), oid(k)).unwrap();
        }
        let mut cursor = tree.cursor_at(b"00000025", Direction::Forward).unwrap();
        let (key, _) = cursor.next().unwrap().unwrap();
        assert_eq!(key, b"00000030");

        let mut cursor = tree.cursor_at(b"00000025", Direction::Reverse).unwrap();
        let (key, _) = cursor.next().unwrap().unwrap();
        assert_eq!(key, b"00000020");
        let (key, _) = cursor.next().unwrap().unwrap();
        assert_eq!(key, b"00000010");
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn remove_drops_pairs_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        let tree = small_tree(&dir);
        tree.put(b"k", oid(1)).unwrap();
        tree.put(b"k", oid(2)).unwrap();
        assert!(tree.remove(b"k", oid(1)).unwrap());
        assert!(!tree.remove(b"k", oid(1)).unwrap());
        assert_eq!(tree.get(b"k").unwrap(), vec![oid(2)]);
        assert!(tree.remove(b"k", oid(2)).unwrap());
        assert!(tree.get(b"k").unwrap().is_empty());
        assert_eq!(tree.stats().keys, 0);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tree = small_tree(&dir);
            for k in 0..200u32 {
                tree.put(format!("{k:08}").as_bytes(), oid(k)).unwrap();
            }
            tree.flush().unwrap();
        }
        let tree = small_tree(&dir);
        assert_eq!(tree.stats().pairs, 200);
        assert_eq!(tree.get(b"00000199").unwrap(), vec![oid(199)]);
        let mut cursor = tree.cursor(Direction::Reverse).unwrap();
        let (key, _) = cursor.next().unwrap().unwrap();
        assert_eq!(key, b"00000199");
    }

    #[test]
    fn oversized_oid_list_spans_pages() {
        let dir = tempfile::tempdir().unwrap();
        let tree = small_tree(&dir);
        // one key with far more oids than a 256-byte page holds
        for n in 0..200u32 {
            tree.put(b"hot", oid(n)).unwrap();
        }
        // neighbors so relocation has references to fix
        tree.put(b"aaa", oid(1000)).unwrap();
        tree.put(b"zzz", oid(1001)).unwrap();
        assert_eq!(tree.get(b"hot").unwrap().len(), 200);
        let mut cursor = tree.cursor(Direction::Forward).unwrap();
        let (key, _) = cursor.next().unwrap().unwrap();
        assert_eq!(key, b"aaa");
    }

    #[test]
    fn optimize_compacts_and_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let tree = small_tree(&dir);
        for k in 0..300u32 {
            tree.put(format!("{k:08}").as_bytes(), oid(k)).unwrap();
        }
        for k in 0..250u32 {
            tree.remove(format!("{k:08}").as_bytes(), oid(k)).unwrap();
        }
        tree.optimize().unwrap();
        assert_eq!(tree.stats().pairs, 50);
        assert_eq!(tree.get(b"00000299").unwrap(), vec![oid(299)]);
    }
}
