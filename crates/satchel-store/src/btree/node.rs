use byteorder::{ByteOrder, LittleEndian};

use crate::error::StoreError;
use crate::varint;

pub const KIND_LEAF: u8 = 1;
pub const KIND_INTERNAL: u8 = 2;

/// Fixed node prologue: kind, total serialized length, allocated
/// page units.
pub const NODE_PROLOGUE: usize = 1 + 4 + 2;

/// Fixed-width record key stored in leaf value lists.
pub const OID_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub oids: Vec<[u8; OID_LEN]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf {
        prev: u64,
        next: u64,
        entries: Vec<LeafEntry>,
    },
    Internal {
        /// `children.len() == keys.len() + 1`; `children[i]` covers
        /// keys strictly below `keys[i]`.
        keys: Vec<Vec<u8>>,
        children: Vec<u64>,
    },
}

impl Node {
    pub fn empty_leaf() -> Node {
        Node::Leaf {
            prev: 0,
            next: 0,
            entries: Vec::new(),
        }
    }

    /// Serialized size, prologue included.
    pub fn encoded_len(&self) -> usize {
        let payload = match self {
            Node::Leaf { entries, .. } => {
                let mut n = 8 + 8 + 4;
                for e in entries {
                    n += varint::len(e.key.len() as u64)
                        + e.key.len()
                        + varint::len(e.oids.len() as u64)
                        + e.oids.len() * OID_LEN;
                }
                n
            }
            Node::Internal { keys, children } => {
                let mut n = 4 + 8;
                debug_assert_eq!(children.len(), keys.len() + 1);
                for k in keys {
                    n += varint::len(k.len() as u64) + k.len() + 8;
                }
                n
            }
        };
        NODE_PROLOGUE + payload
    }

    pub fn encode(&self, units: u16) -> Vec<u8> {
        let total = self.encoded_len();
        let mut buf = Vec::with_capacity(total);
        buf.push(match self {
            Node::Leaf { .. } => KIND_LEAF,
            Node::Internal { .. } => KIND_INTERNAL,
        });
        buf.extend_from_slice(&(total as u32).to_le_bytes());
        buf.extend_from_slice(&units.to_le_bytes());
        match self {
            Node::Leaf { prev, next, entries } => {
                buf.extend_from_slice(&prev.to_le_bytes());
                buf.extend_from_slice(&next.to_le_bytes());
                buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
                for e in entries {
                    varint::write(&mut buf, e.key.len() as u64);
                    buf.extend_from_slice(&e.key);
                    varint::write(&mut buf, e.oids.len() as u64);
                    for oid in &e.oids {
                        buf.extend_from_slice(oid);
                    }
                }
            }
            Node::Internal { keys, children } => {
                buf.extend_from_slice(&(keys.len() as u32).to_le_bytes());
                buf.extend_from_slice(&children[0].to_le_bytes());
                for (k, child) in keys.iter().zip(&children[1..]) {
                    varint::write(&mut buf, k.len() as u64);
                    buf.extend_from_slice(k);
                    buf.extend_from_slice(&child.to_le_bytes());
                }
            }
        }
        debug_assert_eq!(buf.len(), total);
        buf
    }

    /// Decode a node; returns the node and its allocated units.
    pub fn decode(bytes: &[u8]) -> Result<(Node, u16), StoreError> {
        if bytes.len() < NODE_PROLOGUE {
            return Err(StoreError::Corrupt("index node prologue".into()));
        }
        let kind = bytes[0];
        let total = LittleEndian::read_u32(&bytes[1..5]) as usize;
        let units = LittleEndian::read_u16(&bytes[5..7]);
        if total < NODE_PROLOGUE || total > bytes.len() {
            return Err(StoreError::Corrupt("index node length".into()));
        }
        let mut at = NODE_PROLOGUE;
        let node = match kind {
            KIND_LEAF => {
                let prev = LittleEndian::read_u64(&bytes[at..at + 8]);
                let next = LittleEndian::read_u64(&bytes[at + 8..at + 16]);
                let nentries = LittleEndian::read_u32(&bytes[at + 16..at + 20]) as usize;
                at += 20;
                let mut entries = Vec::with_capacity(nentries);
                for _ in 0..nentries {
                    let (klen, used) = varint::read(&bytes[at..])?;
                    at += used;
                    let klen = klen as usize;
                    let key = bytes
                        .get(at..at + klen)
                        .ok_or_else(|| StoreError::Corrupt("index key overruns node".into()))?
                        .to_vec();
                    at += klen;
                    let (noids, used) = varint::read(&bytes[at..])?;
                    at += used;
                    let mut oids = Vec::with_capacity(noids as usize);
                    for _ in 0..noids {
                        let raw = bytes
                            .get(at..at + OID_LEN)
                            .ok_or_else(|| StoreError::Corrupt("index oid overruns node".into()))?;
                        oids.push(raw.try_into().unwrap());
                        at += OID_LEN;
                    }
                    entries.push(LeafEntry { key, oids });
                }
                Node::Leaf { prev, next, entries }
            }
            KIND_INTERNAL => {
                let nkeys = LittleEndian::read_u32(&bytes[at..at + 4]) as usize;
                at += 4;
                let mut children = Vec::with_capacity(nkeys + 1);
                children.push(LittleEndian::read_u64(&bytes[at..at + 8]));
                at += 8;
                let mut keys = Vec::with_capacity(nkeys);
                for _ in 0..nkeys {
                    let (klen, used) = varint::read(&bytes[at..])?;
                    at += used;
                    let klen = klen as usize;
                    let key = bytes
                        .get(at..at + klen)
                        .ok_or_else(|| StoreError::Corrupt("separator overruns node".into()))?
                        .to_vec();
                    at += klen;
                    children.push(LittleEndian::read_u64(&bytes[at..at + 8]));
                    at += 8;
                    keys.push(key);
                }
                Node::Internal { keys, children }
            }
            _ => return Err(StoreError::Corrupt("unknown index node kind".into())),
        };
        Ok((node, units))
    }
}
