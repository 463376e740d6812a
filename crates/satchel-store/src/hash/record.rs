use byteorder::{ByteOrder, LittleEndian};

use crate::error::StoreError;
use crate::varint;

/// Live record marker.
pub const REC_MAGIC: u8 = 0xc8;
/// Free region marker: `0xb0 | u32 region_size`.
pub const FREE_MAGIC: u8 = 0xb0;
pub const FREE_HEADER: u64 = 5;

/// Byte offsets of the in-place-rewritable fields.
pub const LEFT_AT: usize = 2;
pub const RIGHT_AT: usize = 2 + varint::FIXED_LEN;
const PAD_AT: usize = 2 + 2 * varint::FIXED_LEN;
const SIZES_AT: usize = 2 + 3 * varint::FIXED_LEN;

/// Parsed record header.
///
/// `left`/`right` are apow-shifted offsets of the BST children (0 =
/// none) and are stored fixed-width so they can be relinked without
/// moving the record.
#[derive(Debug, Clone)]
pub struct RecordHead {
    pub residue: u8,
    pub left: u64,
    pub right: u64,
    pub psiz: u64,
    pub ksiz: u64,
    pub vsiz: u64,
    pub header_len: u64,
}

impl RecordHead {
    /// Total region: header, key, value, padding.
    pub fn region(&self) -> u64 {
        self.header_len + self.ksiz + self.vsiz + self.psiz
    }

    pub fn key_off(&self, base: u64) -> u64 {
        base + self.header_len
    }

    pub fn value_off(&self, base: u64) -> u64 {
        base + self.header_len + self.ksiz
    }

    /// Header length for a record with the given sizes.
    pub fn len_for(ksiz: u64, vsiz: u64) -> u64 {
        (SIZES_AT + varint::len(ksiz) + varint::len(vsiz)) as u64
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SIZES_AT];
        buf[0] = REC_MAGIC;
        buf[1] = self.residue;
        varint::write_fixed(&mut buf[LEFT_AT..LEFT_AT + varint::FIXED_LEN], self.left);
        varint::write_fixed(&mut buf[RIGHT_AT..RIGHT_AT + varint::FIXED_LEN], self.right);
        varint::write_fixed(&mut buf[PAD_AT..PAD_AT + varint::FIXED_LEN], self.psiz);
        varint::write(&mut buf, self.ksiz);
        varint::write(&mut buf, self.vsiz);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<RecordHead, StoreError> {
        if bytes.len() < SIZES_AT + 2 || bytes[0] != REC_MAGIC {
            return Err(StoreError::Corrupt("record magic".into()));
        }
        let (left, _) = varint::read(&bytes[LEFT_AT..])?;
        let (right, _) = varint::read(&bytes[RIGHT_AT..])?;
        let (psiz, _) = varint::read(&bytes[PAD_AT..])?;
        let (ksiz, used_k) = varint::read(&bytes[SIZES_AT..])?;
        let (vsiz, used_v) = varint::read(&bytes[SIZES_AT + used_k..])?;
        Ok(RecordHead {
            residue: bytes[1],
            left,
            right,
            psiz,
            ksiz,
            vsiz,
            header_len: (SIZES_AT + used_k + used_v) as u64,
        })
    }
}

pub fn encode_free(size: u32) -> [u8; FREE_HEADER as usize] {
    let mut b = [0u8; FREE_HEADER as usize];
    b[0] = FREE_MAGIC;
    LittleEndian::write_u32(&mut b[1..5], size);
    b
}

pub fn decode_free_size(bytes: &[u8]) -> Result<u32, StoreError> {
    if bytes.len() < FREE_HEADER as usize || bytes[0] != FREE_MAGIC {
        return Err(StoreError::Corrupt("free block magic".into()));
    }
    Ok(LittleEndian::read_u32(&bytes[1..5]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_roundtrip() {
        let head = RecordHead {
            residue: 0x5a,
            left: 12345,
            right: 0,
            psiz: 7,
            ksiz: 12,
            vsiz: 900,
            header_len: 0,
        };
        let bytes = head.encode();
        let back = RecordHead::decode(&bytes).unwrap();
        assert_eq!(back.residue, 0x5a);
        assert_eq!(back.left, 12345);
        assert_eq!(back.right, 0);
        assert_eq!(back.psiz, 7);
        assert_eq!(back.ksiz, 12);
        assert_eq!(back.vsiz, 900);
        assert_eq!(back.header_len as usize, bytes.len());
        assert_eq!(back.header_len, RecordHead::len_for(12, 900));
    }

    #[test]
    fn child_pointers_rewrite_in_place() {
        let head = RecordHead {
            residue: 1,
            left: 5,
            right: 0,
            psiz: 0,
            ksiz: 1,
            vsiz: 1,
            header_len: 0,
        };
        let mut bytes = head.encode();
        // grow the left pointer far past its original magnitude
        varint::write_fixed(&mut bytes[LEFT_AT..LEFT_AT + varint::FIXED_LEN], 1 << 30);
        let back = RecordHead::decode(&bytes).unwrap();
        assert_eq!(back.left, 1 << 30);
        assert_eq!(back.ksiz, 1);
    }

    #[test]
    fn free_block_roundtrip() {
        let b = encode_free(4096);
        assert_eq!(decode_free_size(&b).unwrap(), 4096);
        assert!(decode_free_size(&[0u8; 5]).is_err());
    }
}
