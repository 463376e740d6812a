use byteorder::{ByteOrder, LittleEndian};

use crate::error::StoreError;
use crate::free;

pub const HEADER_SIZE: u64 = 256;
const MAGIC: &[u8; 16] = b"satchel-hstore\0\0";
pub const FORMAT_VERSION: u8 = 1;

pub const FLAG_LARGE: u8 = 1 << 0;
pub const FLAG_DEFLATE: u8 = 1 << 1;

const OPAQUE_OFF: usize = 128;
pub const OPAQUE_LEN: usize = 64;

/// Fixed 256-byte file header.
///
/// Offsets: magic 0..16, version 16, flags 17, apow 18, fpow 19,
/// clean 20, bnum 24, rnum 32, fsiz 40, frec 48, opaque 128..192.
#[derive(Debug, Clone)]
pub struct Header {
    pub flags: u8,
    pub apow: u8,
    pub fpow: u8,
    /// Set on clean close, cleared while open for writing; a zero at
    /// open means the free pool region is stale and must be rebuilt.
    pub clean: bool,
    pub bnum: u64,
    pub rnum: u64,
    pub fsiz: u64,
    pub frec: u64,
    pub opaque: [u8; OPAQUE_LEN],
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut b = [0u8; HEADER_SIZE as usize];
        b[..16].copy_from_slice(MAGIC);
        b[16] = FORMAT_VERSION;
        b[17] = self.flags;
        b[18] = self.apow;
        b[19] = self.fpow;
        b[20] = self.clean as u8;
        LittleEndian::write_u64(&mut b[24..32], self.bnum);
        LittleEndian::write_u64(&mut b[32..40], self.rnum);
        LittleEndian::write_u64(&mut b[40..48], self.fsiz);
        LittleEndian::write_u64(&mut b[48..56], self.frec);
        b[OPAQUE_OFF..OPAQUE_OFF + OPAQUE_LEN].copy_from_slice(&self.opaque);
        b
    }

    pub fn decode(b: &[u8]) -> Result<Header, StoreError> {
        if b.len() < HEADER_SIZE as usize || &b[..16] != MAGIC {
            return Err(StoreError::Corrupt("record store magic".into()));
        }
        if b[16] != FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported record store version {}",
                b[16]
            )));
        }
        let mut opaque = [0u8; OPAQUE_LEN];
        opaque.copy_from_slice(&b[OPAQUE_OFF..OPAQUE_OFF + OPAQUE_LEN]);
        Ok(Header {
            flags: b[17],
            apow: b[18],
            fpow: b[19],
            clean: b[20] != 0,
            bnum: LittleEndian::read_u64(&b[24..32]),
            rnum: LittleEndian::read_u64(&b[32..40]),
            fsiz: LittleEndian::read_u64(&b[40..48]),
            frec: LittleEndian::read_u64(&b[48..56]),
            opaque,
        })
    }

    pub fn large(&self) -> bool {
        self.flags & FLAG_LARGE != 0
    }

    pub fn deflate(&self) -> bool {
        self.flags & FLAG_DEFLATE != 0
    }

    pub fn align(&self) -> u64 {
        1 << self.apow
    }

    pub fn align_up(&self, n: u64) -> u64 {
        let a = self.align();
        (n + a - 1) & !(a - 1)
    }

    /// Free-pool region sits right after the header.
    pub fn fbp_off(&self) -> u64 {
        HEADER_SIZE
    }

    pub fn fbp_len(&self) -> u64 {
        (1u64 << self.fpow) * free::ENTRY_LEN as u64
    }

    /// Bucket slot width: shifted offsets, 4 bytes or 6 with the
    /// large flag.
    pub fn bucket_width(&self) -> u64 {
        if self.large() { 6 } else { 4 }
    }

    pub fn bucket_off(&self) -> u64 {
        self.fbp_off() + self.fbp_len()
    }

    pub fn bucket_slot(&self, bucket: u64) -> u64 {
        self.bucket_off() + bucket * self.bucket_width()
    }

    /// Where the dynamic record region begins.
    pub fn compute_frec(&self) -> u64 {
        self.align_up(self.bucket_off() + self.bnum * self.bucket_width())
    }
}
