use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::DocumentError;

/// 12-byte object identifier.
///
/// Layout: 4-byte big-endian seconds since epoch, 4-byte process fuzz,
/// 4-byte big-endian monotonic counter. Byte order makes OIDs sort
/// lexicographically by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(pub [u8; 12]);

static COUNTER: AtomicU32 = AtomicU32::new(0);
static FUZZ: OnceLock<u32> = OnceLock::new();

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

fn process_fuzz() -> u32 {
    *FUZZ.get_or_init(|| {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        let seed = (std::process::id() as u64) << 32 | nanos;
        splitmix64(seed) as u32
    })
}

impl Oid {
    /// Generate a fresh OID from the process-global generator.
    pub fn generate() -> Oid {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let count = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut b = [0u8; 12];
        b[0..4].copy_from_slice(&secs.to_be_bytes());
        b[4..8].copy_from_slice(&process_fuzz().to_be_bytes());
        b[8..12].copy_from_slice(&count.to_be_bytes());
        Oid(b)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Oid {
        Oid(bytes)
    }

    /// Creation time in seconds since epoch.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// 24 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(24);
        for b in self.0 {
            use fmt::Write;
            let _ = write!(s, "{b:02x}");
        }
        s
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Oid {
    type Err = DocumentError;

    /// Strict parse: exactly 24 lowercase hex characters.
    fn from_str(s: &str) -> Result<Oid, DocumentError> {
        if s.len() != 24 {
            return Err(DocumentError::InvalidOid);
        }
        let mut b = [0u8; 12];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hi = hex_digit(chunk[0]).ok_or(DocumentError::InvalidOid)?;
            let lo = hex_digit(chunk[1]).ok_or(DocumentError::InvalidOid)?;
            b[i] = hi << 4 | lo;
        }
        Ok(Oid(b))
    }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_oids_are_unique_and_monotonic() {
        let a = Oid::generate();
        let b = Oid::generate();
        assert_ne!(a, b);
        assert!(a < b, "counter makes same-second OIDs ordered");
    }

    #[test]
    fn hex_roundtrip() {
        let oid = Oid::generate();
        let hex = oid.to_hex();
        assert_eq!(hex.len(), 24);
        assert_eq!(hex.parse::<Oid>().unwrap(), oid);
    }

    #[test]
    fn rejects_uppercase_and_short_hex() {
        assert!("507F1F77BCF86CD799439011".parse::<Oid>().is_err());
        assert!("507f1f77".parse::<Oid>().is_err());
        assert!("507f1f77bcf86cd79943901g".parse::<Oid>().is_err());
    }

    #[test]
    fn timestamp_is_leading_word() {
        let oid = Oid::generate();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;
        assert!(now - oid.timestamp() < 5);
    }
}
