//! Record values are small column maps: string names to byte strings.
//! Documents use the single column [`crate::DOC_COLUMN`].

use crate::error::StoreError;
use crate::varint;

pub fn encode_columns(cols: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    varint::write(&mut buf, cols.len() as u64);
    for (name, value) in cols {
        varint::write(&mut buf, name.len() as u64);
        buf.extend_from_slice(name.as_bytes());
        varint::write(&mut buf, value.len() as u64);
        buf.extend_from_slice(value);
    }
    buf
}

pub fn decode_columns(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
    let mut at = 0;
    let (count, used) = varint::read(&bytes[at..])?;
    at += used;
    let mut cols = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (klen, used) = varint::read(&bytes[at..])?;
        at += used;
        let klen = klen as usize;
        if at + klen > bytes.len() {
            return Err(StoreError::Corrupt("column name overruns record".into()));
        }
        let name = std::str::from_utf8(&bytes[at..at + klen])
            .map_err(|_| StoreError::Corrupt("column name is not UTF-8".into()))?
            .to_string();
        at += klen;
        let (vlen, used) = varint::read(&bytes[at..])?;
        at += used;
        let vlen = vlen as usize;
        if at + vlen > bytes.len() {
            return Err(StoreError::Corrupt("column value overruns record".into()));
        }
        cols.push((name, bytes[at..at + vlen].to_vec()));
        at += vlen;
    }
    Ok(cols)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let doc = b"binary doc bytes".as_slice();
        let meta = b"\x00\x01\x02".as_slice();
        let bytes = encode_columns(&[("$", doc), ("m", meta)]);
        let cols = decode_columns(&bytes).unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0], ("$".to_string(), doc.to_vec()));
        assert_eq!(cols[1], ("m".to_string(), meta.to_vec()));
    }

    #[test]
    fn truncated_value_is_rejected() {
        let bytes = encode_columns(&[("$", b"0123456789")]);
        assert!(decode_columns(&bytes[..bytes.len() - 3]).is_err());
    }
}
