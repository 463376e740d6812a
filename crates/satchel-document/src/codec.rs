//! Byte-exact little-endian wire codec.
//!
//! A document is `int32 total_size | elements | 0x00` where
//! `total_size` counts the whole document including the length word
//! and the trailing null. Each element is
//! `uint8 tag | cstring key | value`.

use crate::document::{Document, KeyMode, check_key};
use crate::error::DocumentError;
use crate::oid::Oid;
use crate::value::Value;

pub(crate) const TAG_DOUBLE: u8 = 0x01;
pub(crate) const TAG_STRING: u8 = 0x02;
pub(crate) const TAG_OBJECT: u8 = 0x03;
pub(crate) const TAG_ARRAY: u8 = 0x04;
pub(crate) const TAG_BINARY: u8 = 0x05;
pub(crate) const TAG_UNDEFINED: u8 = 0x06;
pub(crate) const TAG_OID: u8 = 0x07;
pub(crate) const TAG_BOOL: u8 = 0x08;
pub(crate) const TAG_DATE: u8 = 0x09;
pub(crate) const TAG_NULL: u8 = 0x0A;
pub(crate) const TAG_REGEX: u8 = 0x0B;
pub(crate) const TAG_CODE: u8 = 0x0D;
pub(crate) const TAG_SYMBOL: u8 = 0x0E;
pub(crate) const TAG_CODE_W_SCOPE: u8 = 0x0F;
pub(crate) const TAG_INT32: u8 = 0x10;
pub(crate) const TAG_TIMESTAMP: u8 = 0x11;
pub(crate) const TAG_INT64: u8 = 0x12;

/// Legacy binary subtype whose payload carries its own inner length.
const BIN_SUBTYPE_OLD: u8 = 0x02;

const MAX_SIZE: usize = i32::MAX as usize;

// ── Encoding ───────────────────────────────────────────────────

/// Append buffer growing by halves until the `i32::MAX` wire limit.
struct Buf {
    bytes: Vec<u8>,
}

impl Buf {
    fn new() -> Buf {
        Buf { bytes: Vec::with_capacity(128) }
    }

    fn put(&mut self, chunk: &[u8]) -> Result<(), DocumentError> {
        let need = self.bytes.len() + chunk.len();
        if need > MAX_SIZE {
            return Err(DocumentError::SizeOverflow);
        }
        if need > self.bytes.capacity() {
            let grown = self.bytes.capacity() + self.bytes.capacity() / 2;
            self.bytes.reserve(grown.max(need) - self.bytes.len());
        }
        self.bytes.extend_from_slice(chunk);
        Ok(())
    }

    fn put_u8(&mut self, b: u8) -> Result<(), DocumentError> {
        self.put(&[b])
    }

    fn put_i32(&mut self, n: i32) -> Result<(), DocumentError> {
        self.put(&n.to_le_bytes())
    }

    fn put_cstring(&mut self, s: &str) -> Result<(), DocumentError> {
        if s.as_bytes().contains(&0) {
            return Err(DocumentError::Corrupt("embedded NUL in cstring"));
        }
        self.put(s.as_bytes())?;
        self.put_u8(0)
    }

    fn put_lp_string(&mut self, s: &str) -> Result<(), DocumentError> {
        let len = s.len() + 1;
        if len > MAX_SIZE {
            return Err(DocumentError::SizeOverflow);
        }
        self.put_i32(len as i32)?;
        self.put(s.as_bytes())?;
        self.put_u8(0)
    }

    /// Patch a previously written placeholder length word.
    fn patch_i32(&mut self, at: usize, n: i32) {
        self.bytes[at..at + 4].copy_from_slice(&n.to_le_bytes());
    }
}

/// Encode a document for storage; field names are validated.
pub fn encode(doc: &Document) -> Result<Vec<u8>, DocumentError> {
    encode_with_mode(doc, KeyMode::Store)
}

/// Encode a query-construction document; `$` operators and dotted
/// paths pass key validation. Sizes are still checked.
pub fn encode_unchecked(doc: &Document) -> Result<Vec<u8>, DocumentError> {
    encode_with_mode(doc, KeyMode::Query)
}

fn encode_with_mode(doc: &Document, mode: KeyMode) -> Result<Vec<u8>, DocumentError> {
    let mut buf = Buf::new();
    encode_document(&mut buf, doc, mode)?;
    Ok(buf.bytes)
}

fn encode_document(buf: &mut Buf, doc: &Document, mode: KeyMode) -> Result<(), DocumentError> {
    let start = buf.bytes.len();
    buf.put_i32(0)?;
    for (key, value) in doc.iter() {
        check_key(key, mode)?;
        encode_element(buf, key, value, mode)?;
    }
    buf.put_u8(0)?;
    let total = buf.bytes.len() - start;
    if total > MAX_SIZE {
        return Err(DocumentError::SizeOverflow);
    }
    buf.patch_i32(start, total as i32);
    Ok(())
}

fn encode_array(buf: &mut Buf, items: &[Value], mode: KeyMode) -> Result<(), DocumentError> {
    let start = buf.bytes.len();
    buf.put_i32(0)?;
    let mut key = String::new();
    for (i, value) in items.iter().enumerate() {
        key.clear();
        {
            use std::fmt::Write;
            let _ = write!(key, "{i}");
        }
        encode_element(buf, &key, value, mode)?;
    }
    buf.put_u8(0)?;
    let total = buf.bytes.len() - start;
    if total > MAX_SIZE {
        return Err(DocumentError::SizeOverflow);
    }
    buf.patch_i32(start, total as i32);
    Ok(())
}

fn encode_element(
    buf: &mut Buf,
    key: &str,
    value: &Value,
    mode: KeyMode,
) -> Result<(), DocumentError> {
    match value {
        Value::Double(d) => {
            buf.put_u8(TAG_DOUBLE)?;
            buf.put_cstring(key)?;
            buf.put(&d.to_le_bytes())
        }
        Value::String(s) => {
            buf.put_u8(TAG_STRING)?;
            buf.put_cstring(key)?;
            buf.put_lp_string(s)
        }
        Value::Object(doc) => {
            buf.put_u8(TAG_OBJECT)?;
            buf.put_cstring(key)?;
            encode_document(buf, doc, mode)
        }
        Value::Array(items) => {
            buf.put_u8(TAG_ARRAY)?;
            buf.put_cstring(key)?;
            encode_array(buf, items, mode)
        }
        Value::Binary { subtype, bytes } => {
            buf.put_u8(TAG_BINARY)?;
            buf.put_cstring(key)?;
            if *subtype == BIN_SUBTYPE_OLD {
                buf.put_i32((bytes.len() + 4) as i32)?;
                buf.put_u8(*subtype)?;
                buf.put_i32(bytes.len() as i32)?;
            } else {
                buf.put_i32(bytes.len() as i32)?;
                buf.put_u8(*subtype)?;
            }
            buf.put(bytes)
        }
        Value::Undefined => {
            buf.put_u8(TAG_UNDEFINED)?;
            buf.put_cstring(key)
        }
        Value::ObjectId(oid) => {
            buf.put_u8(TAG_OID)?;
            buf.put_cstring(key)?;
            buf.put(oid.as_bytes())
        }
        Value::Bool(b) => {
            buf.put_u8(TAG_BOOL)?;
            buf.put_cstring(key)?;
            buf.put_u8(*b as u8)
        }
        Value::DateTime(ms) => {
            buf.put_u8(TAG_DATE)?;
            buf.put_cstring(key)?;
            buf.put(&ms.to_le_bytes())
        }
        Value::Null => {
            buf.put_u8(TAG_NULL)?;
            buf.put_cstring(key)
        }
        Value::Regex { pattern, options } => {
            buf.put_u8(TAG_REGEX)?;
            buf.put_cstring(key)?;
            buf.put_cstring(pattern)?;
            buf.put_cstring(options)
        }
        Value::Code(s) => {
            buf.put_u8(TAG_CODE)?;
            buf.put_cstring(key)?;
            buf.put_lp_string(s)
        }
        Value::Symbol(s) => {
            buf.put_u8(TAG_SYMBOL)?;
            buf.put_cstring(key)?;
            buf.put_lp_string(s)
        }
        Value::CodeWithScope(code, scope) => {
            buf.put_u8(TAG_CODE_W_SCOPE)?;
            buf.put_cstring(key)?;
            let start = buf.bytes.len();
            buf.put_i32(0)?;
            buf.put_lp_string(code)?;
            encode_document(buf, scope, mode)?;
            let total = buf.bytes.len() - start;
            buf.patch_i32(start, total as i32);
            Ok(())
        }
        Value::Int32(n) => {
            buf.put_u8(TAG_INT32)?;
            buf.put_cstring(key)?;
            buf.put(&n.to_le_bytes())
        }
        Value::Timestamp { inc, time } => {
            buf.put_u8(TAG_TIMESTAMP)?;
            buf.put_cstring(key)?;
            buf.put(&inc.to_le_bytes())?;
            buf.put(&time.to_le_bytes())
        }
        Value::Int64(n) => {
            buf.put_u8(TAG_INT64)?;
            buf.put_cstring(key)?;
            buf.put(&n.to_le_bytes())
        }
    }
}

// ── Raw access ─────────────────────────────────────────────────

/// A validated view over encoded document bytes.
#[derive(Debug, Clone, Copy)]
pub struct RawDocument<'a> {
    bytes: &'a [u8],
}

impl<'a> RawDocument<'a> {
    /// Check the outer frame: length word, bounds, trailing null.
    pub fn new(bytes: &'a [u8]) -> Result<RawDocument<'a>, DocumentError> {
        if bytes.len() < 5 {
            return Err(DocumentError::Truncated("document frame"));
        }
        let total = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if total < 5 || total as usize > bytes.len() {
            return Err(DocumentError::Corrupt("document length"));
        }
        let bytes = &bytes[..total as usize];
        if bytes[bytes.len() - 1] != 0 {
            return Err(DocumentError::Corrupt("missing document terminator"));
        }
        Ok(RawDocument { bytes })
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Total encoded size including frame.
    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// Forward-only element walk; cost is proportional to the
    /// distance travelled.
    pub fn iter(&self) -> RawIter<'a> {
        RawIter {
            rest: &self.bytes[4..self.bytes.len() - 1],
        }
    }

    /// Linear scan for a top-level field.
    pub fn find(&self, key: &str) -> Result<Option<RawElement<'a>>, DocumentError> {
        for elem in self.iter() {
            let elem = elem?;
            if elem.key == key {
                return Ok(Some(elem));
            }
        }
        Ok(None)
    }
}

/// One decoded element header: tag, key and the raw value slice.
#[derive(Debug, Clone, Copy)]
pub struct RawElement<'a> {
    pub tag: u8,
    pub key: &'a str,
    pub value: &'a [u8],
}

impl<'a> RawElement<'a> {
    /// Decode this element's value into the tree model.
    pub fn decode_value(&self) -> Result<Value, DocumentError> {
        decode_value(self.tag, self.value)
    }
}

pub struct RawIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for RawIter<'a> {
    type Item = Result<RawElement<'a>, DocumentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match split_element(self.rest) {
            Ok((elem, rest)) => {
                self.rest = rest;
                Some(Ok(elem))
            }
            Err(e) => {
                self.rest = &[];
                Some(Err(e))
            }
        }
    }
}

fn split_element(bytes: &[u8]) -> Result<(RawElement<'_>, &[u8]), DocumentError> {
    let tag = bytes[0];
    let rest = &bytes[1..];
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(DocumentError::Truncated("element key"))?;
    let key = std::str::from_utf8(&rest[..nul]).map_err(|_| DocumentError::NotUtf8)?;
    let rest = &rest[nul + 1..];
    let vlen = value_len(tag, rest)?;
    if rest.len() < vlen {
        return Err(DocumentError::Truncated("element value"));
    }
    Ok((
        RawElement {
            tag,
            key,
            value: &rest[..vlen],
        },
        &rest[vlen..],
    ))
}

fn read_i32(bytes: &[u8]) -> Result<i32, DocumentError> {
    if bytes.len() < 4 {
        return Err(DocumentError::Truncated("int32"));
    }
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn value_len(tag: u8, bytes: &[u8]) -> Result<usize, DocumentError> {
    let len = match tag {
        TAG_DOUBLE | TAG_DATE | TAG_TIMESTAMP | TAG_INT64 => 8,
        TAG_STRING | TAG_CODE | TAG_SYMBOL => {
            let n = read_i32(bytes)?;
            if n < 1 {
                return Err(DocumentError::Corrupt("string length"));
            }
            4 + n as usize
        }
        TAG_OBJECT | TAG_ARRAY | TAG_CODE_W_SCOPE => {
            let n = read_i32(bytes)?;
            if n < 4 {
                return Err(DocumentError::Corrupt("nested length"));
            }
            n as usize
        }
        TAG_BINARY => {
            let n = read_i32(bytes)?;
            if n < 0 {
                return Err(DocumentError::Corrupt("binary length"));
            }
            4 + 1 + n as usize
        }
        TAG_UNDEFINED | TAG_NULL => 0,
        TAG_OID => 12,
        TAG_BOOL => 1,
        TAG_INT32 => 4,
        TAG_REGEX => {
            let first = bytes
                .iter()
                .position(|&b| b == 0)
                .ok_or(DocumentError::Truncated("regex pattern"))?;
            let second = bytes[first + 1..]
                .iter()
                .position(|&b| b == 0)
                .ok_or(DocumentError::Truncated("regex options"))?;
            first + 1 + second + 1
        }
        _ => return Err(DocumentError::Corrupt("unknown type tag")),
    };
    Ok(len)
}

// ── Tree decoding ──────────────────────────────────────────────

/// Decode encoded bytes into an owned document tree.
pub fn decode(bytes: &[u8]) -> Result<Document, DocumentError> {
    decode_document(RawDocument::new(bytes)?)
}

fn decode_document(raw: RawDocument<'_>) -> Result<Document, DocumentError> {
    let mut doc = Document::new();
    for elem in raw.iter() {
        let elem = elem?;
        doc.push(elem.key, decode_value(elem.tag, elem.value)?);
    }
    Ok(doc)
}

fn decode_array(raw: RawDocument<'_>) -> Result<Vec<Value>, DocumentError> {
    let mut items = Vec::new();
    for elem in raw.iter() {
        let elem = elem?;
        items.push(decode_value(elem.tag, elem.value)?);
    }
    Ok(items)
}

fn lp_string(bytes: &[u8]) -> Result<&str, DocumentError> {
    let n = read_i32(bytes)? as usize;
    if bytes.len() < 4 + n || n == 0 {
        return Err(DocumentError::Truncated("string payload"));
    }
    if bytes[4 + n - 1] != 0 {
        return Err(DocumentError::Corrupt("string terminator"));
    }
    std::str::from_utf8(&bytes[4..4 + n - 1]).map_err(|_| DocumentError::NotUtf8)
}

fn cstring(bytes: &[u8]) -> Result<(&str, &[u8]), DocumentError> {
    let nul = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(DocumentError::Truncated("cstring"))?;
    let s = std::str::from_utf8(&bytes[..nul]).map_err(|_| DocumentError::NotUtf8)?;
    Ok((s, &bytes[nul + 1..]))
}

fn decode_value(tag: u8, v: &[u8]) -> Result<Value, DocumentError> {
    Ok(match tag {
        TAG_DOUBLE => Value::Double(f64::from_le_bytes(
            v.try_into().map_err(|_| DocumentError::Truncated("double"))?,
        )),
        TAG_STRING => Value::String(lp_string(v)?.to_string()),
        TAG_OBJECT => Value::Object(decode_document(RawDocument::new(v)?)?),
        TAG_ARRAY => Value::Array(decode_array(RawDocument::new(v)?)?),
        TAG_BINARY => {
            let subtype = v[4];
            let payload = if subtype == BIN_SUBTYPE_OLD {
                // legacy framing nests a second length word
                if v.len() < 9 {
                    return Err(DocumentError::Truncated("legacy binary"));
                }
                &v[9..]
            } else {
                &v[5..]
            };
            Value::Binary {
                subtype,
                bytes: payload.to_vec(),
            }
        }
        TAG_UNDEFINED => Value::Undefined,
        TAG_OID => {
            let bytes: [u8; 12] = v.try_into().map_err(|_| DocumentError::Truncated("oid"))?;
            Value::ObjectId(Oid::from_bytes(bytes))
        }
        TAG_BOOL => Value::Bool(v[0] != 0),
        TAG_DATE => Value::DateTime(i64::from_le_bytes(
            v.try_into().map_err(|_| DocumentError::Truncated("date"))?,
        )),
        TAG_NULL => Value::Null,
        TAG_REGEX => {
            let (pattern, rest) = cstring(v)?;
            let (options, _) = cstring(rest)?;
            Value::Regex {
                pattern: pattern.to_string(),
                options: options.to_string(),
            }
        }
        TAG_CODE => Value::Code(lp_string(v)?.to_string()),
        TAG_SYMBOL => Value::Symbol(lp_string(v)?.to_string()),
        TAG_CODE_W_SCOPE => {
            if v.len() < 8 {
                return Err(DocumentError::Truncated("code with scope"));
            }
            let code = lp_string(&v[4..])?;
            let code_total = 4 + read_i32(&v[4..])? as usize;
            let scope = decode_document(RawDocument::new(&v[4 + code_total..])?)?;
            Value::CodeWithScope(code.to_string(), scope)
        }
        TAG_INT32 => Value::Int32(read_i32(v)?),
        TAG_TIMESTAMP => Value::Timestamp {
            inc: read_i32(v)?,
            time: read_i32(&v[4..])?,
        },
        TAG_INT64 => Value::Int64(i64::from_le_bytes(
            v.try_into().map_err(|_| DocumentError::Truncated("int64"))?,
        )),
        _ => return Err(DocumentError::Corrupt("unknown type tag")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        let mut inner = Document::new();
        inner.set("city", Value::String("Austin".into()));
        let mut doc = Document::new();
        doc.set("_id", Value::ObjectId(Oid::generate()));
        doc.set("name", Value::String("alice".into()));
        doc.set("age", Value::Int32(30));
        doc.set("score", Value::Double(12.5));
        doc.set("big", Value::Int64(1 << 40));
        doc.set("ok", Value::Bool(true));
        doc.set("none", Value::Null);
        doc.set("gone", Value::Undefined);
        doc.set("when", Value::DateTime(1_700_000_000_000));
        doc.set("ts", Value::Timestamp { inc: 1, time: 2 });
        doc.set(
            "re",
            Value::Regex {
                pattern: "^a.*".into(),
                options: "i".into(),
            },
        );
        doc.set(
            "blob",
            Value::Binary {
                subtype: 0,
                bytes: vec![1, 2, 3, 0, 4],
            },
        );
        doc.set("addr", Value::Object(inner));
        doc.set(
            "tags",
            Value::Array(vec![
                Value::String("a".into()),
                Value::Int32(7),
                Value::Array(vec![Value::Bool(false)]),
            ]),
        );
        doc
    }

    #[test]
    fn roundtrip_preserves_structure() {
        let doc = sample();
        let bytes = encode(&doc).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn reencode_is_byte_identical() {
        let bytes = encode(&sample()).unwrap();
        let again = encode(&decode(&bytes).unwrap()).unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn total_size_counts_frame_and_terminator() {
        let bytes = encode(&Document::new()).unwrap();
        assert_eq!(bytes, vec![5, 0, 0, 0, 0]);
    }

    #[test]
    fn raw_iter_yields_in_order() {
        let bytes = encode(&sample()).unwrap();
        let raw = RawDocument::new(&bytes).unwrap();
        let keys: Vec<String> = raw
            .iter()
            .map(|e| e.unwrap().key.to_string())
            .collect();
        assert_eq!(keys[0], "_id");
        assert_eq!(keys[1], "name");
        assert_eq!(keys.last().unwrap(), "tags");
    }

    #[test]
    fn find_walks_forward_only() {
        let bytes = encode(&sample()).unwrap();
        let raw = RawDocument::new(&bytes).unwrap();
        let elem = raw.find("age").unwrap().unwrap();
        assert_eq!(elem.tag, TAG_INT32);
        assert_eq!(elem.decode_value().unwrap(), Value::Int32(30));
        assert!(raw.find("missing").unwrap().is_none());
    }

    #[test]
    fn legacy_binary_subtype_roundtrips() {
        let mut doc = Document::new();
        doc.set(
            "b",
            Value::Binary {
                subtype: 0x02,
                bytes: vec![9, 8, 7],
            },
        );
        let bytes = encode(&doc).unwrap();
        assert_eq!(decode(&bytes).unwrap(), doc);
    }

    #[test]
    fn store_mode_refuses_query_keys() {
        let mut doc = Document::new();
        doc.set("$set", Value::Int32(1));
        assert!(matches!(
            encode(&doc),
            Err(DocumentError::KeyStartsDollar(_))
        ));
        assert!(encode_unchecked(&doc).is_ok());
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let bytes = encode(&sample()).unwrap();
        assert!(RawDocument::new(&bytes[..3]).is_err());
        let mut bad = bytes.clone();
        bad[0] = (bytes.len() as i32 + 10).to_le_bytes()[0];
        bad[1] = (bytes.len() as i32 + 10).to_le_bytes()[1];
        assert!(RawDocument::new(&bad[..bytes.len()]).is_err());
    }

    #[test]
    fn corrupt_string_length_is_rejected() {
        let mut doc = Document::new();
        doc.set("s", Value::String("hi".into()));
        let mut bytes = encode(&doc).unwrap();
        // string length word sits after tag + "s\0"
        bytes[7] = 0xff;
        bytes[8] = 0xff;
        bytes[9] = 0xff;
        bytes[10] = 0x7f;
        let raw = RawDocument::new(&bytes).unwrap();
        assert!(raw.iter().any(|e| e.is_err()));
    }

    #[test]
    fn arrays_use_decimal_index_keys() {
        let mut doc = Document::new();
        doc.set("a", Value::Array(vec![Value::Int32(10), Value::Int32(20)]));
        let bytes = encode(&doc).unwrap();
        let raw = RawDocument::new(&bytes).unwrap();
        let arr = raw.find("a").unwrap().unwrap();
        let inner = RawDocument::new(arr.value).unwrap();
        let keys: Vec<String> = inner.iter().map(|e| e.unwrap().key.to_string()).collect();
        assert_eq!(keys, ["0", "1"]);
    }
}
