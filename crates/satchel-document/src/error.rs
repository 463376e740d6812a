use std::fmt;

/// Errors raised by the value model and the binary codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// Encoding would exceed the `i32::MAX` wire size limit.
    SizeOverflow,
    /// The byte buffer ended before the structure it promised.
    Truncated(&'static str),
    /// A length field or type tag is inconsistent with the buffer.
    Corrupt(&'static str),
    /// A key or string value is not valid UTF-8.
    NotUtf8,
    /// A field name contains `.` outside of query mode.
    KeyHasDot(String),
    /// A field name starts with `$` outside of query mode.
    KeyStartsDollar(String),
    /// Textual OID is not 24 lowercase hex characters.
    InvalidOid,
    /// A field path is empty or addresses into a non-container.
    InvalidFieldPath(String),
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentError::SizeOverflow => write!(f, "document exceeds maximum encoded size"),
            DocumentError::Truncated(what) => write!(f, "truncated document: {what}"),
            DocumentError::Corrupt(what) => write!(f, "corrupt document: {what}"),
            DocumentError::NotUtf8 => write!(f, "key or string value is not valid UTF-8"),
            DocumentError::KeyHasDot(k) => write!(f, "field name contains '.': {k}"),
            DocumentError::KeyStartsDollar(k) => write!(f, "field name starts with '$': {k}"),
            DocumentError::InvalidOid => write!(f, "invalid object id"),
            DocumentError::InvalidFieldPath(p) => write!(f, "invalid field path: {p}"),
        }
    }
}

impl std::error::Error for DocumentError {}
