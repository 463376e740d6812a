use std::fmt;

use satchel_document::DocumentError;
use satchel_query::ParseError;
use satchel_store::StoreError;

/// Database-level errors, the taxonomy every public entry point
/// reports through.
#[derive(Debug)]
pub enum DbError {
    InvalidCollectionName(String),
    InvalidDocument(String),
    InvalidOid(String),
    InvalidQueryControl(String),
    QueryOperandNotArray(String),
    InvalidMetadata(String),
    InvalidFieldPath(String),
    InvalidRegex(String),
    SortFailed,
    Query(String),
    UpdateFailed(String),
    ElemMatchDuplicate,
    FieldsIncludeExcludeMix,
    InvalidDoAction(String),
    TooManyCollections,
    ImportExportIo(String),
    JsonParse(String),
    DocumentTooLarge,
    InvalidCommand(String),
    CollectionNotFound(String),
    NotFound,
    /// Codec-level passthrough.
    Document(DocumentError),
    /// Storage/threading passthrough.
    Store(StoreError),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::InvalidCollectionName(name) => write!(f, "invalid collection name: {name}"),
            DbError::InvalidDocument(msg) => write!(f, "invalid document: {msg}"),
            DbError::InvalidOid(s) => write!(f, "invalid oid: {s}"),
            DbError::InvalidQueryControl(msg) => write!(f, "invalid query control: {msg}"),
            DbError::QueryOperandNotArray(op) => write!(f, "{op} operand must be an array"),
            DbError::InvalidMetadata(msg) => write!(f, "invalid metadata: {msg}"),
            DbError::InvalidFieldPath(p) => write!(f, "invalid field path: {p}"),
            DbError::InvalidRegex(msg) => write!(f, "invalid regex: {msg}"),
            DbError::SortFailed => write!(f, "sort buffer limit exceeded"),
            DbError::Query(msg) => write!(f, "query error: {msg}"),
            DbError::UpdateFailed(msg) => write!(f, "update failed: {msg}"),
            DbError::ElemMatchDuplicate => {
                write!(f, "only one $elemMatch allowed along a field path")
            }
            DbError::FieldsIncludeExcludeMix => {
                write!(f, "$fields cannot mix include and exclude entries")
            }
            DbError::InvalidDoAction(msg) => write!(f, "invalid $do action: {msg}"),
            DbError::TooManyCollections => write!(f, "too many collections"),
            DbError::ImportExportIo(msg) => write!(f, "export/import i/o error: {msg}"),
            DbError::JsonParse(msg) => write!(f, "json parse error: {msg}"),
            DbError::DocumentTooLarge => write!(f, "document exceeds the import size limit"),
            DbError::InvalidCommand(msg) => write!(f, "invalid command: {msg}"),
            DbError::CollectionNotFound(name) => write!(f, "collection not found: {name}"),
            DbError::NotFound => write!(f, "record not found"),
            DbError::Document(e) => write!(f, "{e}"),
            DbError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbError::Document(e) => Some(e),
            DbError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DocumentError> for DbError {
    fn from(e: DocumentError) -> DbError {
        match e {
            DocumentError::InvalidOid => DbError::InvalidOid(String::new()),
            DocumentError::InvalidFieldPath(p) => DbError::InvalidFieldPath(p),
            other => DbError::Document(other),
        }
    }
}

impl From<StoreError> for DbError {
    fn from(e: StoreError) -> DbError {
        DbError::Store(e)
    }
}

impl From<ParseError> for DbError {
    fn from(e: ParseError) -> DbError {
        match e {
            ParseError::InvalidControl(msg) => DbError::InvalidQueryControl(msg),
            ParseError::OperandNotArray(op) => DbError::QueryOperandNotArray(op),
            ParseError::ElemMatchDuplicate => DbError::ElemMatchDuplicate,
            ParseError::FieldsIncludeExcludeMix => DbError::FieldsIncludeExcludeMix,
            ParseError::InvalidDoAction(msg) => DbError::InvalidDoAction(msg),
            ParseError::InvalidRegex(msg) => DbError::InvalidRegex(msg),
            ParseError::InvalidPath(p) => DbError::InvalidFieldPath(p),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> DbError {
        DbError::JsonParse(e.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> DbError {
        DbError::Store(StoreError::Io(e))
    }
}
