//! Document value model and binary codec.
//!
//! A [`Document`] is an insertion-ordered sequence of `(field, Value)`
//! pairs; [`Value`] is the typed tree behind it. The codec in
//! [`codec`] produces and consumes the byte-exact little-endian wire
//! form used in storage, in query literals and at the public API.

mod codec;
mod document;
mod error;
mod merge;
mod oid;
mod path;
mod strip;
mod value;

pub use codec::{RawDocument, RawElement, RawIter, decode, encode, encode_unchecked};
pub use document::{Document, KeyMode};
pub use error::DocumentError;
pub use merge::{collapse_duplicates, merge_into, merge_paths};
pub use oid::Oid;
pub use path::{NestedArrays, get_path, remove_path, set_path};
pub use strip::{StripSpec, strip};
pub use value::{Value, compare_at_path, compare_documents, compare_values, type_rank};

/// Reserved field name carrying the document's object id.
pub const ID_FIELD: &str = "_id";
