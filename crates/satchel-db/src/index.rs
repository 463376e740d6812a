use std::path::{Path, PathBuf};

use satchel_document::{Document, NestedArrays, Value, get_path};
use satchel_store::{BTree, BTreeOptions, TreeStats};
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::keys;

/// Index kinds; a field path may carry several at once, each backed
/// by its own B+ tree file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// Lexicographic over raw UTF-8 string values.
    Lex,
    /// Case-insensitive string: case-fold then NFC before keying.
    ILex,
    /// Decimal-ordered numbers.
    Num,
    /// One entry per token of an array or space-separated string.
    Token,
}

impl IndexKind {
    pub const ALL: [IndexKind; 4] = [
        IndexKind::Lex,
        IndexKind::ILex,
        IndexKind::Num,
        IndexKind::Token,
    ];

    /// Letter used in index file names.
    pub fn letter(self) -> char {
        match self {
            IndexKind::Lex => 's',
            IndexKind::ILex => 'i',
            IndexKind::Num => 'n',
            IndexKind::Token => 'a',
        }
    }

    pub fn from_letter(c: char) -> Option<IndexKind> {
        Some(match c {
            's' => IndexKind::Lex,
            'i' => IndexKind::ILex,
            'n' => IndexKind::Num,
            'a' => IndexKind::Token,
            _ => return None,
        })
    }
}

/// What `set_index` should do with the named kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    /// Create missing kinds and backfill them.
    Ensure,
    /// Drop and rebuild the named kinds from the record store.
    Rebuild,
    /// Drop the named kinds.
    Drop,
    /// Drop every kind on the path.
    DropAll,
    /// Compact the named kinds' tree files.
    Optimize,
}

/// Persisted index metadata, stored in the database metadata store
/// under `"i" + collection + "\0" + path`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndexMetaRecord {
    pub kinds: Vec<char>,
}

/// One (field path, kind) secondary index and its backing tree.
pub(crate) struct Index {
    pub path: String,
    pub kind: IndexKind,
    pub tree: BTree,
}

impl Index {
    pub fn open(
        store_path: &Path,
        path: &str,
        kind: IndexKind,
        cache_pages: usize,
    ) -> Result<Index, DbError> {
        let file = index_file(store_path, path, kind);
        let tree = BTree::open(
            file,
            BTreeOptions {
                cache_pages,
                ..BTreeOptions::default()
            },
        )?;
        Ok(Index {
            path: path.to_string(),
            kind,
            tree,
        })
    }

    pub fn stats(&self) -> TreeStats {
        self.tree.stats()
    }

    /// Canonical keys this document contributes to the index; empty
    /// strings are never indexed.
    pub fn contribution(&self, doc: &Document) -> Vec<Vec<u8>> {
        let Some(value) = get_path(doc, &self.path, NestedArrays::ReturnArray) else {
            return Vec::new();
        };
        let mut out: Vec<Vec<u8>> = match self.kind {
            IndexKind::Num => scalars(value)
                .filter_map(keys::coerce_number)
                .map(keys::number_key)
                .collect(),
            IndexKind::Lex => scalars(value)
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec())
                .collect(),
            IndexKind::ILex => scalars(value)
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| keys::fold_case(s).into_bytes())
                .collect(),
            IndexKind::Token => keys::tokenize(value)
                .into_iter()
                .filter(|t| !t.is_empty())
                .map(String::into_bytes)
                .collect(),
        };
        out.sort();
        out.dedup();
        out
    }
}

/// The value itself, or its elements when it is an array.
fn scalars(value: &Value) -> Box<dyn Iterator<Item = &Value> + '_> {
    match value {
        Value::Array(items) => Box::new(items.iter()),
        other => Box::new(std::iter::once(other)),
    }
}

/// `<store file>.idx.<field>.<kind>` next to the collection file.
pub(crate) fn index_file(store_path: &Path, path: &str, kind: IndexKind) -> PathBuf {
    let mut name = store_path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".idx.{path}.{}", kind.letter()));
    store_path.with_file_name(name)
}

/// Metadata key for a collection's index on `path`.
pub(crate) fn meta_key(collection: &str, path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + collection.len() + 1 + path.len());
    key.push(b'i');
    key.extend_from_slice(collection.as_bytes());
    key.push(0);
    key.extend_from_slice(path.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(pairs: &[(&str, Value)]) -> Document {
        let mut d = Document::new();
        for (k, v) in pairs {
            d.push(*k, v.clone());
        }
        d
    }

    fn open_kind(dir: &tempfile::TempDir, kind: IndexKind) -> Index {
        Index::open(&dir.path().join("col"), "field", kind, 16).unwrap()
    }

    #[test]
    fn number_contribution_coerces_strings() {
        let dir = tempfile::tempdir().unwrap();
        let idx = open_kind(&dir, IndexKind::Num);
        let d = doc(&[("field", Value::String("42".into()))]);
        assert_eq!(idx.contribution(&d), vec![keys::number_key(42.0)]);
        let d = doc(&[("field", Value::String("not a number".into()))]);
        assert!(idx.contribution(&d).is_empty());
    }

    #[test]
    fn lex_contribution_skips_empty_strings() {
        let dir = tempfile::tempdir().unwrap();
        let idx = open_kind(&dir, IndexKind::Lex);
        let d = doc(&[("field", Value::String(String::new()))]);
        assert!(idx.contribution(&d).is_empty());
        let d = doc(&[("field", Value::String("abc".into()))]);
        assert_eq!(idx.contribution(&d), vec![b"abc".to_vec()]);
    }

    #[test]
    fn array_values_contribute_each_element() {
        let dir = tempfile::tempdir().unwrap();
        let idx = open_kind(&dir, IndexKind::Num);
        let d = doc(&[(
            "field",
            Value::Array(vec![Value::Int32(3), Value::Int32(1), Value::Int32(3)]),
        )]);
        let keys_out = idx.contribution(&d);
        assert_eq!(keys_out.len(), 2, "duplicates collapse");
    }

    #[test]
    fn token_contribution_splits_strings() {
        let dir = tempfile::tempdir().unwrap();
        let idx = open_kind(&dir, IndexKind::Token);
        let d = doc(&[("field", Value::String("red green red".into()))]);
        let mut keys_out = idx.contribution(&d);
        keys_out.sort();
        assert_eq!(keys_out, vec![b"green".to_vec(), b"red".to_vec()]);
    }

    #[test]
    fn index_file_naming() {
        let file = index_file(Path::new("/db/meta_books"), "author", IndexKind::Num);
        assert_eq!(file, PathBuf::from("/db/meta_books.idx.author.n"));
    }
}
