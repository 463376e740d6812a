use crate::error::DocumentError;
use crate::oid::Oid;
use crate::value::Value;

/// Field-name validation mode.
///
/// Stored documents forbid `.` anywhere and `$` as the first byte of a
/// field name; query documents are built from operator keys like
/// `$set` and dotted paths, so both are allowed there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    Store,
    Query,
}

/// An insertion-ordered sequence of `(field, Value)` pairs.
///
/// Lookups are linear; documents are small and the wire format has no
/// back pointers either, so iteration cost mirrors the encoded form.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Document {
        Document { entries: Vec::new() }
    }

    pub fn with_capacity(n: usize) -> Document {
        Document { entries: Vec::with_capacity(n) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a pair without looking for an existing key.
    ///
    /// Duplicate keys are representable on the wire; callers that want
    /// replace-or-append semantics use [`Document::set`].
    pub fn push(&mut self, key: impl Into<String>, value: Value) {
        self.entries.push((key.into(), value));
    }

    /// Replace the first occurrence of `key`, or append.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Remove the first occurrence of `key` and return its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.entries.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn entries(&self) -> &[(String, Value)] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut Vec<(String, Value)> {
        &mut self.entries
    }

    /// The document's `_id`, if present and an OID.
    pub fn oid(&self) -> Option<Oid> {
        self.get(crate::ID_FIELD).and_then(Value::as_oid)
    }

    /// Validate every field name in the tree against `mode`.
    ///
    /// Encoding runs this implicitly; it is exposed for callers that
    /// want to reject a document before buffering it.
    pub fn validate_keys(&self, mode: KeyMode) -> Result<(), DocumentError> {
        for (key, value) in self.iter() {
            check_key(key, mode)?;
            validate_value(value, mode)?;
        }
        Ok(())
    }
}

fn validate_value(value: &Value, mode: KeyMode) -> Result<(), DocumentError> {
    match value {
        Value::Object(doc) | Value::CodeWithScope(_, doc) => doc.validate_keys(mode),
        Value::Array(items) => {
            for item in items {
                validate_value(item, mode)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub(crate) fn check_key(key: &str, mode: KeyMode) -> Result<(), DocumentError> {
    if mode == KeyMode::Query {
        return Ok(());
    }
    if key.contains('.') {
        return Err(DocumentError::KeyHasDot(key.to_string()));
    }
    if key.starts_with('$') {
        return Err(DocumentError::KeyStartsDollar(key.to_string()));
    }
    Ok(())
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Document {
        Document {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_first_occurrence() {
        let mut doc = Document::new();
        doc.push("a", Value::Int32(1));
        doc.push("b", Value::Int32(2));
        doc.set("a", Value::Int32(9));
        assert_eq!(doc.get("a"), Some(&Value::Int32(9)));
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut doc = Document::new();
        doc.set("z", Value::Null);
        doc.set("a", Value::Null);
        doc.set("m", Value::Null);
        let keys: Vec<&str> = doc.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn store_mode_rejects_dotted_and_dollar_keys() {
        let mut doc = Document::new();
        doc.set("a.b", Value::Int32(1));
        assert!(matches!(
            doc.validate_keys(KeyMode::Store),
            Err(DocumentError::KeyHasDot(_))
        ));
        assert!(doc.validate_keys(KeyMode::Query).is_ok());

        let mut doc = Document::new();
        doc.set("$set", Value::Int32(1));
        assert!(matches!(
            doc.validate_keys(KeyMode::Store),
            Err(DocumentError::KeyStartsDollar(_))
        ));
    }

    #[test]
    fn nested_keys_are_validated() {
        let mut inner = Document::new();
        inner.set("bad.key", Value::Null);
        let mut doc = Document::new();
        doc.set("outer", Value::Object(inner));
        assert!(doc.validate_keys(KeyMode::Store).is_err());
    }
}
