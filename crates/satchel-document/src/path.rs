use crate::document::Document;
use crate::error::DocumentError;
use crate::value::Value;

/// Behavior when a path's middle segment lands on an array but the
/// segment is not a numeric index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedArrays {
    /// The lookup fails.
    Fail,
    /// The array itself is returned so the caller can apply
    /// per-element (`$elemMatch`-style) semantics.
    ReturnArray,
}

fn parse_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

/// Resolve a dotted field path. A numeric segment into an array
/// indexes positionally.
pub fn get_path<'a>(doc: &'a Document, path: &str, mode: NestedArrays) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;

    for segment in segments {
        match current {
            Value::Object(sub) => current = sub.get(segment)?,
            Value::Array(items) => match parse_index(segment) {
                Some(idx) => current = items.get(idx)?,
                None => {
                    return match mode {
                        NestedArrays::Fail => None,
                        NestedArrays::ReturnArray => Some(current),
                    };
                }
            },
            _ => return None,
        }
    }
    Some(current)
}

/// Set the value at a dotted path, creating intermediate objects.
///
/// A numeric segment into an existing array addresses that element
/// (extending with nulls when past the end). Fails when a middle
/// segment lands on a scalar.
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<(), DocumentError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(DocumentError::InvalidFieldPath(path.to_string()));
    }
    set_in_document(doc, &segments, value, path)
}

fn set_in_document(
    doc: &mut Document,
    segments: &[&str],
    value: Value,
    full: &str,
) -> Result<(), DocumentError> {
    let head = segments[0];
    if segments.len() == 1 {
        doc.set(head, value);
        return Ok(());
    }
    if doc.get(head).is_none() {
        doc.set(head, Value::Object(Document::new()));
    }
    match doc.get_mut(head) {
        Some(Value::Object(sub)) => set_in_document(sub, &segments[1..], value, full),
        Some(Value::Array(items)) => set_in_array(items, &segments[1..], value, full),
        _ => Err(DocumentError::InvalidFieldPath(full.to_string())),
    }
}

fn set_in_array(
    items: &mut Vec<Value>,
    segments: &[&str],
    value: Value,
    full: &str,
) -> Result<(), DocumentError> {
    let idx = parse_index(segments[0])
        .ok_or_else(|| DocumentError::InvalidFieldPath(full.to_string()))?;
    if segments.len() == 1 {
        if idx >= items.len() {
            items.resize(idx + 1, Value::Null);
        }
        items[idx] = value;
        return Ok(());
    }
    if idx >= items.len() {
        items.resize(idx + 1, Value::Null);
    }
    if matches!(items[idx], Value::Null) {
        items[idx] = Value::Object(Document::new());
    }
    match &mut items[idx] {
        Value::Object(sub) => set_in_document(sub, &segments[1..], value, full),
        Value::Array(sub) => set_in_array(sub, &segments[1..], value, full),
        _ => Err(DocumentError::InvalidFieldPath(full.to_string())),
    }
}

/// Remove the value at a dotted path. Returns the removed value.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    let (parent_path, leaf) = match path.rsplit_once('.') {
        Some((p, l)) => (Some(p), l),
        None => (None, path),
    };
    match parent_path {
        None => doc.remove(leaf),
        Some(pp) => match get_path_mut(doc, pp)? {
            Value::Object(sub) => sub.remove(leaf),
            Value::Array(items) => {
                let idx = parse_index(leaf)?;
                if idx < items.len() {
                    Some(items.remove(idx))
                } else {
                    None
                }
            }
            _ => None,
        },
    }
}

fn get_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get_mut(first)?;
    for segment in segments {
        match current {
            Value::Object(sub) => current = sub.get_mut(segment)?,
            Value::Array(items) => {
                let idx = parse_index(segment)?;
                current = items.get_mut(idx)?;
            }
            _ => return None,
        }
    }
    Some(current)
}
