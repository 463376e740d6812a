use crate::document::Document;
use crate::error::DocumentError;
use crate::path::set_path;
use crate::value::Value;

/// Merge `src` into `dst`; `src` wins at leaves.
///
/// With `recursive`, matching object fields merge field-by-field and
/// matching array fields append `src`'s elements after `dst`'s (the
/// codec re-keys indices on encode). Without it, any colliding field
/// is replaced wholesale.
pub fn merge_into(dst: &mut Document, src: &Document, recursive: bool) {
    for (key, value) in src.iter() {
        match (dst.get_mut(key), value) {
            (Some(Value::Object(d)), Value::Object(s)) if recursive => {
                merge_into(d, s, true);
            }
            (Some(Value::Array(d)), Value::Array(s)) if recursive => {
                d.extend(s.iter().cloned());
            }
            _ => dst.set(key, value.clone()),
        }
    }
}

/// Apply a flat patch whose keys may be dotted paths, creating
/// intermediate objects, then collapse any duplicate keys the patch
/// introduced.
pub fn merge_paths(dst: &mut Document, patch: &Document) -> Result<(), DocumentError> {
    for (path, value) in patch.iter() {
        set_path(dst, path, value.clone())?;
    }
    collapse_duplicates(dst);
    Ok(())
}

/// Collapse repeated object fields in place.
///
/// When both occurrences are objects they merge recursively; when both
/// are arrays the later elements are appended; otherwise the last
/// occurrence wins.
pub fn collapse_duplicates(doc: &mut Document) {
    let mut i = 0;
    while i < doc.len() {
        let key = doc.entries()[i].0.clone();
        let mut j = i + 1;
        while j < doc.len() {
            if doc.entries()[j].0 != key {
                j += 1;
                continue;
            }
            let (_, later) = doc.entries_mut().remove(j);
            let earlier = &mut doc.entries_mut()[i].1;
            match (earlier, later) {
                (Value::Object(a), Value::Object(ref b)) => {
                    merge_into(a, b, true);
                    collapse_duplicates(a);
                }
                (Value::Array(a), Value::Array(b)) => a.extend(b),
                (slot, other) => *slot = other,
            }
        }
        if let Some(Value::Object(sub)) = doc.entries_mut().get_mut(i).map(|(_, v)| v) {
            collapse_duplicates(sub);
        }
        i += 1;
    }
}
