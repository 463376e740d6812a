//! Applies the update operator pipeline to a matched document.
//!
//! Operators run left-to-right against a clone of the stored
//! document; the caller re-stores the result only when every operator
//! succeeded, so a failing pipeline never leaves a half-updated
//! record.

use std::cmp::Ordering;

use satchel_document::{
    Document, NestedArrays, Value, compare_values, get_path, remove_path, set_path,
};
use satchel_query::UpdateOp;

use crate::error::DbError;
use crate::matcher::Bindings;

#[derive(Debug, Default)]
pub(crate) struct UpdateOutcome {
    pub modified: bool,
    /// `$dropall`: remove the document instead of re-storing it.
    pub drop: bool,
}

pub(crate) fn apply_updates(
    doc: &mut Document,
    updates: &[UpdateOp],
    bindings: &Bindings,
) -> Result<UpdateOutcome, DbError> {
    let mut outcome = UpdateOutcome::default();
    for op in updates {
        match op {
            UpdateOp::Set(patch) | UpdateOp::Upsert(patch) => {
                for (path, value) in patch.iter() {
                    outcome.modified |= op_set(doc, path, value, bindings)?;
                }
            }
            UpdateOp::Unset(paths) => {
                for path in paths {
                    let Some(path) = bind_path(path, bindings) else {
                        continue;
                    };
                    outcome.modified |= remove_path(doc, &path).is_some();
                }
            }
            UpdateOp::Inc(patch) => {
                for (path, amount) in patch.iter() {
                    outcome.modified |= op_inc(doc, path, amount, bindings)?;
                }
            }
            UpdateOp::Rename(pairs) => {
                for (from, to) in pairs {
                    if let Some(value) = remove_path(doc, from) {
                        set_path(doc, to, value)?;
                        outcome.modified = true;
                    }
                }
            }
            UpdateOp::AddToSet(patch) => {
                for (path, value) in patch.iter() {
                    outcome.modified |= op_add_to_set(doc, path, std::slice::from_ref(value), bindings)?;
                }
            }
            UpdateOp::AddToSetAll(patch) => {
                for (path, value) in patch.iter() {
                    let values = expect_array(op.name(), value)?;
                    outcome.modified |= op_add_to_set(doc, path, values, bindings)?;
                }
            }
            UpdateOp::Push(patch) => {
                for (path, value) in patch.iter() {
                    outcome.modified |= op_push(doc, path, std::slice::from_ref(value), bindings)?;
                }
            }
            UpdateOp::PushAll(patch) => {
                for (path, value) in patch.iter() {
                    let values = expect_array(op.name(), value)?;
                    outcome.modified |= op_push(doc, path, values, bindings)?;
                }
            }
            UpdateOp::Pull(patch) => {
                for (path, value) in patch.iter() {
                    outcome.modified |= op_pull(doc, path, std::slice::from_ref(value), bindings)?;
                }
            }
            UpdateOp::PullAll(patch) => {
                for (path, value) in patch.iter() {
                    let values = expect_array(op.name(), value)?;
                    outcome.modified |= op_pull(doc, path, values, bindings)?;
                }
            }
            UpdateOp::DropAll => outcome.drop = true,
            // $do shapes results, not stored documents
            UpdateOp::Do(_) => {}
        }
    }
    Ok(outcome)
}

/// Substitute positional `$` segments from the bindings resolved
/// during matching. `None` when a `$` has no binding; the operator
/// skips that path.
fn bind_path(path: &str, bindings: &Bindings) -> Option<String> {
    if !path.contains('$') {
        return Some(path.to_string());
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut out: Vec<String> = Vec::with_capacity(segments.len());
    for (i, seg) in segments.iter().enumerate() {
        if *seg == "$" {
            let array_path = segments[..i].join(".");
            let idx = bindings.positions.get(&array_path)?;
            out.push(idx.to_string());
        } else {
            out.push((*seg).to_string());
        }
    }
    Some(out.join("."))
}

fn expect_array<'a>(op: &str, value: &'a Value) -> Result<&'a [Value], DbError> {
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(DbError::UpdateFailed(format!(
            "{op} operand for each field must be an array"
        ))),
    }
}

fn op_set(
    doc: &mut Document,
    path: &str,
    value: &Value,
    bindings: &Bindings,
) -> Result<bool, DbError> {
    let Some(path) = bind_path(path, bindings) else {
        return Ok(false);
    };
    if get_path(doc, &path, NestedArrays::Fail) == Some(value) {
        return Ok(false);
    }
    set_path(doc, &path, value.clone())?;
    Ok(true)
}

/// Numeric increment with type promotion: i32 widens to i64 on
/// overflow or when mixed with i64; anything mixed with a double
/// becomes a double. A missing field starts at zero of the
/// increment's type.
fn op_inc(
    doc: &mut Document,
    path: &str,
    amount: &Value,
    bindings: &Bindings,
) -> Result<bool, DbError> {
    let Some(path) = bind_path(path, bindings) else {
        return Ok(false);
    };
    let current = match get_path(doc, &path, NestedArrays::Fail) {
        Some(v) => v.clone(),
        None => match amount {
            Value::Int64(_) => Value::Int64(0),
            Value::Double(_) => Value::Double(0.0),
            _ => Value::Int32(0),
        },
    };
    let result = match (&current, amount) {
        (Value::Int32(a), Value::Int32(b)) => match a.checked_add(*b) {
            Some(sum) => Value::Int32(sum),
            None => Value::Int64(*a as i64 + *b as i64),
        },
        (Value::Int32(a), Value::Int64(b)) => Value::Int64(*a as i64 + b),
        (Value::Int64(a), Value::Int32(b)) => Value::Int64(a + *b as i64),
        (Value::Int64(a), Value::Int64(b)) => Value::Int64(a + b),
        (Value::Double(a), Value::Double(b)) => Value::Double(a + b),
        (Value::Int32(a), Value::Double(b)) => Value::Double(*a as f64 + b),
        (Value::Int64(a), Value::Double(b)) => Value::Double(*a as f64 + b),
        (Value::Double(a), Value::Int32(b)) => Value::Double(a + *b as f64),
        (Value::Double(a), Value::Int64(b)) => Value::Double(a + *b as f64),
        _ => {
            return Err(DbError::UpdateFailed(format!(
                "$inc: field {path} is not numeric"
            )));
        }
    };
    set_path(doc, &path, result)?;
    Ok(true)
}

fn array_slot<'a>(
    doc: &'a mut Document,
    path: &str,
    create: bool,
) -> Result<Option<&'a mut Vec<Value>>, DbError> {
    if get_path(doc, path, NestedArrays::Fail).is_none() {
        if !create {
            return Ok(None);
        }
        set_path(doc, path, Value::Array(Vec::new()))?;
    }
    match get_path_mut_array(doc, path) {
        Some(items) => Ok(Some(items)),
        None => Err(DbError::UpdateFailed(format!(
            "field {path} is not an array"
        ))),
    }
}

fn get_path_mut_array<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Vec<Value>> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get_mut(first)?;
    for seg in segments {
        match current {
            Value::Object(sub) => current = sub.get_mut(seg)?,
            Value::Array(items) => {
                let idx: usize = seg.parse().ok()?;
                current = items.get_mut(idx)?;
            }
            _ => return None,
        }
    }
    match current {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

fn op_add_to_set(
    doc: &mut Document,
    path: &str,
    values: &[Value],
    bindings: &Bindings,
) -> Result<bool, DbError> {
    let Some(path) = bind_path(path, bindings) else {
        return Ok(false);
    };
    let Some(items) = array_slot(doc, &path, true)? else {
        return Ok(false);
    };
    let mut changed = false;
    for value in values {
        let present = items
            .iter()
            .any(|v| compare_values(v, value) == Ordering::Equal);
        if !present {
            items.push(value.clone());
            changed = true;
        }
    }
    Ok(changed)
}

fn op_push(
    doc: &mut Document,
    path: &str,
    values: &[Value],
    bindings: &Bindings,
) -> Result<bool, DbError> {
    let Some(path) = bind_path(path, bindings) else {
        return Ok(false);
    };
    let Some(items) = array_slot(doc, &path, true)? else {
        return Ok(false);
    };
    items.extend(values.iter().cloned());
    Ok(!values.is_empty())
}

fn op_pull(
    doc: &mut Document,
    path: &str,
    values: &[Value],
    bindings: &Bindings,
) -> Result<bool, DbError> {
    let Some(path) = bind_path(path, bindings) else {
        return Ok(false);
    };
    let Some(items) = array_slot(doc, &path, false)? else {
        return Ok(false);
    };
    let before = items.len();
    items.retain(|v| {
        !values
            .iter()
            .any(|drop| compare_values(v, drop) == Ordering::Equal)
    });
    Ok(items.len() != before)
}
