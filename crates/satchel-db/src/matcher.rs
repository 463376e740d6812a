//! Residual predicate evaluation against candidate documents.

use std::cmp::Ordering;
use std::collections::HashMap;

use satchel_document::{Document, Value, compare_values, type_rank};
use satchel_query::{Condition, ConditionOp, Predicate};

use crate::keys;

/// Positional `$` slot bindings resolved while matching one candidate:
/// array path → index of the first element that satisfied its
/// `$elemMatch` group.
#[derive(Debug, Default)]
pub(crate) struct Bindings {
    pub positions: HashMap<String, usize>,
}

pub(crate) fn matches(pred: &Predicate, doc: &Document, bindings: &mut Bindings) -> bool {
    match pred {
        Predicate::And(children) => children.iter().all(|c| matches(c, doc, bindings)),
        Predicate::Or(children) => children.iter().any(|c| matches(c, doc, bindings)),
        Predicate::Leaf(cond) => eval_condition(cond, doc),
        Predicate::ElemMatch {
            path, conditions, ..
        } => eval_elem_match(path, conditions, doc, bindings),
    }
}

/// Resolve every value a dotted path addresses. Arrays met before the
/// path is exhausted descend per element when the next segment is not
/// a numeric index.
pub(crate) fn collect_values<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some(first) = segments.first() {
        if let Some(v) = doc.get(first) {
            collect(v, &segments[1..], &mut out);
        }
    }
    out
}

fn collect<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    if segments.is_empty() {
        out.push(value);
        return;
    }
    let seg = segments[0];
    match value {
        Value::Object(sub) => {
            if let Some(v) = sub.get(seg) {
                collect(v, &segments[1..], out);
            }
        }
        Value::Array(items) => match array_index(seg) {
            Some(idx) => {
                if let Some(v) = items.get(idx) {
                    collect(v, &segments[1..], out);
                }
            }
            None => {
                for item in items {
                    collect(item, segments, out);
                }
            }
        },
        _ => {}
    }
}

fn array_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

fn eval_elem_match(
    path: &str,
    conditions: &[Condition],
    doc: &Document,
    bindings: &mut Bindings,
) -> bool {
    for value in collect_values(doc, path) {
        let Value::Array(items) = value else { continue };
        for (idx, elem) in items.iter().enumerate() {
            let Value::Object(elem_doc) = elem else { continue };
            if conditions.iter().all(|c| eval_condition(c, elem_doc)) {
                bindings.positions.insert(path.to_string(), idx);
                return true;
            }
        }
    }
    false
}

pub(crate) fn eval_condition(cond: &Condition, doc: &Document) -> bool {
    let vals = collect_values(doc, &cond.path);
    let result = match &cond.op {
        ConditionOp::Exists(want) => !vals.is_empty() == *want,
        ConditionOp::Eq(target) => any_scalar(&vals, |v| value_eq(v, target, cond.icase)),
        ConditionOp::Gt(operand) => ordered(&vals, operand, cond.icase, |o| o == Ordering::Greater),
        ConditionOp::Gte(operand) => ordered(&vals, operand, cond.icase, |o| o != Ordering::Less),
        ConditionOp::Lt(operand) => ordered(&vals, operand, cond.icase, |o| o == Ordering::Less),
        ConditionOp::Lte(operand) => {
            ordered(&vals, operand, cond.icase, |o| o != Ordering::Greater)
        }
        ConditionOp::Begin(prefix) => any_scalar(&vals, |v| match v.as_str() {
            Some(s) if cond.icase => keys::fold_case(s).starts_with(&keys::fold_case(prefix)),
            Some(s) => s.starts_with(prefix.as_str()),
            None => false,
        }),
        ConditionOp::In(set) => {
            any_scalar(&vals, |v| set.iter().any(|m| value_eq(v, m, cond.icase)))
        }
        ConditionOp::NotIn(set) => {
            !any_scalar(&vals, |v| set.iter().any(|m| value_eq(v, m, cond.icase)))
        }
        ConditionOp::Between(a, b) => {
            let (lo, hi) = if compare_values(a, b) == Ordering::Greater {
                (b, a)
            } else {
                (a, b)
            };
            any_scalar(&vals, |v| {
                type_rank(v) == type_rank(lo)
                    && compare_values(v, lo) != Ordering::Less
                    && compare_values(v, hi) != Ordering::Greater
            })
        }
        ConditionOp::StrAnd(want) => {
            let have = field_tokens(&vals, cond.icase);
            want.iter()
                .all(|t| have.contains(&apply_case(t, cond.icase)))
        }
        ConditionOp::StrOr(want) => {
            let have = field_tokens(&vals, cond.icase);
            want.iter()
                .any(|t| have.contains(&apply_case(t, cond.icase)))
        }
        ConditionOp::Matches(re) => any_scalar(&vals, |v| match v.as_str() {
            Some(s) => re.is_match(s),
            None => false,
        }),
    };
    result != cond.negate
}

/// Apply `f` to each resolved value and, for arrays, to each element,
/// so scalar operators match arrays by any element.
fn any_scalar(vals: &[&Value], mut f: impl FnMut(&Value) -> bool) -> bool {
    for v in vals {
        if f(v) {
            return true;
        }
        if let Value::Array(items) = v {
            if items.iter().any(&mut f) {
                return true;
            }
        }
    }
    false
}

fn ordered(
    vals: &[&Value],
    operand: &Value,
    icase: bool,
    accept: impl Fn(Ordering) -> bool,
) -> bool {
    any_scalar(vals, |v| {
        if type_rank(v) != type_rank(operand) {
            return false;
        }
        let ord = match (v.as_str(), operand.as_str()) {
            (Some(a), Some(b)) if icase => keys::fold_case(a).cmp(&keys::fold_case(b)),
            _ => compare_values(v, operand),
        };
        accept(ord)
    })
}

fn value_eq(v: &Value, target: &Value, icase: bool) -> bool {
    if icase {
        if let (Some(a), Some(b)) = (v.as_str(), target.as_str()) {
            return keys::fold_case(a) == keys::fold_case(b);
        }
    }
    compare_values(v, target) == Ordering::Equal
}

fn apply_case(s: &str, icase: bool) -> String {
    if icase { keys::fold_case(s) } else { s.to_string() }
}

fn field_tokens(vals: &[&Value], icase: bool) -> Vec<String> {
    let mut tokens = Vec::new();
    for v in vals {
        for t in keys::tokenize(v) {
            tokens.push(apply_case(&t, icase));
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use satchel_query::Query;

    fn doc(pairs: &[(&str, Value)]) -> Document {
        let mut d = Document::new();
        for (k, v) in pairs {
            d.push(*k, v.clone());
        }
        d
    }

    fn matches_query(query: &Document, target: &Document) -> bool {
        let q = Query::from_document(query).unwrap();
        let mut bindings = Bindings::default();
        matches(&q.main, target, &mut bindings)
    }

    #[test]
    fn eq_and_ranges() {
        let d = doc(&[("age", Value::Int32(30))]);
        assert!(matches_query(&doc(&[("age", Value::Int32(30))]), &d));
        assert!(matches_query(&doc(&[("age", Value::Int64(30))]), &d));
        assert!(!matches_query(&doc(&[("age", Value::Int32(31))]), &d));

        let gt = doc(&[("age", Value::Object(doc(&[("$gt", Value::Int32(29))])))]);
        assert!(matches_query(&gt, &d));
        let lt = doc(&[("age", Value::Object(doc(&[("$lt", Value::Int32(30))])))]);
        assert!(!matches_query(&lt, &d));
    }

    #[test]
    fn ordering_requires_same_rank() {
        let d = doc(&[("age", Value::String("30".into()))]);
        let gt = doc(&[("age", Value::Object(doc(&[("$gt", Value::Int32(1))])))]);
        assert!(!matches_query(&gt, &d), "strings never satisfy numeric $gt");
    }

    #[test]
    fn array_fields_match_by_element() {
        let d = doc(&[(
            "tags",
            Value::Array(vec![
                Value::String("red".into()),
                Value::String("blue".into()),
            ]),
        )]);
        assert!(matches_query(&doc(&[("tags", Value::String("red".into()))]), &d));
        let nin = doc(&[(
            "tags",
            Value::Object(doc(&[(
                "$nin",
                Value::Array(vec![Value::String("red".into())]),
            )])),
        )]);
        assert!(!matches_query(&nin, &d));
    }

    #[test]
    fn dotted_paths_descend_arrays_implicitly() {
        let items = Value::Array(vec![
            Value::Object(doc(&[("sku", Value::String("a".into()))])),
            Value::Object(doc(&[("sku", Value::String("b".into()))])),
        ]);
        let d = doc(&[("items", items)]);
        assert!(matches_query(&doc(&[("items.sku", Value::String("b".into()))]), &d));
        assert!(matches_query(&doc(&[("items.1.sku", Value::String("b".into()))]), &d));
        assert!(!matches_query(&doc(&[("items.0.sku", Value::String("b".into()))]), &d));
    }

    #[test]
    fn begin_in_bt_strand_stror() {
        let d = doc(&[
            ("name", Value::String("satchel".into())),
            ("n", Value::Int32(5)),
            ("text", Value::String("alpha beta gamma".into())),
        ]);
        let begin = doc(&[("name", Value::Object(doc(&[("$begin", Value::String("sat".into()))])))]);
        assert!(matches_query(&begin, &d));

        let in_q = doc(&[(
            "n",
            Value::Object(doc(&[(
                "$in",
                Value::Array(vec![Value::Int32(4), Value::Int32(5)]),
            )])),
        )]);
        assert!(matches_query(&in_q, &d));

        let bt = doc(&[(
            "n",
            Value::Object(doc(&[(
                "$bt",
                Value::Array(vec![Value::Int32(7), Value::Int32(2)]),
            )])),
        )]);
        assert!(matches_query(&bt, &d), "$bt endpoints normalize");

        let strand = doc(&[(
            "text",
            Value::Object(doc(&[(
                "$strand",
                Value::Array(vec![
                    Value::String("alpha".into()),
                    Value::String("gamma".into()),
                ]),
            )])),
        )]);
        assert!(matches_query(&strand, &d));

        let stror = doc(&[(
            "text",
            Value::Object(doc(&[(
                "$stror",
                Value::Array(vec![
                    Value::String("nope".into()),
                    Value::String("beta".into()),
                ]),
            )])),
        )]);
        assert!(matches_query(&stror, &d));
    }

    #[test]
    fn icase_and_not() {
        let d = doc(&[("name", Value::String("Alice".into()))]);
        let icase = doc(&[(
            "name",
            Value::Object(doc(&[("$icase", Value::String("ALICE".into()))])),
        )]);
        assert!(matches_query(&icase, &d));

        let not = doc(&[(
            "name",
            Value::Object(doc(&[(
                "$not",
                Value::Object(doc(&[("$begin", Value::String("Al".into()))])),
            )])),
        )]);
        assert!(!matches_query(&not, &d));
    }

    #[test]
    fn exists_checks_presence() {
        let d = doc(&[("a", Value::Null)]);
        let exists = doc(&[("a", Value::Object(doc(&[("$exists", Value::Bool(true))])))]);
        assert!(matches_query(&exists, &d));
        let missing = doc(&[("b", Value::Object(doc(&[("$exists", Value::Bool(false))])))]);
        assert!(matches_query(&missing, &d));
    }

    #[test]
    fn elem_match_binds_first_satisfying_index() {
        let items = Value::Array(vec![
            Value::Object(doc(&[("sku", Value::String("a".into())), ("qty", Value::Int32(1))])),
            Value::Object(doc(&[("sku", Value::String("b".into())), ("qty", Value::Int32(2))])),
            Value::Object(doc(&[("sku", Value::String("b".into())), ("qty", Value::Int32(9))])),
        ]);
        let d = doc(&[("items", items)]);
        let em = doc(&[(
            "items",
            Value::Object(doc(&[(
                "$elemMatch",
                Value::Object(doc(&[
                    ("sku", Value::String("b".into())),
                    ("qty", Value::Object(doc(&[("$gt", Value::Int32(1))]))),
                ])),
            )])),
        )]);
        let q = Query::from_document(&em).unwrap();
        let mut bindings = Bindings::default();
        assert!(matches(&q.main, &d, &mut bindings));
        assert_eq!(bindings.positions.get("items"), Some(&1));
    }

    #[test]
    fn elem_match_requires_all_conditions_on_one_element() {
        // sku=b on element 1, qty=9 only on element 2: no single
        // element satisfies both
        let items = Value::Array(vec![
            Value::Object(doc(&[("sku", Value::String("b".into())), ("qty", Value::Int32(1))])),
            Value::Object(doc(&[("sku", Value::String("x".into())), ("qty", Value::Int32(9))])),
        ]);
        let d = doc(&[("items", items)]);
        let em = doc(&[(
            "items",
            Value::Object(doc(&[(
                "$elemMatch",
                Value::Object(doc(&[
                    ("sku", Value::String("b".into())),
                    ("qty", Value::Int32(9)),
                ])),
            )])),
        )]);
        assert!(!matches_query(&em, &d));
    }
}
