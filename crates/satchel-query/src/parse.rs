use satchel_document::{Document, Value};

use crate::error::ParseError;
use crate::expr::{Condition, ConditionOp, Predicate};
use crate::hints::{FieldsSpec, Hints, SortDir};
use crate::update::{DoAction, UpdateOp};
use crate::Query;

/// Parse a query from its wire form: the main spec, each branch and
/// the hints object are independent encoded documents.
pub fn parse_query_bytes(
    main: &[u8],
    or: &[&[u8]],
    and: &[&[u8]],
    hints: Option<&[u8]>,
) -> Result<Query, ParseError> {
    let decode_one = |bytes: &[u8]| {
        satchel_document::decode(bytes)
            .map_err(|e| ParseError::InvalidControl(format!("malformed query document: {e}")))
    };
    let main = decode_one(main)?;
    let or: Vec<Document> = or.iter().map(|b| decode_one(b)).collect::<Result<_, _>>()?;
    let and: Vec<Document> = and.iter().map(|b| decode_one(b)).collect::<Result<_, _>>()?;
    let hints = hints.map(&decode_one).transpose()?;
    parse_query(&main, &or, &and, hints.as_ref())
}

/// Parse a query from its constituent documents: the main spec, the
/// `$or` and `$and` branch lists and the hints document. `$or`,
/// `$and` and hint keys embedded in the main document are accepted as
/// well and merged.
pub fn parse_query(
    main: &Document,
    or: &[Document],
    and: &[Document],
    hints: Option<&Document>,
) -> Result<Query, ParseError> {
    let mut parser = Parser { next_group: 0 };
    let mut query = Query {
        main: Predicate::always(),
        or: Vec::new(),
        and: Vec::new(),
        updates: Vec::new(),
        hints: Hints::default(),
    };

    let mut conditions = Vec::new();
    for (key, value) in main.iter() {
        match key {
            "$or" => parser.parse_branch_array(key, value, &mut query.or)?,
            "$and" => parser.parse_branch_array(key, value, &mut query.and)?,
            "$set" | "$unset" | "$inc" | "$rename" | "$addToSet" | "$addToSetAll" | "$push"
            | "$pushAll" | "$pull" | "$pullAll" | "$upsert" | "$do" | "$dropall" => {
                query.updates.push(parse_update(key, value)?);
            }
            "$orderby" | "$skip" | "$max" | "$min" | "$fields" => {
                parse_hint(key, value, &mut query.hints)?;
            }
            k if k.starts_with('$') => {
                return Err(ParseError::InvalidControl(format!(
                    "unknown top-level operator: {k}"
                )));
            }
            path => conditions.push(parser.parse_field(path, value)?),
        }
    }
    query.main = fold_and(conditions);

    for branch in or {
        query.or.push(parser.parse_predicate(branch)?);
    }
    for branch in and {
        query.and.push(parser.parse_predicate(branch)?);
    }
    if let Some(doc) = hints {
        for (key, value) in doc.iter() {
            parse_hint(key, value, &mut query.hints)?;
        }
    }
    Ok(query)
}

fn fold_and(mut children: Vec<Predicate>) -> Predicate {
    if children.len() == 1 {
        children.pop().unwrap()
    } else {
        Predicate::And(children)
    }
}

struct Parser {
    next_group: u32,
}

impl Parser {
    /// A branch document: conditions and nested `$and`/`$or` only.
    fn parse_predicate(&mut self, doc: &Document) -> Result<Predicate, ParseError> {
        let mut children = Vec::new();
        for (key, value) in doc.iter() {
            match key {
                "$or" => {
                    let mut branches = Vec::new();
                    self.parse_branch_array(key, value, &mut branches)?;
                    children.push(Predicate::Or(branches));
                }
                "$and" => {
                    let mut branches = Vec::new();
                    self.parse_branch_array(key, value, &mut branches)?;
                    children.push(Predicate::And(branches));
                }
                k if k.starts_with('$') => {
                    return Err(ParseError::InvalidControl(format!(
                        "operator {k} is not allowed inside a branch"
                    )));
                }
                path => children.push(self.parse_field(path, value)?),
            }
        }
        Ok(fold_and(children))
    }

    fn parse_branch_array(
        &mut self,
        op: &str,
        value: &Value,
        out: &mut Vec<Predicate>,
    ) -> Result<(), ParseError> {
        let Value::Array(items) = value else {
            return Err(ParseError::OperandNotArray(
                if op == "$or" { "$or" } else { "$and" }.to_string(),
            ));
        };
        for item in items {
            match item {
                Value::Object(doc) => out.push(self.parse_predicate(doc)?),
                _ => {
                    return Err(ParseError::InvalidControl(format!(
                        "{op} array elements must be documents"
                    )));
                }
            }
        }
        Ok(())
    }

    /// A field condition: implicit `$eq` or an operator sub-document.
    fn parse_field(&mut self, path: &str, value: &Value) -> Result<Predicate, ParseError> {
        if path.is_empty() {
            return Err(ParseError::InvalidPath(path.to_string()));
        }
        if let Value::Object(sub) = value {
            if let Some((first, _)) = sub.iter().next() {
                if first.starts_with('$') {
                    return self.parse_operator_doc(path, sub, false, false);
                }
            }
        }
        Ok(Predicate::Leaf(eq_condition(path, value, false, false)?))
    }

    fn parse_operator_doc(
        &mut self,
        path: &str,
        doc: &Document,
        negate: bool,
        icase: bool,
    ) -> Result<Predicate, ParseError> {
        let mut conditions = Vec::new();
        for (key, value) in doc.iter() {
            match key {
                "$elemMatch" => {
                    if doc.len() > 1 {
                        return Err(ParseError::InvalidControl(
                            "$elemMatch cannot be combined with other operators".into(),
                        ));
                    }
                    return self.parse_elem_match(path, value);
                }
                "$not" => {
                    let Value::Object(inner) = value else {
                        return Err(ParseError::InvalidControl(
                            "$not operand must be a document".into(),
                        ));
                    };
                    conditions.push(self.parse_operator_doc(path, inner, !negate, icase)?);
                }
                "$icase" => match value {
                    Value::Object(inner) => {
                        conditions.push(self.parse_operator_doc(path, inner, negate, true)?);
                    }
                    other => {
                        conditions.push(Predicate::Leaf(eq_condition(path, other, negate, true)?));
                    }
                },
                op => {
                    conditions.push(Predicate::Leaf(Condition {
                        path: path.to_string(),
                        op: parse_op(op, value)?,
                        negate,
                        icase,
                    }));
                }
            }
        }
        Ok(fold_and(conditions))
    }

    fn parse_elem_match(&mut self, path: &str, value: &Value) -> Result<Predicate, ParseError> {
        let Value::Object(spec) = value else {
            return Err(ParseError::InvalidControl(
                "$elemMatch operand must be a document".into(),
            ));
        };
        let group = self.next_group;
        self.next_group += 1;
        let mut conditions = Vec::new();
        for (sub_path, sub_value) in spec.iter() {
            if sub_path.starts_with('$') {
                return Err(ParseError::InvalidControl(format!(
                    "operator {sub_path} is not allowed directly under $elemMatch"
                )));
            }
            match sub_value {
                Value::Object(inner)
                    if inner.iter().next().is_some_and(|(k, _)| k.starts_with('$')) =>
                {
                    if inner.contains_key("$elemMatch") {
                        return Err(ParseError::ElemMatchDuplicate);
                    }
                    for (op, operand) in inner.iter() {
                        match op {
                            "$not" => {
                                let Value::Object(nested) = operand else {
                                    return Err(ParseError::InvalidControl(
                                        "$not operand must be a document".into(),
                                    ));
                                };
                                for (nop, noperand) in nested.iter() {
                                    conditions.push(Condition {
                                        path: sub_path.to_string(),
                                        op: parse_op(nop, noperand)?,
                                        negate: true,
                                        icase: false,
                                    });
                                }
                            }
                            _ => conditions.push(Condition {
                                path: sub_path.to_string(),
                                op: parse_op(op, operand)?,
                                negate: false,
                                icase: false,
                            }),
                        }
                    }
                }
                other => conditions.push(eq_condition(sub_path, other, false, false)?),
            }
        }
        Ok(Predicate::ElemMatch {
            path: path.to_string(),
            group,
            conditions,
        })
    }
}

fn eq_condition(
    path: &str,
    value: &Value,
    negate: bool,
    icase: bool,
) -> Result<Condition, ParseError> {
    let op = match value {
        Value::Regex { pattern, options } => ConditionOp::Matches(compile_regex(pattern, options)?),
        other => ConditionOp::Eq(other.clone()),
    };
    Ok(Condition {
        path: path.to_string(),
        op,
        negate,
        icase,
    })
}

fn compile_regex(pattern: &str, options: &str) -> Result<regex::Regex, ParseError> {
    let full = if options.is_empty() {
        pattern.to_string()
    } else {
        let mut prefix = String::with_capacity(4 + options.len() + pattern.len());
        prefix.push_str("(?");
        for ch in options.chars() {
            match ch {
                'i' | 's' | 'm' | 'x' => prefix.push(ch),
                c => return Err(ParseError::InvalidRegex(format!("unknown regex option: {c}"))),
            }
        }
        prefix.push(')');
        prefix.push_str(pattern);
        prefix
    };
    regex::Regex::new(&full).map_err(|e| ParseError::InvalidRegex(e.to_string()))
}

fn parse_op(op: &str, operand: &Value) -> Result<ConditionOp, ParseError> {
    Ok(match op {
        "$eq" => match operand {
            Value::Regex { pattern, options } => {
                ConditionOp::Matches(compile_regex(pattern, options)?)
            }
            other => ConditionOp::Eq(other.clone()),
        },
        "$gt" => ConditionOp::Gt(operand.clone()),
        "$gte" => ConditionOp::Gte(operand.clone()),
        "$lt" => ConditionOp::Lt(operand.clone()),
        "$lte" => ConditionOp::Lte(operand.clone()),
        "$begin" => match operand {
            Value::String(s) => ConditionOp::Begin(s.clone()),
            _ => {
                return Err(ParseError::InvalidControl(
                    "$begin operand must be a string".into(),
                ));
            }
        },
        "$in" => ConditionOp::In(array_operand(op, operand)?),
        "$nin" => ConditionOp::NotIn(array_operand(op, operand)?),
        "$bt" => {
            let items = array_operand(op, operand)?;
            if items.len() != 2 {
                return Err(ParseError::InvalidControl(
                    "$bt operand must hold exactly two endpoints".into(),
                ));
            }
            let mut it = items.into_iter();
            ConditionOp::Between(it.next().unwrap(), it.next().unwrap())
        }
        "$strand" => ConditionOp::StrAnd(token_operand(op, operand)?),
        "$stror" => ConditionOp::StrOr(token_operand(op, operand)?),
        "$exists" => match operand {
            Value::Bool(b) => ConditionOp::Exists(*b),
            _ => {
                return Err(ParseError::InvalidControl(
                    "$exists operand must be a boolean".into(),
                ));
            }
        },
        other => {
            return Err(ParseError::InvalidControl(format!(
                "unknown field operator: {other}"
            )));
        }
    })
}

fn array_operand(op: &str, operand: &Value) -> Result<Vec<Value>, ParseError> {
    match operand {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(ParseError::OperandNotArray(op.to_string())),
    }
}

fn token_operand(op: &str, operand: &Value) -> Result<Vec<String>, ParseError> {
    let items = array_operand(op, operand)?;
    items
        .into_iter()
        .map(|v| match v {
            Value::String(s) => Ok(s),
            _ => Err(ParseError::InvalidControl(format!(
                "{op} tokens must be strings"
            ))),
        })
        .collect()
}

// ── Updates ────────────────────────────────────────────────────

fn parse_update(op: &str, value: &Value) -> Result<UpdateOp, ParseError> {
    let object = |v: &Value| -> Result<Document, ParseError> {
        match v {
            Value::Object(doc) => Ok(doc.clone()),
            _ => Err(ParseError::InvalidControl(format!(
                "{op} operand must be a document"
            ))),
        }
    };
    Ok(match op {
        "$set" => UpdateOp::Set(object(value)?),
        "$inc" => UpdateOp::Inc(object(value)?),
        "$addToSet" => UpdateOp::AddToSet(object(value)?),
        "$addToSetAll" => UpdateOp::AddToSetAll(object(value)?),
        "$push" => UpdateOp::Push(object(value)?),
        "$pushAll" => UpdateOp::PushAll(object(value)?),
        "$pull" => UpdateOp::Pull(object(value)?),
        "$pullAll" => UpdateOp::PullAll(object(value)?),
        "$upsert" => UpdateOp::Upsert(object(value)?),
        "$unset" => UpdateOp::Unset(object(value)?.iter().map(|(k, _)| k.to_string()).collect()),
        "$rename" => {
            let doc = object(value)?;
            let mut pairs = Vec::with_capacity(doc.len());
            for (from, to) in doc.iter() {
                match to {
                    Value::String(name) => pairs.push((from.to_string(), name.clone())),
                    _ => {
                        return Err(ParseError::InvalidControl(
                            "$rename target must be a string".into(),
                        ));
                    }
                }
            }
            UpdateOp::Rename(pairs)
        }
        "$dropall" => match value {
            Value::Bool(true) => UpdateOp::DropAll,
            _ => {
                return Err(ParseError::InvalidControl(
                    "$dropall operand must be true".into(),
                ));
            }
        },
        "$do" => UpdateOp::Do(parse_do(&object(value)?)?),
        _ => unreachable!("caller routes update operators"),
    })
}

fn parse_do(spec: &Document) -> Result<Vec<DoAction>, ParseError> {
    let mut actions = Vec::with_capacity(spec.len());
    for (path, action) in spec.iter() {
        let Value::Object(body) = action else {
            return Err(ParseError::InvalidDoAction(format!(
                "{path}: action must be a document"
            )));
        };
        let Some((verb, operand)) = body.iter().next() else {
            return Err(ParseError::InvalidDoAction(format!("{path}: empty action")));
        };
        match verb {
            "$join" => match operand {
                Value::String(collection) => actions.push(DoAction::Join {
                    path: path.to_string(),
                    collection: collection.clone(),
                }),
                _ => {
                    return Err(ParseError::InvalidDoAction(format!(
                        "{path}: $join expects a collection name"
                    )));
                }
            },
            "$slice" => match operand {
                Value::Int32(_) | Value::Int64(_) | Value::Double(_) => {
                    let limit = operand.as_f64().unwrap() as i64;
                    actions.push(DoAction::Slice {
                        path: path.to_string(),
                        skip: 0,
                        limit,
                    });
                }
                Value::Array(items) if items.len() == 2 => {
                    let nums: Option<Vec<i64>> =
                        items.iter().map(|v| v.as_f64().map(|f| f as i64)).collect();
                    let Some(nums) = nums else {
                        return Err(ParseError::InvalidDoAction(format!(
                            "{path}: $slice endpoints must be numbers"
                        )));
                    };
                    actions.push(DoAction::Slice {
                        path: path.to_string(),
                        skip: nums[0],
                        limit: nums[1],
                    });
                }
                _ => {
                    return Err(ParseError::InvalidDoAction(format!(
                        "{path}: $slice expects a count or [skip, count]"
                    )));
                }
            },
            other => {
                return Err(ParseError::InvalidDoAction(format!(
                    "{path}: unknown action {other}"
                )));
            }
        }
    }
    Ok(actions)
}

// ── Hints ──────────────────────────────────────────────────────

fn parse_hint(key: &str, value: &Value, hints: &mut Hints) -> Result<(), ParseError> {
    match key {
        "$orderby" => {
            let Value::Object(spec) = value else {
                return Err(ParseError::InvalidControl(
                    "$orderby operand must be a document".into(),
                ));
            };
            for (path, dir) in spec.iter() {
                let Some(n) = dir.as_f64() else {
                    return Err(ParseError::InvalidControl(format!(
                        "$orderby direction for {path} must be a number"
                    )));
                };
                let dir = if n < 0.0 { SortDir::Desc } else { SortDir::Asc };
                hints.order_by.push((path.to_string(), dir));
            }
        }
        "$skip" => hints.skip = numeric_hint(key, value)?,
        "$max" => hints.max = Some(numeric_hint(key, value)?),
        "$min" => hints.min = Some(numeric_hint(key, value)?),
        "$fields" => {
            let Value::Object(spec) = value else {
                return Err(ParseError::InvalidControl(
                    "$fields operand must be a document".into(),
                ));
            };
            let mut include: Option<bool> = None;
            let mut paths = Vec::with_capacity(spec.len());
            for (path, flag) in spec.iter() {
                let Some(n) = flag.as_f64() else {
                    return Err(ParseError::InvalidControl(format!(
                        "$fields flag for {path} must be a number"
                    )));
                };
                let this = n != 0.0;
                match include {
                    None => include = Some(this),
                    Some(prev) if prev != this => {
                        return Err(ParseError::FieldsIncludeExcludeMix);
                    }
                    Some(_) => {}
                }
                paths.push(path.to_string());
            }
            hints.fields = Some(FieldsSpec {
                include: include.unwrap_or(true),
                paths,
            });
        }
        other => {
            return Err(ParseError::InvalidControl(format!(
                "unknown hint: {other}"
            )));
        }
    }
    Ok(())
}

fn numeric_hint(key: &str, value: &Value) -> Result<usize, ParseError> {
    let Some(n) = value.as_f64() else {
        return Err(ParseError::InvalidControl(format!(
            "{key} operand must be a number"
        )));
    };
    Ok(if n < 0.0 { 0 } else { n as usize })
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

    fn s(v: &str) -> Value {
        Value::String(v.into())
    }

    #[test]
    fn bare_field_is_implicit_eq() {
        let q = Query::from_document(&doc(&[("status", s("active"))])).unwrap();
        match &q.main {
            Predicate::Leaf(c) => {
                assert_eq!(c.path, "status");
                assert!(matches!(&c.op, ConditionOp::Eq(Value::String(v)) if v == "active"));
            }
            other => panic!("expected Leaf, got {other:?}"),
        }
    }

    #[test]
    fn multiple_fields_fold_into_and() {
        let q = Query::from_document(&doc(&[
            ("status", s("active")),
            ("age", Value::Int32(30)),
        ]))
        .unwrap();
        match &q.main {
            Predicate::And(children) => assert_eq!(children.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn operator_doc_parses_each_op() {
        let ops = doc(&[("$gt", Value::Int32(5)), ("$lte", Value::Int32(10))]);
        let q = Query::from_document(&doc(&[("score", Value::Object(ops))])).unwrap();
        match &q.main {
            Predicate::And(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(&children[0], Predicate::Leaf(c) if matches!(c.op, ConditionOp::Gt(_))));
                assert!(matches!(&children[1], Predicate::Leaf(c) if matches!(c.op, ConditionOp::Lte(_))));
            }
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn bt_requires_two_endpoints() {
        let bad = doc(&[(
            "k",
            Value::Object(doc(&[("$bt", Value::Array(vec![Value::Int32(1)]))])),
        )]);
        assert!(Query::from_document(&bad).is_err());
        let good = doc(&[(
            "k",
            Value::Object(doc(&[(
                "$bt",
                Value::Array(vec![Value::Int32(1), Value::Int32(9)]),
            )])),
        )]);
        let q = Query::from_document(&good).unwrap();
        assert!(
            matches!(&q.main, Predicate::Leaf(c) if matches!(c.op, ConditionOp::Between(..)))
        );
    }

    #[test]
    fn in_requires_array() {
        let bad = doc(&[("k", Value::Object(doc(&[("$in", Value::Int32(1))])))]);
        assert_eq!(
            Query::from_document(&bad).unwrap_err(),
            ParseError::OperandNotArray("$in".to_string())
        );
    }

    #[test]
    fn not_negates_and_icase_folds() {
        let inner = doc(&[("$begin", s("ab"))]);
        let spec = doc(&[("$not", Value::Object(inner))]);
        let q = Query::from_document(&doc(&[("name", Value::Object(spec))])).unwrap();
        match &q.main {
            Predicate::Leaf(c) => {
                assert!(c.negate);
                assert!(!c.icase);
            }
            other => panic!("expected Leaf, got {other:?}"),
        }

        let spec = doc(&[("$icase", s("Alice"))]);
        let q = Query::from_document(&doc(&[("name", Value::Object(spec))])).unwrap();
        match &q.main {
            Predicate::Leaf(c) => assert!(c.icase),
            other => panic!("expected Leaf, got {other:?}"),
        }
    }

    #[test]
    fn elem_match_groups_conditions() {
        let inner = doc(&[("sku", s("b")), ("qty", Value::Object(doc(&[("$gt", Value::Int32(1))])))]);
        let spec = doc(&[("$elemMatch", Value::Object(inner))]);
        let q = Query::from_document(&doc(&[("items", Value::Object(spec))])).unwrap();
        match &q.main {
            Predicate::ElemMatch { path, conditions, .. } => {
                assert_eq!(path, "items");
                assert_eq!(conditions.len(), 2);
                assert_eq!(conditions[0].path, "sku");
                assert_eq!(conditions[1].path, "qty");
            }
            other => panic!("expected ElemMatch, got {other:?}"),
        }
    }

    #[test]
    fn nested_elem_match_is_rejected() {
        let innermost = doc(&[("x", Value::Int32(1))]);
        let nested = doc(&[("$elemMatch", Value::Object(innermost))]);
        let inner = doc(&[("sub", Value::Object(nested))]);
        let spec = doc(&[("$elemMatch", Value::Object(inner))]);
        let err = Query::from_document(&doc(&[("items", Value::Object(spec))])).unwrap_err();
        assert_eq!(err, ParseError::ElemMatchDuplicate);
    }

    #[test]
    fn or_branches_parse_from_main_and_separate_lists() {
        let main = doc(&[(
            "$or",
            Value::Array(vec![
                Value::Object(doc(&[("color", s("red"))])),
                Value::Object(doc(&[("color", s("blue"))])),
            ]),
        )]);
        let q = Query::from_document(&main).unwrap();
        assert_eq!(q.or.len(), 2);

        let q = parse_query(
            &Document::new(),
            &[doc(&[("color", s("red"))]), doc(&[("color", s("blue"))])],
            &[],
            None,
        )
        .unwrap();
        assert_eq!(q.or.len(), 2);
        assert!(q.main.is_always());
    }

    #[test]
    fn update_operators_parse() {
        let q = Query::from_document(&doc(&[
            ("name", s("alice")),
            ("$set", Value::Object(doc(&[("age", Value::Int32(31))]))),
            ("$inc", Value::Object(doc(&[("visits", Value::Int32(1))]))),
            ("$dropall", Value::Bool(true)),
        ]))
        .unwrap();
        assert!(q.is_update());
        assert_eq!(q.updates.len(), 3);
        assert!(matches!(q.updates[0], UpdateOp::Set(_)));
        assert!(matches!(q.updates[1], UpdateOp::Inc(_)));
        assert!(matches!(q.updates[2], UpdateOp::DropAll));
    }

    #[test]
    fn do_join_and_slice_parse() {
        let join = doc(&[("$join", s("authors"))]);
        let slice = doc(&[(
            "$slice",
            Value::Array(vec![Value::Int32(2), Value::Int32(5)]),
        )]);
        let spec = doc(&[
            ("author", Value::Object(join)),
            ("tags", Value::Object(slice)),
        ]);
        let q = Query::from_document(&doc(&[("$do", Value::Object(spec))])).unwrap();
        let UpdateOp::Do(actions) = &q.updates[0] else {
            panic!("expected Do");
        };
        assert!(matches!(&actions[0], DoAction::Join { collection, .. } if collection == "authors"));
        assert!(matches!(&actions[1], DoAction::Slice { skip: 2, limit: 5, .. }));
    }

    #[test]
    fn do_rejects_unknown_action() {
        let bad = doc(&[("x", Value::Object(doc(&[("$frob", Value::Int32(1))])))]);
        let err = Query::from_document(&doc(&[("$do", Value::Object(bad))])).unwrap_err();
        assert!(matches!(err, ParseError::InvalidDoAction(_)));
    }

    #[test]
    fn hints_parse_and_fields_mix_is_rejected() {
        let hints = doc(&[
            (
                "$orderby",
                Value::Object(doc(&[("age", Value::Int32(-1)), ("name", Value::Int32(1))])),
            ),
            ("$skip", Value::Int32(5)),
            ("$max", Value::Int32(10)),
        ]);
        let q = parse_query(&Document::new(), &[], &[], Some(&hints)).unwrap();
        assert_eq!(q.hints.order_by.len(), 2);
        assert_eq!(q.hints.order_by[0], ("age".to_string(), SortDir::Desc));
        assert_eq!(q.hints.skip, 5);
        assert_eq!(q.hints.max, Some(10));

        let mixed = doc(&[(
            "$fields",
            Value::Object(doc(&[("a", Value::Int32(1)), ("b", Value::Int32(0))])),
        )]);
        let err = parse_query(&Document::new(), &[], &[], Some(&mixed)).unwrap_err();
        assert_eq!(err, ParseError::FieldsIncludeExcludeMix);
    }

    #[test]
    fn regex_literal_compiles_with_options() {
        let q = Query::from_document(&doc(&[(
            "name",
            Value::Regex {
                pattern: "^ali".into(),
                options: "i".into(),
            },
        )]))
        .unwrap();
        match &q.main {
            Predicate::Leaf(c) => match &c.op {
                ConditionOp::Matches(re) => assert!(re.is_match("ALICE")),
                other => panic!("expected Matches, got {other:?}"),
            },
            other => panic!("expected Leaf, got {other:?}"),
        }
    }

    #[test]
    fn invalid_regex_is_reported() {
        let err = Query::from_document(&doc(&[(
            "name",
            Value::Regex {
                pattern: "[broken".into(),
                options: String::new(),
            },
        )]))
        .unwrap_err();
        assert!(matches!(err, ParseError::InvalidRegex(_)));
    }

    #[test]
    fn wire_form_parses_encoded_documents() {
        let main = doc(&[("age", Value::Object(doc(&[("$gte", Value::Int32(21))])))]);
        let branch = doc(&[("role", s("admin"))]);
        let hints = doc(&[("$max", Value::Int32(3))]);
        let main_bytes = satchel_document::encode_unchecked(&main).unwrap();
        let branch_bytes = satchel_document::encode_unchecked(&branch).unwrap();
        let hints_bytes = satchel_document::encode_unchecked(&hints).unwrap();

        let q = parse_query_bytes(
            &main_bytes,
            &[branch_bytes.as_slice()],
            &[],
            Some(&hints_bytes),
        )
        .unwrap();
        assert!(matches!(&q.main, Predicate::Leaf(c) if matches!(c.op, ConditionOp::Gte(_))));
        assert_eq!(q.or.len(), 1);
        assert_eq!(q.hints.max, Some(3));
    }

    #[test]
    fn wire_form_rejects_garbage() {
        assert!(parse_query_bytes(b"nonsense", &[], &[], None).is_err());
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let bad = doc(&[("k", Value::Object(doc(&[("$frobnicate", Value::Int32(1))])))]);
        assert!(matches!(
            Query::from_document(&bad).unwrap_err(),
            ParseError::InvalidControl(_)
        ));
    }
}
