//! Index selection.
//!
//! Conditions reachable by conjunction alone are scored against the
//! collection's indexes; the best one drives the main cursor and
//! everything is re-checked as residual predicates against each
//! fetched candidate. With no qualifying index, an `$orderby` whose
//! first key is indexed supplies an ordered full cursor; failing
//! that, the record store is scanned.

use std::sync::Arc;

use satchel_document::Value;
use satchel_query::{Condition, ConditionOp, Predicate, Query, SortDir};
use satchel_store::Direction;

use crate::collection::Collection;
use crate::index::{Index, IndexKind};
use crate::keys;

/// Indexes whose key diversity is at or below this share of the
/// record count are not worth driving a cursor.
const MIN_SELECTIVITY_PCT: f64 = 20.0;

pub(crate) enum IndexRange {
    Eq(Vec<u8>),
    Begin(Vec<u8>),
    Bounds {
        lower: Option<(Vec<u8>, bool)>,
        upper: Option<(Vec<u8>, bool)>,
    },
    /// Point lookups unioned together (`$in`, `$stror`).
    In(Vec<Vec<u8>>),
    Full,
}

pub(crate) enum PlanSource {
    FullScan,
    Index {
        index: Arc<Index>,
        range: IndexRange,
    },
    /// One indexed sub-plan per `$or` branch, deduplicated by OID.
    Union(Vec<(Arc<Index>, IndexRange)>),
}

pub(crate) struct Plan {
    pub source: PlanSource,
    pub dir: Direction,
    /// The chosen cursor already yields candidates in `$orderby`
    /// order, so the executor skips the sort buffer.
    pub order_satisfied: bool,
    pub explain: String,
}

pub(crate) fn plan(collection: &Collection, query: &Query) -> Plan {
    let rnum = collection.count().unwrap_or(0);
    let order_first = query.hints.order_by.first();

    let mut leaves: Vec<&Condition> = Vec::new();
    collect_and_leaves(&query.main, &mut leaves);
    for branch in &query.and {
        collect_and_leaves(branch, &mut leaves);
    }

    let mut best: Option<(Arc<Index>, IndexRange, f64, &Condition)> = None;
    for cond in leaves {
        let Some((index, range, score)) = score_condition(collection, cond, order_first, rnum)
        else {
            continue;
        };
        if best.as_ref().is_none_or(|(_, _, s, _)| score > *s) {
            best = Some((index, range, score, cond));
        }
    }

    if let Some((index, range, score, cond)) = best {
        let single_order = query.hints.order_by.len() == 1
            && query.hints.order_by[0].0 == index.path
            && matches!(range, IndexRange::Eq(_) | IndexRange::Begin(_) | IndexRange::Bounds { .. });
        let dir = match (single_order, query.hints.order_by.first()) {
            (true, Some((_, SortDir::Desc))) => Direction::Reverse,
            _ => Direction::Forward,
        };
        let explain = format!(
            "index scan: {} ({:?}) via {} score={score:.1}",
            index.path,
            index.kind,
            cond.op.name()
        );
        tracing::debug!(plan = %explain, "query plan");
        return Plan {
            source: PlanSource::Index { index, range },
            dir,
            order_satisfied: single_order,
            explain,
        };
    }

    // no indexed condition; try to union indexed $or branches
    if !query.or.is_empty() {
        if let Some(sources) = plan_or_union(collection, &query.or, rnum) {
            let explain = format!("index union over {} $or branches", sources.len());
            tracing::debug!(plan = %explain, "query plan");
            return Plan {
                source: PlanSource::Union(sources),
                dir: Direction::Forward,
                order_satisfied: false,
                explain,
            };
        }
    }

    // orderby-driven full-order cursor
    if let Some((path, sort_dir)) = order_first {
        let ordered_kind = [IndexKind::Num, IndexKind::Lex, IndexKind::ILex]
            .into_iter()
            .find_map(|kind| collection.index_for(path, kind));
        if let Some(index) = ordered_kind {
            let explain = format!("ordered scan: {} ({:?}) for $orderby", index.path, index.kind);
            tracing::debug!(plan = %explain, "query plan");
            return Plan {
                source: PlanSource::Index {
                    index,
                    range: IndexRange::Full,
                },
                dir: match sort_dir {
                    SortDir::Asc => Direction::Forward,
                    SortDir::Desc => Direction::Reverse,
                },
                order_satisfied: query.hints.order_by.len() == 1,
                explain,
            };
        }
    }

    tracing::debug!(plan = "full scan", "query plan");
    Plan {
        source: PlanSource::FullScan,
        dir: Direction::Forward,
        order_satisfied: false,
        explain: "full collection scan".to_string(),
    }
}

fn collect_and_leaves<'q>(pred: &'q Predicate, out: &mut Vec<&'q Condition>) {
    match pred {
        Predicate::And(children) => {
            for child in children {
                collect_and_leaves(child, out);
            }
        }
        Predicate::Leaf(cond) => out.push(cond),
        // disjunctions and per-element groups cannot drive the cursor
        Predicate::Or(_) | Predicate::ElemMatch { .. } => {}
    }
}

fn plan_or_union(
    collection: &Collection,
    branches: &[Predicate],
    rnum: u64,
) -> Option<Vec<(Arc<Index>, IndexRange)>> {
    let mut sources = Vec::with_capacity(branches.len());
    for branch in branches {
        let mut leaves = Vec::new();
        collect_and_leaves(branch, &mut leaves);
        let mut best: Option<(Arc<Index>, IndexRange, f64)> = None;
        for cond in leaves {
            if let Some((index, range, score)) = score_condition(collection, cond, None, rnum) {
                if best.as_ref().is_none_or(|(_, _, s)| score > *s) {
                    best = Some((index, range, score));
                }
            }
        }
        let (index, range, _) = best?;
        sources.push((index, range));
    }
    Some(sources)
}

/// Score one condition against the available indexes: operator class
/// (equality > between > prefix > range), selectivity, and a bonus
/// when the field also satisfies the first `$orderby` key.
fn score_condition(
    collection: &Collection,
    cond: &Condition,
    order_first: Option<&(String, SortDir)>,
    rnum: u64,
) -> Option<(Arc<Index>, IndexRange, f64)> {
    if cond.negate {
        return None;
    }
    let (index, range, base) = match &cond.op {
        ConditionOp::Eq(value) => {
            let (index, key) = point_key(collection, cond, value)?;
            (index, IndexRange::Eq(key), 100.0)
        }
        ConditionOp::Between(a, b) => {
            let index = collection.index_for(&cond.path, IndexKind::Num)?;
            let ka = keys::number_key(keys::coerce_number(a)?);
            let kb = keys::number_key(keys::coerce_number(b)?);
            let (lo, hi) = if ka <= kb { (ka, kb) } else { (kb, ka) };
            (
                index,
                IndexRange::Bounds {
                    lower: Some((lo, true)),
                    upper: Some((hi, true)),
                },
                80.0,
            )
        }
        ConditionOp::Begin(prefix) => {
            let (index, key) = string_key(collection, cond, prefix)?;
            let stats = index.stats();
            let avg = if stats.keys == 0 {
                1.0
            } else {
                stats.key_bytes as f64 / stats.keys as f64
            };
            let scale = (key.len() as f64 / avg).min(1.0);
            (index, IndexRange::Begin(key), 60.0 * scale)
        }
        ConditionOp::Gt(v) | ConditionOp::Gte(v) => {
            let inclusive = matches!(cond.op, ConditionOp::Gte(_));
            let (index, key) = point_key(collection, cond, v)?;
            (
                index,
                IndexRange::Bounds {
                    lower: Some((key, inclusive)),
                    upper: None,
                },
                40.0,
            )
        }
        ConditionOp::Lt(v) | ConditionOp::Lte(v) => {
            let inclusive = matches!(cond.op, ConditionOp::Lte(_));
            let (index, key) = point_key(collection, cond, v)?;
            (
                index,
                IndexRange::Bounds {
                    lower: None,
                    upper: Some((key, inclusive)),
                },
                40.0,
            )
        }
        ConditionOp::In(members) => {
            // $in is scored only against a token index
            let index = collection.index_for(&cond.path, IndexKind::Token)?;
            let keys_in: Vec<Vec<u8>> = members.iter().filter_map(token_form).collect();
            if keys_in.is_empty() {
                return None;
            }
            (index, IndexRange::In(keys_in), 70.0)
        }
        ConditionOp::StrOr(tokens) => {
            let index = collection.index_for(&cond.path, IndexKind::Token)?;
            (
                index,
                IndexRange::In(tokens.iter().map(|t| t.as_bytes().to_vec()).collect()),
                60.0,
            )
        }
        ConditionOp::StrAnd(tokens) => {
            // drive with one token, residual evaluation checks the rest
            let index = collection.index_for(&cond.path, IndexKind::Token)?;
            let first = tokens.first()?;
            (index, IndexRange::Eq(first.as_bytes().to_vec()), 60.0)
        }
        ConditionOp::NotIn(_) | ConditionOp::Exists(_) | ConditionOp::Matches(_) => return None,
    };

    let stats = index.stats();
    let selectivity = if rnum == 0 {
        100.0
    } else {
        (stats.keys as f64 / rnum as f64) * 100.0
    };
    if selectivity <= MIN_SELECTIVITY_PCT {
        tracing::debug!(
            path = %cond.path,
            selectivity,
            "index rejected for low selectivity"
        );
        return None;
    }
    let mut score = base * selectivity / 100.0;
    if let Some((order_path, _)) = order_first {
        if *order_path == cond.path {
            score += 10.0;
        }
    }
    Some((index, range, score))
}

/// Point key for equality and single-ended ranges: number index for
/// numeric-like operands, string index otherwise.
fn point_key(
    collection: &Collection,
    cond: &Condition,
    value: &Value,
) -> Option<(Arc<Index>, Vec<u8>)> {
    match value {
        Value::String(s) => string_key(collection, cond, s),
        other => {
            let n = other.as_f64()?;
            let index = collection.index_for(&cond.path, IndexKind::Num)?;
            Some((index, keys::number_key(n)))
        }
    }
}

fn string_key(
    collection: &Collection,
    cond: &Condition,
    s: &str,
) -> Option<(Arc<Index>, Vec<u8>)> {
    if cond.icase {
        let index = collection.index_for(&cond.path, IndexKind::ILex)?;
        Some((index, keys::fold_case(s).into_bytes()))
    } else {
        let index = collection.index_for(&cond.path, IndexKind::Lex)?;
        Some((index, s.as_bytes().to_vec()))
    }
}

fn token_form(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.as_bytes().to_vec()),
        Value::Int32(_) | Value::Int64(_) | Value::Double(_) => {
            let n = value.as_f64()?;
            Some(if n == n.trunc() && n.abs() < 1e15 {
                format!("{}", n as i64).into_bytes()
            } else {
                format!("{n}").into_bytes()
            })
        }
        _ => None,
    }
}
