//! Query execution over a planned cursor.
//!
//! Candidates stream from the chosen index cursor or a full scan,
//! every predicate is re-checked against the fetched document, update
//! pipelines run against a clone and re-store atomically, and results
//! flow to a caller-supplied visitor while the collection lock is
//! held. Sorting buffers matches and delivers after ordering; `$skip`
//! always applies after the sort.

use std::collections::HashSet;
use std::sync::Arc;

use satchel_document::{Document, Oid, StripSpec, Value, compare_at_path, strip};
use satchel_query::{Query, SortDir, UpdateOp};
use satchel_store::Direction;

use crate::collection::Collection;
use crate::error::DbError;
use crate::index::Index;
use crate::matcher::{self, Bindings};
use crate::options::QueryLimits;
use crate::planner::{self, IndexRange, Plan, PlanSource};
use crate::update_exec;
use crate::visitor::QueryCtl;

/// Execution switches mirroring the classic count-only / find-one
/// query flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecFlags {
    pub count_only: bool,
    pub find_one: bool,
}

/// Outcome of one execution.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Matches delivered (after `$skip`/`$max`).
    pub count: u64,
    /// Documents an update pipeline actually modified or removed.
    pub updated: u64,
    /// The plan the planner chose, for diagnostics.
    pub explain: String,
}

pub(crate) type Resolver<'a> = dyn Fn(&str) -> Option<Arc<Collection>> + 'a;

pub(crate) fn execute(
    collection: &Collection,
    query: &Query,
    flags: ExecFlags,
    limits: &QueryLimits,
    ctl: Option<&QueryCtl>,
    resolve: &Resolver<'_>,
    visitor: &mut dyn FnMut(&Document) -> bool,
) -> Result<QueryResult, DbError> {
    let plan = planner::plan(collection, query);
    if query.is_update() {
        let _guard = collection.lock.write();
        run(collection, query, flags, limits, ctl, resolve, visitor, plan)
    } else {
        let _guard = collection.lock.read();
        run(collection, query, flags, limits, ctl, resolve, visitor, plan)
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    collection: &Collection,
    query: &Query,
    flags: ExecFlags,
    limits: &QueryLimits,
    ctl: Option<&QueryCtl>,
    resolve: &Resolver<'_>,
    visitor: &mut dyn FnMut(&Document) -> bool,
    plan: Plan,
) -> Result<QueryResult, DbError> {
    let is_update = query.is_update();
    let need_sort = !query.hints.order_by.is_empty() && !plan.order_satisfied;
    let mut exec = Exec {
        collection,
        query,
        flags,
        limits,
        ctl,
        resolve,
        visitor,
        is_update,
        need_sort,
        skip_left: query.hints.skip,
        emitted: 0,
        count: 0,
        updated: 0,
        buffer: Vec::with_capacity(query.hints.min.unwrap_or(0)),
        last_or: None,
    };

    if is_update {
        collection.begin_deferred();
    }
    let drive_result = exec.drive(&plan);
    let sort_result = match &drive_result {
        Ok(()) if need_sort => exec.finish_sorted(),
        _ => Ok(()),
    };
    if is_update {
        collection.end_deferred()?;
    }
    drive_result?;
    sort_result?;

    if is_update && exec.count == 0 {
        exec.run_upsert()?;
    }

    Ok(QueryResult {
        count: exec.count,
        updated: exec.updated,
        explain: plan.explain,
    })
}

struct Exec<'a> {
    collection: &'a Collection,
    query: &'a Query,
    flags: ExecFlags,
    limits: &'a QueryLimits,
    ctl: Option<&'a QueryCtl>,
    resolve: &'a Resolver<'a>,
    visitor: &'a mut dyn FnMut(&Document) -> bool,
    is_update: bool,
    need_sort: bool,
    skip_left: usize,
    emitted: usize,
    count: u64,
    updated: u64,
    buffer: Vec<(Oid, Document, Bindings)>,
    /// Hot path: the `$or` branch that matched the previous candidate
    /// is tried first for the next one.
    last_or: Option<usize>,
}

impl Exec<'_> {
    fn drive(&mut self, plan: &Plan) -> Result<(), DbError> {
        let collection = self.collection;
        match &plan.source {
            PlanSource::FullScan => {
                if self.is_update {
                    // mutations relocate records; snapshot the oids
                    // before touching anything
                    let mut oids = Vec::new();
                    collection.scan_locked(|oid, _| {
                        oids.push(oid);
                        Ok(true)
                    })?;
                    self.process_oids(oids.into_iter())
                } else {
                    collection.scan_locked(|oid, doc| {
                        let mut keep = true;
                        self.process(oid, doc, &mut keep)?;
                        Ok(keep)
                    })
                }
            }
            PlanSource::Index { index, range } => {
                let oids = collect_index_oids(index, range, plan.dir)?;
                self.process_oids(oids.into_iter())
            }
            PlanSource::Union(sources) => {
                let mut seen = HashSet::new();
                let mut oids = Vec::new();
                for (index, range) in sources {
                    for oid in collect_index_oids(index, range, plan.dir)? {
                        if seen.insert(oid) {
                            oids.push(oid);
                        }
                    }
                }
                self.process_oids(oids.into_iter())
            }
        }
    }

    fn process_oids(&mut self, oids: impl Iterator<Item = Oid>) -> Result<(), DbError> {
        for oid in oids {
            // an index entry may outlive its record after a crash
            // between delta apply and log truncation; skip the hole
            let Some(doc) = self.collection.load_raw(oid)? else {
                continue;
            };
            let mut keep = true;
            self.process(oid, doc, &mut keep)?;
            if !keep {
                break;
            }
        }
        Ok(())
    }

    fn process(&mut self, oid: Oid, doc: Document, keep: &mut bool) -> Result<(), DbError> {
        if let Some(ctl) = self.ctl {
            if !ctl.checkpoint() {
                *keep = false;
                return Ok(());
            }
        }
        let mut bindings = Bindings::default();
        if !self.matches_all(&doc, &mut bindings) {
            return Ok(());
        }
        if self.need_sort {
            if let Some(limit) = self.limits.max_sort_buffer {
                if self.buffer.len() >= limit {
                    return Err(DbError::SortFailed);
                }
            }
            self.buffer.push((oid, doc, bindings));
            return Ok(());
        }
        *keep = self.deliver(oid, doc, &bindings)?;
        Ok(())
    }

    fn matches_all(&mut self, doc: &Document, bindings: &mut Bindings) -> bool {
        if !matcher::matches(&self.query.main, doc, bindings) {
            return false;
        }
        for branch in &self.query.and {
            if !matcher::matches(branch, doc, bindings) {
                return false;
            }
        }
        if self.query.or.is_empty() {
            return true;
        }
        if let Some(i) = self.last_or {
            if matcher::matches(&self.query.or[i], doc, bindings) {
                return true;
            }
        }
        for (i, branch) in self.query.or.iter().enumerate() {
            if Some(i) == self.last_or {
                continue;
            }
            if matcher::matches(branch, doc, bindings) {
                self.last_or = Some(i);
                return true;
            }
        }
        false
    }

    /// Skip/max bookkeeping, mutation, projection and the visitor
    /// call for one accepted candidate. Returns whether the scan
    /// should continue.
    fn deliver(&mut self, oid: Oid, doc: Document, bindings: &Bindings) -> Result<bool, DbError> {
        if self.skip_left > 0 {
            self.skip_left -= 1;
            return Ok(true);
        }
        if let Some(max) = self.query.hints.max {
            if self.emitted >= max {
                return Ok(false);
            }
        }
        self.count += 1;
        self.emitted += 1;

        let mut keep_going = true;
        if self.is_update {
            let (stored, changed) = self.apply_update(oid, &doc, bindings)?;
            if changed {
                self.updated += 1;
            }
            if !self.flags.count_only {
                if let Some(updated_doc) = &stored {
                    let out = self.project(updated_doc, bindings)?;
                    keep_going = (self.visitor)(&out);
                }
            }
        } else if !self.flags.count_only {
            let out = self.project(&doc, bindings)?;
            keep_going = (self.visitor)(&out);
        }

        if self.flags.find_one {
            return Ok(false);
        }
        if let Some(max) = self.query.hints.max {
            if self.emitted >= max {
                return Ok(false);
            }
        }
        Ok(keep_going)
    }

    /// The pipeline runs on a clone; the original record survives any
    /// failure untouched and the updated count stays put.
    fn apply_update(
        &self,
        oid: Oid,
        doc: &Document,
        bindings: &Bindings,
    ) -> Result<(Option<Document>, bool), DbError> {
        let mut updated_doc = doc.clone();
        let outcome = update_exec::apply_updates(&mut updated_doc, &self.query.updates, bindings)?;
        if outcome.drop {
            self.collection.rm_locked(oid)?;
            return Ok((None, true));
        }
        if outcome.modified {
            self.collection.restore_locked(oid, doc, &updated_doc)?;
        }
        Ok((Some(updated_doc), outcome.modified))
    }

    fn finish_sorted(&mut self) -> Result<(), DbError> {
        let order = self.query.hints.order_by.clone();
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.sort_by(|(_, a, _), (_, b, _)| {
            for (path, dir) in &order {
                let ord = compare_at_path(a, b, path);
                let ord = match dir {
                    SortDir::Asc => ord,
                    SortDir::Desc => ord.reverse(),
                };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        for (oid, doc, bindings) in buffer {
            if !self.deliver(oid, doc, &bindings)? {
                break;
            }
        }
        Ok(())
    }

    /// `$upsert` with no matches inserts its operand, transactionally
    /// within the single document: a failed index update rolls the
    /// record back and the error propagates.
    fn run_upsert(&mut self) -> Result<(), DbError> {
        let Some(UpdateOp::Upsert(template)) = self
            .query
            .updates
            .iter()
            .find(|op| matches!(op, UpdateOp::Upsert(_)))
        else {
            return Ok(());
        };
        match self.collection.save_locked(template, false) {
            Ok(_oid) => {
                self.updated += 1;
                Ok(())
            }
            Err(e) => {
                if let Some(Value::ObjectId(oid)) = template.get(satchel_document::ID_FIELD) {
                    let _ = self.collection.rm_locked(*oid);
                }
                Err(e)
            }
        }
    }

    // ── Projection ──────────────────────────────────────────────

    fn project(&self, doc: &Document, bindings: &Bindings) -> Result<Document, DbError> {
        let mut out = doc.clone();
        for op in &self.query.updates {
            if let UpdateOp::Do(actions) = op {
                for action in actions {
                    apply_do_action(&mut out, action, self.collection, self.resolve)?;
                }
            }
        }
        if let Some(fields) = &self.query.hints.fields {
            let mut paths: Vec<String> = fields
                .paths
                .iter()
                .map(|p| bind_positional(p, bindings))
                .collect();
            if fields.include && !paths.iter().any(|p| p == satchel_document::ID_FIELD) {
                paths.push(satchel_document::ID_FIELD.to_string());
            }
            let (stripped, _) = strip(
                &out,
                &StripSpec {
                    include: fields.include,
                    paths,
                    rename: Vec::new(),
                    collect: false,
                },
            );
            out = stripped;
        }
        Ok(out)
    }
}

/// Replace `$` path segments with the positional index bound during
/// `$elemMatch` evaluation; unresolved slots keep the literal `$`
/// (which then selects nothing).
fn bind_positional(path: &str, bindings: &Bindings) -> String {
    if !path.contains('$') {
        return path.to_string();
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut out: Vec<String> = Vec::with_capacity(segments.len());
    for (i, seg) in segments.iter().enumerate() {
        if *seg == "$" {
            let array_path = segments[..i].join(".");
            match bindings.positions.get(&array_path) {
                Some(idx) => out.push(idx.to_string()),
                None => out.push("$".to_string()),
            }
        } else {
            out.push((*seg).to_string());
        }
    }
    out.join(".")
}

fn apply_do_action(
    doc: &mut Document,
    action: &satchel_query::DoAction,
    current: &Collection,
    resolve: &Resolver<'_>,
) -> Result<(), DbError> {
    use satchel_document::{NestedArrays, get_path, set_path};
    use satchel_query::DoAction;

    match action {
        DoAction::Join { path, collection } => {
            let Some(value) = get_path(doc, path, NestedArrays::Fail).cloned() else {
                return Ok(());
            };
            let load = |oid: Oid| -> Result<Option<Document>, DbError> {
                if collection == current.name() {
                    current.load_raw(oid)
                } else {
                    match resolve(collection) {
                        Some(other) => other.load(oid),
                        None => Ok(None),
                    }
                }
            };
            let joined = match value {
                Value::ObjectId(oid) => load(oid)?.map(Value::Object),
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Value::ObjectId(oid) => match load(oid)? {
                                Some(d) => out.push(Value::Object(d)),
                                None => out.push(Value::ObjectId(oid)),
                            },
                            other => out.push(other),
                        }
                    }
                    Some(Value::Array(out))
                }
                _ => None,
            };
            if let Some(joined) = joined {
                set_path(doc, path, joined)?;
            }
        }
        DoAction::Slice { path, skip, limit } => {
            let Some(Value::Array(items)) = get_path(doc, path, NestedArrays::Fail).cloned()
            else {
                return Ok(());
            };
            let len = items.len() as i64;
            let start = if *skip < 0 { (len + skip).max(0) } else { (*skip).min(len) };
            let take = if *limit < 0 { len } else { *limit };
            let sliced: Vec<Value> = items
                .into_iter()
                .skip(start as usize)
                .take(take.max(0) as usize)
                .collect();
            set_path(doc, path, Value::Array(sliced))?;
        }
    }
    Ok(())
}

fn collect_index_oids(
    index: &Arc<Index>,
    range: &IndexRange,
    dir: Direction,
) -> Result<Vec<Oid>, DbError> {
    let tree = &index.tree;
    let mut seen: HashSet<[u8; 12]> = HashSet::new();
    let mut out: Vec<Oid> = Vec::new();
    let mut push = |oids: Vec<[u8; 12]>, out: &mut Vec<Oid>, seen: &mut HashSet<[u8; 12]>| {
        for oid in oids {
            if seen.insert(oid) {
                out.push(Oid::from_bytes(oid));
            }
        }
    };

    match range {
        IndexRange::Eq(key) => push(tree.get(key)?, &mut out, &mut seen),
        IndexRange::In(keys) => {
            for key in keys {
                push(tree.get(key)?, &mut out, &mut seen);
            }
        }
        IndexRange::Begin(prefix) => {
            let mut cursor = tree.cursor_at(prefix, Direction::Forward)?;
            while let Some((key, oids)) = cursor.next()? {
                if !key.starts_with(prefix.as_slice()) {
                    break;
                }
                push(oids, &mut out, &mut seen);
            }
            if dir == Direction::Reverse {
                out.reverse();
            }
        }
        IndexRange::Full => {
            let mut cursor = tree.cursor(dir)?;
            while let Some((_, oids)) = cursor.next()? {
                push(oids, &mut out, &mut seen);
            }
        }
        IndexRange::Bounds { lower, upper } => match dir {
            Direction::Forward => {
                let mut cursor = match lower {
                    Some((key, _)) => tree.cursor_at(key, Direction::Forward)?,
                    None => tree.cursor(Direction::Forward)?,
                };
                while let Some((key, oids)) = cursor.next()? {
                    if let Some((lk, inclusive)) = lower {
                        if !inclusive && key == *lk {
                            continue;
                        }
                    }
                    if let Some((uk, inclusive)) = upper {
                        if key > *uk || (!inclusive && key == *uk) {
                            break;
                        }
                    }
                    push(oids, &mut out, &mut seen);
                }
            }
            Direction::Reverse => {
                let mut cursor = match upper {
                    Some((key, _)) => tree.cursor_at(key, Direction::Reverse)?,
                    None => tree.cursor(Direction::Reverse)?,
                };
                while let Some((key, oids)) = cursor.next()? {
                    if let Some((uk, inclusive)) = upper {
                        if !inclusive && key == *uk {
                            continue;
                        }
                    }
                    if let Some((lk, inclusive)) = lower {
                        if key < *lk || (!inclusive && key == *lk) {
                            break;
                        }
                    }
                    push(oids, &mut out, &mut seen);
                }
            }
        },
    }
    Ok(out)
}
