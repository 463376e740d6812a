//! Query language: AST, parser and update operators.
//!
//! Queries arrive as encoded documents (a main spec, optional `$or`
//! and `$and` branch lists and a hints document) and parse into a
//! [`Query`] the planner and executor consume.

mod error;
mod expr;
mod hints;
mod parse;
mod update;

pub use error::ParseError;
pub use expr::{Condition, ConditionOp, Predicate};
pub use hints::{FieldsSpec, Hints, SortDir};
pub use parse::{parse_query, parse_query_bytes};
pub use update::{DoAction, UpdateOp};

use satchel_document::Document;

/// A parsed query: the main predicate, `$or`/`$and` branch predicates,
/// the update pipeline and hints. Callers own it and may execute it
/// any number of times.
#[derive(Debug, Clone)]
pub struct Query {
    pub main: Predicate,
    pub or: Vec<Predicate>,
    pub and: Vec<Predicate>,
    pub updates: Vec<UpdateOp>,
    pub hints: Hints,
}

impl Query {
    /// Parse with no separate branch or hints documents.
    pub fn from_document(main: &Document) -> Result<Query, ParseError> {
        parse_query(main, &[], &[], None)
    }

    /// Whether execution mutates matched documents.
    pub fn is_update(&self) -> bool {
        !self.updates.is_empty()
    }
}
