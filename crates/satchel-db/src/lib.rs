//! The database container: collections over the record store, index
//! maintenance, the query planner and executor, export/import.

mod collection;
mod database;
mod error;
mod executor;
mod export;
mod index;
mod keys;
mod matcher;
mod options;
mod planner;
mod update_exec;
mod visitor;

pub use collection::Collection;
pub use database::Database;
pub use error::DbError;
pub use executor::{ExecFlags, QueryResult};
pub use index::{IndexKind, IndexOp};
pub use options::{CollectionOptions, DatabaseOptions, OpenMode, QueryLimits};
pub use visitor::QueryCtl;

pub use satchel_document::{Document, Oid, Value};
pub use satchel_query::Query;
