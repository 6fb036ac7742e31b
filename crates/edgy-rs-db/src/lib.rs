//! # edgy-rs-db
//!
//! Query engine of edgy-rs. Models are described by a static
//! [`ModelMeta`](model::ModelMeta); a lazy [`QuerySet`](query::QuerySet)
//! accumulates filters, ordering, slicing, and eager-loading directives
//! and compiles them into one SELECT with deduplicated joins. Result rows
//! are materialized into [`Instance`](instance::Instance) graphs, and
//! `prefetch_related` loads to-many relationships with one batched query
//! per path level.
//!
//! ## Architecture
//!
//! Nothing touches the database until a terminal method (`all`, `get`,
//! `count`, `stream`, ...) runs. The statement compiler plans joins,
//! lowers [`Q`](query::Q) predicates into a [`WhereNode`](query::sql::WhereNode)
//! tree, and the [`SqlCompiler`](query::sql::SqlCompiler) renders it with
//! backend-specific placeholders. The executor is resolved from the
//! QuerySet's [`DbContext`](connections::DbContext), which also carries
//! the active transaction and schema.
//!
//! ## Module Overview
//!
//! - [`model`] - The [`Model`](model::Model) trait, [`ModelMeta`](model::ModelMeta), relations
//! - [`fields`] - Field definitions ([`FieldDef`](fields::FieldDef)) and types
//! - [`value`] - The backend-agnostic [`Value`](value::Value) enum
//! - [`instance`] - Materialized rows and their relationship slots
//! - [`query`] - Q algebra, compiler, materializer, prefetch, QuerySet
//! - [`pagination`] - Numbered and cursor paginators
//! - [`executor`] - The [`DbExecutor`](executor::DbExecutor) backend seam
//! - [`connections`] - Named databases and the per-query context
//! - [`transactions`] - Transactions and savepoints

// These clippy lints are intentionally allowed for the query crate:
// - struct_excessive_bools: FieldDef carries one flag per column property
// - too_many_lines: the compiler and delete collector match over many cases
// - result_large_err: EdgyError is the crate-wide error type
// - format_push_string: format! with push_str reads better for SQL generation
// - doc_markdown: backtick requirements for SQL keywords are too strict
// - needless_pass_by_value: builder arguments are taken by value on purpose
// - return_self_not_must_use: builder methods are self-documenting
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::result_large_err)]
#![allow(clippy::format_push_string)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::use_self)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::match_same_arms)]
// significant_drop_tightening: false positives with async Mutex guards
#![allow(clippy::significant_drop_tightening)]

pub mod connections;
pub mod executor;
pub mod fields;
pub mod instance;
pub mod model;
pub mod pagination;
pub mod query;
pub mod transactions;
pub mod value;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export the most commonly used types at the crate root.
pub use connections::{Connections, DbContext};
pub use executor::DbExecutor;
pub use fields::{FieldDef, FieldType, OnDelete, ThroughTable};
pub use instance::{FromInstance, Instance, Relation};
pub use model::{Model, ModelMeta, RelationInfo, RelationKind};
pub use pagination::{Cursor, CursorPage, CursorPaginator, NumberedPaginator, Page};
pub use query::{and_, not_, or_, LookupOp, Prefetch, QuerySet, Q};
pub use transactions::atomic;
pub use value::{Value, ValueKey};

/// Builds a list of `(field, value)` pairs for `create`, `update` and
/// `get_or_create`.
///
/// ```
/// use edgy_rs_db::{fields, Value};
///
/// let values = fields! { "name" => "Malibu", "year" => 1998_i64 };
/// assert_eq!(values[0], ("name".to_string(), Value::from("Malibu")));
/// assert_eq!(values[1].1, Value::Int(1998));
/// ```
#[macro_export]
macro_rules! fields {
    ($($name:expr => $value:expr),* $(,)?) => {
        ::std::vec![$((::std::string::String::from($name), $crate::value::Value::from($value))),*]
    };
}
