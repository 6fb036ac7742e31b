//! Query building, compilation, and execution.
//!
//! This module contains the complete query pipeline:
//!
//! - [`lookups`] - Q objects and lookup operators for filtering
//! - [`expressions`] - F-objects, aggregates, and computed expressions
//! - [`sql`] - Relational query AST and the SQL renderer
//! - [`compiler`] - QuerySet state to one statement, with join planning
//! - [`materializer`] - Result rows to instances
//! - [`prefetch`] - Batched loading of related rows
//! - [`queryset`] - The lazy QuerySet and its terminal operations
//! - [`bulk`] - Inserts, updates and the delete collector

pub mod bulk;
pub mod compiler;
pub mod expressions;
pub mod lookups;
pub mod materializer;
pub mod prefetch;
pub mod queryset;
pub mod sql;

pub use compiler::{CompileMode, OrderSpec};
pub use expressions::{AggregateFunc, Expression};
pub use lookups::{and_, field, not_, or_, LookupOp, Q};
pub use prefetch::Prefetch;
pub use queryset::QuerySet;
pub use sql::{DatabaseBackendType, Row};
