//! Computed expressions for annotations, aggregates and `group_by` queries.
//!
//! - [`core`] - F-objects, literal values, functions, aggregates, arithmetic

pub mod core;

pub use self::core::{AggregateFunc, Expression};
