//! Field definitions for model descriptors.
//!
//! [`FieldDef`] and [`FieldType`] describe the columns and relationships of a
//! model; [`OnDelete`] and [`ThroughTable`] parameterize relationship fields.

pub mod types;

pub use types::{FieldDef, FieldType, ModelRef, OnDelete, ThroughTable};
