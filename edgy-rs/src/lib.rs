//! # edgy-rs
//!
//! An async ORM with lazy QuerySets, relationship-aware row materialization
//! and batched prefetching.
//!
//! This is the meta-crate that re-exports all sub-crates for convenient access.
//! You can depend on `edgy-rs` to get the whole stack, or depend on
//! individual crates for finer-grained control.
//!
//! ```no_run
//! use edgy_rs::prelude::*;
//!
//! # async fn run() -> EdgyResult<()> {
//! edgy_rs::init(Settings::default())?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

/// Error types, settings, and logging.
pub use edgy_rs_core as core;

/// QuerySets, models, instances, pagination and transactions.
pub use edgy_rs_db as db;

/// Database backends: `PostgreSQL`, `SQLite`.
pub use edgy_rs_db_backends as db_backends;

pub use edgy_rs_db::fields;

// Third-party crates whose types appear in the public API: `stream()` yields
// a `futures` stream, `values()` returns `IndexMap`s, `Value` carries
// `chrono` and `serde_json` values, and `DbExecutor` is an `async_trait`.
pub use async_trait::async_trait;
pub use chrono;
pub use futures;
pub use indexmap;
pub use serde_json;

/// The names most applications need.
pub mod prelude {
    pub use edgy_rs_core::{EdgyError, EdgyResult, Settings};
    pub use edgy_rs_db::{
        and_, atomic, not_, or_, Connections, Cursor, CursorPaginator, DbContext, DbExecutor,
        FromInstance, Instance, Model, ModelMeta, NumberedPaginator, Prefetch, Q, QuerySet, Value,
    };
}

/// Configures the process from `settings`: installs them as the global
/// settings, sets up logging, and registers every configured database as
/// the global connection registry.
///
/// # Errors
///
/// Fails if settings or a registry were already installed, or if a
/// database cannot be opened.
pub fn init(settings: edgy_rs_core::Settings) -> edgy_rs_core::EdgyResult<()> {
    edgy_rs_core::logging::setup_logging(&settings);
    let connections = edgy_rs_db_backends::connections_from_settings(&settings)?;
    tracing::info!(databases = connections.len(), "edgy-rs initialised");
    edgy_rs_core::SETTINGS.configure(settings)?;
    Arc::new(connections).install_global()
}
