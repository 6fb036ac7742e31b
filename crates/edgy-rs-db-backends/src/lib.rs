//! # edgy-rs-db-backends
//!
//! Database drivers behind the [`DbExecutor`](edgy_rs_db::DbExecutor) seam:
//!
//! - `SQLite` via `rusqlite` (feature `sqlite`, on by default)
//! - `PostgreSQL` via `tokio-postgres` and `deadpool-postgres` (feature `postgres`)
//!
//! Both map driver failures onto [`EdgyError`](edgy_rs_core::EdgyError):
//! constraint violations become `IntegrityError` with the violated
//! constraint kind, and connection trouble becomes `OperationalError`.

pub mod base;
#[cfg(feature = "postgres")]
pub mod postgresql;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use base::{connections_from_settings, open_database, Engine};
#[cfg(feature = "postgres")]
pub use postgresql::{PostgresBackend, PostgresSession};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteBackend, SqliteSession};
