//! Opening backends from settings.
//!
//! [`Engine`] names a backend; [`open_database`] builds the executor for
//! one alias and [`connections_from_settings`] builds the whole registry.
//! Engines whose cargo feature is disabled are reported as configuration
//! errors rather than missing symbols.

use std::str::FromStr;
use std::sync::Arc;

use edgy_rs_core::{DatabaseSettings, EdgyError, EdgyResult, Settings};
use edgy_rs_db::{Connections, DbExecutor};

/// A supported database engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// SQLite via `rusqlite` (feature `sqlite`).
    Sqlite,
    /// PostgreSQL via `tokio-postgres` (feature `postgres`).
    Postgres,
}

impl FromStr for Engine {
    type Err = EdgyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(EdgyError::ConfigurationError(format!(
                "Unknown database engine '{other}'"
            ))),
        }
    }
}

/// Opens the executor for one database alias.
///
/// PostgreSQL pools connect lazily, so this never touches the network.
///
/// # Errors
///
/// Returns [`EdgyError::ConfigurationError`] for unknown or disabled
/// engines, and the driver's error if a SQLite file cannot be opened.
pub fn open_database(settings: &DatabaseSettings) -> EdgyResult<Arc<dyn DbExecutor>> {
    match settings.engine.parse::<Engine>()? {
        #[cfg(feature = "sqlite")]
        Engine::Sqlite => Ok(Arc::new(crate::sqlite::SqliteBackend::open(&settings.name)?)),
        #[cfg(feature = "postgres")]
        Engine::Postgres => Ok(Arc::new(crate::postgresql::PostgresBackend::from_settings(
            settings,
        )?)),
        #[allow(unreachable_patterns)]
        engine => Err(EdgyError::ConfigurationError(format!(
            "Database engine {engine:?} is not enabled in this build"
        ))),
    }
}

/// Builds the connection registry described by `settings`.
///
/// # Errors
///
/// Fails on the first alias that cannot be opened, or if the default alias
/// is not configured.
pub fn connections_from_settings(settings: &Settings) -> EdgyResult<Connections> {
    if !settings.databases.contains_key(&settings.default_database) {
        return Err(EdgyError::ConfigurationError(format!(
            "The default database '{}' is not configured",
            settings.default_database
        )));
    }
    let mut connections = Connections::new().with_default_alias(settings.default_database.clone());
    let mut aliases: Vec<&String> = settings.databases.keys().collect();
    aliases.sort();
    for alias in aliases {
        let db = &settings.databases[alias];
        connections = connections.with_database(alias.clone(), open_database(db)?);
        if let Some(schema) = &db.schema {
            connections = connections.with_schema(alias.clone(), schema.clone());
        }
        tracing::info!(alias = %alias, engine = %db.engine, "registered database");
    }
    Ok(connections)
}
