//! Settings for edgy-rs.
//!
//! [`Settings`] holds the database registry configuration, logging options and
//! query-engine tuning knobs. [`LazySettings`] is a process-wide slot for
//! applications that want one ambient configuration; everything in the ORM
//! also accepts settings explicitly.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{EdgyError, EdgyResult};

/// The alias used when no database is named explicitly.
pub const DEFAULT_DB_ALIAS: &str = "default";

/// Connection settings for one database alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// The engine: `sqlite` or `postgresql`.
    pub engine: String,
    /// The database name, or the file path (`:memory:` allowed) for SQLite.
    pub name: String,
    /// The database user.
    pub user: String,
    /// The database password.
    pub password: String,
    /// The database host.
    pub host: String,
    /// The database port (0 means the driver default).
    pub port: u16,
    /// Schema applied to every query routed to this alias, if any.
    pub schema: Option<String>,
    /// Maximum pooled connections (PostgreSQL only).
    pub pool_size: usize,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            engine: "sqlite".to_string(),
            name: ":memory:".to_string(),
            user: String::new(),
            password: String::new(),
            host: String::new(),
            port: 0,
            schema: None,
            pool_size: 16,
        }
    }
}

/// The complete set of edgy-rs settings.
///
/// # Examples
///
/// ```
/// use edgy_rs_core::settings::Settings;
///
/// let settings = Settings::default();
/// assert_eq!(settings.default_database, "default");
/// assert_eq!(settings.prefetch_chunk_size, 100);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Whether debug mode is enabled (pretty logs instead of JSON).
    pub debug: bool,
    /// The log filter directive (e.g. "info", "edgy_rs_db=debug").
    pub log_level: String,

    // ── Database ─────────────────────────────────────────────────────

    /// The alias used by querysets that were not routed with `using`.
    pub default_database: String,
    /// Database configurations, keyed by alias.
    pub databases: HashMap<String, DatabaseSettings>,

    // ── Query engine ─────────────────────────────────────────────────

    /// Rows per prefetch batch when streaming a queryset with prefetches.
    pub prefetch_chunk_size: usize,
    /// Rows buffered between a backend and a consuming stream.
    pub stream_buffer: usize,

    /// Custom settings that don't fit into the above categories.
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut databases = HashMap::new();
        databases.insert(DEFAULT_DB_ALIAS.to_string(), DatabaseSettings::default());

        Self {
            debug: true,
            log_level: "info".to_string(),
            default_database: DEFAULT_DB_ALIAS.to_string(),
            databases,
            prefetch_chunk_size: 100,
            stream_buffer: 64,
            extra: HashMap::new(),
        }
    }
}

impl Settings {
    /// Returns the settings of the default database alias.
    pub fn default_database_settings(&self) -> Option<&DatabaseSettings> {
        self.databases.get(&self.default_database)
    }
}

/// A lazily-initialized, globally-accessible settings container.
pub struct LazySettings {
    inner: OnceLock<Settings>,
}

impl Default for LazySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl LazySettings {
    /// Creates a new, unconfigured `LazySettings`.
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Configures the global settings. May be called once.
    pub fn configure(&self, settings: Settings) -> EdgyResult<()> {
        self.inner.set(settings).map_err(|_| {
            EdgyError::ConfigurationError("Settings have already been configured".to_string())
        })
    }

    /// Returns the configured settings, if any.
    pub fn get(&self) -> Option<&Settings> {
        self.inner.get()
    }

    /// Returns the configured settings or the defaults.
    pub fn get_or_default(&self) -> &Settings {
        self.inner.get_or_init(Settings::default)
    }

    /// Returns `true` if settings have been configured.
    pub fn is_configured(&self) -> bool {
        self.inner.get().is_some()
    }
}

/// The global settings instance.
pub static SETTINGS: LazySettings = LazySettings::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = Settings::default();
        assert!(s.debug);
        assert_eq!(s.log_level, "info");
        assert_eq!(s.default_database, DEFAULT_DB_ALIAS);
        assert_eq!(s.stream_buffer, 64);
    }

    #[test]
    fn test_default_database() {
        let s = Settings::default();
        let db = s.default_database_settings().unwrap();
        assert_eq!(db.engine, "sqlite");
        assert_eq!(db.name, ":memory:");
        assert!(db.schema.is_none());
    }

    #[test]
    fn test_lazy_settings_configure_once() {
        let lazy = LazySettings::new();
        assert!(!lazy.is_configured());
        assert!(lazy.get().is_none());
        lazy.configure(Settings::default()).unwrap();
        assert!(lazy.is_configured());
        assert!(lazy.configure(Settings::default()).is_err());
    }

    #[test]
    fn test_settings_serde_roundtrip_keeps_databases() {
        let mut s = Settings::default();
        s.databases.insert(
            "replica".to_string(),
            DatabaseSettings {
                engine: "postgresql".to_string(),
                name: "music".to_string(),
                schema: Some("tenant_a".to_string()),
                ..DatabaseSettings::default()
            },
        );
        let json = serde_json::to_string(&s).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.databases.get("replica"), s.databases.get("replica"));
    }
}
