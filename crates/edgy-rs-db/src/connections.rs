//! Connection registry and per-query connection context.
//!
//! [`Connections`] maps database aliases (`"default"`, `"replica"`) to
//! executors. One registry may be installed process-wide with
//! [`Connections::install_global`]; QuerySets built without an explicit
//! context resolve against it when they execute, not when they are built.
//!
//! [`DbContext`] is what each QuerySet and instance carries: a registry (or
//! the global one), an alias, an optional schema, and, inside a transaction,
//! the pinned executor every statement must use.
//!
//! ```
//! use edgy_rs_db::connections::{Connections, DbContext};
//!
//! let ctx = DbContext::global().using(Some("replica"), Some("tenant_a"));
//! assert_eq!(ctx.alias(), Some("replica"));
//! assert_eq!(ctx.schema().as_deref(), Some("tenant_a"));
//! assert!(Connections::new().is_empty());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use edgy_rs_core::{EdgyError, EdgyResult, DEFAULT_DB_ALIAS};

use crate::executor::DbExecutor;

static GLOBAL: OnceCell<Arc<Connections>> = OnceCell::new();

/// Named database connections.
#[derive(Clone)]
pub struct Connections {
    databases: HashMap<String, Arc<dyn DbExecutor>>,
    schemas: HashMap<String, String>,
    default_alias: String,
}

impl Default for Connections {
    fn default() -> Self {
        Self::new()
    }
}

impl Connections {
    /// Creates an empty registry whose default alias is `"default"`.
    pub fn new() -> Self {
        Self {
            databases: HashMap::new(),
            schemas: HashMap::new(),
            default_alias: DEFAULT_DB_ALIAS.to_string(),
        }
    }

    /// Registers `executor` under `alias`.
    #[must_use]
    pub fn with_database(mut self, alias: impl Into<String>, executor: Arc<dyn DbExecutor>) -> Self {
        self.add(alias, executor);
        self
    }

    /// Sets the schema used by default for `alias`.
    #[must_use]
    pub fn with_schema(mut self, alias: impl Into<String>, schema: impl Into<String>) -> Self {
        self.schemas.insert(alias.into(), schema.into());
        self
    }

    /// Changes which alias is used when none is given.
    #[must_use]
    pub fn with_default_alias(mut self, alias: impl Into<String>) -> Self {
        self.default_alias = alias.into();
        self
    }

    /// Registers `executor` under `alias`, replacing any previous one.
    pub fn add(&mut self, alias: impl Into<String>, executor: Arc<dyn DbExecutor>) {
        self.databases.insert(alias.into(), executor);
    }

    /// Returns the executor registered under `alias`.
    pub fn get(&self, alias: &str) -> Option<Arc<dyn DbExecutor>> {
        self.databases.get(alias).cloned()
    }

    /// The alias used when none is given.
    pub fn default_alias(&self) -> &str {
        &self.default_alias
    }

    /// The default schema of `alias`, if configured.
    pub fn schema_for(&self, alias: &str) -> Option<&str> {
        self.schemas.get(alias).map(String::as_str)
    }

    /// All registered aliases, sorted.
    pub fn aliases(&self) -> Vec<&str> {
        let mut aliases: Vec<&str> = self.databases.keys().map(String::as_str).collect();
        aliases.sort_unstable();
        aliases
    }

    /// Returns the number of registered databases.
    pub fn len(&self) -> usize {
        self.databases.len()
    }

    /// Returns `true` if no database is registered.
    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }

    /// Installs this registry as the process-wide default.
    ///
    /// Fails if a registry is already installed.
    pub fn install_global(self: Arc<Self>) -> EdgyResult<()> {
        GLOBAL.set(self).map_err(|_| {
            EdgyError::ConfigurationError("A global connection registry is already installed".to_string())
        })
    }

    /// The process-wide registry, if installed.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }
}

impl fmt::Debug for Connections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connections")
            .field("aliases", &self.aliases())
            .field("default_alias", &self.default_alias)
            .field("schemas", &self.schemas)
            .finish()
    }
}

/// Where a query runs: registry, alias, schema and an optional pinned
/// transaction connection.
#[derive(Clone, Default)]
pub struct DbContext {
    connections: Option<Arc<Connections>>,
    alias: Option<String>,
    schema: Option<String>,
    pinned: Option<Arc<dyn DbExecutor>>,
}

impl DbContext {
    /// A context resolved against the global registry at execution time.
    pub fn global() -> Self {
        Self::default()
    }

    /// A context over an explicit registry.
    pub fn new(connections: Arc<Connections>) -> Self {
        Self {
            connections: Some(connections),
            ..Self::default()
        }
    }

    /// A context over a single executor registered as the default alias.
    pub fn from_executor(executor: Arc<dyn DbExecutor>) -> Self {
        Self::new(Arc::new(Connections::new().with_database(DEFAULT_DB_ALIAS, executor)))
    }

    /// The explicit alias, if any.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Returns `true` inside a transaction scope.
    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    fn registry(&self) -> EdgyResult<Arc<Connections>> {
        self.connections
            .clone()
            .or_else(Connections::global)
            .ok_or_else(|| {
                EdgyError::OperationalError("No database connections are configured".to_string())
            })
    }

    /// Resolves the executor statements should run on.
    pub fn executor(&self) -> EdgyResult<Arc<dyn DbExecutor>> {
        if let Some(pinned) = &self.pinned {
            return Ok(Arc::clone(pinned));
        }
        let registry = self.registry()?;
        let alias = self.alias.as_deref().unwrap_or_else(|| registry.default_alias());
        registry.get(alias).ok_or_else(|| {
            EdgyError::ConfigurationError(format!("Unknown database alias '{alias}'"))
        })
    }

    /// The schema tables are qualified with, if any.
    pub fn schema(&self) -> Option<String> {
        if self.schema.is_some() {
            return self.schema.clone();
        }
        let registry = self.registry().ok()?;
        let alias = self.alias.as_deref().unwrap_or_else(|| registry.default_alias());
        registry.schema_for(alias).map(str::to_string)
    }

    /// A copy bound to another database and/or schema.
    ///
    /// Switching database leaves any transaction scope.
    #[must_use]
    pub fn using(&self, database: Option<&str>, schema: Option<&str>) -> Self {
        let mut ctx = self.clone();
        if let Some(database) = database {
            if ctx.alias.as_deref() != Some(database) {
                ctx.pinned = None;
            }
            ctx.alias = Some(database.to_string());
        }
        if let Some(schema) = schema {
            ctx.schema = Some(schema.to_string());
        }
        ctx
    }

    /// A copy whose statements all run on `executor`.
    #[must_use]
    pub fn pinned(&self, executor: Arc<dyn DbExecutor>) -> Self {
        Self {
            pinned: Some(executor),
            ..self.clone()
        }
    }
}

impl fmt::Debug for DbContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbContext")
            .field("alias", &self.alias)
            .field("schema", &self.schema)
            .field("explicit_registry", &self.connections.is_some())
            .field("pinned", &self.pinned.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDb;

    fn registry() -> Arc<Connections> {
        Arc::new(
            Connections::new()
                .with_database("default", Arc::new(MockDb::new()))
                .with_database("replica", Arc::new(MockDb::new()))
                .with_schema("replica", "analytics"),
        )
    }

    #[test]
    fn test_resolves_default_alias() {
        let ctx = DbContext::new(registry());
        assert!(ctx.executor().is_ok());
        assert_eq!(ctx.schema(), None);
    }

    #[test]
    fn test_unknown_alias_is_configuration_error() {
        let ctx = DbContext::new(registry()).using(Some("nope"), None);
        let Err(err) = ctx.executor() else { panic!("expected error") };
        assert!(matches!(err, EdgyError::ConfigurationError(ref m) if m.contains("nope")));
    }

    #[test]
    fn test_registry_schema_and_override() {
        let ctx = DbContext::new(registry()).using(Some("replica"), None);
        assert_eq!(ctx.schema().as_deref(), Some("analytics"));
        let ctx = ctx.using(None, Some("tenant"));
        assert_eq!(ctx.schema().as_deref(), Some("tenant"));
        assert_eq!(ctx.alias(), Some("replica"));
    }

    #[test]
    fn test_switching_database_unpins() {
        let pinned = DbContext::new(registry()).pinned(Arc::new(MockDb::new()));
        assert!(pinned.is_pinned());
        assert!(pinned.using(None, Some("tenant")).is_pinned());
        assert!(!pinned.using(Some("replica"), None).is_pinned());
    }

    #[test]
    fn test_aliases_sorted() {
        assert_eq!(registry().aliases(), vec!["default", "replica"]);
    }
}
