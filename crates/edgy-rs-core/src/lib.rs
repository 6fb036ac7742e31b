//! # edgy-rs-core
//!
//! Error types, settings, and logging shared by every edgy-rs crate.
//!
//! ## Modules
//!
//! - [`error`] - Error types and result aliases
//! - [`settings`] - Settings and the global settings slot
//! - [`settings_loader`] - TOML/JSON loading with environment overrides
//! - [`logging`] - Tracing-based logging integration

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;

pub use error::{ConstraintKind, EdgyError, EdgyResult, IntegrityViolation, ValidationError};
pub use settings::{DatabaseSettings, Settings, DEFAULT_DB_ALIAS, SETTINGS};
