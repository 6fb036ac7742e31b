//! Core error types for edgy-rs.
//!
//! [`EdgyError`] is the single error enum shared by the query engine and the
//! database backends. Its variants follow the failure taxonomy of the ORM:
//! configuration mistakes detected before any I/O, lookup multiplicity,
//! integrity violations surfaced from the database, partial-instance access,
//! and plain driver failures.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Represents a validation error with optional field-level errors.
///
/// # Examples
///
/// ```
/// use edgy_rs_core::error::ValidationError;
///
/// let err = ValidationError::new("This field is required.", "required");
/// assert_eq!(err.to_string(), "This field is required.");
///
/// let err = ValidationError::for_field("name", ValidationError::new("Too long.", "max_length"));
/// assert!(err.to_string().contains("name: Too long."));
/// ```
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The primary error message.
    pub message: String,
    /// A short code identifying the failure (e.g. "required", "null").
    pub code: String,
    /// Additional parameters providing context for the message.
    pub params: HashMap<String, String>,
    /// Per-field validation errors, keyed by field name.
    pub field_errors: HashMap<String, Vec<Self>>,
}

impl ValidationError {
    /// Creates a new `ValidationError` with a message and code.
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            params: HashMap::new(),
            field_errors: HashMap::new(),
        }
    }

    /// Creates a `ValidationError` containing per-field errors.
    pub fn with_field_errors(field_errors: HashMap<String, Vec<Self>>) -> Self {
        Self {
            message: String::new(),
            code: String::new(),
            params: HashMap::new(),
            field_errors,
        }
    }

    /// Creates a `ValidationError` holding a single error for one field.
    pub fn for_field(field: impl Into<String>, error: Self) -> Self {
        let mut field_errors = HashMap::new();
        field_errors.insert(field.into(), vec![error]);
        Self::with_field_errors(field_errors)
    }

    /// Adds a parameter to this validation error.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Merges the field errors of `other` into this error.
    pub fn merge(&mut self, other: Self) {
        for (field, errors) in other.field_errors {
            self.field_errors.entry(field).or_default().extend(errors);
        }
    }

    /// Returns `true` if no message and no field errors are recorded.
    pub fn is_empty(&self) -> bool {
        self.message.is_empty() && self.field_errors.is_empty()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.message.is_empty() {
            write!(f, "{}", self.message)?;
        } else if !self.field_errors.is_empty() {
            let mut fields: Vec<_> = self.field_errors.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            let mut first = true;
            for (field, errors) in fields {
                for error in errors {
                    if !first {
                        write!(f, "; ")?;
                    }
                    write!(f, "{field}: {error}")?;
                    first = false;
                }
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// The kind of constraint behind an [`EdgyError::IntegrityError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// A UNIQUE or PRIMARY KEY constraint.
    Unique,
    /// A FOREIGN KEY constraint.
    ForeignKey,
    /// A NOT NULL constraint.
    NotNull,
    /// A CHECK constraint.
    Check,
    /// A restrict/protect on-delete rule enforced by the ORM.
    Restrict,
    /// Any other integrity failure reported by the database.
    Other,
}

/// An integrity violation: the constraint kind plus the database message.
#[derive(Debug, Clone)]
pub struct IntegrityViolation {
    /// Which kind of constraint failed.
    pub kind: ConstraintKind,
    /// The message reported by the database or the ORM.
    pub message: String,
}

impl IntegrityViolation {
    /// Creates a new violation.
    pub fn new(kind: ConstraintKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// The primary error type for edgy-rs.
#[derive(Error, Debug)]
pub enum EdgyError {
    // ── Query construction ───────────────────────────────────────────

    /// Unknown field or path, conflicting directives, or an invalid
    /// relationship traversal. Always raised before any I/O.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    // ── Lookup multiplicity ──────────────────────────────────────────

    /// A query expected exactly one result but found none.
    #[error("Object does not exist: {0}")]
    DoesNotExist(String),

    /// A query expected exactly one result but found several.
    #[error("Multiple objects returned when one expected: {0}")]
    MultipleObjectsReturned(String),

    // ── Partial instances ────────────────────────────────────────────

    /// A field was read on an instance materialized without it.
    #[error("Field '{field}' of {model} was not loaded by this query")]
    FieldNotLoaded {
        /// The model name.
        model: String,
        /// The field that was not fetched.
        field: String,
    },

    /// A relationship was read before it was loaded.
    #[error("Relation '{relation}' of {model} is not loaded; call load() first")]
    RelationNotLoaded {
        /// The model name.
        model: String,
        /// The relationship name.
        relation: String,
    },

    // ── Database ─────────────────────────────────────────────────────

    /// A database integrity constraint was violated.
    #[error("Integrity error: {0}")]
    IntegrityError(IntegrityViolation),

    /// A generic database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// An operational database error (connection failure, pool exhaustion).
    #[error("Operational error: {0}")]
    OperationalError(String),

    // ── Validation ───────────────────────────────────────────────────

    /// One or more values failed validation before reaching the database.
    #[error("Validation error: {0}")]
    ValidationError(ValidationError),

    // ── Serialization ────────────────────────────────────────────────

    /// An error occurred during serialization or deserialization.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // ── IO ───────────────────────────────────────────────────────────

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl EdgyError {
    /// Shorthand for an integrity error of the given kind.
    pub fn integrity(kind: ConstraintKind, message: impl Into<String>) -> Self {
        Self::IntegrityError(IntegrityViolation::new(kind, message))
    }

    /// Returns `true` if this error is a UNIQUE constraint violation.
    pub const fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Self::IntegrityError(IntegrityViolation {
                kind: ConstraintKind::Unique,
                ..
            })
        )
    }

    /// Returns `true` for "not found" and "multiple found" errors.
    pub const fn is_lookup_error(&self) -> bool {
        matches!(
            self,
            Self::DoesNotExist(_) | Self::MultipleObjectsReturned(_)
        )
    }
}

impl From<ValidationError> for EdgyError {
    fn from(err: ValidationError) -> Self {
        Self::ValidationError(err)
    }
}

impl From<serde_json::Error> for EdgyError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// A convenience type alias for `Result<T, EdgyError>`.
pub type EdgyResult<T> = Result<T, EdgyError>;
