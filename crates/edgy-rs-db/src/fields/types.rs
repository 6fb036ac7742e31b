//! Field type definitions.
//!
//! A [`FieldDef`] describes one attribute of a model: its column, its
//! [`FieldType`], nullability and defaults. Relationship fields carry the
//! target model as a [`ModelRef`] so descriptors can reference each other
//! without initialization-order problems.

use crate::model::ModelMeta;
use crate::value::Value;

/// A lazily-resolved reference to another model's descriptor.
pub type ModelRef = fn() -> &'static ModelMeta;

/// The type of a model field.
#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    /// Auto-incrementing 32-bit integer primary key.
    AutoField,
    /// Auto-incrementing 64-bit integer primary key.
    BigAutoField,
    /// Variable-length string with a max length.
    CharField,
    /// Unlimited-length text.
    TextField,
    /// 32-bit signed integer.
    IntegerField,
    /// 64-bit signed integer.
    BigIntegerField,
    /// 16-bit signed integer.
    SmallIntegerField,
    /// 64-bit floating-point number.
    FloatField,
    /// Boolean.
    BooleanField,
    /// Date without time.
    DateField,
    /// Date and time.
    DateTimeField,
    /// Time without date.
    TimeField,
    /// UUID.
    UuidField,
    /// Raw binary data.
    BinaryField,
    /// JSON data.
    JsonField,
    /// Many-to-one relationship; the column holds the target's primary key.
    ForeignKey {
        /// The target model.
        to: ModelRef,
        /// Behavior when the referenced row is deleted.
        on_delete: OnDelete,
    },
    /// One-to-one relationship (unique foreign key).
    OneToOneField {
        /// The target model.
        to: ModelRef,
        /// Behavior when the referenced row is deleted.
        on_delete: OnDelete,
    },
    /// Many-to-many relationship through a link table. Has no column.
    ManyToManyField {
        /// The target model.
        to: ModelRef,
        /// The link table.
        through: ThroughTable,
    },
}

/// Behavior when a referenced row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    /// Delete all referencing rows.
    Cascade,
    /// Refuse the delete while referencing rows exist.
    Restrict,
    /// Same as `Restrict`, kept for parity with declarative model definitions.
    Protect,
    /// Set the foreign key to NULL.
    SetNull,
    /// Set the foreign key to its declared default.
    SetDefault,
    /// Leave referencing rows untouched.
    DoNothing,
}

/// The link table of a many-to-many relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughTable {
    /// The link table name.
    pub table: &'static str,
    /// The column pointing at the model declaring the relationship.
    pub source_column: &'static str,
    /// The column pointing at the target model.
    pub target_column: &'static str,
}

impl ThroughTable {
    /// Creates a link table descriptor.
    pub const fn new(
        table: &'static str,
        source_column: &'static str,
        target_column: &'static str,
    ) -> Self {
        Self {
            table,
            source_column,
            target_column,
        }
    }

    /// The same table seen from the other side of the relationship.
    #[must_use]
    pub const fn reversed(self) -> Self {
        Self {
            table: self.table,
            source_column: self.target_column,
            target_column: self.source_column,
        }
    }
}

/// Complete definition of a model field.
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// The attribute name of this field.
    pub name: &'static str,
    /// The database column name.
    pub column: String,
    /// The type of this field.
    pub field_type: FieldType,
    /// Whether this field is (part of) the primary key.
    pub primary_key: bool,
    /// Whether NULL is allowed.
    pub null: bool,
    /// Client-side default applied on insert when no value is given.
    pub default: Option<Value>,
    /// Whether the database generates the value (server default, trigger).
    pub server_default: bool,
    /// Whether a UNIQUE constraint is applied.
    pub unique: bool,
    /// Maximum character length.
    pub max_length: Option<usize>,
}

impl FieldDef {
    /// Creates a new `FieldDef`. Foreign keys default to a `<name>_id` column.
    pub fn new(name: &'static str, field_type: FieldType) -> Self {
        let column = match field_type {
            FieldType::ForeignKey { .. } | FieldType::OneToOneField { .. } => format!("{name}_id"),
            _ => name.to_string(),
        };
        Self {
            name,
            column,
            field_type,
            primary_key: false,
            null: false,
            default: None,
            server_default: false,
            unique: false,
            max_length: None,
        }
    }

    /// A many-to-one relationship to `to`.
    pub fn foreign_key(name: &'static str, to: ModelRef, on_delete: OnDelete) -> Self {
        Self::new(name, FieldType::ForeignKey { to, on_delete })
    }

    /// A one-to-one relationship to `to`.
    pub fn one_to_one(name: &'static str, to: ModelRef, on_delete: OnDelete) -> Self {
        Self::new(name, FieldType::OneToOneField { to, on_delete }).unique()
    }

    /// A many-to-many relationship to `to` through a link table.
    pub fn many_to_many(name: &'static str, to: ModelRef, through: ThroughTable) -> Self {
        let mut field = Self::new(name, FieldType::ManyToManyField { to, through });
        field.column = String::new();
        field
    }

    /// Sets the database column name.
    #[must_use]
    pub fn db_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Marks this field as (part of) the primary key.
    #[must_use]
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Allows NULL values.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    /// Sets the maximum character length.
    #[must_use]
    pub const fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Marks this field as having a UNIQUE constraint.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets the client-side default value.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Declares that the database fills this column when it is omitted.
    #[must_use]
    pub const fn server_default(mut self) -> Self {
        self.server_default = true;
        self
    }

    /// Returns `true` for fields backed by a column on the model's own table.
    pub const fn is_concrete(&self) -> bool {
        !matches!(self.field_type, FieldType::ManyToManyField { .. })
    }

    /// Returns `true` for relationship fields.
    pub const fn is_relation(&self) -> bool {
        matches!(
            self.field_type,
            FieldType::ForeignKey { .. }
                | FieldType::OneToOneField { .. }
                | FieldType::ManyToManyField { .. }
        )
    }

    /// Returns `true` if the database produces the value when omitted.
    pub const fn is_auto(&self) -> bool {
        self.server_default
            || matches!(self.field_type, FieldType::AutoField | FieldType::BigAutoField)
    }

    /// Returns `true` if an insert may omit this field.
    pub const fn is_optional_on_insert(&self) -> bool {
        self.null || self.default.is_some() || self.is_auto()
    }
}

impl FieldType {
    /// Normalizes a raw backend value to this field's natural representation.
    ///
    /// SQLite has no native booleans, dates, UUIDs or JSON; they come back as
    /// integers or text and are converted here. Values that do not parse are
    /// returned unchanged.
    pub fn coerce(&self, value: Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (Self::BooleanField, Value::Int(i)) => Value::Bool(i != 0),
            (Self::UuidField, Value::String(s)) => {
                uuid::Uuid::parse_str(&s).map_or(Value::String(s), Value::Uuid)
            }
            (Self::UuidField, Value::Bytes(b)) => {
                uuid::Uuid::from_slice(&b).map_or(Value::Bytes(b), Value::Uuid)
            }
            (Self::DateField, Value::String(s)) => s
                .parse::<chrono::NaiveDate>()
                .map_or(Value::String(s), Value::Date),
            (Self::DateTimeField, Value::String(s)) => parse_datetime(&s).unwrap_or(Value::String(s)),
            (Self::TimeField, Value::String(s)) => s
                .parse::<chrono::NaiveTime>()
                .map_or(Value::String(s), Value::Time),
            (Self::JsonField, Value::String(s)) => {
                serde_json::from_str(&s).map_or(Value::String(s), Value::Json)
            }
            (Self::FloatField, Value::Int(i)) => Value::Float(i as f64),
            (_, other) => other,
        }
    }
}

fn parse_datetime(s: &str) -> Option<Value> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(Value::DateTimeTz(dt.with_timezone(&chrono::Utc)));
    }
    if let Ok(dt) = s.parse::<chrono::DateTime<chrono::Utc>>() {
        return Some(Value::DateTimeTz(dt));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(Value::DateTime)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> &'static ModelMeta {
        use std::sync::LazyLock;
        static META: LazyLock<ModelMeta> = LazyLock::new(|| {
            ModelMeta::new("Album", "albums")
                .add_field(FieldDef::new("id", FieldType::BigAutoField).primary_key())
        });
        &META
    }

    #[test]
    fn test_foreign_key_column_defaults_to_id_suffix() {
        let fk = FieldDef::foreign_key("album", target, OnDelete::Cascade);
        assert_eq!(fk.column, "album_id");
        assert!(fk.is_relation());
        assert!(fk.is_concrete());
    }

    #[test]
    fn test_one_to_one_is_unique() {
        let field = FieldDef::one_to_one("profile", target, OnDelete::Cascade);
        assert!(field.unique);
    }

    #[test]
    fn test_many_to_many_has_no_column() {
        let field = FieldDef::many_to_many(
            "albums",
            target,
            ThroughTable::new("artist_albums", "artist_id", "album_id"),
        );
        assert!(!field.is_concrete());
        assert!(field.column.is_empty());
    }

    #[test]
    fn test_through_reversed() {
        let t = ThroughTable::new("artist_albums", "artist_id", "album_id").reversed();
        assert_eq!(t.source_column, "album_id");
        assert_eq!(t.target_column, "artist_id");
    }

    #[test]
    fn test_optional_on_insert() {
        assert!(FieldDef::new("id", FieldType::BigAutoField).primary_key().is_optional_on_insert());
        assert!(FieldDef::new("bio", FieldType::TextField).nullable().is_optional_on_insert());
        assert!(FieldDef::new("n", FieldType::IntegerField).default(0).is_optional_on_insert());
        assert!(FieldDef::new("ts", FieldType::DateTimeField).server_default().is_optional_on_insert());
        assert!(!FieldDef::new("title", FieldType::CharField).is_optional_on_insert());
    }

    #[test]
    fn test_coerce_sqlite_values() {
        assert_eq!(FieldType::BooleanField.coerce(Value::Int(1)), Value::Bool(true));
        assert_eq!(
            FieldType::DateField.coerce(Value::from("2024-02-29")),
            Value::Date(chrono::NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert_eq!(
            FieldType::JsonField.coerce(Value::from("{\"a\":1}")),
            Value::Json(serde_json::json!({"a": 1}))
        );
        assert_eq!(FieldType::DateField.coerce(Value::from("soon")), Value::from("soon"));
        assert_eq!(FieldType::CharField.coerce(Value::Null), Value::Null);
    }

    #[test]
    fn test_coerce_datetime_formats() {
        let naive = FieldType::DateTimeField.coerce(Value::from("2024-01-02 03:04:05"));
        assert!(matches!(naive, Value::DateTime(_)));
        let aware = FieldType::DateTimeField.coerce(Value::from("2024-01-02T03:04:05Z"));
        assert!(matches!(aware, Value::DateTimeTz(_)));
    }
}
