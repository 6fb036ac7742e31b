//! Model descriptors.
//!
//! A model is a static [`ModelMeta`] describing a table: its fields, its
//! primary key, the reverse side of relationships declared on other models,
//! and default ordering. Types implement [`Model`] to hand out their
//! descriptor and a [`QuerySet`] over it.
//!
//! [`ModelMeta::relation`] gives every relationship, forward or reverse, one
//! uniform shape ([`RelationInfo`]) which the compiler, the materializer and
//! the prefetch executor all consume.

use edgy_rs_core::{EdgyError, EdgyResult};

use crate::connections::DbContext;
use crate::fields::{FieldDef, FieldType, ModelRef, OnDelete, ThroughTable};
use crate::query::QuerySet;

/// The core trait for all models.
///
/// # Examples
///
/// ```
/// use std::sync::LazyLock;
/// use edgy_rs_db::fields::{FieldDef, FieldType};
/// use edgy_rs_db::model::{Model, ModelMeta};
///
/// struct Studio;
///
/// impl Model for Studio {
///     fn meta() -> &'static ModelMeta {
///         static META: LazyLock<ModelMeta> = LazyLock::new(|| {
///             ModelMeta::new("Studio", "studios")
///                 .add_field(FieldDef::new("id", FieldType::BigAutoField).primary_key())
///                 .add_field(FieldDef::new("name", FieldType::CharField).max_length(100))
///         });
///         &META
///     }
/// }
///
/// assert_eq!(Studio::meta().table, "studios");
/// assert_eq!(Studio::query().model().name, "Studio");
/// ```
pub trait Model: Send + Sync + 'static {
    /// Returns the static descriptor for this model.
    fn meta() -> &'static ModelMeta;

    /// Returns a lazy `QuerySet` over this model bound to the default
    /// connection registry.
    fn query() -> QuerySet {
        QuerySet::new(Self::meta())
    }

    /// Returns a lazy `QuerySet` over this model bound to `db`.
    fn query_with(db: DbContext) -> QuerySet {
        QuerySet::new(Self::meta()).with_db(db)
    }
}

/// The reverse side of a relationship declared on another model.
#[derive(Debug, Clone)]
pub struct ReverseRelation {
    /// The attribute name on this model (e.g. `tracks`).
    pub name: &'static str,
    /// The model declaring the relationship field.
    pub source: ModelRef,
    /// The name of the relationship field on `source`.
    pub field: &'static str,
}

/// Static metadata describing a model's table.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    /// The model name, used in error messages.
    pub name: &'static str,
    /// The database table name.
    pub table: &'static str,
    /// Declared fields, in column order.
    pub fields: Vec<FieldDef>,
    /// Reverse relationships.
    pub reverse_relations: Vec<ReverseRelation>,
    /// Default ordering (`"-name"` for descending).
    pub ordering: Vec<String>,
    /// Reflected models map existing tables read-only.
    pub reflected: bool,
}

impl ModelMeta {
    /// Starts a descriptor for `table`.
    pub const fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            fields: Vec::new(),
            reverse_relations: Vec::new(),
            ordering: Vec::new(),
            reflected: false,
        }
    }

    /// Adds a field.
    #[must_use]
    pub fn add_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Declares the reverse side of `source.field` under `name`.
    #[must_use]
    pub fn add_reverse(mut self, name: &'static str, source: ModelRef, field: &'static str) -> Self {
        self.reverse_relations.push(ReverseRelation {
            name,
            source,
            field,
        });
        self
    }

    /// Sets the default ordering.
    #[must_use]
    pub fn with_ordering(mut self, ordering: &[&str]) -> Self {
        self.ordering = ordering.iter().map(ToString::to_string).collect();
        self
    }

    /// Marks the model as reflected (read-only).
    #[must_use]
    pub const fn reflected(mut self) -> Self {
        self.reflected = true;
        self
    }

    /// Looks up a declared field by name.
    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Looks up a field or fails with a configuration error naming it.
    pub fn field_or_err(&self, name: &str) -> EdgyResult<&FieldDef> {
        self.get_field(name).ok_or_else(|| {
            EdgyError::ConfigurationError(format!(
                "Cannot resolve keyword '{name}' into field of {}",
                self.name
            ))
        })
    }

    /// Fields backed by a column of this table.
    pub fn concrete_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_concrete())
    }

    /// Primary key fields, in declaration order.
    pub fn pk_fields(&self) -> Vec<&FieldDef> {
        self.fields.iter().filter(|f| f.primary_key).collect()
    }

    /// Primary key field names.
    pub fn pk_names(&self) -> Vec<&'static str> {
        self.fields
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| f.name)
            .collect()
    }

    /// The single primary key field.
    ///
    /// Relationships and `IN`-based operations need a single-column key.
    pub fn pk_field(&self) -> EdgyResult<&FieldDef> {
        match self.pk_fields().as_slice() {
            [one] => Ok(one),
            [] => Err(EdgyError::ConfigurationError(format!(
                "Model {} declares no primary key",
                self.name
            ))),
            _ => Err(EdgyError::ConfigurationError(format!(
                "Model {} has a composite primary key; this operation needs a single-column key",
                self.name
            ))),
        }
    }

    /// Returns `true` if `name` is a field or a relationship of this model.
    pub fn has_attribute(&self, name: &str) -> bool {
        self.get_field(name).is_some() || self.reverse_relations.iter().any(|r| r.name == name)
    }

    /// Fails with a configuration error if the model is reflected.
    pub fn ensure_writable(&self, operation: &str) -> EdgyResult<()> {
        if self.reflected {
            return Err(EdgyError::ConfigurationError(format!(
                "{} is a reflected model; {operation}() is not allowed",
                self.name
            )));
        }
        Ok(())
    }

    /// Resolves the relationship `name`, forward or reverse.
    pub fn relation(&self, name: &str) -> Option<RelationInfo> {
        if let Some(field) = self.get_field(name) {
            return self.forward_relation(field);
        }
        let reverse = self.reverse_relations.iter().find(|r| r.name == name)?;
        self.reverse_relation(reverse)
    }

    /// Every relationship of this model, forward ones first.
    pub fn relations(&self) -> Vec<RelationInfo> {
        self.fields
            .iter()
            .filter_map(|f| self.forward_relation(f))
            .chain(
                self.reverse_relations
                    .iter()
                    .filter_map(|r| self.reverse_relation(r)),
            )
            .collect()
    }

    fn own_pk(&self) -> Option<&FieldDef> {
        self.pk_field().ok()
    }

    fn forward_relation(&self, field: &FieldDef) -> Option<RelationInfo> {
        match field.field_type {
            FieldType::ForeignKey { to, on_delete } | FieldType::OneToOneField { to, on_delete } => {
                let target_pk = to().own_pk()?;
                let kind = if matches!(field.field_type, FieldType::ForeignKey { .. }) {
                    RelationKind::ForeignKey
                } else {
                    RelationKind::OneToOne
                };
                Some(RelationInfo {
                    name: field.name,
                    kind,
                    target: to,
                    local_column: field.column.clone(),
                    local_field: field.name,
                    remote_column: target_pk.column.clone(),
                    remote_field: target_pk.name,
                    through: None,
                    nullable: field.null,
                    on_delete,
                })
            }
            FieldType::ManyToManyField { to, through } => {
                let own_pk = self.own_pk()?;
                let target_pk = to().own_pk()?;
                Some(RelationInfo {
                    name: field.name,
                    kind: RelationKind::ManyToMany,
                    target: to,
                    local_column: own_pk.column.clone(),
                    local_field: own_pk.name,
                    remote_column: target_pk.column.clone(),
                    remote_field: target_pk.name,
                    through: Some(through),
                    nullable: true,
                    on_delete: OnDelete::Cascade,
                })
            }
            _ => None,
        }
    }

    fn reverse_relation(&self, reverse: &ReverseRelation) -> Option<RelationInfo> {
        let source = (reverse.source)();
        let field = source.get_field(reverse.field)?;
        let own_pk = self.own_pk()?;
        let (kind, remote_column, remote_field, through, on_delete) = match field.field_type {
            FieldType::ForeignKey { on_delete, .. } => (
                RelationKind::ReverseForeignKey,
                field.column.clone(),
                field.name,
                None,
                on_delete,
            ),
            FieldType::OneToOneField { on_delete, .. } => (
                RelationKind::ReverseOneToOne,
                field.column.clone(),
                field.name,
                None,
                on_delete,
            ),
            FieldType::ManyToManyField { through, .. } => {
                let source_pk = source.own_pk()?;
                (
                    RelationKind::ManyToMany,
                    source_pk.column.clone(),
                    source_pk.name,
                    Some(through.reversed()),
                    OnDelete::Cascade,
                )
            }
            _ => return None,
        };
        Some(RelationInfo {
            name: reverse.name,
            kind,
            target: reverse.source,
            local_column: own_pk.column.clone(),
            local_field: own_pk.name,
            remote_column,
            remote_field,
            through,
            nullable: true,
            on_delete,
        })
    }
}

/// The shape of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// This model holds a foreign key to the target.
    ForeignKey,
    /// This model holds a unique foreign key to the target.
    OneToOne,
    /// The target holds a foreign key to this model.
    ReverseForeignKey,
    /// The target holds a unique foreign key to this model.
    ReverseOneToOne,
    /// Linked through a link table, from either side.
    ManyToMany,
}

impl RelationKind {
    /// Returns `true` if at most one related row exists per instance.
    pub const fn is_to_one(self) -> bool {
        matches!(self, Self::ForeignKey | Self::OneToOne | Self::ReverseOneToOne)
    }

    /// Returns `true` if the key lives on this model's table.
    pub const fn is_forward(self) -> bool {
        matches!(self, Self::ForeignKey | Self::OneToOne)
    }
}

/// One relationship seen from a model.
///
/// Joining the two tables is always `local_column = remote_column`, except
/// for many-to-many where the link table sits in between:
/// `local_column = through.source_column` and
/// `through.target_column = remote_column`.
#[derive(Debug, Clone)]
pub struct RelationInfo {
    /// The attribute name.
    pub name: &'static str,
    /// The relationship shape.
    pub kind: RelationKind,
    /// The related model.
    pub target: ModelRef,
    /// Column on this model's table.
    pub local_column: String,
    /// Field on this model holding `local_column`.
    pub local_field: &'static str,
    /// Column on the related table.
    pub remote_column: String,
    /// Field on the related model holding `remote_column`.
    pub remote_field: &'static str,
    /// The link table for many-to-many relationships.
    pub through: Option<ThroughTable>,
    /// Whether the relationship may be absent.
    pub nullable: bool,
    /// The on-delete rule of the underlying foreign key.
    pub on_delete: OnDelete,
}

impl RelationInfo {
    /// The related model's descriptor.
    pub fn target_meta(&self) -> &'static ModelMeta {
        (self.target)()
    }
}
