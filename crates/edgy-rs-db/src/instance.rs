//! Materialized model instances.
//!
//! An [`Instance`] is one row of a model: its field values keyed by field
//! name, one [`Relation`] per relationship, lists attached by prefetch
//! directives, annotations from `extra_select`, and the [`DbContext`] it was
//! loaded from.
//!
//! Relationships never trigger I/O on access. A relation the query did not
//! load is a stub ([`Relation::Unloaded`] / [`Relation::UnloadedMany`])
//! carrying the key needed to fetch it; [`Instance::load`] performs that
//! fetch explicitly.
//!
//! Instances materialized by a query using `only()` or `defer()` are
//! *partial*: reading a field that was not fetched fails with
//! [`EdgyError::FieldNotLoaded`] instead of returning a null.

use std::fmt;

use indexmap::IndexMap;

use edgy_rs_core::{EdgyError, EdgyResult};

use crate::connections::DbContext;
use crate::model::ModelMeta;
use crate::query::lookups::Q;
use crate::query::sql::FromValue;
use crate::query::{bulk, prefetch, QuerySet};
use crate::value::{Value, ValueKey};

/// The state of one relationship attribute.
#[derive(Debug, Clone)]
pub enum Relation {
    /// A to-one relationship loaded by `select_related` or `load`.
    Loaded(Box<Instance>),
    /// A to-many relationship loaded by `load`.
    LoadedMany(Vec<Instance>),
    /// A to-one relationship not loaded yet, with the key that resolves it.
    Unloaded(Value),
    /// A to-many relationship not loaded yet, with this instance's key.
    UnloadedMany(Value),
    /// No related row (NULL foreign key or left-join miss).
    Null,
}

impl Relation {
    /// Returns `true` if the related rows are available without I/O.
    pub const fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_) | Self::LoadedMany(_) | Self::Null)
    }
}

/// A materialized row of a model.
#[derive(Clone)]
pub struct Instance {
    meta: &'static ModelMeta,
    values: IndexMap<String, Value>,
    relations: IndexMap<String, Relation>,
    attached: IndexMap<String, Vec<Instance>>,
    links: IndexMap<String, Option<Box<Instance>>>,
    annotations: IndexMap<String, Value>,
    partial: bool,
    db: DbContext,
}

impl Instance {
    /// An empty, unsaved instance of `meta` bound to `db`.
    pub fn new(meta: &'static ModelMeta, db: DbContext) -> Self {
        Self {
            meta,
            values: IndexMap::new(),
            relations: IndexMap::new(),
            attached: IndexMap::new(),
            links: IndexMap::new(),
            annotations: IndexMap::new(),
            partial: false,
            db,
        }
    }

    pub(crate) fn set_partial(&mut self, partial: bool) {
        self.partial = partial;
    }

    pub(crate) fn insert_raw(&mut self, field: &str, value: Value) {
        self.values.insert(field.to_string(), value);
    }

    pub(crate) fn set_relation(&mut self, name: &str, relation: Relation) {
        self.relations.insert(name.to_string(), relation);
    }

    pub(crate) fn set_annotation(&mut self, name: &str, value: Value) {
        self.annotations.insert(name.to_string(), value);
    }

    pub(crate) fn take_annotation(&mut self, name: &str) -> Option<Value> {
        self.annotations.shift_remove(name)
    }

    /// The model descriptor.
    pub const fn meta(&self) -> &'static ModelMeta {
        self.meta
    }

    /// The connection context this instance was loaded from.
    pub const fn db(&self) -> &DbContext {
        &self.db
    }

    /// Returns `true` if the instance was materialized with `only`/`defer`.
    pub const fn is_partial(&self) -> bool {
        self.partial
    }

    /// Loaded field values, keyed by field name, in column order.
    pub const fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    /// The primary key value. Composite keys come back as a
    /// [`Value::List`]; an unsaved instance has [`Value::Null`].
    pub fn pk(&self) -> Value {
        let names = self.meta.pk_names();
        let mut parts: Vec<Value> = names
            .iter()
            .map(|name| self.values.get(*name).cloned().unwrap_or(Value::Null))
            .collect();
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            Value::List(parts)
        }
    }

    pub(crate) fn pk_key(&self) -> ValueKey {
        self.pk().key()
    }

    /// Reads a field value (or an annotation).
    ///
    /// Fails with [`EdgyError::FieldNotLoaded`] for a declared field the
    /// query did not fetch, and with a configuration error for a name that
    /// is neither a field nor an annotation.
    pub fn get_value(&self, name: &str) -> EdgyResult<&Value> {
        let name = if name == "pk" {
            self.meta.pk_field()?.name
        } else {
            name
        };
        if let Some(value) = self.values.get(name) {
            return Ok(value);
        }
        if let Some(value) = self.annotations.get(name) {
            return Ok(value);
        }
        match self.meta.get_field(name) {
            Some(field) if field.is_concrete() => Err(EdgyError::FieldNotLoaded {
                model: self.meta.name.to_string(),
                field: name.to_string(),
            }),
            _ => Err(EdgyError::ConfigurationError(format!(
                "{} has no field or annotation '{name}'",
                self.meta.name
            ))),
        }
    }

    /// Reads and converts a field value.
    pub fn get<T: FromValue>(&self, name: &str) -> EdgyResult<T> {
        T::from_value(self.get_value(name)?)
    }

    /// Reads an annotation produced by `extra_select`.
    pub fn annotation(&self, name: &str) -> Option<&Value> {
        self.annotations.get(name)
    }

    /// Sets a field value.
    ///
    /// Setting a foreign key resets its relation to a stub for the new key.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> EdgyResult<()> {
        let field = self.meta.field_or_err(name)?;
        if !field.is_concrete() {
            return Err(EdgyError::ConfigurationError(format!(
                "'{name}' of {} is a many-to-many relation and has no column value",
                self.meta.name
            )));
        }
        let value = field.field_type.coerce(value.into());
        if field.is_relation() {
            let relation = if value.is_null() {
                Relation::Null
            } else {
                Relation::Unloaded(value.clone())
            };
            self.relations.insert(name.to_string(), relation);
        }
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    /// The raw state of a relationship attribute.
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    fn relation_or_err(&self, name: &str) -> EdgyResult<&Relation> {
        self.relations.get(name).ok_or_else(|| {
            if self.meta.relation(name).is_some() {
                EdgyError::FieldNotLoaded {
                    model: self.meta.name.to_string(),
                    field: name.to_string(),
                }
            } else {
                EdgyError::ConfigurationError(format!(
                    "{} has no relationship '{name}'",
                    self.meta.name
                ))
            }
        })
    }

    fn not_loaded(&self, name: &str) -> EdgyError {
        EdgyError::RelationNotLoaded {
            model: self.meta.name.to_string(),
            relation: name.to_string(),
        }
    }

    /// The related instance of a to-one relationship.
    ///
    /// `Ok(None)` means there is no related row. A stub fails with
    /// [`EdgyError::RelationNotLoaded`].
    pub fn related(&self, name: &str) -> EdgyResult<Option<&Self>> {
        match self.relation_or_err(name)? {
            Relation::Loaded(inst) => Ok(Some(inst)),
            Relation::Null => Ok(None),
            Relation::Unloaded(_) => Err(self.not_loaded(name)),
            Relation::LoadedMany(_) | Relation::UnloadedMany(_) => Err(EdgyError::ConfigurationError(
                format!("'{name}' of {} is a to-many relationship; use related_many()", self.meta.name),
            )),
        }
    }

    /// The related instances of a to-many relationship.
    pub fn related_many(&self, name: &str) -> EdgyResult<&[Self]> {
        match self.relation_or_err(name)? {
            Relation::LoadedMany(items) => Ok(items),
            Relation::Null => Ok(&[]),
            Relation::UnloadedMany(_) => Err(self.not_loaded(name)),
            Relation::Loaded(_) | Relation::Unloaded(_) => Err(EdgyError::ConfigurationError(format!(
                "'{name}' of {} is a to-one relationship; use related()",
                self.meta.name
            ))),
        }
    }

    /// The list attached by a prefetch directive.
    pub fn prefetched(&self, to_attr: &str) -> EdgyResult<&[Self]> {
        self.attached.get(to_attr).map(Vec::as_slice).ok_or_else(|| {
            EdgyError::ConfigurationError(format!(
                "Nothing was prefetched into '{to_attr}' on {}",
                self.meta.name
            ))
        })
    }

    pub(crate) fn attach(&mut self, to_attr: &str, items: Vec<Self>) {
        self.attached.insert(to_attr.to_string(), items);
    }

    /// The neighbour linked under `attr` by a paginator, if any.
    pub fn linked(&self, attr: &str) -> Option<&Self> {
        self.links.get(attr).and_then(|inst| inst.as_deref())
    }

    pub(crate) fn set_linked(&mut self, attr: &str, neighbour: Option<Self>) {
        self.links.insert(attr.to_string(), neighbour.map(Box::new));
    }

    /// Resolves the stub relationship `name` with one query.
    ///
    /// Loading an already loaded relationship is a no-op.
    pub async fn load(&mut self, name: &str) -> EdgyResult<()> {
        let rel = self.meta.relation(name).ok_or_else(|| {
            EdgyError::ConfigurationError(format!("{} has no relationship '{name}'", self.meta.name))
        })?;
        let key = match self.relation_or_err(name)? {
            Relation::Unloaded(key) | Relation::UnloadedMany(key) => key.clone(),
            _ => return Ok(()),
        };
        let mut found = prefetch::fetch_related(&rel, vec![key], None, &self.db).await?;
        let relation = if rel.kind.is_to_one() {
            match found.pop() {
                Some((_, inst)) => Relation::Loaded(Box::new(inst)),
                None => Relation::Null,
            }
        } else {
            Relation::LoadedMany(found.into_iter().map(|(_, inst)| inst).collect())
        };
        self.relations.insert(name.to_string(), relation);
        Ok(())
    }

    /// Writes this instance.
    ///
    /// An instance without a primary key is inserted and receives the
    /// generated values; otherwise its loaded fields are updated.
    pub async fn save(&mut self) -> EdgyResult<()> {
        self.meta.ensure_writable("save")?;
        let pk = self.pk();
        let unsaved = pk.is_null() || matches!(&pk, Value::List(parts) if parts.iter().any(Value::is_null));
        if !unsaved {
            let pk_names = self.meta.pk_names();
            let changes: Vec<(String, Value)> = self
                .values
                .iter()
                .filter(|(name, _)| !pk_names.contains(&name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            if changes.is_empty() {
                return Ok(());
            }
            let updated = self.identity_query()?.update(changes).await?;
            if updated > 0 {
                return Ok(());
            }
        }
        let values: Vec<(String, Value)> = self
            .values
            .iter()
            .filter(|(_, value)| !value.is_null() || !unsaved)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let created = bulk::insert_one(self.meta, &self.db, values).await?;
        self.values = created.values;
        for (name, relation) in created.relations {
            self.relations.entry(name).or_insert(relation);
        }
        Ok(())
    }

    /// Deletes this instance's row, honoring every on-delete rule.
    pub async fn delete(&self) -> EdgyResult<u64> {
        self.identity_query()?.delete().await
    }

    /// Reloads every field from the database, dropping loaded relations.
    pub async fn refresh(&mut self) -> EdgyResult<()> {
        let fresh = self.identity_query()?.get(Q::default()).await?;
        self.values = fresh.values;
        self.relations = fresh.relations;
        self.partial = false;
        Ok(())
    }

    fn identity_query(&self) -> EdgyResult<QuerySet> {
        let mut q = Q::default();
        for name in self.meta.pk_names() {
            let value = self.values.get(name).cloned().unwrap_or(Value::Null);
            if value.is_null() {
                return Err(EdgyError::ConfigurationError(format!(
                    "{} instance has no primary key value for '{name}'",
                    self.meta.name
                )));
            }
            q = q & Q::lookup(name, value);
        }
        Ok(QuerySet::new(self.meta).with_db(self.db.clone()).filter(q))
    }

    /// A JSON rendering of loaded values, relations, prefetched lists and
    /// annotations.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.values {
            map.insert(name.clone(), value.to_json());
        }
        for (name, relation) in &self.relations {
            match relation {
                Relation::Loaded(inst) => {
                    map.insert(name.clone(), inst.to_json());
                }
                Relation::LoadedMany(items) => {
                    map.insert(
                        name.clone(),
                        serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
                    );
                }
                Relation::Null => {
                    map.insert(name.clone(), serde_json::Value::Null);
                }
                Relation::Unloaded(_) | Relation::UnloadedMany(_) => {}
            }
        }
        for (name, items) in &self.attached {
            map.insert(
                name.clone(),
                serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            );
        }
        for (name, value) in &self.annotations {
            map.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }
}

impl PartialEq for Instance {
    /// Two instances are equal when they belong to the same model and hold
    /// the same field values.
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.meta, other.meta) && self.values == other.values
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.meta.name)
            .field("values", &self.values)
            .field("relations", &self.relations.keys().collect::<Vec<_>>())
            .field("attached", &self.attached.keys().collect::<Vec<_>>())
            .field("partial", &self.partial)
            .finish_non_exhaustive()
    }
}

/// Typed extraction from an [`Instance`].
///
/// ```
/// use edgy_rs_db::instance::{FromInstance, Instance};
/// use edgy_rs_core::EdgyResult;
///
/// struct TrackRow {
///     title: String,
///     position: i64,
/// }
///
/// impl FromInstance for TrackRow {
///     fn from_instance(inst: &Instance) -> EdgyResult<Self> {
///         Ok(Self {
///             title: inst.get("title")?,
///             position: inst.get("position")?,
///         })
///     }
/// }
/// ```
pub trait FromInstance: Sized {
    /// Builds `Self` from a materialized instance.
    fn from_instance(inst: &Instance) -> EdgyResult<Self>;
}

impl FromInstance for Instance {
    fn from_instance(inst: &Instance) -> EdgyResult<Self> {
        Ok(inst.clone())
    }
}
