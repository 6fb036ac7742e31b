//! Lazy, immutable query builder.
//!
//! A [`QuerySet`] accumulates filters, ordering, slicing, eager-loading and
//! projection directives without touching the database. Every builder
//! method returns a new QuerySet and leaves the receiver unchanged, so a
//! base QuerySet can be shared and refined freely.
//!
//! Terminal methods (`all`, `get`, `count`, `values`, `stream`, ...)
//! compile the accumulated state with the statement compiler and run it on
//! the executor resolved from the QuerySet's [`DbContext`].
//!
//! # Examples
//!
//! ```
//! use edgy_rs_db::query::{Q, QuerySet};
//! use edgy_rs_db::query::sql::DatabaseBackendType;
//! # use std::sync::LazyLock;
//! # use edgy_rs_db::fields::{FieldDef, FieldType};
//! # use edgy_rs_db::model::ModelMeta;
//! # static META: LazyLock<ModelMeta> = LazyLock::new(|| {
//! #     ModelMeta::new("Studio", "studios")
//! #         .add_field(FieldDef::new("id", FieldType::BigAutoField).primary_key())
//! #         .add_field(FieldDef::new("name", FieldType::CharField).max_length(100))
//! # });
//!
//! let base = QuerySet::new(&META);
//! let named = base.filter(Q::lookup("name__istartswith", "sub")).order_by(&["-name"]);
//! let (sql, params) = named.compile_sql(DatabaseBackendType::PostgreSQL).unwrap();
//! assert!(sql.contains("ILIKE $1"));
//! assert_eq!(params.len(), 1);
//! assert!(base.compile_sql(DatabaseBackendType::PostgreSQL).unwrap().0.ends_with("\"studios\""));
//! ```

use std::future::Future;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use indexmap::IndexMap;
use tracing::Instrument;

use edgy_rs_core::logging::query_span;
use edgy_rs_core::{EdgyError, EdgyResult, SETTINGS};

use super::bulk;
use super::compiler::{CompileMode, CompiledQuery, OrderSpec, Projection, StatementCompiler, ThroughLink};
use super::expressions::Expression;
use super::lookups::{LookupOp, Q, LOOKUP_SEP};
use super::materializer::Materializer;
use super::prefetch::{self, Prefetch};
use super::sql::{DatabaseBackendType, Row, SqlCompiler};
use crate::connections::DbContext;
use crate::fields::FieldDef;
use crate::instance::{FromInstance, Instance};
use crate::model::ModelMeta;
use crate::transactions::atomic;
use crate::value::{Value, ValueKey};

/// A lazy query over one model.
#[derive(Clone, Debug)]
pub struct QuerySet {
    pub(crate) model: &'static ModelMeta,
    pub(crate) filter_clauses: Vec<Q>,
    pub(crate) order_by: Vec<OrderSpec>,
    pub(crate) limit_count: Option<usize>,
    pub(crate) offset_count: Option<usize>,
    pub(crate) select_related: Vec<String>,
    pub(crate) prefetch_related: Vec<Prefetch>,
    pub(crate) only_fields: Vec<String>,
    pub(crate) defer_fields: Vec<String>,
    pub(crate) distinct_on: Option<Vec<String>>,
    pub(crate) extra_select: Vec<(String, Expression)>,
    pub(crate) group_by: Vec<String>,
    pub(crate) required_fields: Vec<String>,
    pub(crate) link: Option<ThroughLink>,
    pub(crate) is_none: bool,
    pub(crate) db: DbContext,
}

fn owned(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| (*f).to_string()).collect()
}

fn pairs<K: Into<String>>(values: impl IntoIterator<Item = (K, Value)>) -> Vec<(String, Value)> {
    values.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// The field a `__`-separated path ends at, if it ends at a concrete one.
fn field_at_path(model: &'static ModelMeta, path: &str) -> Option<&'static FieldDef> {
    let mut meta = model;
    let mut segments = path.split(LOOKUP_SEP).peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            return meta.get_field(segment).filter(|f| f.is_concrete());
        }
        meta = meta.relation(segment)?.target_meta();
    }
    None
}

impl QuerySet {
    /// A QuerySet over every row of `model`, resolved against the global
    /// connection registry.
    pub fn new(model: &'static ModelMeta) -> Self {
        Self {
            model,
            filter_clauses: Vec::new(),
            order_by: Vec::new(),
            limit_count: None,
            offset_count: None,
            select_related: Vec::new(),
            prefetch_related: Vec::new(),
            only_fields: Vec::new(),
            defer_fields: Vec::new(),
            distinct_on: None,
            extra_select: Vec::new(),
            group_by: Vec::new(),
            required_fields: Vec::new(),
            link: None,
            is_none: false,
            db: DbContext::global(),
        }
    }

    /// The same query bound to `db`.
    #[must_use]
    pub fn with_db(&self, db: DbContext) -> Self {
        let mut qs = self.clone();
        qs.db = db;
        qs
    }

    /// The queried model.
    pub const fn model(&self) -> &'static ModelMeta {
        self.model
    }

    /// The connection context.
    pub const fn db(&self) -> &DbContext {
        &self.db
    }

    fn refine(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut qs = self.clone();
        f(&mut qs);
        qs
    }

    // ── Builders ─────────────────────────────────────────────────────

    /// Keeps rows matching `q`, ANDed with existing filters.
    #[must_use]
    pub fn filter(&self, q: Q) -> Self {
        if matches!(&q, Q::And(children) if children.is_empty()) {
            return self.clone();
        }
        self.refine(|qs| qs.filter_clauses.push(q))
    }

    /// Drops rows matching `q`.
    #[must_use]
    pub fn exclude(&self, q: Q) -> Self {
        self.refine(|qs| qs.filter_clauses.push(!q))
    }

    /// Keeps rows matching the existing filters OR `q`.
    #[must_use]
    pub fn or_(&self, q: Q) -> Self {
        self.refine(|qs| {
            if qs.filter_clauses.is_empty() {
                qs.filter_clauses.push(q);
            } else {
                let existing = super::lookups::and_(std::mem::take(&mut qs.filter_clauses));
                qs.filter_clauses.push(existing | q);
            }
        })
    }

    /// Same as [`exclude`](Self::exclude).
    #[must_use]
    pub fn not_(&self, q: Q) -> Self {
        self.exclude(q)
    }

    /// Filters by `(lookup, value)` pairs, ANDed.
    #[must_use]
    pub fn filter_kwargs<K: AsRef<str>, V: Into<Value>>(
        &self,
        kwargs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.filter(Q::kwargs(kwargs))
    }

    /// Excludes rows matching all `(lookup, value)` pairs.
    #[must_use]
    pub fn exclude_kwargs<K: AsRef<str>, V: Into<Value>>(
        &self,
        kwargs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.exclude(Q::kwargs(kwargs))
    }

    /// Replaces the ordering. `"-field"` sorts descending.
    #[must_use]
    pub fn order_by(&self, fields: &[&str]) -> Self {
        self.refine(|qs| qs.order_by = fields.iter().map(|f| OrderSpec::parse(f)).collect())
    }

    /// Returns at most `n` rows.
    #[must_use]
    pub fn limit(&self, n: usize) -> Self {
        self.refine(|qs| qs.limit_count = Some(n))
    }

    /// Skips the first `n` rows.
    #[must_use]
    pub fn offset(&self, n: usize) -> Self {
        self.refine(|qs| qs.offset_count = Some(n))
    }

    /// Removes duplicate rows; with fields, keeps one row per distinct
    /// combination of them (`DISTINCT ON`, PostgreSQL only).
    #[must_use]
    pub fn distinct(&self, fields: &[&str]) -> Self {
        self.refine(|qs| qs.distinct_on = Some(owned(fields)))
    }

    /// Groups by the given field paths.
    #[must_use]
    pub fn group_by(&self, fields: &[&str]) -> Self {
        self.refine(|qs| qs.group_by.extend(owned(fields)))
    }

    /// Adds a computed column, readable as an annotation on each instance.
    #[must_use]
    pub fn extra_select(&self, alias: impl Into<String>, expr: Expression) -> Self {
        let alias = alias.into();
        self.refine(|qs| qs.extra_select.push((alias, expr)))
    }

    /// Loads to-one relationships in the same query through joins.
    #[must_use]
    pub fn select_related(&self, paths: &[&str]) -> Self {
        self.refine(|qs| {
            for path in paths {
                if !qs.select_related.iter().any(|p| p == path) {
                    qs.select_related.push((*path).to_string());
                }
            }
        })
    }

    /// Loads relationships with one extra query per directive and level.
    #[must_use]
    pub fn prefetch_related(&self, directives: Vec<Prefetch>) -> Self {
        self.refine(|qs| qs.prefetch_related.extend(directives))
    }

    /// Fetches only these fields (plus the primary key). Related models
    /// take `path__field` entries.
    #[must_use]
    pub fn only(&self, fields: &[&str]) -> Self {
        self.refine(|qs| qs.only_fields.extend(owned(fields)))
    }

    /// Fetches everything except these fields.
    #[must_use]
    pub fn defer(&self, fields: &[&str]) -> Self {
        self.refine(|qs| qs.defer_fields.extend(owned(fields)))
    }

    /// A QuerySet that matches nothing and never hits the database.
    #[must_use]
    pub fn none(&self) -> Self {
        self.refine(|qs| qs.is_none = true)
    }

    /// The same query on another database alias and/or schema.
    #[must_use]
    pub fn using(&self, database: Option<&str>, schema: Option<&str>) -> Self {
        self.refine(|qs| qs.db = qs.db.using(database, schema))
    }

    /// The ordering that applies: explicit, else the model default.
    pub(crate) fn effective_ordering(&self) -> Vec<OrderSpec> {
        if self.order_by.is_empty() {
            self.model.ordering.iter().map(|s| OrderSpec::parse(s)).collect()
        } else {
            self.order_by.clone()
        }
    }

    pub(crate) fn pk_ordering(&self) -> Vec<OrderSpec> {
        self.model
            .pk_names()
            .into_iter()
            .map(|name| OrderSpec {
                path: name.to_string(),
                descending: false,
            })
            .collect()
    }

    // ── Compilation ──────────────────────────────────────────────────

    /// Compiles the query for `backend`.
    pub fn compile(&self, mode: CompileMode, backend: DatabaseBackendType) -> EdgyResult<CompiledQuery> {
        StatementCompiler::new(self, backend).compile(mode)
    }

    /// The SELECT statement `all()` would run on `backend`.
    pub fn compile_sql(&self, backend: DatabaseBackendType) -> EdgyResult<(String, Vec<Value>)> {
        let compiled = self.compile(CompileMode::Select, backend)?;
        Ok(SqlCompiler::new(backend).compile_select(&compiled.query))
    }

    async fn fetch(&self, mode: CompileMode) -> EdgyResult<(Vec<Row>, Projection)> {
        let executor = self.db.executor()?;
        let backend = executor.backend_type();
        let compiled = self.compile(mode, backend)?;
        let (sql, params) = SqlCompiler::new(backend).compile_select(&compiled.query);
        tracing::debug!(sql = %sql, params = params.len(), "query");
        let rows = executor.query(&sql, &params).await?;
        Ok((rows, compiled.projection))
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Every matching instance, with `select_related` and prefetches loaded.
    pub async fn all(&self) -> EdgyResult<Vec<Instance>> {
        async {
            if self.is_none {
                return Ok(Vec::new());
            }
            let (rows, projection) = self.fetch(CompileMode::Select).await?;
            let materializer = Materializer::new(&projection, self.db.clone());
            let mut instances = rows
                .iter()
                .map(|row| materializer.materialize(row))
                .collect::<EdgyResult<Vec<_>>>()?;
            prefetch::prefetch_all(&mut instances, &self.prefetch_related, &self.db).await?;
            Ok(instances)
        }
        .instrument(query_span(self.model.name, "all"))
        .await
    }

    pub(crate) fn all_boxed(&self) -> BoxFuture<'_, EdgyResult<Vec<Instance>>> {
        Box::pin(self.all())
    }

    /// Every matching row converted to `T`.
    pub async fn all_as<T: FromInstance>(&self) -> EdgyResult<Vec<T>> {
        self.all().await?.iter().map(T::from_instance).collect()
    }

    /// The single row matching `q`.
    ///
    /// Fails with [`EdgyError::DoesNotExist`] or
    /// [`EdgyError::MultipleObjectsReturned`].
    pub async fn get(&self, q: Q) -> EdgyResult<Instance> {
        let qs = self.filter(q).limit(2);
        let mut found = qs.all().await?;
        match found.len() {
            0 => Err(EdgyError::DoesNotExist(format!(
                "{} matching query does not exist",
                self.model.name
            ))),
            1 => Ok(found.remove(0)),
            _ => Err(EdgyError::MultipleObjectsReturned(format!(
                "get() returned more than one {}",
                self.model.name
            ))),
        }
    }

    /// Like [`get`](Self::get), but `None` when nothing matches.
    pub async fn get_or_none(&self, q: Q) -> EdgyResult<Option<Instance>> {
        match self.get(q).await {
            Ok(inst) => Ok(Some(inst)),
            Err(EdgyError::DoesNotExist(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The first row by the current ordering (primary key if none).
    pub async fn first(&self) -> EdgyResult<Option<Instance>> {
        let mut qs = self.limit(1);
        if qs.effective_ordering().is_empty() {
            qs.order_by = self.pk_ordering();
        }
        Ok(qs.all().await?.into_iter().next())
    }

    /// The last row by the current ordering (primary key if none).
    pub async fn last(&self) -> EdgyResult<Option<Instance>> {
        if self.limit_count.is_some() || self.offset_count.is_some() {
            return Err(EdgyError::ConfigurationError(
                "last() cannot be used on a sliced QuerySet".to_string(),
            ));
        }
        let mut ordering = self.effective_ordering();
        if ordering.is_empty() {
            ordering = self.pk_ordering();
        }
        if ordering.is_empty() {
            return Err(EdgyError::ConfigurationError(format!(
                "last() on {} needs an order_by(), as the model has no primary key",
                self.model.name
            )));
        }
        let mut qs = self.limit(1);
        qs.order_by = ordering.iter().map(OrderSpec::reversed).collect();
        Ok(qs.all().await?.into_iter().next())
    }

    /// The number of matching rows.
    pub async fn count(&self) -> EdgyResult<usize> {
        async {
            if self.is_none {
                return Ok(0);
            }
            let (rows, _) = self.fetch(CompileMode::Count).await?;
            let n: i64 = rows
                .first()
                .ok_or_else(|| EdgyError::DatabaseError("COUNT returned no row".to_string()))?
                .get_by_index(0)?;
            usize::try_from(n).map_err(|e| EdgyError::DatabaseError(e.to_string()))
        }
        .instrument(query_span(self.model.name, "count"))
        .await
    }

    /// Returns `true` if at least one row matches.
    pub async fn exists(&self) -> EdgyResult<bool> {
        async {
            if self.is_none {
                return Ok(false);
            }
            let (rows, _) = self.fetch(CompileMode::Exists).await?;
            Ok(!rows.is_empty())
        }
        .instrument(query_span(self.model.name, "exists"))
        .await
    }

    /// Matching rows as maps of field path to value. No field names means
    /// every concrete field; `extra_select` aliases are included.
    pub async fn values(&self, fields: &[&str]) -> EdgyResult<Vec<IndexMap<String, Value>>> {
        async {
            if self.is_none {
                return Ok(Vec::new());
            }
            let (rows, projection) = self.fetch(CompileMode::Values(owned(fields))).await?;
            let coercers: Vec<(String, usize, Option<&'static FieldDef>)> = projection
                .values
                .iter()
                .map(|(label, index)| (label.clone(), *index, field_at_path(self.model, label)))
                .collect();
            Ok(rows
                .iter()
                .map(|row| {
                    coercers
                        .iter()
                        .map(|(label, index, field)| {
                            let raw = row.value_at(*index).cloned().unwrap_or(Value::Null);
                            let value = field.map_or_else(|| raw.clone(), |f| f.field_type.coerce(raw.clone()));
                            (label.clone(), value)
                        })
                        .collect()
                })
                .collect())
        }
        .instrument(query_span(self.model.name, "values"))
        .await
    }

    /// Matching rows as tuples ([`Value::List`]), or bare values when
    /// `flat` is set and exactly one field is named.
    pub async fn values_list(&self, fields: &[&str], flat: bool) -> EdgyResult<Vec<Value>> {
        if flat && fields.len() != 1 {
            return Err(EdgyError::ConfigurationError(
                "values_list(flat=true) needs exactly one field".to_string(),
            ));
        }
        let rows = self.values(fields).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut cells: Vec<Value> = row.into_values().collect();
                if flat {
                    cells.swap_remove(0)
                } else {
                    Value::List(cells)
                }
            })
            .collect())
    }

    /// Matching rows keyed by `field` (the primary key by default),
    /// restricted to `ids`.
    pub async fn in_bulk(
        &self,
        ids: Vec<Value>,
        field: Option<&str>,
    ) -> EdgyResult<IndexMap<ValueKey, Instance>> {
        let field = match field {
            Some(name) => self.model.field_or_err(name)?,
            None => self.model.pk_field()?,
        };
        if ids.is_empty() {
            return Ok(IndexMap::new());
        }
        let rows = self
            .filter(Q::filter(field.name, LookupOp::In, Value::List(ids)))
            .all()
            .await?;
        Ok(rows
            .into_iter()
            .map(|inst| {
                let key = inst.values().get(field.name).map_or(ValueKey::Null, Value::key);
                (key, inst)
            })
            .collect())
    }

    /// Streams matching instances as the backend yields rows.
    ///
    /// With prefetch directives, rows are buffered in batches of the
    /// `prefetch_chunk_size` setting and each batch is prefetched with one
    /// query per directive and level.
    pub fn stream(&self) -> EdgyResult<BoxStream<'static, EdgyResult<Instance>>> {
        if self.is_none {
            return Ok(stream::empty().boxed());
        }
        let executor = self.db.executor()?;
        let backend = executor.backend_type();
        let compiled = self.compile(CompileMode::Select, backend)?;
        let (sql, params) = SqlCompiler::new(backend).compile_select(&compiled.query);
        tracing::debug!(sql = %sql, params = params.len(), model = self.model.name, "stream");

        let projection = compiled.projection;
        let db = self.db.clone();
        let instances = executor
            .query_stream(sql, params)
            .map(move |row| Materializer::new(&projection, db.clone()).materialize(&row?));
        if self.prefetch_related.is_empty() {
            return Ok(instances.boxed());
        }

        let chunk = SETTINGS.get_or_default().prefetch_chunk_size.max(1);
        let directives = self.prefetch_related.clone();
        let db = self.db.clone();
        Ok(instances
            .chunks(chunk)
            .then(move |batch| {
                let directives = directives.clone();
                let db = db.clone();
                async move {
                    let mut items = batch.into_iter().collect::<EdgyResult<Vec<_>>>()?;
                    prefetch::prefetch_all(&mut items, &directives, &db).await?;
                    Ok::<_, EdgyError>(items)
                }
            })
            .flat_map(|batch| {
                stream::iter(match batch {
                    Ok(items) => items.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                })
            })
            .boxed())
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Inserts one row and returns it with generated values filled in.
    pub async fn create<K: Into<String>>(
        &self,
        values: impl IntoIterator<Item = (K, Value)>,
    ) -> EdgyResult<Instance> {
        bulk::insert_one(self.model, &self.db, pairs(values))
            .instrument(query_span(self.model.name, "create"))
            .await
    }

    /// Inserts many rows in one statement; returns the number of rows
    /// written. Generated values are not read back.
    pub async fn bulk_create<K: Into<String>>(
        &self,
        rows: Vec<Vec<(K, Value)>>,
    ) -> EdgyResult<u64> {
        let rows = rows.into_iter().map(pairs).collect();
        bulk::insert_many(self.model, &self.db, rows)
            .instrument(query_span(self.model.name, "bulk_create"))
            .await
    }

    /// Updates every matching row; returns the number of rows changed.
    pub async fn update<K: Into<String>>(
        &self,
        values: impl IntoIterator<Item = (K, Value)>,
    ) -> EdgyResult<u64> {
        if self.is_none {
            return Ok(0);
        }
        bulk::update(self, pairs(values))
            .instrument(query_span(self.model.name, "update"))
            .await
    }

    /// Deletes every matching row, applying on-delete rules to dependent
    /// rows; returns the number of rows of this model deleted.
    pub async fn delete(&self) -> EdgyResult<u64> {
        if self.is_none {
            return Ok(0);
        }
        bulk::delete(self)
            .instrument(query_span(self.model.name, "delete"))
            .await
    }

    /// Writes `fields` of each instance back, one statement per instance,
    /// inside one transaction.
    pub async fn bulk_update(&self, instances: &[Instance], fields: &[&str]) -> EdgyResult<u64> {
        bulk::bulk_update(self.model, &self.db, instances, fields)
            .instrument(query_span(self.model.name, "bulk_update"))
            .await
    }

    /// Fetches the row matching `lookups`, creating it from `lookups` plus
    /// `defaults` when missing. The flag is `true` when a row was created.
    ///
    /// A concurrent insert that wins the race is picked up by re-reading.
    pub async fn get_or_create(
        &self,
        lookups: Vec<(String, Value)>,
        defaults: Vec<(String, Value)>,
    ) -> EdgyResult<(Instance, bool)> {
        let q = Q::kwargs(lookups.iter().map(|(k, v)| (k.as_str(), v.clone())));
        match self.get(q.clone()).await {
            Ok(inst) => return Ok((inst, false)),
            Err(EdgyError::DoesNotExist(_)) => {}
            Err(e) => return Err(e),
        }
        let mut values: Vec<(String, Value)> = lookups
            .into_iter()
            .filter(|(k, _)| !k.contains(LOOKUP_SEP))
            .collect();
        for (key, value) in defaults {
            values.retain(|(k, _)| *k != key);
            values.push((key, value));
        }
        match self.create(values).await {
            Ok(inst) => Ok((inst, true)),
            Err(e) if e.is_unique_violation() => Ok((self.get(q).await?, false)),
            Err(e) => Err(e),
        }
    }

    /// Updates the row matching `lookups` with `defaults`, or creates it.
    /// The flag is `true` when a row was created.
    pub async fn update_or_create(
        &self,
        lookups: Vec<(String, Value)>,
        defaults: Vec<(String, Value)>,
    ) -> EdgyResult<(Instance, bool)> {
        let q = Q::kwargs(lookups.iter().map(|(k, v)| (k.as_str(), v.clone())));
        match self.get(q).await {
            Ok(mut inst) => {
                for (key, value) in defaults {
                    inst.set(&key, value)?;
                }
                inst.save().await?;
                Ok((inst, false))
            }
            Err(EdgyError::DoesNotExist(_)) => self.get_or_create(lookups, defaults).await,
            Err(e) => Err(e),
        }
    }

    /// Runs `f` inside a transaction. The QuerySet handed to `f` (and any
    /// QuerySet or instance derived from it) runs on the transaction's
    /// connection. Nested calls become savepoints.
    pub async fn transaction<F, Fut, T>(&self, force_rollback: bool, f: F) -> EdgyResult<T>
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = EdgyResult<T>>,
    {
        let executor = self.db.executor()?;
        let base = self.clone();
        atomic(executor, force_rollback, move |tx| {
            let db = base.db.pinned(tx);
            f(base.with_db(db))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::Model;
    use crate::testing::fixtures::{Album, Track};
    use crate::testing::{row, MockDb};

    fn mocked() -> (Arc<MockDb>, DbContext) {
        let db = Arc::new(MockDb::new());
        let ctx = DbContext::from_executor(db.clone());
        (db, ctx)
    }

    fn track_row(id: i64, title: &str) -> Row {
        row(&[
            ("id", Value::Int(id)),
            ("album", Value::Int(1)),
            ("title", title.into()),
            ("position", Value::Int(id)),
        ])
    }

    #[test]
    fn test_builders_leave_receiver_unchanged() {
        let base = Track::query();
        let refined = base.filter(Q::lookup("position__gt", 1)).limit(3).order_by(&["-title"]);
        assert!(base.filter_clauses.is_empty());
        assert_eq!(base.limit_count, None);
        assert_eq!(refined.limit_count, Some(3));
        assert_eq!(refined.order_by, vec![OrderSpec::parse("-title")]);
    }

    #[test]
    fn test_or_combines_with_existing_filters() {
        let qs = Track::query()
            .filter(Q::lookup("position", 1))
            .filter(Q::lookup("title", "a"))
            .or_(Q::lookup("position", 9));
        let (sql, params) = qs.compile_sql(DatabaseBackendType::SQLite).unwrap();
        assert!(sql.contains(
            "WHERE ((\"tracks\".\"position\" = ? AND \"tracks\".\"title\" = ?) OR \"tracks\".\"position\" = ?)"
        ));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_filter_with_empty_q_is_noop() {
        let qs = Track::query().filter(Q::default());
        assert!(qs.filter_clauses.is_empty());
    }

    #[derive(Clone, Default)]
    struct SpanLog(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for SpanLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_exists_runs_inside_a_query_span() {
        use tracing_subscriber::fmt::format::FmtSpan;

        let log = SpanLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_span_events(FmtSpan::NEW)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (db, ctx) = mocked();
        db.push_rows(vec![row(&[("a", Value::Int(1))])]);
        assert!(Track::query_with(ctx).exists().await.unwrap());
        assert!(db.statements()[0].ends_with("LIMIT 1"));

        let output = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("query{"), "{output}");
        assert!(output.contains("exists"), "{output}");
    }

    #[tokio::test]
    async fn test_none_never_queries() {
        let (db, ctx) = mocked();
        let qs = Track::query_with(ctx).none();
        assert!(qs.all().await.unwrap().is_empty());
        assert_eq!(qs.count().await.unwrap(), 0);
        assert!(!qs.exists().await.unwrap());
        assert_eq!(qs.delete().await.unwrap(), 0);
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_get_multiplicity() {
        let (db, ctx) = mocked();
        let qs = Track::query_with(ctx);

        db.push_rows(vec![]);
        let missing = qs.get(Q::lookup("title", "x")).await.unwrap_err();
        assert!(matches!(missing, EdgyError::DoesNotExist(_)));

        db.push_rows(vec![track_row(1, "a"), track_row(2, "b")]);
        let many = qs.get(Q::lookup("position__gte", 1)).await.unwrap_err();
        assert!(matches!(many, EdgyError::MultipleObjectsReturned(_)));

        db.push_rows(vec![track_row(1, "a")]);
        assert_eq!(qs.get(Q::lookup("id", 1)).await.unwrap().get::<String>("title").unwrap(), "a");

        assert!(db.statements().iter().all(|s| s.ends_with("LIMIT 2")));
    }

    #[tokio::test]
    async fn test_first_and_last_default_to_pk() {
        let (db, ctx) = mocked();
        let qs = Track::query_with(ctx);
        assert!(qs.first().await.unwrap().is_none());
        assert!(qs.last().await.unwrap().is_none());
        let statements = db.statements();
        assert!(statements[0].ends_with("ORDER BY \"tracks\".\"id\" ASC LIMIT 1"));
        assert!(statements[1].ends_with("ORDER BY \"tracks\".\"id\" DESC LIMIT 1"));
        assert!(qs.limit(3).last().await.is_err());
    }

    #[tokio::test]
    async fn test_count_reads_single_cell() {
        let (db, ctx) = mocked();
        db.push_rows(vec![row(&[("count", Value::Int(42))])]);
        assert_eq!(Track::query_with(ctx).count().await.unwrap(), 42);
        assert!(db.statements()[0].starts_with("SELECT COUNT(*)"));
    }

    #[tokio::test]
    async fn test_values_list_flat_needs_one_field() {
        let (db, ctx) = mocked();
        let qs = Album::query_with(ctx);
        assert!(qs.values_list(&["name", "year"], true).await.is_err());
        assert!(db.statements().is_empty());

        db.push_rows(vec![row(&[("name", "Malibu".into())]), row(&[("name", "Oxnard".into())])]);
        let names = qs.values_list(&["name"], true).await.unwrap();
        assert_eq!(names, vec![Value::from("Malibu"), Value::from("Oxnard")]);
    }

    #[tokio::test]
    async fn test_last_without_any_ordering_is_an_error() {
        use crate::fields::{FieldDef, FieldType};
        use std::sync::LazyLock;
        static LOG: LazyLock<ModelMeta> = LazyLock::new(|| {
            ModelMeta::new("AccessLog", "access_log")
                .add_field(FieldDef::new("line", FieldType::TextField))
                .reflected()
        });
        let (db, ctx) = mocked();
        let err = QuerySet::new(&LOG).with_db(ctx).last().await.unwrap_err();
        assert!(err.to_string().contains("needs an order_by()"));
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_validation_happens_before_io() {
        let (db, ctx) = mocked();
        let err = Album::query_with(ctx)
            .select_related(&["tracks"])
            .all()
            .await
            .unwrap_err();
        assert!(matches!(err, EdgyError::ConfigurationError(_)));
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_transaction_pins_queryset() {
        let (db, ctx) = mocked();
        let qs = Track::query_with(ctx);
        qs.transaction(false, |tx| async move {
            assert!(tx.db().is_pinned());
            tx.count().await.map(|_| ())
        })
        .await
        .unwrap_err();
        let statements = db.statements();
        assert_eq!(statements.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(statements.last().map(String::as_str), Some("ROLLBACK"));
    }
}
