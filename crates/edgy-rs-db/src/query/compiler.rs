//! Statement compiler.
//!
//! Turns the state accumulated by a [`QuerySet`] into one relational
//! [`Query`] plus the [`Projection`] the row materializer needs to carve each
//! result row back into instances.
//!
//! A [`JoinPlan`] keyed by relationship path hands out exactly one join (and
//! alias) per path, so filters, ordering, `select_related`, `group_by`,
//! `extra_select` and `distinct` on the same path share it. Only to-one
//! relationships are ever joined: a filter crossing a reverse foreign key or
//! a many-to-many relationship becomes `key IN (subquery)` so parent rows
//! never fan out.
//!
//! Every validation error surfaces here, before any I/O.

use indexmap::IndexMap;

use edgy_rs_core::{EdgyError, EdgyResult};

use super::expressions::Expression;
use super::lookups::{Leaf, LookupOp, Q, LOOKUP_SEP};
use super::prefetch::{self, Prefetch};
use super::queryset::QuerySet;
use super::sql::{
    ColumnRef, DatabaseBackendType, Distinct, FromSource, Join, JoinType, Lookup, OrderBy,
    OrderTarget, Query, SelectColumn, TableRef, WhereNode,
};
use crate::fields::{FieldDef, ThroughTable};
use crate::model::{ModelMeta, RelationInfo};
use crate::value::Value;

/// Output label of the link-table key selected for many-to-many prefetches.
pub(crate) const LINK_LABEL: &str = "__link";
const LINK_ALIAS: &str = "__link";

/// One `order_by` entry: a field path and a direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSpec {
    /// The `__`-separated field path (or an `extra_select` alias).
    pub path: String,
    /// Whether to sort in descending order.
    pub descending: bool,
}

impl OrderSpec {
    /// Parses `"name"` or `"-name"`.
    pub fn parse(spec: &str) -> Self {
        spec.strip_prefix('-').map_or_else(
            || Self {
                path: spec.to_string(),
                descending: false,
            },
            |path| Self {
                path: path.to_string(),
                descending: true,
            },
        )
    }

    /// The same path in the opposite direction.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            path: self.path.clone(),
            descending: !self.descending,
        }
    }
}

/// Restricts a query to rows linked through a many-to-many table.
#[derive(Debug, Clone)]
pub(crate) struct ThroughLink {
    pub(crate) through: ThroughTable,
    pub(crate) remote_column: String,
    pub(crate) keys: Vec<Value>,
}

/// What a compiled statement returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileMode {
    /// Full rows for materialization.
    Select,
    /// A single `COUNT(*)`.
    Count,
    /// At most one constant row.
    Exists,
    /// The named field paths (all concrete fields when empty).
    Values(Vec<String>),
    /// Primary key columns only.
    PkOnly,
}

/// The columns of one model inside a result row.
#[derive(Debug, Clone)]
pub struct ModelProjection {
    /// The model.
    pub meta: &'static ModelMeta,
    /// `(field name, row index)` for every fetched field.
    pub columns: Vec<(&'static str, usize)>,
    /// Whether only a subset of the model's fields is fetched.
    pub partial: bool,
}

/// A model reached through `select_related`.
#[derive(Debug, Clone)]
pub struct RelatedProjection {
    /// Relationship path from the base model.
    pub path: Vec<String>,
    /// Its columns.
    pub model: ModelProjection,
}

/// Where everything lives in a result row.
#[derive(Debug, Clone)]
pub struct Projection {
    /// The queried model.
    pub base: ModelProjection,
    /// Joined models, parents before children.
    pub related: Vec<RelatedProjection>,
    /// `(alias, row index)` of `extra_select` expressions.
    pub extras: Vec<(String, usize)>,
    /// `(label, row index)` for [`CompileMode::Values`].
    pub values: Vec<(String, usize)>,
}

impl Projection {
    fn empty(meta: &'static ModelMeta) -> Self {
        Self {
            base: ModelProjection {
                meta,
                columns: Vec::new(),
                partial: false,
            },
            related: Vec::new(),
            extras: Vec::new(),
            values: Vec::new(),
        }
    }
}

/// A compiled statement and its projection.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    /// The relational query.
    pub query: Query,
    /// How to read its rows.
    pub projection: Projection,
}

fn unknown(meta: &ModelMeta, segment: &str, path: &str) -> EdgyError {
    EdgyError::ConfigurationError(format!(
        "Cannot resolve keyword '{segment}' into field of {} (in '{path}')",
        meta.name
    ))
}

fn column_of(meta: &ModelMeta, name: &str, path: &str) -> EdgyResult<(&'static str, String)> {
    let field = if name == "pk" {
        meta.pk_field()?
    } else {
        meta.get_field(name)
            .filter(|f| f.is_concrete())
            .ok_or_else(|| unknown(meta, name, path))?
    };
    Ok((field.name, field.column.clone()))
}

fn split_path(path: &str) -> Vec<String> {
    path.split(LOOKUP_SEP).map(str::to_string).collect()
}

/// Coerces filter values the way the column will store them.
fn coerce_filter_value(field: &FieldDef, op: LookupOp, value: &Value) -> Value {
    match (op, value) {
        (LookupOp::In | LookupOp::Range, Value::List(items)) => Value::List(
            items
                .iter()
                .map(|v| field.field_type.coerce(v.clone()))
                .collect(),
        ),
        (LookupOp::Exact | LookupOp::Gt | LookupOp::Gte | LookupOp::Lt | LookupOp::Lte, v) => {
            field.field_type.coerce(v.clone())
        }
        (_, v) => v.clone(),
    }
}

#[derive(Debug, Clone)]
struct JoinNode {
    alias: String,
    meta: &'static ModelMeta,
    inner: bool,
}

/// Joins keyed by relationship path, one per distinct path.
#[derive(Debug, Clone)]
pub struct JoinPlan {
    base: &'static ModelMeta,
    base_alias: String,
    schema: Option<String>,
    nodes: IndexMap<String, JoinNode>,
    joins: Vec<Join>,
}

impl JoinPlan {
    /// An empty plan rooted at `base`.
    pub fn new(base: &'static ModelMeta, schema: Option<String>) -> Self {
        Self {
            base,
            base_alias: base.table.to_string(),
            schema,
            nodes: IndexMap::new(),
            joins: Vec::new(),
        }
    }

    /// The alias of the base table.
    pub fn base_alias(&self) -> &str {
        &self.base_alias
    }

    /// The base table reference.
    pub fn base_table(&self) -> TableRef {
        TableRef::new(self.base.table)
            .with_schema(self.schema.as_deref())
            .with_alias(self.base_alias.clone())
    }

    /// The joins added so far, in order.
    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    fn fresh_alias(&self, key: &str) -> String {
        let mut alias = key.to_string();
        let mut n = 1;
        while alias == self.base_alias || self.nodes.values().any(|node| node.alias == alias) {
            alias = format!("{key}_{n}");
            n += 1;
        }
        alias
    }

    /// Walks the to-one relationships in `segments`, joining each path once.
    /// Returns the alias and model at the end of the walk.
    pub fn ensure(
        &mut self,
        segments: &[String],
        purpose: &str,
    ) -> EdgyResult<(String, &'static ModelMeta)> {
        let mut alias = self.base_alias.clone();
        let mut meta = self.base;
        let mut inner = true;
        let mut key = String::new();
        for segment in segments {
            if !key.is_empty() {
                key.push_str(LOOKUP_SEP);
            }
            key.push_str(segment);
            if let Some(node) = self.nodes.get(&key) {
                alias.clone_from(&node.alias);
                meta = node.meta;
                inner = node.inner;
                continue;
            }
            let rel = meta.relation(segment).ok_or_else(|| unknown(meta, segment, &key))?;
            if !rel.kind.is_to_one() {
                return Err(EdgyError::ConfigurationError(format!(
                    "'{key}' crosses the to-many relationship '{segment}' of {}; {purpose} can only follow to-one relationships",
                    meta.name
                )));
            }
            let target = rel.target_meta();
            let join_alias = self.fresh_alias(&key);
            let join_inner = inner && rel.kind.is_forward() && !rel.nullable;
            self.joins.push(Join {
                table: TableRef::new(target.table)
                    .with_schema(self.schema.as_deref())
                    .with_alias(join_alias.clone()),
                join_type: if join_inner {
                    JoinType::Inner
                } else {
                    JoinType::Left
                },
                on: vec![(
                    ColumnRef::new(alias.clone(), rel.local_column.clone()),
                    ColumnRef::new(join_alias.clone(), rel.remote_column.clone()),
                )],
            });
            self.nodes.insert(
                key.clone(),
                JoinNode {
                    alias: join_alias.clone(),
                    meta: target,
                    inner: join_inner,
                },
            );
            alias = join_alias;
            meta = target;
            inner = join_inner;
        }
        Ok((alias, meta))
    }

    /// Resolves a field path to a qualified column, joining as needed.
    pub fn resolve_column(&mut self, path: &str, purpose: &str) -> EdgyResult<ColumnRef> {
        let segments = split_path(path);
        let Some((last, prefix)) = segments.split_last() else {
            return Err(unknown(self.base, path, path));
        };
        let (alias, meta) = self.ensure(prefix, purpose)?;
        let (_, column) = column_of(meta, last, path)?;
        Ok(ColumnRef::new(alias, column))
    }

    /// Compiles a predicate tree.
    pub fn compile_q(&mut self, q: &Q) -> EdgyResult<WhereNode> {
        Ok(match q {
            Q::Filter(leaf) => self.compile_leaf(leaf)?,
            Q::And(children) => WhereNode::And(
                children
                    .iter()
                    .map(|c| self.compile_q(c))
                    .collect::<EdgyResult<_>>()?,
            ),
            Q::Or(children) => WhereNode::Or(
                children
                    .iter()
                    .map(|c| self.compile_q(c))
                    .collect::<EdgyResult<_>>()?,
            ),
            Q::Not(inner) => WhereNode::Not(Box::new(self.compile_q(inner)?)),
        })
    }

    fn compile_leaf(&mut self, leaf: &Leaf) -> EdgyResult<WhereNode> {
        let path = leaf.path_string();
        let mut meta = self.base;
        for (i, segment) in leaf.path.iter().enumerate() {
            let last = i + 1 == leaf.path.len();
            let concrete = segment == "pk" || meta.get_field(segment).is_some_and(FieldDef::is_concrete);
            if last && concrete {
                let (alias, meta) = self.ensure(&leaf.path[..i], "filters")?;
                let (name, column) = column_of(meta, segment, &path)?;
                let value = meta
                    .get_field(name)
                    .map_or_else(|| leaf.value.clone(), |f| coerce_filter_value(f, leaf.op, &leaf.value));
                return Ok(WhereNode::Condition {
                    column: ColumnRef::new(alias, column),
                    lookup: leaf.op.to_sql(&value, &path)?,
                });
            }
            let rel = meta.relation(segment).ok_or_else(|| unknown(meta, segment, &path))?;
            if rel.kind.is_to_one() && !last {
                meta = rel.target_meta();
                continue;
            }
            let (alias, _) = self.ensure(&leaf.path[..i], "filters")?;
            return self.related_subquery(&alias, &rel, &leaf.path[i + 1..], leaf, &path);
        }
        Err(unknown(self.base, &path, &path))
    }

    /// `local IN (SELECT remote FROM related WHERE ...)` for a leaf crossing
    /// a to-many (or reverse one-to-one) relationship.
    fn related_subquery(
        &self,
        alias: &str,
        rel: &RelationInfo,
        rest: &[String],
        leaf: &Leaf,
        path: &str,
    ) -> EdgyResult<WhereNode> {
        let target = rel.target_meta();
        let mut sub_plan = Self::new(target, self.schema.clone());
        let null_check = rest.is_empty() && leaf.op == LookupOp::IsNull;
        let condition = if null_check {
            None
        } else {
            let sub_path = if rest.is_empty() {
                vec![target.pk_field()?.name.to_string()]
            } else {
                rest.to_vec()
            };
            let sub_leaf = Leaf {
                path: sub_path,
                op: leaf.op,
                value: leaf.value.clone(),
            };
            Some(sub_plan.compile_leaf(&sub_leaf)?)
        };
        let negated = if null_check {
            match leaf.op.to_sql(&leaf.value, path)? {
                Lookup::IsNull(flag) => flag,
                _ => false,
            }
        } else {
            false
        };

        let mut sub = Query::new(sub_plan.base_table());
        let target_alias = sub_plan.base_alias().to_string();
        let key = if let Some(through) = &rel.through {
            sub.joins.push(Join {
                table: TableRef::new(through.table).with_schema(self.schema.as_deref()),
                join_type: JoinType::Inner,
                on: vec![(
                    ColumnRef::new(through.table, through.target_column),
                    ColumnRef::new(target_alias, rel.remote_column.clone()),
                )],
            });
            ColumnRef::new(through.table, through.source_column)
        } else {
            ColumnRef::new(target_alias, rel.remote_column.clone())
        };
        sub.joins.extend(sub_plan.joins.iter().cloned());
        sub.select = vec![SelectColumn::Column(key.clone(), None)];
        sub.add_where(WhereNode::Condition {
            column: key,
            lookup: Lookup::IsNull(false),
        });
        if let Some(condition) = condition {
            sub.add_where(condition);
        }
        Ok(WhereNode::InSubquery {
            column: ColumnRef::new(alias, rel.local_column.clone()),
            query: Box::new(sub),
            negated,
        })
    }
}

/// Expands `["album__studio"]` into `["album", "album__studio"]`.
/// Fields of the model at `prefix` that prefetch directives read keys
/// from: the local side of every hop that starts at `prefix`.
fn prefetch_keys(meta: &'static ModelMeta, prefix: &str, directives: &[Prefetch]) -> Vec<&'static str> {
    let mut keys = Vec::new();
    for directive in directives {
        let segments: Vec<&str> = directive.related_name.split(LOOKUP_SEP).collect();
        for (i, segment) in segments.iter().enumerate() {
            if segments[..i].join(LOOKUP_SEP) != prefix {
                continue;
            }
            if let Some(rel) = meta.relation(segment) {
                if !keys.contains(&rel.local_field) {
                    keys.push(rel.local_field);
                }
            }
        }
    }
    keys
}

fn expand_paths(paths: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for path in paths {
        let mut key = String::new();
        for segment in path.split(LOOKUP_SEP) {
            if !key.is_empty() {
                key.push_str(LOOKUP_SEP);
            }
            key.push_str(segment);
            if !out.contains(&key) {
                out.push(key.clone());
            }
        }
    }
    out
}

/// Compiles one QuerySet.
pub struct StatementCompiler<'a> {
    qs: &'a QuerySet,
    backend: DatabaseBackendType,
    plan: JoinPlan,
}

impl<'a> StatementCompiler<'a> {
    /// A compiler for `qs` targeting `backend`.
    pub fn new(qs: &'a QuerySet, backend: DatabaseBackendType) -> Self {
        Self {
            qs,
            backend,
            plan: JoinPlan::new(qs.model, qs.db.schema()),
        }
    }

    /// Validates the QuerySet and compiles it in `mode`.
    pub fn compile(mut self, mode: CompileMode) -> EdgyResult<CompiledQuery> {
        let qs = self.qs;
        self.validate()?;

        let mut query = Query::new(self.plan.base_table());
        for clause in &qs.filter_clauses {
            if !clause.is_empty() || matches!(clause, Q::Or(_)) {
                let node = self.plan.compile_q(clause)?;
                query.add_where(node);
            }
        }

        let mut projection = Projection::empty(qs.model);
        match mode {
            CompileMode::Select => {
                self.select_models(&mut query, &mut projection)?;
                self.select_extras(&mut query, &mut projection)?;
                self.apply_link(&mut query, &mut projection);
                self.apply_shape(&mut query, true)?;
            }
            CompileMode::Values(fields) => {
                self.select_values(&mut query, &mut projection, &fields)?;
                self.select_extras(&mut query, &mut projection)?;
                self.apply_shape(&mut query, true)?;
            }
            CompileMode::PkOnly => {
                let base_alias = self.plan.base_alias().to_string();
                for field in qs.model.pk_fields() {
                    query.select.push(SelectColumn::Column(
                        ColumnRef::new(base_alias.clone(), field.column.clone()),
                        Some(field.name.to_string()),
                    ));
                }
                self.apply_shape(&mut query, true)?;
            }
            CompileMode::Exists => {
                query.select = vec![SelectColumn::Expression(Expression::raw("1", Vec::new()), "one".into())];
                self.apply_shape(&mut query, false)?;
                query.limit = Some(query.limit.map_or(1, |l| l.min(1)));
            }
            CompileMode::Count => {
                query = self.count_query(query)?;
            }
        }
        query.joins = self.plan.joins().to_vec();
        if let FromSource::Subquery(inner, _) = &mut query.from {
            inner.joins.clone_from(&query.joins);
            query.joins.clear();
        }
        Ok(CompiledQuery { query, projection })
    }

    fn validate(&self) -> EdgyResult<()> {
        let qs = self.qs;
        if !qs.only_fields.is_empty() && !qs.defer_fields.is_empty() {
            return Err(EdgyError::ConfigurationError(format!(
                "only() and defer() cannot be combined on {}",
                qs.model.name
            )));
        }
        if let Some(cols) = &qs.distinct_on {
            if !cols.is_empty() && !self.backend.supports_distinct_on() {
                return Err(EdgyError::ConfigurationError(format!(
                    "distinct({}) needs DISTINCT ON, which {:?} does not support",
                    cols.join(", "),
                    self.backend
                )));
            }
        }
        // Resolve on a scratch plan so modes that never select related models
        // don't pick up their joins.
        let mut trial_plan = self.plan.clone();
        for path in &qs.select_related {
            trial_plan.ensure(&split_path(path), "select_related")?;
        }
        let related = expand_paths(&qs.select_related);
        for entry in qs.only_fields.iter().chain(&qs.defer_fields) {
            let (prefix, name) = entry.rsplit_once(LOOKUP_SEP).unwrap_or(("", entry.as_str()));
            let meta = if prefix.is_empty() {
                qs.model
            } else if related.iter().any(|p| p == prefix) {
                trial_plan.ensure(&split_path(prefix), "select_related")?.1
            } else {
                return Err(EdgyError::ConfigurationError(format!(
                    "'{entry}' refers to '{prefix}', which is not in select_related()"
                )));
            };
            column_of(meta, name, entry)?;
        }
        prefetch::validate(qs.model, &qs.prefetch_related)?;
        Ok(())
    }

    /// The fields of the model at `prefix` that the query fetches.
    fn selected_fields(&self, meta: &'static ModelMeta, prefix: &str) -> (Vec<&'static FieldDef>, bool) {
        let qs = self.qs;
        let entries = |list: &[String]| -> Vec<String> {
            list.iter()
                .filter_map(|entry| {
                    let (p, name) = entry.rsplit_once(LOOKUP_SEP).unwrap_or(("", entry.as_str()));
                    (p == prefix).then(|| {
                        if name == "pk" {
                            meta.pk_names().into_iter().map(str::to_string).collect()
                        } else {
                            vec![name.to_string()]
                        }
                    })
                })
                .flatten()
                .collect()
        };
        let only = entries(&qs.only_fields);
        let defer = entries(&qs.defer_fields);
        let mut required: Vec<&str> = if prefix.is_empty() {
            qs.required_fields.iter().map(String::as_str).collect()
        } else {
            Vec::new()
        };
        required.extend(prefetch_keys(meta, prefix, &qs.prefetch_related));
        let fields: Vec<&'static FieldDef> = meta
            .concrete_fields()
            .filter(|f| {
                f.primary_key
                    || required.contains(&f.name)
                    || if only.is_empty() {
                        !defer.iter().any(|d| d == f.name)
                    } else {
                        only.iter().any(|o| o == f.name)
                    }
            })
            .collect();
        (fields, !only.is_empty() || !defer.is_empty())
    }

    fn model_columns(
        &self,
        query: &mut Query,
        meta: &'static ModelMeta,
        alias: &str,
        prefix: &str,
    ) -> ModelProjection {
        let (fields, partial) = self.selected_fields(meta, prefix);
        let mut columns = Vec::with_capacity(fields.len());
        for field in fields {
            let label = if prefix.is_empty() {
                field.name.to_string()
            } else {
                format!("{prefix}{LOOKUP_SEP}{}", field.name)
            };
            columns.push((field.name, query.select.len()));
            query.select.push(SelectColumn::Column(
                ColumnRef::new(alias, field.column.clone()),
                Some(label),
            ));
        }
        ModelProjection {
            meta,
            columns,
            partial,
        }
    }

    fn select_models(&mut self, query: &mut Query, projection: &mut Projection) -> EdgyResult<()> {
        let base_alias = self.plan.base_alias().to_string();
        projection.base = self.model_columns(query, self.qs.model, &base_alias, "");
        for path in expand_paths(&self.qs.select_related) {
            let segments = split_path(&path);
            let (alias, meta) = self.plan.ensure(&segments, "select_related")?;
            let model = self.model_columns(query, meta, &alias, &path);
            projection.related.push(RelatedProjection {
                path: segments,
                model,
            });
        }
        Ok(())
    }

    fn select_values(
        &mut self,
        query: &mut Query,
        projection: &mut Projection,
        fields: &[String],
    ) -> EdgyResult<()> {
        let paths: Vec<String> = if fields.is_empty() {
            self.qs
                .model
                .concrete_fields()
                .map(|f| f.name.to_string())
                .collect()
        } else {
            fields.to_vec()
        };
        for path in paths {
            let column = self.plan.resolve_column(&path, "values()")?;
            projection.values.push((path.clone(), query.select.len()));
            query.select.push(SelectColumn::Column(column, Some(path)));
        }
        Ok(())
    }

    fn select_extras(&mut self, query: &mut Query, projection: &mut Projection) -> EdgyResult<()> {
        let qs = self.qs;
        for (alias, expr) in &qs.extra_select {
            let plan = &mut self.plan;
            let resolved = expr.resolve(&mut |path: &str| plan.resolve_column(path, "extra_select"))?;
            let index = query.select.len();
            query.select.push(SelectColumn::Expression(resolved, alias.clone()));
            projection.extras.push((alias.clone(), index));
            if !projection.values.is_empty() {
                projection.values.push((alias.clone(), index));
            }
        }
        Ok(())
    }

    fn apply_link(&mut self, query: &mut Query, projection: &mut Projection) {
        let Some(link) = &self.qs.link else {
            return;
        };
        let base_alias = self.plan.base_alias().to_string();
        let key = ColumnRef::new(LINK_ALIAS, link.through.source_column);
        self.plan.joins.push(Join {
            table: TableRef::new(link.through.table)
                .with_schema(self.plan.schema.as_deref())
                .with_alias(LINK_ALIAS),
            join_type: JoinType::Inner,
            on: vec![(
                ColumnRef::new(LINK_ALIAS, link.through.target_column),
                ColumnRef::new(base_alias, link.remote_column.clone()),
            )],
        });
        query.add_where(WhereNode::Condition {
            column: key.clone(),
            lookup: Lookup::In(link.keys.clone()),
        });
        projection.extras.push((LINK_LABEL.to_string(), query.select.len()));
        query.select.push(SelectColumn::Column(key, Some(LINK_LABEL.to_string())));
    }

    /// The effective ordering: explicit, else the model default.
    fn ordering(&self) -> Vec<OrderSpec> {
        if self.qs.order_by.is_empty() {
            self.qs.model.ordering.iter().map(|s| OrderSpec::parse(s)).collect()
        } else {
            self.qs.order_by.clone()
        }
    }

    /// Ordering, distinct, grouping and slicing.
    fn apply_shape(&mut self, query: &mut Query, with_order: bool) -> EdgyResult<()> {
        let qs = self.qs;
        if with_order {
            for spec in self.ordering() {
                let target = if qs.extra_select.iter().any(|(alias, _)| *alias == spec.path) {
                    OrderTarget::Alias(spec.path.clone())
                } else {
                    OrderTarget::Column(self.plan.resolve_column(&spec.path, "order_by")?)
                };
                query.order_by.push(OrderBy {
                    target,
                    descending: spec.descending,
                });
            }
        }
        query.distinct = match &qs.distinct_on {
            None => Distinct::None,
            Some(cols) if cols.is_empty() => Distinct::All,
            Some(cols) => Distinct::On(
                cols.iter()
                    .map(|c| self.plan.resolve_column(c, "distinct"))
                    .collect::<EdgyResult<_>>()?,
            ),
        };
        for path in &qs.group_by {
            let column = self.plan.resolve_column(path, "group_by")?;
            query.group_by.push(column);
        }
        query.limit = qs.limit_count;
        query.offset = qs.offset_count;
        Ok(())
    }

    fn count_query(&mut self, mut query: Query) -> EdgyResult<Query> {
        let qs = self.qs;
        let count = SelectColumn::Expression(Expression::count_all(), "count".into());
        let needs_subquery = qs.limit_count.is_some()
            || qs.offset_count.is_some()
            || qs.distinct_on.is_some()
            || !qs.group_by.is_empty();
        if !needs_subquery {
            query.select = vec![count];
            return Ok(query);
        }
        let base_alias = self.plan.base_alias().to_string();
        query.select = qs
            .model
            .pk_fields()
            .into_iter()
            .map(|f| SelectColumn::Column(ColumnRef::new(base_alias.clone(), f.column.clone()), None))
            .collect();
        self.apply_shape(&mut query, qs.limit_count.is_some() || qs.offset_count.is_some())?;
        if !query.group_by.is_empty() {
            query.select = query
                .group_by
                .iter()
                .map(|c| SelectColumn::Column(c.clone(), None))
                .collect();
        }
        let mut outer = Query::from_source(FromSource::Subquery(Box::new(query), "counted".into()));
        outer.select = vec![count];
        Ok(outer)
    }
}
