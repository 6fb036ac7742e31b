//! Write operations.
//!
//! Inserts validate their values against the model before any statement
//! runs and read generated values back with `RETURNING`. Updates and
//! deletes reuse the QuerySet's filters: a plain filter becomes the
//! statement's WHERE clause directly, anything needing joins or slicing is
//! narrowed through `pk IN (subquery)`.
//!
//! Deletes run inside one transaction and walk every relationship that
//! points at the deleted rows:
//!
//! - `CASCADE` deletes the referencing rows (recursively).
//! - `RESTRICT`/`PROTECT` aborts with an integrity error if any exist.
//! - `SET NULL`/`SET DEFAULT` rewrites their foreign key.
//! - Many-to-many link rows are removed.

use std::collections::{HashMap, HashSet};

use futures::future::BoxFuture;

use edgy_rs_core::{ConstraintKind, EdgyError, EdgyResult, ValidationError};

use super::compiler::CompileMode;
use super::expressions::Expression;
use super::queryset::QuerySet;
use super::sql::{ColumnRef, Distinct, Lookup, Query, Row, SelectColumn, SqlCompiler, TableRef, WhereNode};
use crate::connections::DbContext;
use crate::fields::{FieldDef, OnDelete};
use crate::instance::Instance;
use crate::model::{ModelMeta, RelationKind};
use crate::query::materializer::attach_stubs;
use crate::transactions::atomic;
use crate::value::{Value, ValueKey};

fn table_ref(meta: &ModelMeta, db: &DbContext) -> TableRef {
    TableRef::new(meta.table).with_schema(db.schema().as_deref())
}

fn field_for_key<'m>(meta: &'m ModelMeta, key: &str) -> EdgyResult<&'m FieldDef> {
    let field = if key == "pk" {
        meta.pk_field()?
    } else {
        meta.field_or_err(key)?
    };
    if !field.is_concrete() {
        return Err(EdgyError::ConfigurationError(format!(
            "'{key}' of {} is a many-to-many relation; it has no column to write",
            meta.name
        )));
    }
    Ok(field)
}

/// Records a validation failure of `value` for `field` into `errors`.
fn check_value(field: &FieldDef, value: &Value, errors: &mut ValidationError) {
    if value.is_null() && !field.null && !field.is_auto() {
        errors.merge(ValidationError::for_field(
            field.name,
            ValidationError::new("This field cannot be null.", "null"),
        ));
    }
    if let (Some(max), Value::String(s)) = (field.max_length, value) {
        let len = s.chars().count();
        if len > max {
            errors.merge(ValidationError::for_field(
                field.name,
                ValidationError::new(
                    format!("Ensure this value has at most {max} characters (it has {len})."),
                    "max_length",
                )
                .with_param("max_length", max.to_string()),
            ));
        }
    }
}

/// Validates and completes the values of one insert.
///
/// Unknown names are configuration errors; missing required fields, NULLs
/// in non-null fields and over-long strings are collected into one
/// [`ValidationError`]. Declared defaults fill the gaps.
pub(crate) fn prepare_insert(
    meta: &'static ModelMeta,
    values: Vec<(String, Value)>,
) -> EdgyResult<Vec<(&'static FieldDef, Value)>> {
    let mut given: HashMap<&'static str, Value> = HashMap::new();
    for (key, value) in values {
        let field = field_for_key(meta, &key)?;
        given.insert(field.name, field.field_type.coerce(value));
    }

    let mut errors = ValidationError::with_field_errors(HashMap::new());
    let mut prepared = Vec::new();
    for field in meta.concrete_fields() {
        let value = match given.remove(field.name) {
            Some(value) => value,
            None => match &field.default {
                Some(default) => default.clone(),
                None if field.is_optional_on_insert() => continue,
                None => {
                    errors.merge(ValidationError::for_field(
                        field.name,
                        ValidationError::new("This field is required.", "required"),
                    ));
                    continue;
                }
            },
        };
        if value.is_null() && field.is_auto() {
            continue;
        }
        check_value(field, &value, &mut errors);
        prepared.push((field, value));
    }
    if errors.is_empty() {
        Ok(prepared)
    } else {
        Err(errors.into())
    }
}

/// Builds an instance from a row returned by `RETURNING` every concrete
/// column.
fn returned_instance(meta: &'static ModelMeta, db: &DbContext, row: &Row) -> Instance {
    let mut inst = Instance::new(meta, db.clone());
    for (index, field) in meta.concrete_fields().enumerate() {
        let raw = row.value_at(index).cloned().unwrap_or(Value::Null);
        inst.insert_raw(field.name, field.field_type.coerce(raw));
    }
    attach_stubs(&mut inst);
    inst
}

async fn insert_rows(
    meta: &'static ModelMeta,
    db: &DbContext,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
) -> EdgyResult<Vec<Instance>> {
    let executor = db.executor()?;
    let returning: Vec<String> = meta.concrete_fields().map(|f| f.column.clone()).collect();
    let (sql, params) = SqlCompiler::new(executor.backend_type()).compile_insert(
        &table_ref(meta, db),
        &columns,
        &rows,
        &returning,
    );
    tracing::debug!(sql = %sql, params = params.len(), rows = rows.len(), "insert");
    let returned = executor.query(&sql, &params).await?;
    Ok(returned.iter().map(|row| returned_instance(meta, db, row)).collect())
}

/// Inserts one row and returns it as stored.
pub(crate) async fn insert_one(
    meta: &'static ModelMeta,
    db: &DbContext,
    values: Vec<(String, Value)>,
) -> EdgyResult<Instance> {
    meta.ensure_writable("create")?;
    let prepared = prepare_insert(meta, values)?;
    let columns = prepared.iter().map(|(f, _)| f.column.clone()).collect();
    let row = prepared.into_iter().map(|(_, v)| v).collect();
    insert_rows(meta, db, columns, vec![row])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| EdgyError::DatabaseError(format!("INSERT into {} returned no row", meta.table)))
}

/// Inserts every row in one statement and returns the number of rows
/// written. Rows are validated before anything is sent, and all rows must
/// end up setting the same columns.
pub(crate) async fn insert_many(
    meta: &'static ModelMeta,
    db: &DbContext,
    rows: Vec<Vec<(String, Value)>>,
) -> EdgyResult<u64> {
    meta.ensure_writable("bulk_create")?;
    if rows.is_empty() {
        return Ok(0);
    }
    let count = rows.len();
    let mut columns: Option<Vec<String>> = None;
    let mut values = Vec::with_capacity(count);
    for row in rows {
        let prepared = prepare_insert(meta, row)?;
        let row_columns: Vec<String> = prepared.iter().map(|(f, _)| f.column.clone()).collect();
        match &columns {
            Some(expected) if *expected != row_columns => {
                return Err(EdgyError::ConfigurationError(format!(
                    "bulk_create rows for {} must all set the same fields",
                    meta.name
                )));
            }
            Some(_) => {}
            None => columns = Some(row_columns),
        }
        values.push(prepared.into_iter().map(|(_, v)| v).collect::<Vec<Value>>());
    }
    let columns = columns.unwrap_or_default();
    let executor = db.executor()?;
    let compiler = SqlCompiler::new(executor.backend_type());
    let table = table_ref(meta, db);
    if columns.is_empty() {
        // DEFAULT VALUES inserts a single row.
        let (sql, params) = compiler.compile_insert(&table, &columns, &[], &[]);
        let mut written = 0;
        for _ in 0..count {
            written += executor.execute_sql(&sql, &params).await?;
        }
        return Ok(written);
    }
    let (sql, params) = compiler.compile_insert(&table, &columns, &values, &[]);
    tracing::debug!(sql = %sql, params = params.len(), rows = count, "bulk insert");
    executor.execute_sql(&sql, &params).await
}

/// The WHERE clause selecting exactly the rows of `qs`.
fn write_filter(qs: &QuerySet, compiler: &SqlCompiler) -> EdgyResult<Option<WhereNode>> {
    let compiled = qs.compile(CompileMode::PkOnly, compiler.backend())?;
    let mut query = compiled.query;
    let direct = query.joins.is_empty()
        && query.limit.is_none()
        && query.offset.is_none()
        && query.distinct == Distinct::None;
    if direct {
        return Ok(query.where_clause);
    }
    let pk = qs.model.pk_field()?;
    query.select = vec![SelectColumn::Column(
        ColumnRef::new(qs.model.table, pk.column.clone()),
        None,
    )];
    Ok(Some(WhereNode::InSubquery {
        column: ColumnRef::new(qs.model.table, pk.column.clone()),
        query: Box::new(query),
        negated: false,
    }))
}

/// Updates every row of `qs`.
pub(crate) async fn update(qs: &QuerySet, values: Vec<(String, Value)>) -> EdgyResult<u64> {
    let meta = qs.model;
    meta.ensure_writable("update")?;
    if values.is_empty() {
        return Ok(0);
    }
    let mut errors = ValidationError::with_field_errors(HashMap::new());
    let mut assignments = Vec::with_capacity(values.len());
    for (key, value) in values {
        let field = field_for_key(meta, &key)?;
        let value = field.field_type.coerce(value);
        check_value(field, &value, &mut errors);
        assignments.push((field.column.clone(), value));
    }
    if !errors.is_empty() {
        return Err(errors.into());
    }

    let executor = qs.db.executor()?;
    let compiler = SqlCompiler::new(executor.backend_type());
    let filter = write_filter(qs, &compiler)?;
    let (sql, params) = compiler.compile_update(&table_ref(meta, &qs.db), &assignments, filter.as_ref());
    tracing::debug!(sql = %sql, params = params.len(), "update");
    executor.execute_sql(&sql, &params).await
}

fn pk_filter(meta: &ModelMeta, inst: &Instance) -> EdgyResult<WhereNode> {
    let mut nodes = Vec::new();
    for field in meta.pk_fields() {
        let value = inst.get_value(field.name)?;
        if value.is_null() {
            return Err(EdgyError::ConfigurationError(format!(
                "{} instance has no primary key value for '{}'",
                meta.name, field.name
            )));
        }
        nodes.push(WhereNode::Condition {
            column: ColumnRef::new(meta.table, field.column.clone()),
            lookup: Lookup::Exact(value.clone()),
        });
    }
    Ok(WhereNode::And(nodes))
}

/// Writes `fields` of every instance, one UPDATE each, in one transaction.
pub(crate) async fn bulk_update(
    meta: &'static ModelMeta,
    db: &DbContext,
    instances: &[Instance],
    fields: &[&str],
) -> EdgyResult<u64> {
    meta.ensure_writable("bulk_update")?;
    let fields: Vec<&FieldDef> = fields
        .iter()
        .map(|name| field_for_key(meta, name))
        .collect::<EdgyResult<_>>()?;
    if let Some(pk) = fields.iter().find(|f| f.primary_key) {
        return Err(EdgyError::ConfigurationError(format!(
            "bulk_update cannot change the primary key field '{}'",
            pk.name
        )));
    }
    if instances.is_empty() || fields.is_empty() {
        return Ok(0);
    }
    if let Some(stranger) = instances.iter().find(|i| !std::ptr::eq(i.meta(), meta)) {
        return Err(EdgyError::ConfigurationError(format!(
            "bulk_update on {} got an instance of {}",
            meta.name,
            stranger.meta().name
        )));
    }

    let executor = db.executor()?;
    let table = table_ref(meta, db);
    atomic(executor, false, |tx| async move {
        let compiler = SqlCompiler::new(tx.backend_type());
        let mut total = 0;
        for inst in instances {
            let mut errors = ValidationError::with_field_errors(HashMap::new());
            let mut assignments = Vec::with_capacity(fields.len());
            for field in &fields {
                let value = inst.get_value(field.name)?.clone();
                check_value(field, &value, &mut errors);
                assignments.push((field.column.clone(), value));
            }
            if !errors.is_empty() {
                return Err(errors.into());
            }
            let filter = pk_filter(meta, inst)?;
            let (sql, params) = compiler.compile_update(&table, &assignments, Some(&filter));
            total += tx.execute_sql(&sql, &params).await?;
        }
        Ok::<_, EdgyError>(total)
    })
    .await
}

/// Deletes every row of `qs` and applies on-delete rules, atomically.
pub(crate) async fn delete(qs: &QuerySet) -> EdgyResult<u64> {
    qs.model.ensure_writable("delete")?;
    let executor = qs.db.executor()?;
    let compiler = SqlCompiler::new(executor.backend_type());
    let filter = write_filter(qs, &compiler)?;
    let base = qs.db.clone();
    atomic(executor, false, move |tx| async move {
        let db = base.pinned(tx);
        let mut seen = HashSet::new();
        delete_rows(qs.model, &db, filter, &mut seen).await
    })
    .await
}

async fn select_pks(
    meta: &'static ModelMeta,
    db: &DbContext,
    filter: Option<WhereNode>,
) -> EdgyResult<Vec<Value>> {
    let executor = db.executor()?;
    let pk = meta.pk_field()?;
    let mut query = Query::new(table_ref(meta, db));
    query.select = vec![SelectColumn::Column(ColumnRef::new(meta.table, pk.column.clone()), None)];
    query.where_clause = filter;
    let (sql, params) = SqlCompiler::new(executor.backend_type()).compile_select(&query);
    let rows = executor.query(&sql, &params).await?;
    Ok(rows
        .iter()
        .map(|row| pk.field_type.coerce(row.value_at(0).cloned().unwrap_or(Value::Null)))
        .collect())
}

async fn any_rows(meta: &'static ModelMeta, db: &DbContext, filter: WhereNode) -> EdgyResult<bool> {
    let executor = db.executor()?;
    let mut query = Query::new(table_ref(meta, db));
    query.select = vec![SelectColumn::Expression(Expression::raw("1", Vec::new()), "one".into())];
    query.where_clause = Some(filter);
    query.limit = Some(1);
    let (sql, params) = SqlCompiler::new(executor.backend_type()).compile_select(&query);
    Ok(!executor.query(&sql, &params).await?.is_empty())
}

async fn execute(db: &DbContext, sql: &str, params: &[Value]) -> EdgyResult<u64> {
    tracing::debug!(sql = %sql, params = params.len(), "delete collector");
    db.executor()?.execute_sql(sql, params).await
}

/// Deletes the rows of `meta` matching `filter` after handling everything
/// that references them. Returns the number of `meta` rows deleted.
fn delete_rows<'a>(
    meta: &'static ModelMeta,
    db: &'a DbContext,
    filter: Option<WhereNode>,
    seen: &'a mut HashSet<(&'static str, ValueKey)>,
) -> BoxFuture<'a, EdgyResult<u64>> {
    Box::pin(async move {
        let executor = db.executor()?;
        let compiler = SqlCompiler::new(executor.backend_type());
        let table = table_ref(meta, db);
        let dependents: Vec<_> = meta
            .relations()
            .into_iter()
            .filter(|rel| !rel.kind.is_forward() || rel.kind == RelationKind::ManyToMany)
            .collect();

        if dependents.is_empty() {
            let (sql, params) = compiler.compile_delete(&table, filter.as_ref());
            return execute(db, &sql, &params).await;
        }

        let pks: Vec<Value> = select_pks(meta, db, filter)
            .await?
            .into_iter()
            .filter(|pk| seen.insert((meta.table, pk.key())))
            .collect();
        if pks.is_empty() {
            return Ok(0);
        }

        for rel in dependents {
            if let Some(through) = rel.through {
                let link = WhereNode::Condition {
                    column: ColumnRef::new(through.table, through.source_column),
                    lookup: Lookup::In(pks.clone()),
                };
                let link_table = TableRef::new(through.table).with_schema(db.schema().as_deref());
                let (sql, params) = compiler.compile_delete(&link_table, Some(&link));
                execute(db, &sql, &params).await?;
                continue;
            }
            let child = rel.target_meta();
            let referencing = WhereNode::Condition {
                column: ColumnRef::new(child.table, rel.remote_column.clone()),
                lookup: Lookup::In(pks.clone()),
            };
            match rel.on_delete {
                OnDelete::Cascade => {
                    delete_rows(child, db, Some(referencing), seen).await?;
                }
                OnDelete::Restrict | OnDelete::Protect => {
                    if any_rows(child, db, referencing).await? {
                        return Err(EdgyError::integrity(
                            ConstraintKind::Restrict,
                            format!(
                                "Cannot delete {}: it is still referenced by {}.{}",
                                meta.name, child.name, rel.remote_field
                            ),
                        ));
                    }
                }
                OnDelete::SetNull | OnDelete::SetDefault => {
                    let value = match (rel.on_delete, child.get_field(rel.remote_field)) {
                        (OnDelete::SetDefault, Some(field)) => field.default.clone().unwrap_or(Value::Null),
                        _ => Value::Null,
                    };
                    let (sql, params) = compiler.compile_update(
                        &table_ref(child, db),
                        &[(rel.remote_column.clone(), value)],
                        Some(&referencing),
                    );
                    execute(db, &sql, &params).await?;
                }
                OnDelete::DoNothing => {}
            }
        }

        let pk = meta.pk_field()?;
        let own = WhereNode::Condition {
            column: ColumnRef::new(meta.table, pk.column.clone()),
            lookup: Lookup::In(pks),
        };
        let (sql, params) = compiler.compile_delete(&table, Some(&own));
        execute(db, &sql, &params).await
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::Model;
    use crate::testing::fixtures::{Album, Studio, Track};
    use crate::testing::{row, MockDb};

    fn mocked() -> (Arc<MockDb>, DbContext) {
        let db = Arc::new(MockDb::new());
        let ctx = DbContext::from_executor(db.clone());
        (db, ctx)
    }

    fn kv(pairs: &[(&str, Value)]) -> Vec<(String, Value)> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_prepare_insert_collects_field_errors() {
        let err = prepare_insert(Track::meta(), kv(&[("title", Value::from("x".repeat(101)))])).unwrap_err();
        let EdgyError::ValidationError(v) = err else {
            panic!("expected a validation error, got {err:?}");
        };
        assert_eq!(v.field_errors["album"][0].code, "required");
        assert_eq!(v.field_errors["position"][0].code, "required");
        assert_eq!(v.field_errors["title"][0].code, "max_length");
        assert_eq!(v.field_errors["title"][0].params["max_length"], "100");
    }

    #[test]
    fn test_prepare_insert_rejects_unknown_and_m2m() {
        assert!(matches!(
            prepare_insert(Album::meta(), kv(&[("nmae", Value::from("x"))])),
            Err(EdgyError::ConfigurationError(_))
        ));
        assert!(matches!(
            prepare_insert(crate::testing::fixtures::Artist::meta(), kv(&[("albums", Value::Int(1))])),
            Err(EdgyError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_prepare_insert_skips_auto_and_nullable() {
        let prepared = prepare_insert(Album::meta(), kv(&[("name", Value::from("Malibu"))])).unwrap();
        let names: Vec<&str> = prepared.iter().map(|(f, _)| f.name).collect();
        assert_eq!(names, vec!["name"]);
    }

    #[tokio::test]
    async fn test_insert_one_returns_stored_row() {
        let (db, ctx) = mocked();
        db.push_rows(vec![row(&[
            ("id", Value::Int(5)),
            ("name", "Malibu".into()),
            ("year", Value::Int(2016)),
            ("studio_id", Value::Null),
        ])]);
        let album = insert_one(Album::meta(), &ctx, kv(&[("name", "Malibu".into()), ("year", 2016.into())]))
            .await
            .unwrap();
        assert_eq!(album.pk(), Value::Int(5));
        assert!(album.related("studio").unwrap().is_none());
        assert_eq!(
            db.statements()[0],
            "INSERT INTO \"albums\" (\"name\", \"year\") VALUES (?, ?) \
             RETURNING \"id\", \"name\", \"year\", \"studio_id\""
        );
    }

    #[tokio::test]
    async fn test_insert_many_requires_same_fields() {
        let (db, ctx) = mocked();
        let rows = vec![
            kv(&[("name", "A".into())]),
            kv(&[("name", "B".into()), ("year", 2020.into())]),
        ];
        assert!(insert_many(Album::meta(), &ctx, rows).await.is_err());
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_insert_many_is_one_statement() {
        let (db, ctx) = mocked();
        db.push_affected(2);
        let rows = vec![kv(&[("name", "A".into())]), kv(&[("name", "B".into())])];
        assert_eq!(insert_many(Album::meta(), &ctx, rows).await.unwrap(), 2);
        assert_eq!(
            db.statements(),
            vec!["INSERT INTO \"albums\" (\"name\") VALUES (?), (?)".to_string()]
        );
    }

    #[tokio::test]
    async fn test_update_through_join_uses_pk_subquery() {
        let (db, ctx) = mocked();
        let qs = Track::query_with(ctx).filter(crate::query::Q::lookup("album__name", "Malibu"));
        update(&qs, kv(&[("position", 1.into())])).await.unwrap();
        assert_eq!(
            db.statements()[0],
            "UPDATE \"tracks\" SET \"position\" = ? WHERE \"tracks\".\"id\" IN \
             (SELECT \"tracks\".\"id\" FROM \"tracks\" INNER JOIN \"albums\" AS \"album\" \
             ON \"tracks\".\"album_id\" = \"album\".\"id\" WHERE \"album\".\"name\" = ?)"
        );
    }

    #[tokio::test]
    async fn test_update_rejects_null_in_required_field() {
        let (_, ctx) = mocked();
        let err = update(&Track::query_with(ctx), kv(&[("title", Value::Null)])).await.unwrap_err();
        assert!(matches!(err, EdgyError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_delete_cascades_and_clears_links() {
        let (db, ctx) = mocked();
        db.push_rows(vec![row(&[("id", Value::Int(1))])]);
        let deleted = delete(&Album::query_with(ctx).filter(crate::query::Q::lookup("id", 1)))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(
            db.statements(),
            vec![
                "BEGIN".to_string(),
                "SELECT \"albums\".\"id\" FROM \"albums\" WHERE \"albums\".\"id\" = ?".to_string(),
                "DELETE FROM \"tracks\" WHERE \"tracks\".\"album_id\" IN (?)".to_string(),
                "DELETE FROM \"artist_albums\" WHERE \"artist_albums\".\"album_id\" IN (?)".to_string(),
                "DELETE FROM \"albums\" WHERE \"albums\".\"id\" IN (?)".to_string(),
                "COMMIT".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_restrict_rolls_back() {
        let (db, ctx) = mocked();
        db.push_rows(vec![row(&[("id", Value::Int(1))])]);
        db.push_rows(vec![row(&[("one", Value::Int(1))])]);
        let err = delete(&Studio::query_with(ctx)).await.unwrap_err();
        assert!(matches!(
            err,
            EdgyError::IntegrityError(ref v) if v.kind == ConstraintKind::Restrict
        ));
        let statements = db.statements();
        assert!(statements[2].starts_with("UPDATE \"albums\" SET \"studio_id\" = ?"));
        assert!(statements[3].starts_with("SELECT 1 AS \"one\" FROM \"contracts\""));
        assert_eq!(statements.last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_delete_without_matches_deletes_nothing() {
        let (db, ctx) = mocked();
        assert_eq!(delete(&Studio::query_with(ctx)).await.unwrap(), 0);
        assert_eq!(db.statements().len(), 3);
    }
}
