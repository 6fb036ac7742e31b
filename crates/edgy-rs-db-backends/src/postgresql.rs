//! PostgreSQL database backend using `tokio-postgres` and `deadpool-postgres`.
//!
//! [`PostgresBackend`] checks a client out of the pool per statement.
//! Transactions ask for a [`dedicated_connection`](DbExecutor::dedicated_connection),
//! a [`PostgresSession`] that keeps one client checked out until it is
//! dropped. Streams use `query_raw`, so rows arrive as the server sends
//! them, and hold their client until the stream ends.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio_postgres::error::SqlState;
use bytes::BytesMut;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use edgy_rs_core::{ConstraintKind, DatabaseSettings, EdgyError, EdgyResult};
use edgy_rs_db::query::sql::{DatabaseBackendType, Row};
use edgy_rs_db::value::Value;
use edgy_rs_db::DbExecutor;

type Client = deadpool_postgres::Object;

/// A PostgreSQL database backend.
pub struct PostgresBackend {
    pool: deadpool_postgres::Pool,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("status", &self.pool.status())
            .finish()
    }
}

impl PostgresBackend {
    /// Creates a backend from a `deadpool-postgres` pool.
    pub const fn new(pool: deadpool_postgres::Pool) -> Self {
        Self { pool }
    }

    /// Creates a backend from the settings of one database alias.
    ///
    /// Connections are opened lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub fn from_settings(settings: &DatabaseSettings) -> EdgyResult<Self> {
        let mut pg_config = deadpool_postgres::Config::new();
        pg_config.dbname = Some(settings.name.clone());
        pg_config.host = non_empty(&settings.host);
        pg_config.port = (settings.port != 0).then_some(settings.port);
        pg_config.user = non_empty(&settings.user);
        pg_config.password = non_empty(&settings.password);
        pg_config.pool = Some(deadpool_postgres::PoolConfig::new(settings.pool_size.max(1)));

        let pool = pg_config
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), tokio_postgres::NoTls)
            .map_err(|e| EdgyError::OperationalError(format!("Failed to create pool: {e}")))?;
        Ok(Self { pool })
    }

    async fn client(&self) -> EdgyResult<Client> {
        self.pool
            .get()
            .await
            .map_err(|e| EdgyError::OperationalError(format!("Pool error: {e}")))
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// A pooled client checked out for the lifetime of a transaction.
pub struct PostgresSession {
    client: Arc<Client>,
}

/// An ORM value bound as a statement parameter.
///
/// The server decides each parameter's type from the statement, so the
/// value is encoded against that type: `NULL` fits any column and integers
/// narrow to `INT2`/`INT4` or widen to floats as the column requires.
#[derive(Debug)]
struct PgParam<'a>(&'a Value);

impl ToSql for PgParam<'_> {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql_checked(ty, out),
            Value::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql_checked(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql_checked(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql_checked(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql_checked(ty, out),
                _ => i.to_sql_checked(ty, out),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql_checked(ty, out),
                _ => f.to_sql_checked(ty, out),
            },
            Value::String(s) => s.to_sql_checked(ty, out),
            Value::Bytes(b) => b.to_sql_checked(ty, out),
            Value::Date(d) => d.to_sql_checked(ty, out),
            Value::DateTime(dt) => dt.to_sql_checked(ty, out),
            Value::DateTimeTz(dt) => dt.to_sql_checked(ty, out),
            Value::Time(t) => t.to_sql_checked(ty, out),
            Value::Uuid(u) => u.to_sql_checked(ty, out),
            Value::Json(j) => j.to_sql_checked(ty, out),
            Value::List(_) => self.0.to_json().to_sql_checked(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

type BoxError = Box<dyn std::error::Error + Sync + Send>;

fn to_sql_params(params: &[Value]) -> Vec<PgParam<'_>> {
    params.iter().map(PgParam).collect()
}

fn param_refs<'a>(params: &'a [PgParam<'_>]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Maps a driver error onto the ORM error kinds by SQLSTATE.
pub(crate) fn map_error(err: tokio_postgres::Error) -> EdgyError {
    let message = err
        .as_db_error()
        .map_or_else(|| err.to_string(), |db| db.message().to_string());
    let Some(state) = err.code() else {
        return if err.is_closed() {
            EdgyError::OperationalError(message)
        } else {
            EdgyError::DatabaseError(message)
        };
    };
    let kind = match *state {
        SqlState::UNIQUE_VIOLATION => Some(ConstraintKind::Unique),
        SqlState::FOREIGN_KEY_VIOLATION => Some(ConstraintKind::ForeignKey),
        SqlState::NOT_NULL_VIOLATION => Some(ConstraintKind::NotNull),
        SqlState::CHECK_VIOLATION => Some(ConstraintKind::Check),
        SqlState::RESTRICT_VIOLATION => Some(ConstraintKind::Restrict),
        _ if state.code().starts_with("23") => Some(ConstraintKind::Other),
        _ => None,
    };
    match kind {
        Some(kind) => EdgyError::integrity(kind, message),
        // Class 08: connection exceptions; 53: insufficient resources.
        None if state.code().starts_with("08") || state.code().starts_with("53") => {
            EdgyError::OperationalError(message)
        }
        None => EdgyError::DatabaseError(message),
    }
}

fn get<'a, T>(pg_row: &'a tokio_postgres::Row, i: usize, wrap: impl FnOnce(T) -> Value) -> Value
where
    T: tokio_postgres::types::FromSql<'a>,
{
    pg_row
        .try_get::<_, Option<T>>(i)
        .ok()
        .flatten()
        .map_or(Value::Null, wrap)
}

/// Converts a `tokio_postgres::Row` to our generic `Row`.
fn convert_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns: Vec<String> = pg_row.columns().iter().map(|c| c.name().to_string()).collect();
    let values: Vec<Value> = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| match *col.type_() {
            Type::BOOL => get(pg_row, i, Value::Bool),
            Type::INT2 => get(pg_row, i, |v: i16| Value::Int(i64::from(v))),
            Type::INT4 => get(pg_row, i, |v: i32| Value::Int(i64::from(v))),
            Type::INT8 => get(pg_row, i, Value::Int),
            Type::FLOAT4 => get(pg_row, i, |v: f32| Value::Float(f64::from(v))),
            Type::FLOAT8 => get(pg_row, i, Value::Float),
            Type::BYTEA => get(pg_row, i, Value::Bytes),
            Type::UUID => get(pg_row, i, Value::Uuid),
            Type::DATE => get(pg_row, i, Value::Date),
            Type::TIMESTAMP => get(pg_row, i, Value::DateTime),
            Type::TIMESTAMPTZ => get(pg_row, i, Value::DateTimeTz),
            Type::TIME => get(pg_row, i, Value::Time),
            Type::JSON | Type::JSONB => get(pg_row, i, Value::Json),
            // Text types, and the text form of anything unknown.
            _ => get(pg_row, i, Value::String),
        })
        .collect();
    Row::new(columns, values)
}

async fn execute_on(client: &Client, sql: &str, params: &[Value]) -> EdgyResult<u64> {
    let owned = to_sql_params(params);
    client
        .execute(sql, &param_refs(&owned))
        .await
        .map_err(map_error)
}

async fn query_on(client: &Client, sql: &str, params: &[Value]) -> EdgyResult<Vec<Row>> {
    let owned = to_sql_params(params);
    let rows = client
        .query(sql, &param_refs(&owned))
        .await
        .map_err(map_error)?;
    Ok(rows.iter().map(convert_row).collect())
}

/// Streams rows from `client`, keeping it checked out until the stream ends.
fn stream_on(
    client: impl std::future::Future<Output = EdgyResult<Arc<Client>>> + Send + 'static,
    sql: String,
    params: Vec<Value>,
) -> BoxStream<'static, EdgyResult<Row>> {
    let open = async move {
        let client = client.await?;
        let owned = to_sql_params(&params);
        let rows = client
            .query_raw(sql.as_str(), param_refs(&owned))
            .await
            .map_err(map_error)?;
        Ok::<_, EdgyError>(rows.map(move |row| {
            let _held = &client;
            row.map(|r| convert_row(&r)).map_err(map_error)
        }))
    };
    stream::once(open).try_flatten().boxed()
}

#[async_trait::async_trait]
impl DbExecutor for PostgresBackend {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> EdgyResult<u64> {
        execute_on(&self.client().await?, sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> EdgyResult<Vec<Row>> {
        query_on(&self.client().await?, sql, params).await
    }

    fn query_stream(
        self: Arc<Self>,
        sql: String,
        params: Vec<Value>,
    ) -> BoxStream<'static, EdgyResult<Row>> {
        stream_on(async move { self.client().await.map(Arc::new) }, sql, params)
    }

    async fn dedicated_connection(&self) -> EdgyResult<Option<Arc<dyn DbExecutor>>> {
        let client = Arc::new(self.client().await?);
        Ok(Some(Arc::new(PostgresSession { client })))
    }
}

#[async_trait::async_trait]
impl DbExecutor for PostgresSession {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> EdgyResult<u64> {
        execute_on(&self.client, sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> EdgyResult<Vec<Row>> {
        query_on(&self.client, sql, params).await
    }

    fn query_stream(
        self: Arc<Self>,
        sql: String,
        params: Vec<Value>,
    ) -> BoxStream<'static, EdgyResult<Row>> {
        let client = Arc::clone(&self.client);
        stream_on(async move { Ok(client) }, sql, params)
    }

    async fn dedicated_connection(&self) -> EdgyResult<Option<Arc<dyn DbExecutor>>> {
        Ok(Some(Arc::new(Self {
            client: Arc::clone(&self.client),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &Value, ty: &Type) -> Result<(IsNull, BytesMut), BoxError> {
        let mut out = BytesMut::new();
        let is_null = PgParam(value).to_sql_checked(ty, &mut out)?;
        Ok((is_null, out))
    }

    #[test]
    fn test_to_sql_params_covers_every_value() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let time = chrono::NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let cases = vec![
            (Value::Bool(true), Type::BOOL),
            (Value::Int(42), Type::INT8),
            (Value::Float(1.5), Type::FLOAT8),
            (Value::from("hello"), Type::TEXT),
            (Value::Bytes(vec![1, 2, 3]), Type::BYTEA),
            (Value::Date(date), Type::DATE),
            (Value::Time(time), Type::TIME),
            (Value::DateTime(date.and_time(time)), Type::TIMESTAMP),
            (Value::Uuid(uuid::Uuid::new_v4()), Type::UUID),
            (Value::Json(serde_json::json!({"key": "value"})), Type::JSONB),
            (Value::List(vec![Value::Int(1)]), Type::JSONB),
        ];
        for (value, ty) in &cases {
            let (is_null, out) = encode(value, ty).unwrap();
            assert!(matches!(is_null, IsNull::No), "{value:?} as {ty}");
            assert!(!out.is_empty(), "{value:?} as {ty}");
        }
        let values: Vec<Value> = cases.into_iter().map(|(v, _)| v).collect();
        assert_eq!(param_refs(&to_sql_params(&values)).len(), values.len());
    }

    #[test]
    fn test_null_binds_to_any_column_type() {
        for ty in [Type::INT4, Type::INT8, Type::TIMESTAMPTZ, Type::UUID, Type::BOOL] {
            let (is_null, out) = encode(&Value::Null, &ty).unwrap();
            assert!(matches!(is_null, IsNull::Yes));
            assert!(out.is_empty());
        }
    }

    #[test]
    fn test_integers_follow_the_column_width() {
        assert_eq!(encode(&Value::Int(7), &Type::INT2).unwrap().1.len(), 2);
        assert_eq!(encode(&Value::Int(7), &Type::INT4).unwrap().1.len(), 4);
        assert_eq!(encode(&Value::Int(7), &Type::INT8).unwrap().1.len(), 8);
        assert_eq!(encode(&Value::Int(7), &Type::FLOAT8).unwrap().1.len(), 8);
        assert!(encode(&Value::Int(i64::from(i16::MAX) + 1), &Type::INT2).is_err());
        assert!(encode(&Value::Int(i64::MAX), &Type::INT4).is_err());
    }

    #[test]
    fn test_mismatched_types_are_rejected() {
        assert!(encode(&Value::from("seven"), &Type::INT8).is_err());
        assert!(encode(&Value::Bool(true), &Type::TEXT).is_err());
    }

    #[test]
    fn test_from_settings_builds_lazy_pool() {
        let settings = DatabaseSettings {
            engine: "postgresql".to_string(),
            name: "edgy".to_string(),
            host: "localhost".to_string(),
            pool_size: 4,
            ..DatabaseSettings::default()
        };
        let backend = PostgresBackend::from_settings(&settings).unwrap();
        assert_eq!(backend.pool.status().max_size, 4);
        assert_eq!(backend.backend_type(), DatabaseBackendType::PostgreSQL);
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(""), None);
        assert_eq!(non_empty("db"), Some("db".to_string()));
    }
}
