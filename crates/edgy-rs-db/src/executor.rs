//! The database executor contract.
//!
//! [`DbExecutor`] is the minimal async interface the query engine needs from
//! a connection: run a statement, fetch rows, stream rows, and hand out a
//! dedicated connection for transactions. Backends in `edgy-rs-db-backends`
//! implement it; the engine only ever holds `Arc<dyn DbExecutor>`.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use edgy_rs_core::{EdgyError, EdgyResult};

use crate::query::sql::{DatabaseBackendType, Row};
use crate::value::Value;

/// Minimal async database executor.
#[async_trait::async_trait]
pub trait DbExecutor: Send + Sync + 'static {
    /// Returns the backend type for SQL compilation.
    fn backend_type(&self) -> DatabaseBackendType;

    /// Runs a statement that returns no rows. Returns the affected row count.
    async fn execute_sql(&self, sql: &str, params: &[Value]) -> EdgyResult<u64>;

    /// Runs a query and returns all rows.
    async fn query(&self, sql: &str, params: &[Value]) -> EdgyResult<Vec<Row>>;

    /// Runs a query expected to return exactly one row.
    async fn query_one(&self, sql: &str, params: &[Value]) -> EdgyResult<Row> {
        let mut rows = self.query(sql, params).await?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            0 => Err(EdgyError::DoesNotExist("Query returned no rows".to_string())),
            n => Err(EdgyError::MultipleObjectsReturned(format!(
                "Query returned {n} rows"
            ))),
        }
    }

    /// Streams the rows of a query.
    ///
    /// The connection is held until the stream ends or is dropped. The
    /// default buffers the whole result; backends override it to fetch
    /// incrementally.
    fn query_stream(
        self: Arc<Self>,
        sql: String,
        params: Vec<Value>,
    ) -> BoxStream<'static, EdgyResult<Row>> {
        stream::once(async move { self.query(&sql, &params).await })
            .map_ok(|rows| stream::iter(rows.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    /// The current transaction nesting depth; 0 outside transactions.
    fn transaction_depth(&self) -> u32 {
        0
    }

    /// Returns an executor bound to one physical connection for the
    /// lifetime of the returned handle, or `None` if every statement already
    /// runs on the same connection.
    async fn dedicated_connection(&self) -> EdgyResult<Option<Arc<dyn DbExecutor>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDb;

    #[tokio::test]
    async fn test_query_one_multiplicity() {
        let db = MockDb::new();
        db.push_rows(vec![]);
        let err = db.query_one("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, EdgyError::DoesNotExist(_)));

        db.push_rows(vec![
            Row::new(vec!["x".into()], vec![Value::Int(1)]),
            Row::new(vec!["x".into()], vec![Value::Int(2)]),
        ]);
        let err = db.query_one("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, EdgyError::MultipleObjectsReturned(_)));
    }

    #[tokio::test]
    async fn test_default_stream_yields_rows() {
        let db = Arc::new(MockDb::new());
        db.push_rows(vec![
            Row::new(vec!["x".into()], vec![Value::Int(1)]),
            Row::new(vec!["x".into()], vec![Value::Int(2)]),
        ]);
        let rows: Vec<Row> = db.clone().query_stream("SELECT x".into(), vec![]).try_collect().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(db.statements(), vec!["SELECT x".to_string()]);
    }
}
