//! Transaction scopes.
//!
//! [`atomic`] runs a closure inside a transaction. The outermost scope takes
//! a dedicated connection from the executor and issues `BEGIN`; nested scopes
//! (recognized by a non-zero [`DbExecutor::transaction_depth`]) become
//! savepoints. The closure receives a [`TransactionExecutor`] that pins every
//! statement to that connection.
//!
//! Outcome rules:
//!
//! - `Ok` commits (or releases the savepoint) unless `force_rollback` is set.
//! - `Err` or `force_rollback` rolls back.
//! - Dropping the future mid-scope (cancellation) rolls back on a spawned
//!   task when a tokio runtime is available.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use tracing::Instrument;

use edgy_rs_core::logging::transaction_span;
use edgy_rs_core::EdgyResult;

use crate::executor::DbExecutor;
use crate::query::sql::{DatabaseBackendType, Row};
use crate::value::Value;

/// Counter for generating unique savepoint names.
static SAVEPOINT_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
enum Scope {
    Transaction,
    Savepoint(String),
}

impl Scope {
    fn commit_sql(&self) -> String {
        match self {
            Self::Transaction => "COMMIT".to_string(),
            Self::Savepoint(name) => format!("RELEASE SAVEPOINT {name}"),
        }
    }

    fn rollback_sql(&self) -> Vec<String> {
        match self {
            Self::Transaction => vec!["ROLLBACK".to_string()],
            Self::Savepoint(name) => vec![
                format!("ROLLBACK TO SAVEPOINT {name}"),
                format!("RELEASE SAVEPOINT {name}"),
            ],
        }
    }
}

async fn rollback(conn: &dyn DbExecutor, scope: &Scope) -> EdgyResult<()> {
    for sql in scope.rollback_sql() {
        conn.execute_sql(&sql, &[]).await?;
    }
    Ok(())
}

/// An executor pinned to one connection inside a transaction scope.
pub struct TransactionExecutor {
    inner: Arc<dyn DbExecutor>,
    depth: u32,
}

#[async_trait::async_trait]
impl DbExecutor for TransactionExecutor {
    fn backend_type(&self) -> DatabaseBackendType {
        self.inner.backend_type()
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> EdgyResult<u64> {
        self.inner.execute_sql(sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> EdgyResult<Vec<Row>> {
        self.inner.query(sql, params).await
    }

    fn query_stream(
        self: Arc<Self>,
        sql: String,
        params: Vec<Value>,
    ) -> BoxStream<'static, EdgyResult<Row>> {
        Arc::clone(&self.inner).query_stream(sql, params)
    }

    fn transaction_depth(&self) -> u32 {
        self.depth
    }
}

/// Rolls the scope back if the owning future is dropped before it finishes.
struct RollbackGuard {
    conn: Option<Arc<dyn DbExecutor>>,
    scope: Scope,
}

impl RollbackGuard {
    fn disarm(&mut self) {
        self.conn = None;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let scope = self.scope.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(?scope, "transaction scope cancelled; rolling back");
                handle.spawn(async move {
                    if let Err(e) = rollback(conn.as_ref(), &scope).await {
                        tracing::warn!(error = %e, "rollback after cancellation failed");
                    }
                });
            }
            Err(_) => tracing::warn!(?scope, "transaction scope dropped outside a runtime"),
        }
    }
}

/// Runs `f` inside a transaction (or savepoint when already inside one).
///
/// # Examples
///
/// ```ignore
/// let id = atomic(db, false, |tx| async move {
///     tx.execute_sql("INSERT INTO studios (name) VALUES (?)", &["Sub Pop".into()]).await?;
///     Ok(1)
/// })
/// .await?;
/// ```
pub async fn atomic<F, Fut, T>(db: Arc<dyn DbExecutor>, force_rollback: bool, f: F) -> EdgyResult<T>
where
    F: FnOnce(Arc<dyn DbExecutor>) -> Fut,
    Fut: Future<Output = EdgyResult<T>>,
{
    let depth = db.transaction_depth();
    let (conn, scope) = if depth == 0 {
        let dedicated = db.dedicated_connection().await?;
        let conn = dedicated.unwrap_or(db);
        conn.execute_sql("BEGIN", &[]).await?;
        (conn, Scope::Transaction)
    } else {
        let name = format!("sp_{}", SAVEPOINT_COUNTER.fetch_add(1, Ordering::Relaxed));
        db.execute_sql(&format!("SAVEPOINT {name}"), &[]).await?;
        (db, Scope::Savepoint(name))
    };

    let mut guard = RollbackGuard {
        conn: Some(Arc::clone(&conn)),
        scope: scope.clone(),
    };
    let txn: Arc<dyn DbExecutor> = Arc::new(TransactionExecutor {
        inner: Arc::clone(&conn),
        depth: depth + 1,
    });

    let result = f(txn)
        .instrument(transaction_span(depth + 1, force_rollback))
        .await;
    guard.disarm();

    match result {
        Ok(value) if !force_rollback => {
            conn.execute_sql(&scope.commit_sql(), &[]).await?;
            Ok(value)
        }
        Ok(value) => {
            rollback(conn.as_ref(), &scope).await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = rollback(conn.as_ref(), &scope).await {
                tracing::warn!(error = %rollback_err, "rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDb;
    use edgy_rs_core::EdgyError;

    fn statements(db: &MockDb) -> Vec<String> {
        db.statements()
    }

    #[tokio::test]
    async fn test_commit_on_ok() {
        let db = Arc::new(MockDb::new());
        let value = atomic(db.clone(), false, |tx| async move {
            tx.execute_sql("INSERT 1", &[]).await?;
            Ok::<_, EdgyError>(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(statements(&db), vec!["BEGIN", "INSERT 1", "COMMIT"]);
    }

    #[tokio::test]
    async fn test_rollback_on_err() {
        let db = Arc::new(MockDb::new());
        let result: EdgyResult<()> = atomic(db.clone(), false, |tx| async move {
            tx.execute_sql("INSERT 1", &[]).await?;
            Err(EdgyError::DatabaseError("boom".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(statements(&db), vec!["BEGIN", "INSERT 1", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_force_rollback_discards_success() {
        let db = Arc::new(MockDb::new());
        atomic(db.clone(), true, |tx| async move {
            tx.execute_sql("INSERT 1", &[]).await?;
            Ok::<_, EdgyError>(())
        })
        .await
        .unwrap();
        assert_eq!(statements(&db).last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_nested_scope_is_savepoint() {
        let db = Arc::new(MockDb::new());
        atomic(db.clone(), false, |outer| async move {
            assert_eq!(outer.transaction_depth(), 1);
            let inner: EdgyResult<()> = atomic(outer.clone(), false, |inner| async move {
                assert_eq!(inner.transaction_depth(), 2);
                inner.execute_sql("INSERT 2", &[]).await?;
                Err(EdgyError::DatabaseError("inner".into()))
            })
            .await;
            assert!(inner.is_err());
            outer.execute_sql("INSERT 3", &[]).await?;
            Ok::<_, EdgyError>(())
        })
        .await
        .unwrap();

        let log = statements(&db);
        assert_eq!(log[0], "BEGIN");
        assert!(log[1].starts_with("SAVEPOINT sp_"));
        assert_eq!(log[2], "INSERT 2");
        assert!(log[3].starts_with("ROLLBACK TO SAVEPOINT sp_"));
        assert!(log[4].starts_with("RELEASE SAVEPOINT sp_"));
        assert_eq!(&log[5..], ["INSERT 3", "COMMIT"]);
    }

    #[tokio::test]
    async fn test_cancellation_rolls_back() {
        let db = Arc::new(MockDb::new());
        let fut = atomic(db.clone(), false, |tx| async move {
            tx.execute_sql("INSERT 1", &[]).await?;
            std::future::pending::<()>().await;
            Ok::<_, EdgyError>(())
        });
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(20), fut).await;
        assert!(timed_out.is_err());
        // Give the spawned rollback a chance to run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(statements(&db), vec!["BEGIN", "INSERT 1", "ROLLBACK"]);
    }
}
