//! SQLite database backend using `rusqlite`.
//!
//! Statements run on one primary connection guarded by an async mutex,
//! inside `tokio::task::spawn_blocking`. A transaction takes a
//! [`SqliteSession`] from
//! [`dedicated_connection`](DbExecutor::dedicated_connection): it holds the
//! primary connection's lock from `BEGIN` until the connection is back in
//! autocommit, so statements from outside the transaction wait for it to
//! finish instead of running inside it.
//!
//! Streams outside a transaction read on a connection of their own, so the
//! consumer may issue further queries (prefetch batches, lazy loads) while
//! a stream is open. In-memory databases use a named shared-cache URI so
//! that reader connections see the same data. Inside a transaction only
//! the primary connection sees the uncommitted writes; streams there are
//! read in full before the first row is yielded.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use rusqlite::{ffi, ErrorCode};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_stream::wrappers::ReceiverStream;

use edgy_rs_core::{ConstraintKind, EdgyError, EdgyResult, SETTINGS};
use edgy_rs_db::query::sql::{DatabaseBackendType, Row};
use edgy_rs_db::value::Value;
use edgy_rs_db::DbExecutor;

/// Counter for naming shared-cache in-memory databases.
static MEMORY_COUNTER: AtomicU64 = AtomicU64::new(0);

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a database lives.
#[derive(Debug, Clone)]
enum Location {
    /// A shared-cache in-memory database, by URI.
    Memory(String),
    File(PathBuf),
}

impl Location {
    fn connect(&self) -> EdgyResult<rusqlite::Connection> {
        let conn = match self {
            Self::Memory(uri) => rusqlite::Connection::open(uri),
            Self::File(path) => rusqlite::Connection::open(path),
        }
        .map_err(|e| EdgyError::OperationalError(format!("SQLite open failed: {e}")))?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_error)?;
        Ok(conn)
    }

    fn connect_reader(&self) -> EdgyResult<rusqlite::Connection> {
        let conn = self.connect()?;
        if matches!(self, Self::Memory(_)) {
            // Shared-cache readers would otherwise table-lock out the writer.
            conn.execute_batch("PRAGMA read_uncommitted = true;")
                .map_err(map_error)?;
        }
        Ok(conn)
    }
}

/// A SQLite database backend.
pub struct SqliteBackend {
    location: Location,
    conn: Arc<Mutex<rusqlite::Connection>>,
    stream_buffer: usize,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Opens the database at `path`; `:memory:` creates a private in-memory
    /// database.
    ///
    /// Foreign keys are enforced; file databases use WAL journaling.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> EdgyResult<Self> {
        let path = path.into();
        let location = if path.to_str() == Some(":memory:") {
            let n = MEMORY_COUNTER.fetch_add(1, Ordering::Relaxed);
            Location::Memory(format!(
                "file:edgy-mem-{}-{n}?mode=memory&cache=shared",
                std::process::id()
            ))
        } else {
            Location::File(path)
        };

        let conn = location.connect()?;
        let pragmas = match location {
            Location::Memory(_) => "PRAGMA foreign_keys=ON;",
            Location::File(_) => "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;",
        };
        conn.execute_batch(pragmas).map_err(|e| {
            EdgyError::OperationalError(format!("Failed to set pragmas: {e}"))
        })?;
        tracing::debug!(location = ?location, "opened SQLite database");

        Ok(Self {
            location,
            conn: Arc::new(Mutex::new(conn)),
            stream_buffer: SETTINGS.get_or_default().stream_buffer.max(1),
        })
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn memory() -> EdgyResult<Self> {
        Self::open(":memory:")
    }

    /// Runs a `;`-separated batch of statements, e.g. a schema.
    ///
    /// # Errors
    ///
    /// Returns the first failing statement's error.
    pub async fn execute_script(&self, sql: &str) -> EdgyResult<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| conn.execute_batch(&sql).map_err(map_error))
            .await
    }

    /// Runs `f` on the primary connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> EdgyResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> EdgyResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| EdgyError::DatabaseError(format!("Task join error: {e}")))?
    }

    /// Feeds the rows of one query into `tx`. Runs on the blocking pool.
    fn stream_into(
        &self,
        sql: &str,
        params: &[Value],
        tx: &mpsc::Sender<EdgyResult<Row>>,
    ) -> EdgyResult<()> {
        let primary = self.conn.blocking_lock();
        if !primary.is_autocommit() {
            let rows = query_rows(&primary, sql, params)?;
            drop(primary);
            for row in rows {
                if tx.blocking_send(Ok(row)).is_err() {
                    break;
                }
            }
            return Ok(());
        }
        drop(primary);

        let reader = self.location.connect_reader()?;
        let mut stmt = reader.prepare(sql).map_err(map_error)?;
        let columns = column_names(&stmt);
        bind_params(&mut stmt, params)?;
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next().map_err(map_error)? {
            if tx.blocking_send(Ok(convert_row(row, &columns))).is_err() {
                // The consumer dropped the stream.
                break;
            }
        }
        Ok(())
    }
}

/// Maps a driver error onto the ORM error kinds.
pub(crate) fn map_error(err: rusqlite::Error) -> EdgyError {
    let rusqlite::Error::SqliteFailure(failure, message) = &err else {
        return EdgyError::DatabaseError(err.to_string());
    };
    let message = message.clone().unwrap_or_else(|| failure.to_string());
    match failure.code {
        ErrorCode::ConstraintViolation => {
            let kind = match failure.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    ConstraintKind::Unique
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => ConstraintKind::ForeignKey,
                ffi::SQLITE_CONSTRAINT_NOTNULL => ConstraintKind::NotNull,
                ffi::SQLITE_CONSTRAINT_CHECK => ConstraintKind::Check,
                _ => ConstraintKind::Other,
            };
            EdgyError::integrity(kind, message)
        }
        ErrorCode::DatabaseBusy
        | ErrorCode::DatabaseLocked
        | ErrorCode::CannotOpen
        | ErrorCode::ReadOnly
        | ErrorCode::DiskFull => EdgyError::OperationalError(message),
        _ => EdgyError::DatabaseError(message),
    }
}

/// Binds ORM values to a statement's positional parameters.
fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> EdgyResult<()> {
    for (i, param) in params.iter().enumerate() {
        let idx = i + 1;
        match param {
            Value::Null => stmt.raw_bind_parameter(idx, rusqlite::types::Null),
            Value::Bool(b) => stmt.raw_bind_parameter(idx, b),
            Value::Int(v) => stmt.raw_bind_parameter(idx, v),
            Value::Float(v) => stmt.raw_bind_parameter(idx, v),
            Value::String(s) => stmt.raw_bind_parameter(idx, s.as_str()),
            Value::Bytes(b) => stmt.raw_bind_parameter(idx, b.as_slice()),
            Value::Date(d) => stmt.raw_bind_parameter(idx, d.to_string()),
            Value::DateTime(dt) => stmt.raw_bind_parameter(idx, dt.to_string()),
            Value::DateTimeTz(dt) => stmt.raw_bind_parameter(idx, dt.to_rfc3339()),
            Value::Time(t) => stmt.raw_bind_parameter(idx, t.to_string()),
            Value::Uuid(u) => stmt.raw_bind_parameter(idx, u.to_string()),
            Value::Json(j) => stmt.raw_bind_parameter(idx, j.to_string()),
            Value::List(_) => stmt.raw_bind_parameter(idx, param.to_json().to_string()),
        }
        .map_err(|e| EdgyError::DatabaseError(format!("Bind error: {e}")))?;
    }
    Ok(())
}

fn column_names(stmt: &rusqlite::Statement<'_>) -> Arc<[String]> {
    stmt.column_names().into_iter().map(String::from).collect()
}

/// Converts a `rusqlite::Row`; the materializer coerces text dates etc.
fn convert_row(sqlite_row: &rusqlite::Row<'_>, columns: &Arc<[String]>) -> Row {
    use rusqlite::types::ValueRef;

    let values = (0..columns.len())
        .map(|i| match sqlite_row.get_ref(i).unwrap_or(ValueRef::Null) {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Int(v),
            ValueRef::Real(v) => Value::Float(v),
            ValueRef::Text(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
            ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
        })
        .collect();
    Row::with_columns(Arc::clone(columns), values)
}

fn execute_on(conn: &rusqlite::Connection, sql: &str, params: &[Value]) -> EdgyResult<u64> {
    let mut stmt = conn.prepare(sql).map_err(map_error)?;
    bind_params(&mut stmt, params)?;
    let count = stmt.raw_execute().map_err(map_error)?;
    Ok(count as u64)
}

fn query_rows(conn: &rusqlite::Connection, sql: &str, params: &[Value]) -> EdgyResult<Vec<Row>> {
    let mut stmt = conn.prepare(sql).map_err(map_error)?;
    let columns = column_names(&stmt);
    bind_params(&mut stmt, params)?;
    let mut raw_rows = stmt.raw_query();
    let mut rows = Vec::new();
    while let Some(row) = raw_rows.next().map_err(map_error)? {
        rows.push(convert_row(row, &columns));
    }
    Ok(rows)
}

#[async_trait::async_trait]
impl DbExecutor for SqliteBackend {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> EdgyResult<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| execute_on(conn, &sql, &params)).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> EdgyResult<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| query_rows(conn, &sql, &params)).await
    }

    fn query_stream(
        self: Arc<Self>,
        sql: String,
        params: Vec<Value>,
    ) -> BoxStream<'static, EdgyResult<Row>> {
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = self.stream_into(&sql, &params, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });
        ReceiverStream::new(rx).boxed()
    }

    async fn dedicated_connection(&self) -> EdgyResult<Option<Arc<dyn DbExecutor>>> {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        Ok(Some(Arc::new(SqliteSession {
            conn: Arc::clone(&self.conn),
            held: Arc::new(Mutex::new(Some(guard))),
        })))
    }
}

/// The primary connection, held for one transaction.
///
/// The lock is released as soon as a statement leaves the connection in
/// autocommit (after `COMMIT`, `ROLLBACK` or a failed `BEGIN`), or when the
/// session is dropped. Later statements on a released session run like
/// statements on the backend.
pub struct SqliteSession {
    conn: Arc<Mutex<rusqlite::Connection>>,
    held: Arc<Mutex<Option<OwnedMutexGuard<rusqlite::Connection>>>>,
}

impl std::fmt::Debug for SqliteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSession").finish_non_exhaustive()
    }
}

impl SqliteSession {
    async fn with_conn<T, F>(&self, f: F) -> EdgyResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> EdgyResult<T> + Send + 'static,
    {
        let held = Arc::clone(&self.held);
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut slot = held.blocking_lock();
            let Some(guard) = slot.as_ref() else {
                drop(slot);
                let conn = conn.blocking_lock();
                return f(&conn);
            };
            let result = f(&**guard);
            if guard.is_autocommit() {
                *slot = None;
                tracing::trace!("released SQLite session");
            }
            result
        })
        .await
        .map_err(|e| EdgyError::DatabaseError(format!("Task join error: {e}")))?
    }
}

#[async_trait::async_trait]
impl DbExecutor for SqliteSession {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> EdgyResult<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| execute_on(conn, &sql, &params)).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> EdgyResult<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| query_rows(conn, &sql, &params)).await
    }

    async fn dedicated_connection(&self) -> EdgyResult<Option<Arc<dyn DbExecutor>>> {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        Ok(Some(Arc::new(Self {
            conn: Arc::clone(&self.conn),
            held: Arc::new(Mutex::new(Some(guard))),
        })))
    }
}
