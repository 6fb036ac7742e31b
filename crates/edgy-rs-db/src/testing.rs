//! Test tooling: executors that record statements, and a small fixture schema.
//!
//! [`RecordingExecutor`] wraps any executor and logs every statement it
//! runs, which is how query counts (no N+1) are asserted. [`MockDb`] is a
//! scripted executor for unit tests that never touch a database.
//! [`fixtures`] declares a studio / album / track / artist schema together
//! with its SQLite DDL.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{BoxStream, StreamExt};

use edgy_rs_core::EdgyResult;

use crate::executor::DbExecutor;
use crate::query::sql::{DatabaseBackendType, Row};
use crate::value::Value;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A shared statement log.
#[derive(Debug, Clone, Default)]
pub struct QueryLog {
    entries: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
}

impl QueryLog {
    fn push(&self, sql: &str, params: &[Value]) {
        lock(&self.entries).push((sql.to_string(), params.to_vec()));
    }

    /// Every statement so far.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.entries).iter().map(|(sql, _)| sql.clone()).collect()
    }

    /// Every statement with its parameters.
    pub fn entries(&self) -> Vec<(String, Vec<Value>)> {
        lock(&self.entries).clone()
    }

    /// Number of `SELECT` statements so far.
    pub fn select_count(&self) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|(sql, _)| sql.trim_start().starts_with("SELECT"))
            .count()
    }

    /// Number of statements so far.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Returns `true` if nothing ran yet.
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Forgets everything logged so far.
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

/// Wraps an executor and logs every statement it runs.
pub struct RecordingExecutor {
    inner: Arc<dyn DbExecutor>,
    log: QueryLog,
}

impl RecordingExecutor {
    /// Wraps `inner` with a fresh log.
    pub fn new(inner: Arc<dyn DbExecutor>) -> Self {
        Self {
            inner,
            log: QueryLog::default(),
        }
    }

    /// The statement log, shared with any dedicated connection handed out.
    pub fn log(&self) -> QueryLog {
        self.log.clone()
    }
}

#[async_trait::async_trait]
impl DbExecutor for RecordingExecutor {
    fn backend_type(&self) -> DatabaseBackendType {
        self.inner.backend_type()
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> EdgyResult<u64> {
        self.log.push(sql, params);
        self.inner.execute_sql(sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> EdgyResult<Vec<Row>> {
        self.log.push(sql, params);
        self.inner.query(sql, params).await
    }

    fn query_stream(
        self: Arc<Self>,
        sql: String,
        params: Vec<Value>,
    ) -> BoxStream<'static, EdgyResult<Row>> {
        self.log.push(&sql, &params);
        Arc::clone(&self.inner).query_stream(sql, params)
    }

    fn transaction_depth(&self) -> u32 {
        self.inner.transaction_depth()
    }

    async fn dedicated_connection(&self) -> EdgyResult<Option<Arc<dyn DbExecutor>>> {
        Ok(self.inner.dedicated_connection().await?.map(|conn| {
            Arc::new(Self {
                inner: conn,
                log: self.log.clone(),
            }) as Arc<dyn DbExecutor>
        }))
    }
}

/// A scripted executor: logs statements, answers queries from a queue.
///
/// Queries with no queued answer return no rows; statements return the next
/// queued affected count or 1.
#[derive(Default)]
pub struct MockDb {
    backend: Option<DatabaseBackendType>,
    log: QueryLog,
    rows: Mutex<VecDeque<Vec<Row>>>,
    affected: Mutex<VecDeque<u64>>,
}

impl MockDb {
    /// A SQLite-flavoured mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock reporting `backend`.
    pub fn with_backend(backend: DatabaseBackendType) -> Self {
        Self {
            backend: Some(backend),
            ..Self::default()
        }
    }

    /// Queues the answer to the next query.
    pub fn push_rows(&self, rows: Vec<Row>) {
        lock(&self.rows).push_back(rows);
    }

    /// Queues the affected count of the next statement.
    pub fn push_affected(&self, count: u64) {
        lock(&self.affected).push_back(count);
    }

    /// Every statement so far.
    pub fn statements(&self) -> Vec<String> {
        self.log.statements()
    }

    /// The statement log.
    pub fn log(&self) -> QueryLog {
        self.log.clone()
    }
}

#[async_trait::async_trait]
impl DbExecutor for MockDb {
    fn backend_type(&self) -> DatabaseBackendType {
        self.backend.unwrap_or(DatabaseBackendType::SQLite)
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> EdgyResult<u64> {
        self.log.push(sql, params);
        Ok(lock(&self.affected).pop_front().unwrap_or(1))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> EdgyResult<Vec<Row>> {
        self.log.push(sql, params);
        Ok(lock(&self.rows).pop_front().unwrap_or_default())
    }
}

/// Builds a row from `(column, value)` pairs.
pub fn row(cells: &[(&str, Value)]) -> Row {
    Row::new(
        cells.iter().map(|(c, _)| (*c).to_string()).collect(),
        cells.iter().map(|(_, v)| v.clone()).collect(),
    )
}

/// Drains a stream of rows, for tests that only care about the count.
pub async fn count_stream(mut stream: BoxStream<'static, EdgyResult<Row>>) -> EdgyResult<usize> {
    let mut n = 0;
    while let Some(row) = stream.next().await {
        row?;
        n += 1;
    }
    Ok(n)
}

/// A studio / album / track / artist / contract schema.
///
/// - `Album.studio` is a nullable foreign key with `SET NULL`.
/// - `Track.album` is a required foreign key with `CASCADE`.
/// - `Artist.albums` is many-to-many through `artist_albums`.
/// - `Contract.studio` is a required foreign key with `RESTRICT`.
pub mod fixtures {
    use std::sync::LazyLock;

    use crate::fields::{FieldDef, FieldType, OnDelete, ThroughTable};
    use crate::model::{Model, ModelMeta};

    /// Record studios.
    pub struct Studio;
    /// Albums, optionally released by a studio.
    pub struct Album;
    /// Tracks of an album.
    pub struct Track;
    /// Artists, linked to albums many-to-many.
    pub struct Artist;
    /// Contracts binding a studio.
    pub struct Contract;

    fn id() -> FieldDef {
        FieldDef::new("id", FieldType::BigAutoField).primary_key()
    }

    impl Model for Studio {
        fn meta() -> &'static ModelMeta {
            static META: LazyLock<ModelMeta> = LazyLock::new(|| {
                ModelMeta::new("Studio", "studios")
                    .add_field(id())
                    .add_field(FieldDef::new("name", FieldType::CharField).max_length(100))
                    .add_reverse("albums", Album::meta, "studio")
                    .add_reverse("contracts", Contract::meta, "studio")
            });
            &META
        }
    }

    impl Model for Album {
        fn meta() -> &'static ModelMeta {
            static META: LazyLock<ModelMeta> = LazyLock::new(|| {
                ModelMeta::new("Album", "albums")
                    .add_field(id())
                    .add_field(FieldDef::new("name", FieldType::CharField).max_length(100).unique())
                    .add_field(FieldDef::new("year", FieldType::IntegerField).nullable())
                    .add_field(FieldDef::foreign_key("studio", Studio::meta, OnDelete::SetNull).nullable())
                    .add_reverse("tracks", Track::meta, "album")
                    .add_reverse("artists", Artist::meta, "albums")
            });
            &META
        }
    }

    impl Model for Track {
        fn meta() -> &'static ModelMeta {
            static META: LazyLock<ModelMeta> = LazyLock::new(|| {
                ModelMeta::new("Track", "tracks")
                    .add_field(id())
                    .add_field(FieldDef::foreign_key("album", Album::meta, OnDelete::Cascade))
                    .add_field(FieldDef::new("title", FieldType::CharField).max_length(100))
                    .add_field(FieldDef::new("position", FieldType::IntegerField))
            });
            &META
        }
    }

    impl Model for Artist {
        fn meta() -> &'static ModelMeta {
            static META: LazyLock<ModelMeta> = LazyLock::new(|| {
                ModelMeta::new("Artist", "artists")
                    .add_field(id())
                    .add_field(FieldDef::new("name", FieldType::CharField).max_length(100))
                    .add_field(FieldDef::many_to_many(
                        "albums",
                        Album::meta,
                        ThroughTable::new("artist_albums", "artist_id", "album_id"),
                    ))
            });
            &META
        }
    }

    impl Model for Contract {
        fn meta() -> &'static ModelMeta {
            static META: LazyLock<ModelMeta> = LazyLock::new(|| {
                ModelMeta::new("Contract", "contracts")
                    .add_field(id())
                    .add_field(FieldDef::foreign_key("studio", Studio::meta, OnDelete::Restrict))
                    .add_field(FieldDef::new("title", FieldType::TextField))
            });
            &META
        }
    }

    /// SQLite DDL for the fixture schema.
    pub const SQLITE_SCHEMA: &[&str] = &[
        "CREATE TABLE studios (id INTEGER PRIMARY KEY AUTOINCREMENT, name VARCHAR(100) NOT NULL)",
        "CREATE TABLE albums (id INTEGER PRIMARY KEY AUTOINCREMENT, name VARCHAR(100) NOT NULL UNIQUE, \
         year INTEGER, studio_id INTEGER REFERENCES studios(id))",
        "CREATE TABLE tracks (id INTEGER PRIMARY KEY AUTOINCREMENT, \
         album_id INTEGER NOT NULL REFERENCES albums(id), title VARCHAR(100) NOT NULL, position INTEGER NOT NULL)",
        "CREATE TABLE artists (id INTEGER PRIMARY KEY AUTOINCREMENT, name VARCHAR(100) NOT NULL)",
        "CREATE TABLE artist_albums (artist_id INTEGER NOT NULL REFERENCES artists(id), \
         album_id INTEGER NOT NULL REFERENCES albums(id), PRIMARY KEY (artist_id, album_id))",
        "CREATE TABLE contracts (id INTEGER PRIMARY KEY AUTOINCREMENT, \
         studio_id INTEGER NOT NULL REFERENCES studios(id), title TEXT NOT NULL)",
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_executor_counts_selects() {
        let mock: Arc<dyn DbExecutor> = Arc::new(MockDb::new());
        let rec = RecordingExecutor::new(mock);
        rec.query("SELECT 1", &[]).await.unwrap();
        rec.execute_sql("UPDATE t SET x = 1", &[]).await.unwrap();
        let log = rec.log();
        assert_eq!(log.len(), 2);
        assert_eq!(log.select_count(), 1);
        log.clear();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_mock_answers_in_order() {
        let db = MockDb::new();
        db.push_rows(vec![row(&[("id", Value::Int(1))])]);
        db.push_affected(3);
        assert_eq!(db.query("SELECT", &[]).await.unwrap().len(), 1);
        assert!(db.query("SELECT", &[]).await.unwrap().is_empty());
        assert_eq!(db.execute_sql("DELETE", &[]).await.unwrap(), 3);
        assert_eq!(db.execute_sql("DELETE", &[]).await.unwrap(), 1);
    }
}
