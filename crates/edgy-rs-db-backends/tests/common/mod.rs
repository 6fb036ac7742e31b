//! Shared setup for the SQLite integration tests: an in-memory database
//! with the fixture schema, wrapped in a statement recorder.

#![allow(dead_code)]

use std::sync::Arc;

use edgy_rs_db::fields;
use edgy_rs_db::testing::fixtures::{Album, Studio, Track, SQLITE_SCHEMA};
use edgy_rs_db::testing::{QueryLog, RecordingExecutor};
use edgy_rs_db::{DbContext, DbExecutor, Instance, Model, Value};
use edgy_rs_db_backends::SqliteBackend;

/// A fresh database and the log of every statement run against it.
pub struct TestDb {
    pub ctx: DbContext,
    pub log: QueryLog,
}

/// Routes `tracing` output through the test harness; `RUST_LOG` selects
/// what is shown.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn database() -> TestDb {
    init_tracing();
    let sqlite = SqliteBackend::memory().expect("open in-memory SQLite");
    for ddl in SQLITE_SCHEMA {
        sqlite.execute_sql(ddl, &[]).await.expect("create fixture table");
    }
    let recorder = RecordingExecutor::new(Arc::new(sqlite));
    let log = recorder.log();
    TestDb {
        ctx: DbContext::from_executor(Arc::new(recorder)),
        log,
    }
}

pub async fn studio(ctx: &DbContext, name: &str) -> Instance {
    Studio::query_with(ctx.clone())
        .create(fields! { "name" => name })
        .await
        .expect("create studio")
}

pub async fn album(ctx: &DbContext, name: &str, studio: Option<&Instance>) -> Instance {
    let studio = studio.map_or(Value::Null, Instance::pk);
    Album::query_with(ctx.clone())
        .create(fields! { "name" => name, "studio" => studio })
        .await
        .expect("create album")
}

pub async fn tracks(ctx: &DbContext, album: &Instance, titles: &[&str]) {
    let rows = titles
        .iter()
        .enumerate()
        .map(|(i, title)| {
            fields! {
                "album" => album.pk(),
                "title" => *title,
                "position" => i64::try_from(i + 1).expect("small position"),
            }
        })
        .collect();
    Track::query_with(ctx.clone())
        .bulk_create(rows)
        .await
        .expect("create tracks");
}

/// Two albums on one studio: "Malibu" (three tracks, "The Bird" first)
/// and "Oxnard" (two tracks).
pub async fn malibu(ctx: &DbContext) -> (Instance, Instance) {
    let label = studio(ctx, "Steel Wool").await;
    let malibu = album(ctx, "Malibu", Some(&label)).await;
    tracks(ctx, &malibu, &["The Bird", "Heart Don't Stand a Chance", "The Waters"]).await;
    let oxnard = album(ctx, "Oxnard", Some(&label)).await;
    tracks(ctx, &oxnard, &["The Chase", "Tints"]).await;
    (malibu, oxnard)
}
