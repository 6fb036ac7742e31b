//! Write-path integration tests against in-memory SQLite: creation and
//! validation, on-delete rules, transactions and routing.

mod common;

use std::sync::Arc;
use std::time::Duration;

use edgy_rs_core::{ConstraintKind, EdgyError};
use edgy_rs_db::testing::fixtures::{Album, Artist, Contract, Studio, Track, SQLITE_SCHEMA};
use edgy_rs_db::{fields, Connections, DbContext, DbExecutor, Instance, Model, Q, Value};
use edgy_rs_db_backends::SqliteBackend;

use common::{album, database, malibu, studio, tracks};

#[tokio::test]
async fn test_create_then_get() {
    let db = database().await;
    let created = Album::query_with(db.ctx.clone())
        .create(fields! { "name" => "Venice", "year" => 2014_i64 })
        .await
        .unwrap();
    assert!(matches!(created.pk(), Value::Int(_)));
    assert!(created.get_value("studio").unwrap().is_null());

    let fetched = Album::query_with(db.ctx.clone())
        .get(Q::lookup("pk", created.pk()))
        .await
        .unwrap();
    assert_eq!(fetched.get::<String>("name").unwrap(), "Venice");
    assert_eq!(fetched.get::<i64>("year").unwrap(), 2014);
}

#[tokio::test]
async fn test_create_validates_before_sending() {
    let db = database().await;
    db.log.clear();
    let err = Album::query_with(db.ctx.clone())
        .create(fields! { "name" => "x".repeat(101) })
        .await
        .unwrap_err();
    let EdgyError::ValidationError(v) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert!(v.field_errors.contains_key("name"));

    let err = Track::query_with(db.ctx.clone())
        .create(fields! { "title" => "Orphan" })
        .await
        .unwrap_err();
    let EdgyError::ValidationError(v) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert!(v.field_errors.contains_key("album"));
    assert!(v.field_errors.contains_key("position"));
    assert!(db.log.is_empty());
}

#[tokio::test]
async fn test_unique_violation_is_integrity_error() {
    let db = database().await;
    album(&db.ctx, "Yes Lawd!", None).await;
    let err = Album::query_with(db.ctx.clone())
        .create(fields! { "name" => "Yes Lawd!" })
        .await
        .unwrap_err();
    assert!(err.is_unique_violation());
}

#[tokio::test]
async fn test_bulk_create_counts_rows() {
    let db = database().await;
    db.log.clear();
    let written = Studio::query_with(db.ctx.clone())
        .bulk_create(vec![
            fields! { "name" => "Sound City" },
            fields! { "name" => "Electric Lady" },
            fields! { "name" => "Abbey Road" },
        ])
        .await
        .unwrap();
    assert_eq!(written, 3);
    assert_eq!(db.log.len(), 1);
    assert_eq!(Studio::query_with(db.ctx.clone()).count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_update_and_bulk_update() {
    let db = database().await;
    let (malibu_album, _) = malibu(&db.ctx).await;

    let changed = Track::query_with(db.ctx.clone())
        .filter(Q::lookup("album__name", "Malibu"))
        .update(fields! { "position" => 0_i64 })
        .await
        .unwrap();
    assert_eq!(changed, 3);

    let mut rows = Track::query_with(db.ctx.clone())
        .filter(Q::lookup("album", malibu_album.pk()))
        .order_by(&["id"])
        .all()
        .await
        .unwrap();
    for (i, track) in rows.iter_mut().enumerate() {
        track.set("position", i64::try_from(i + 10).unwrap()).unwrap();
    }
    let written = Track::query_with(db.ctx.clone())
        .bulk_update(&rows, &["position"])
        .await
        .unwrap();
    assert_eq!(written, 3);
    let positions = Track::query_with(db.ctx.clone())
        .filter(Q::lookup("album", malibu_album.pk()))
        .order_by(&["id"])
        .values_list(&["position"], true)
        .await
        .unwrap();
    assert_eq!(positions, vec![Value::Int(10), Value::Int(11), Value::Int(12)]);
}

#[tokio::test]
async fn test_get_or_create_and_update_or_create() {
    let db = database().await;
    let qs = Album::query_with(db.ctx.clone());
    let lookup = || vec![("name".to_string(), Value::from("Ventura"))];

    let (first, created) = qs
        .get_or_create(lookup(), vec![("year".to_string(), Value::Int(2019))])
        .await
        .unwrap();
    assert!(created);
    let (again, created) = qs.get_or_create(lookup(), Vec::new()).await.unwrap();
    assert!(!created);
    assert_eq!(again.pk(), first.pk());

    let (updated, created) = qs
        .update_or_create(lookup(), vec![("year".to_string(), Value::Int(2020))])
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(updated.get::<i64>("year").unwrap(), 2020);
    assert_eq!(qs.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_instance_save_refresh_delete() {
    let db = database().await;
    let mut label = Instance::new(Studio::meta(), db.ctx.clone());
    label.set("name", "Aftermath").unwrap();
    label.save().await.unwrap();
    assert!(!label.pk().is_null());

    label.set("name", "Aftermath Entertainment").unwrap();
    label.save().await.unwrap();
    let mut stale = Studio::query_with(db.ctx.clone())
        .get(Q::lookup("pk", label.pk()))
        .await
        .unwrap();
    assert_eq!(stale.get::<String>("name").unwrap(), "Aftermath Entertainment");

    Studio::query_with(db.ctx.clone())
        .filter(Q::lookup("pk", label.pk()))
        .update(fields! { "name" => "Renamed" })
        .await
        .unwrap();
    stale.refresh().await.unwrap();
    assert_eq!(stale.get::<String>("name").unwrap(), "Renamed");

    assert_eq!(label.delete().await.unwrap(), 1);
    assert!(!Studio::query_with(db.ctx.clone()).exists().await.unwrap());
}

#[tokio::test]
async fn test_delete_cascades_and_sets_null() {
    let db = database().await;
    let (malibu_album, oxnard) = malibu(&db.ctx).await;
    let artist = Artist::query_with(db.ctx.clone())
        .create(fields! { "name" => "Anderson .Paak" })
        .await
        .unwrap();
    let executor = db.ctx.executor().unwrap();
    executor
        .execute_sql(
            "INSERT INTO artist_albums (artist_id, album_id) VALUES (?, ?)",
            &[artist.pk(), malibu_album.pk()],
        )
        .await
        .unwrap();

    let deleted = Album::query_with(db.ctx.clone())
        .filter(Q::lookup("name", "Malibu"))
        .delete()
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(Track::query_with(db.ctx.clone()).count().await.unwrap(), 2);
    let links = executor
        .query("SELECT COUNT(*) AS n FROM artist_albums", &[])
        .await
        .unwrap();
    assert_eq!(links[0].get::<i64>("n").unwrap(), 0);
    assert!(Artist::query_with(db.ctx.clone()).exists().await.unwrap());

    // Deleting the studio orphans its remaining album.
    Studio::query_with(db.ctx.clone()).delete().await.unwrap();
    let orphan = Album::query_with(db.ctx.clone())
        .get(Q::lookup("pk", oxnard.pk()))
        .await
        .unwrap();
    assert!(orphan.get_value("studio").unwrap().is_null());
}

#[tokio::test]
async fn test_restricted_delete_rolls_back() {
    let db = database().await;
    let label = studio(&db.ctx, "Death Row").await;
    let kept = album(&db.ctx, "The Chronic", Some(&label)).await;
    tracks(&db.ctx, &kept, &["Nuthin' but a G Thang"]).await;
    Contract::query_with(db.ctx.clone())
        .create(fields! { "studio" => label.pk(), "title" => "Distribution" })
        .await
        .unwrap();

    let err = Studio::query_with(db.ctx.clone()).delete().await.unwrap_err();
    assert!(matches!(
        err,
        EdgyError::IntegrityError(ref v) if v.kind == ConstraintKind::Restrict
    ));
    // Nothing from the failed delete survives.
    let album = Album::query_with(db.ctx.clone())
        .get(Q::lookup("pk", kept.pk()))
        .await
        .unwrap();
    assert_eq!(album.get_value("studio").unwrap(), &label.pk());
    assert_eq!(Studio::query_with(db.ctx.clone()).count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_transaction_commit_and_rollback() {
    let db = database().await;
    let qs = Studio::query_with(db.ctx.clone());

    qs.transaction(false, |tx| async move {
        tx.create(fields! { "name" => "Committed" }).await?;
        Ok(())
    })
    .await
    .unwrap();

    qs.transaction(true, |tx| async move {
        tx.create(fields! { "name" => "Forced" }).await?;
        assert_eq!(tx.count().await?, 2);
        Ok(())
    })
    .await
    .unwrap();

    let err = qs
        .transaction(false, |tx| async move {
            tx.create(fields! { "name" => "Failed" }).await?;
            Err::<(), _>(EdgyError::OperationalError("abort".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EdgyError::OperationalError(_)));

    let names = qs.values_list(&["name"], true).await.unwrap();
    assert_eq!(names, vec![Value::from("Committed")]);
}

#[tokio::test]
async fn test_nested_transaction_is_a_savepoint() {
    let db = database().await;
    let qs = Studio::query_with(db.ctx.clone());
    qs.transaction(false, |outer| async move {
        outer.create(fields! { "name" => "Outer" }).await?;
        let inner = outer
            .transaction(false, |inner| async move {
                inner.create(fields! { "name" => "Inner" }).await?;
                Err::<(), _>(EdgyError::OperationalError("inner failed".into()))
            })
            .await;
        assert!(inner.is_err());
        Ok(())
    })
    .await
    .unwrap();

    let names = qs.values_list(&["name"], true).await.unwrap();
    assert_eq!(names, vec![Value::from("Outer")]);
    assert!(db.log.statements().iter().any(|s| s.starts_with("SAVEPOINT")));
}

#[tokio::test]
async fn test_outside_writes_wait_for_open_transaction() {
    let db = database().await;
    let qs = Studio::query_with(db.ctx.clone());

    let (inside, outside, deleted) = tokio::join!(
        qs.transaction(true, |tx| async move {
            tx.create(fields! { "name" => "Inside" }).await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.values_list(&["name"], true).await
        }),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            qs.create(fields! { "name" => "Outside" }).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            qs.filter(Q::lookup("name", "Nobody")).delete().await
        },
    );

    assert_eq!(inside.unwrap(), vec![Value::from("Inside")]);
    outside.unwrap();
    assert_eq!(deleted.unwrap(), 0);
    let names = qs.values_list(&["name"], true).await.unwrap();
    assert_eq!(names, vec![Value::from("Outside")]);
}

#[tokio::test]
async fn test_using_routes_between_aliases() {
    let mut registry = Connections::new();
    for alias in ["default", "archive"] {
        let sqlite = SqliteBackend::memory().unwrap();
        for ddl in SQLITE_SCHEMA {
            sqlite.execute_sql(ddl, &[]).await.unwrap();
        }
        registry.add(alias, Arc::new(sqlite) as Arc<dyn DbExecutor>);
    }
    let ctx = DbContext::new(Arc::new(registry));

    Studio::query_with(ctx.clone())
        .using(Some("archive"), None)
        .create(fields! { "name" => "Archived" })
        .await
        .unwrap();
    assert_eq!(Studio::query_with(ctx.clone()).count().await.unwrap(), 0);
    let archived = Studio::query_with(ctx.clone())
        .using(Some("archive"), None)
        .first()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(archived.get::<String>("name").unwrap(), "Archived");

    let err = Studio::query_with(ctx).using(Some("missing"), None).count().await.unwrap_err();
    assert!(matches!(err, EdgyError::ConfigurationError(_)));
}
