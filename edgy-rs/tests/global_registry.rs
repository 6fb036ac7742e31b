//! `init` wires settings to the global registry that `Model::query` uses.

use edgy_rs::db::testing::fixtures::{Studio, SQLITE_SCHEMA};
use edgy_rs::prelude::*;

#[tokio::test]
async fn test_init_installs_global_registry() {
    edgy_rs::init(Settings::default()).unwrap();
    let executor = DbContext::global().executor().unwrap();
    for ddl in SQLITE_SCHEMA {
        executor.execute_sql(ddl, &[]).await.unwrap();
    }

    Studio::query()
        .create(edgy_rs::fields! { "name" => "Capitol" })
        .await
        .unwrap();
    let found = Studio::query().get(Q::lookup("name", "Capitol")).await.unwrap();
    assert_eq!(found.get::<String>("name").unwrap(), "Capitol");

    assert!(edgy_rs::init(Settings::default()).is_err());
}

#[tokio::test]
async fn test_public_api_types_come_from_reexports() {
    use edgy_rs::futures::TryStreamExt;
    use edgy_rs::indexmap::IndexMap;

    let db = edgy_rs::db::testing::MockDb::new();
    db.push_rows(vec![edgy_rs::db::testing::row(&[
        ("id", Value::Int(1)),
        ("name", Value::from("Capitol")),
    ])]);
    db.push_rows(vec![edgy_rs::db::testing::row(&[("name", Value::from("Capitol"))])]);
    let ctx = DbContext::from_executor(std::sync::Arc::new(db));

    let streamed: Vec<Instance> = Studio::query_with(ctx.clone())
        .stream()
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(streamed.len(), 1);

    let values: Vec<IndexMap<String, Value>> =
        Studio::query_with(ctx).values(&["name"]).await.unwrap();
    assert_eq!(values[0]["name"], Value::from("Capitol"));

    let json: edgy_rs::serde_json::Value = Value::from("x").to_json();
    assert_eq!(json, edgy_rs::serde_json::json!("x"));
}
