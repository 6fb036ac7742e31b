//! Read-path integration tests against in-memory SQLite: filtering across
//! relationships, join planning, prefetching, partial instances, streaming
//! and pagination.

mod common;

use futures::{StreamExt, TryStreamExt};

use edgy_rs_core::EdgyError;
use edgy_rs_db::query::expressions::{AggregateFunc, Expression};
use edgy_rs_db::testing::fixtures::{Album, Artist, Studio, Track};
use edgy_rs_db::{
    fields, CursorPaginator, DbExecutor, FromInstance, Instance, Model, NumberedPaginator,
    Prefetch, Q, Value, ValueKey,
};

use common::{album, database, malibu, studio, tracks};

fn titles(items: &[Instance]) -> Vec<String> {
    items.iter().map(|t| t.get::<String>("title").unwrap()).collect()
}

#[tokio::test]
async fn test_malibu_scenario() {
    let db = database().await;
    malibu(&db.ctx).await;

    let on_malibu = Track::query_with(db.ctx.clone()).filter(Q::lookup("album__name__icontains", "mali"));
    assert_eq!(on_malibu.count().await.unwrap(), 3);

    let first = on_malibu
        .select_related(&["album"])
        .order_by(&["position"])
        .first()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.get::<String>("title").unwrap(), "The Bird");
    let album = first.related("album").unwrap().unwrap();
    assert_eq!(album.get::<String>("name").unwrap(), "Malibu");
}

#[tokio::test]
async fn test_filter_and_select_related_share_one_join() {
    let db = database().await;
    malibu(&db.ctx).await;
    db.log.clear();

    let rows = Track::query_with(db.ctx.clone())
        .filter(Q::lookup("album__name", "Oxnard"))
        .filter(Q::lookup("album__studio__name__startswith", "Steel"))
        .select_related(&["album__studio", "album"])
        .order_by(&["album__name", "position"])
        .all()
        .await
        .unwrap();
    assert_eq!(titles(&rows), vec!["The Chase", "Tints"]);

    let statements = db.log.statements();
    assert_eq!(statements.len(), 1);
    assert_eq!(statements[0].matches("JOIN \"albums\"").count(), 1);
    assert_eq!(statements[0].matches("JOIN \"studios\"").count(), 1);
    let studio = rows[0].related("album").unwrap().unwrap().related("studio").unwrap().unwrap();
    assert_eq!(studio.get::<String>("name").unwrap(), "Steel Wool");
}

#[tokio::test]
async fn test_contains_respects_case_unless_insensitive() {
    let db = database().await;
    malibu(&db.ctx).await;
    let matching = |lookup: &str, needle: &str| {
        Track::query_with(db.ctx.clone()).filter(Q::lookup(lookup, needle)).order_by(&["title"])
    };

    assert_eq!(matching("title__contains", "the").count().await.unwrap(), 0);
    let found = matching("title__icontains", "the").all().await.unwrap();
    assert_eq!(titles(&found), vec!["The Bird", "The Chase", "The Waters"]);

    assert_eq!(matching("title__startswith", "T").count().await.unwrap(), 4);
    assert_eq!(matching("title__startswith", "t").count().await.unwrap(), 0);
    assert_eq!(matching("title__endswith", "CE").count().await.unwrap(), 0);
    assert_eq!(matching("title__iendswith", "CE").count().await.unwrap(), 1);
    assert_eq!(matching("title__contains", "*").count().await.unwrap(), 0);
    assert_eq!(matching("title__contains", "Don't").count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_select_related_null_foreign_key() {
    let db = database().await;
    album(&db.ctx, "Unsigned", None).await;
    let found = Album::query_with(db.ctx.clone())
        .select_related(&["studio"])
        .get(Q::lookup("name", "Unsigned"))
        .await
        .unwrap();
    assert!(found.related("studio").unwrap().is_none());
}

#[tokio::test]
async fn test_filter_across_to_many_does_not_duplicate_parents() {
    let db = database().await;
    malibu(&db.ctx).await;
    let albums = Album::query_with(db.ctx.clone())
        .filter(Q::lookup("tracks__title__icontains", "the"))
        .order_by(&["name"])
        .all()
        .await
        .unwrap();
    let names: Vec<String> = albums.iter().map(|a| a.get("name").unwrap()).collect();
    assert_eq!(names, vec!["Malibu", "Oxnard"]);
}

#[tokio::test]
async fn test_prefetch_is_one_query_per_level() {
    for n in [1_usize, 5, 50] {
        let db = database().await;
        let label = studio(&db.ctx, "Aftermath").await;
        for i in 0..n {
            let a = album(&db.ctx, &format!("album {i}"), Some(&label)).await;
            tracks(&db.ctx, &a, &["one", "two"]).await;
        }
        db.log.clear();

        let albums = Album::query_with(db.ctx.clone())
            .prefetch_related(vec![Prefetch::new("tracks", "all_tracks")])
            .all()
            .await
            .unwrap();
        assert_eq!(albums.len(), n);
        assert_eq!(db.log.select_count(), 2, "n = {n}");
        for a in &albums {
            assert_eq!(titles(a.prefetched("all_tracks").unwrap()), vec!["one", "two"]);
        }

        db.log.clear();
        let studios = Studio::query_with(db.ctx.clone())
            .prefetch_related(vec![Prefetch::new("albums__tracks", "every_track")])
            .all()
            .await
            .unwrap();
        assert_eq!(db.log.select_count(), 3, "n = {n}");
        assert_eq!(studios[0].prefetched("every_track").unwrap().len(), 2 * n);
    }
}

#[tokio::test]
async fn test_prefetch_with_queryset_orders_children() {
    let db = database().await;
    malibu(&db.ctx).await;
    let sorted = Track::query_with(db.ctx.clone()).order_by(&["-position"]);
    let albums = Album::query_with(db.ctx.clone())
        .filter(Q::lookup("name", "Malibu"))
        .prefetch_related(vec![Prefetch::new("tracks", "reversed").with_queryset(sorted)])
        .all()
        .await
        .unwrap();
    assert_eq!(
        titles(albums[0].prefetched("reversed").unwrap()),
        vec!["The Waters", "Heart Don't Stand a Chance", "The Bird"]
    );
}

#[tokio::test]
async fn test_prefetch_attaches_empty_lists() {
    let db = database().await;
    album(&db.ctx, "Silent", None).await;
    album(&db.ctx, "Quiet", None).await;
    db.log.clear();

    let albums = Album::query_with(db.ctx.clone())
        .prefetch_related(vec![
            Prefetch::new("tracks", "all_tracks"),
            Prefetch::new("studio", "labels"),
        ])
        .all()
        .await
        .unwrap();
    for a in &albums {
        assert!(a.prefetched("all_tracks").unwrap().is_empty());
        assert!(a.prefetched("labels").unwrap().is_empty());
    }
    // Every studio key is NULL, so the second directive issues no query.
    assert_eq!(db.log.select_count(), 2);
}

#[tokio::test]
async fn test_prefetch_reuses_select_related_level() {
    let db = database().await;
    malibu(&db.ctx).await;
    db.log.clear();
    let rows = Track::query_with(db.ctx.clone())
        .select_related(&["album"])
        .prefetch_related(vec![Prefetch::new("album__artists", "performers")])
        .all()
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);
    // The album level comes from the join; only the artists level queries.
    assert_eq!(db.log.select_count(), 2);
}

#[tokio::test]
async fn test_prefetch_through_partial_instances() {
    let db = database().await;
    malibu(&db.ctx).await;

    let rows = Track::query_with(db.ctx.clone())
        .only(&["title"])
        .prefetch_related(vec![Prefetch::new("album", "albums")])
        .all()
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);
    for track in &rows {
        assert_eq!(track.prefetched("albums").unwrap().len(), 1);
    }

    let rows = Track::query_with(db.ctx.clone())
        .select_related(&["album"])
        .only(&["title", "album__name"])
        .prefetch_related(vec![Prefetch::new("album__studio", "labels")])
        .all()
        .await
        .unwrap();
    for track in &rows {
        let labels = track.prefetched("labels").unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].get::<String>("name").unwrap(), "Steel Wool");
    }
}

#[tokio::test]
async fn test_many_to_many_prefetch_and_filter() {
    let db = database().await;
    let (malibu_album, oxnard) = malibu(&db.ctx).await;
    let artist = Artist::query_with(db.ctx.clone())
        .create(fields! { "name" => "Anderson .Paak" })
        .await
        .unwrap();
    let executor = db.ctx.executor().unwrap();
    for a in [&malibu_album, &oxnard] {
        executor
            .execute_sql(
                "INSERT INTO artist_albums (artist_id, album_id) VALUES (?, ?)",
                &[artist.pk(), a.pk()],
            )
            .await
            .unwrap();
    }

    let artists = Artist::query_with(db.ctx.clone())
        .prefetch_related(vec![Prefetch::new("albums__tracks", "catalog")])
        .all()
        .await
        .unwrap();
    assert_eq!(artists[0].prefetched("catalog").unwrap().len(), 5);

    let credited = Album::query_with(db.ctx.clone())
        .filter(Q::lookup("artists__name", "Anderson .Paak"))
        .count()
        .await
        .unwrap();
    assert_eq!(credited, 2);
    let uncredited = Album::query_with(db.ctx.clone())
        .filter(Q::lookup("artists__isnull", true))
        .count()
        .await
        .unwrap();
    assert_eq!(uncredited, 0);
}

#[tokio::test]
async fn test_get_multiplicity() {
    let db = database().await;
    malibu(&db.ctx).await;
    let qs = Track::query_with(db.ctx.clone());

    let missing = qs.get(Q::lookup("title", "Nope")).await.unwrap_err();
    assert!(matches!(missing, EdgyError::DoesNotExist(_)));
    let many = qs.get(Q::lookup("position", 1_i64)).await.unwrap_err();
    assert!(matches!(many, EdgyError::MultipleObjectsReturned(_)));
    assert!(qs.get_or_none(Q::lookup("title", "Nope")).await.unwrap().is_none());
    let bird = qs.get(Q::lookup("title", "The Bird")).await.unwrap();
    assert_eq!(bird.get::<i64>("position").unwrap(), 1);
}

#[tokio::test]
async fn test_partial_instances_refuse_unfetched_fields() {
    let db = database().await;
    malibu(&db.ctx).await;
    let only = Track::query_with(db.ctx.clone())
        .only(&["title"])
        .get(Q::lookup("title", "Tints"))
        .await
        .unwrap();
    assert!(only.is_partial());
    assert!(!only.pk().is_null());
    assert!(matches!(
        only.get::<i64>("position"),
        Err(EdgyError::FieldNotLoaded { .. })
    ));

    let deferred = Track::query_with(db.ctx.clone())
        .defer(&["title"])
        .get(Q::lookup("title", "Tints"))
        .await
        .unwrap();
    assert_eq!(deferred.get::<i64>("position").unwrap(), 2);
    assert!(deferred.get::<String>("title").is_err());

    let err = Track::query_with(db.ctx.clone())
        .only(&["title"])
        .defer(&["position"])
        .all()
        .await
        .unwrap_err();
    assert!(matches!(err, EdgyError::ConfigurationError(_)));
}

#[tokio::test]
async fn test_load_resolves_stubs() {
    let db = database().await;
    malibu(&db.ctx).await;
    let mut track = Track::query_with(db.ctx.clone())
        .get(Q::lookup("title", "The Waters"))
        .await
        .unwrap();
    assert!(matches!(
        track.related("album"),
        Err(EdgyError::RelationNotLoaded { .. })
    ));
    db.log.clear();
    track.load("album").await.unwrap();
    assert_eq!(db.log.select_count(), 1);
    let album = track.related("album").unwrap().unwrap();
    assert_eq!(album.get::<String>("name").unwrap(), "Malibu");

    let mut album = album.clone();
    album.load("tracks").await.unwrap();
    assert_eq!(album.related_many("tracks").unwrap().len(), 3);
}

#[tokio::test]
async fn test_values_aggregates_and_in_bulk() {
    let db = database().await;
    let (malibu_album, oxnard) = malibu(&db.ctx).await;

    let per_album = Track::query_with(db.ctx.clone())
        .group_by(&["album__name"])
        .extra_select("n", Expression::aggregate(AggregateFunc::Count, Expression::f("id")))
        .order_by(&["-n"])
        .values(&["album__name"])
        .await
        .unwrap();
    assert_eq!(per_album.len(), 2);
    assert_eq!(per_album[0]["album__name"], Value::from("Malibu"));
    assert_eq!(per_album[0]["n"], Value::Int(3));

    let flat = Track::query_with(db.ctx.clone())
        .filter(Q::lookup("album__name", "Oxnard"))
        .order_by(&["position"])
        .values_list(&["title"], true)
        .await
        .unwrap();
    assert_eq!(flat, vec![Value::from("The Chase"), Value::from("Tints")]);

    let by_pk = Album::query_with(db.ctx.clone())
        .in_bulk(vec![malibu_album.pk(), oxnard.pk(), Value::Int(999)], None)
        .await
        .unwrap();
    assert_eq!(by_pk.len(), 2);
    assert_eq!(by_pk[&oxnard.pk().key()].get::<String>("name").unwrap(), "Oxnard");

    let by_name = Album::query_with(db.ctx.clone())
        .in_bulk(vec![Value::from("Malibu")], Some("name"))
        .await
        .unwrap();
    assert!(by_name.contains_key(&ValueKey::Text("Malibu".to_string())));
}

struct TrackTitle {
    title: String,
    position: i64,
}

impl FromInstance for TrackTitle {
    fn from_instance(inst: &Instance) -> edgy_rs_core::EdgyResult<Self> {
        Ok(Self {
            title: inst.get("title")?,
            position: inst.get("position")?,
        })
    }
}

#[tokio::test]
async fn test_all_as_typed_rows() {
    let db = database().await;
    malibu(&db.ctx).await;
    let rows: Vec<TrackTitle> = Track::query_with(db.ctx.clone())
        .filter(Q::lookup("album__name", "Oxnard"))
        .order_by(&["-position"])
        .all_as()
        .await
        .unwrap();
    assert_eq!(rows[0].title, "Tints");
    assert_eq!(rows[0].position, 2);
}

#[tokio::test]
async fn test_stream_yields_rows_lazily() {
    let db = database().await;
    let a = album(&db.ctx, "Long Player", None).await;
    let names: Vec<String> = (1..=40).map(|i| format!("track {i:02}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    tracks(&db.ctx, &a, &refs).await;

    let all: Vec<Instance> = Track::query_with(db.ctx.clone())
        .order_by(&["position"])
        .stream()
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(all.len(), 40);
    assert_eq!(all[39].get::<String>("title").unwrap(), "track 40");

    // Dropping a stream early releases the backend.
    let first_three: Vec<_> = Track::query_with(db.ctx.clone())
        .stream()
        .unwrap()
        .take(3)
        .collect()
        .await;
    assert_eq!(first_three.len(), 3);
    assert_eq!(Track::query_with(db.ctx.clone()).count().await.unwrap(), 40);
}

#[tokio::test]
async fn test_stream_with_prefetch() {
    let db = database().await;
    malibu(&db.ctx).await;
    db.log.clear();
    let albums: Vec<Instance> = Album::query_with(db.ctx.clone())
        .order_by(&["name"])
        .prefetch_related(vec![Prefetch::new("tracks", "all_tracks")])
        .stream()
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(albums.len(), 2);
    assert_eq!(albums[0].prefetched("all_tracks").unwrap().len(), 3);
    assert_eq!(albums[1].prefetched("all_tracks").unwrap().len(), 2);
    assert_eq!(db.log.select_count(), 2);
}

#[tokio::test]
async fn test_numbered_pagination() {
    let db = database().await;
    malibu(&db.ctx).await;
    let paginator = NumberedPaginator::new(&Track::query_with(db.ctx.clone()), 2)
        .unwrap()
        .next_item_attr("next")
        .previous_item_attr("previous");
    assert_eq!(paginator.count().await.unwrap(), 5);
    assert_eq!(paginator.num_pages().await.unwrap(), 3);

    let second = paginator.get_page(2).await.unwrap();
    assert_eq!(titles(&second.items), vec!["The Waters", "The Chase"]);
    assert!(second.has_next && second.has_previous);
    let before = second.items[0].linked("previous").unwrap();
    assert_eq!(before.get::<String>("title").unwrap(), "Heart Don't Stand a Chance");
    let after = second.items[1].linked("next").unwrap();
    assert_eq!(after.get::<String>("title").unwrap(), "Tints");

    let last = paginator.get_page(3).await.unwrap();
    assert_eq!(titles(&last.items), vec!["Tints"]);
    assert!(!last.has_next);
    assert!(last.items[0].linked("next").is_none());
    assert!(matches!(paginator.get_page(4).await, Err(EdgyError::DoesNotExist(_))));
}

#[tokio::test]
async fn test_cursor_pagination_walks_both_ways() {
    let db = database().await;
    malibu(&db.ctx).await;
    let qs = Track::query_with(db.ctx.clone()).order_by(&["title"]);
    let paginator = CursorPaginator::new(&qs, 2).unwrap();

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = paginator.get_page(cursor.as_ref(), false).await.unwrap();
        seen.extend(titles(&page.items));
        if !page.has_next {
            break;
        }
        let token = page.next_cursor.unwrap().encode().unwrap();
        cursor = Some(edgy_rs_db::Cursor::decode(&token).unwrap());
    }
    let mut expected = seen.clone();
    expected.sort();
    assert_eq!(seen, expected);
    assert_eq!(seen.len(), 5);

    // Step back from the last page.
    let tints = Track::query_with(db.ctx.clone()).get(Q::lookup("title", "Tints")).await.unwrap();
    let end = paginator.cursor_for(&tints).unwrap();
    let previous = paginator.get_page(Some(&end), true).await.unwrap();
    assert_eq!(titles(&previous.items), vec!["The Chase", "The Waters"]);
    assert!(previous.has_previous);
    assert!(previous.has_next);
}
