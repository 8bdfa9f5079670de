//! Postgres engagement store behaviour under concurrent writers.
//!
//! Needs a `DATABASE_URL` the test harness can create scratch databases on:
//! `DATABASE_URL=postgres://localhost/postgres cargo test -- --ignored`.

use emberfeed::application::repos::EngagementStore;
use emberfeed::domain::entities::{ContentItem, LikeChange, NewItem};
use emberfeed::infra::db::PostgresEngagementStore;
use sqlx::PgPool;
use uuid::Uuid;

async fn seeded(pool: &PgPool) -> (PostgresEngagementStore, ContentItem) {
    let store = PostgresEngagementStore::new(pool.clone());
    let item = store
        .create_item(NewItem {
            title: "contended".to_string(),
            content: "body".to_string(),
            tags: vec!["db".to_string()],
            media_url: None,
            author_id: 1,
        })
        .await
        .expect("create");
    (store, item)
}

async fn like_rows(pool: &PgPool, id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM likes WHERE post_id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("count likes")
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL pointing at a Postgres server"]
async fn toggle_returns_the_item_with_the_counter_already_moved(pool: PgPool) {
    let (store, item) = seeded(&pool).await;

    let (change, liked) = store.toggle_like(item.id, 5).await.expect("like");
    assert_eq!(change, LikeChange::Liked);
    assert_eq!(liked.like_count, 1);

    let (change, unliked) = store.toggle_like(item.id, 5).await.expect("unlike");
    assert_eq!(change, LikeChange::Unliked);
    assert_eq!(unliked.like_count, 0);
    assert_eq!(like_rows(&pool, item.id).await, 0);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL pointing at a Postgres server"]
async fn concurrent_toggles_keep_counter_equal_to_like_rows(pool: PgPool) {
    let (store, item) = seeded(&pool).await;

    // User 9 toggles five times (ends liked); users 10..20 toggle once each.
    let id = item.id;
    let mut tasks = Vec::new();
    for user in std::iter::repeat_n(9, 5).chain(10..20) {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.toggle_like(id, user).await.expect("toggle")
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }

    let rows = like_rows(&pool, item.id).await;
    let stored = store
        .get_item(item.id)
        .await
        .expect("get")
        .expect("item exists");
    assert_eq!(rows, 11);
    assert_eq!(stored.like_count, 11);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL pointing at a Postgres server"]
async fn toggling_a_missing_item_is_not_found(pool: PgPool) {
    let store = PostgresEngagementStore::new(pool);
    let err = store
        .toggle_like(Uuid::new_v4(), 1)
        .await
        .expect_err("no such item");
    assert!(matches!(
        err,
        emberfeed::application::repos::RepoError::NotFound
    ));
}
