//! Needs a Postgres reachable through DATABASE_URL, run with `--ignored`.
mod common;

use std::collections::HashSet;

use common::{email, seller};
use seller_worker::store::{PostgresStore, SellerStore, StoreError};
use sqlx::PgPool;

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn test_bulk_insert_and_lookup(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let mut inactive = seller(2);
    inactive.is_active = false;

    store.bulk_insert(&[seller(1), inactive]).await.unwrap();

    let found = store
        .find_existing_emails(&[email(1), email(2), email(3)])
        .await
        .unwrap();
    assert_eq!(found, HashSet::from([email(1), email(2)]));

    let stored = store.find_by_email(&email(2)).await.unwrap().unwrap();
    assert!(!stored.is_active);
    assert_eq!(stored.first_name, "First2");
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn test_bulk_insert_conflict_writes_nothing(pool: PgPool) {
    let store = PostgresStore::new(pool);
    store.insert(&seller(2)).await.unwrap();

    let result = store.bulk_insert(&[seller(1), seller(2), seller(3)]).await;

    assert!(matches!(result, Err(StoreError::Conflict(_))));
    let found = store
        .find_existing_emails(&[email(1), email(3)])
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn test_update_keeps_identity(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let original = seller(1);
    store.insert(&original).await.unwrap();

    let mut changed = original.clone();
    changed.region = "APAC".to_string();
    changed.email = "other@example.com".to_string();
    store.update(&changed).await.unwrap();

    let stored = store.find_by_email(&email(1)).await.unwrap().unwrap();
    assert_eq!(stored.id, original.id);
    assert_eq!(stored.region, "APAC");
    assert_eq!(stored.created_at, original.created_at);
}
