//! Shared helpers for integration tests.
//!
//! Postgres-backed tests need `DATABASE_URL`; without it they skip rather
//! than fail, so the suite stays runnable on machines with no database.
#![allow(dead_code)]

use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use courier_core::storage::MessageStore;
use courier_core::PostgresMessageStore;

/// Connect a store under a unique throwaway schema, or `None` when no
/// database is configured.
pub async fn test_store() -> Option<PostgresMessageStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .ok()?;
    let schema = unique_schema();
    let store = PostgresMessageStore::new(pool, schema);
    store
        .ensure_schema()
        .await
        .expect("failed to provision test schema");
    Some(store)
}

/// Unique, identifier-safe schema name per test invocation so parallel
/// tests never share tables.
pub fn unique_schema() -> String {
    format!("courier_test_{}", Uuid::new_v4().simple())
}

/// Drop the throwaway schema.
pub async fn drop_store(store: &PostgresMessageStore) {
    store
        .teardown_schema()
        .await
        .expect("failed to tear down test schema");
    let drop_schema = format!("DROP SCHEMA IF EXISTS {} CASCADE", store.schema());
    let _ = sqlx::query(&drop_schema).execute(store.pool()).await;
}

/// Standard skip message so skipped runs are visible in test output.
#[macro_export]
macro_rules! require_database {
    () => {
        match common::test_store().await {
            Some(store) => store,
            None => {
                eprintln!("skipping: DATABASE_URL is not set");
                return;
            }
        }
    };
}
