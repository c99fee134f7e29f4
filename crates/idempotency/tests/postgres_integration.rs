//! PostgreSQL integration tests.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p idempotency --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use idempotency::{IdempotencyRecord, IdempotencyStore, PostgresIdempotencyStore};
use messaging::EventId;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_idempotency_records.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresIdempotencyStore {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE idempotency_records")
        .execute(&pool)
        .await
        .unwrap();

    PostgresIdempotencyStore::new(pool)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn record_then_lookup() {
    let store = get_test_store().await;
    let event_id = EventId::new();

    assert!(!store.is_processed(event_id, "order-service").await.unwrap());
    assert!(
        store
            .record_processed(IdempotencyRecord::new(event_id, "order-service", "start_saga", "order_created"))
            .await
            .unwrap()
    );
    assert!(store.is_processed(event_id, "order-service").await.unwrap());

    let record = store.get(event_id, "order-service").await.unwrap().unwrap();
    assert_eq!(record.action, "start_saga");
    assert_eq!(record.result, "order_created");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn concurrent_records_insert_exactly_once() {
    let store = get_test_store().await;
    let event_id = EventId::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .record_processed(IdempotencyRecord::new(event_id, "product-service", "reserve_stock", "reserved"))
                .await
                .unwrap()
        }));
    }

    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn same_event_is_independent_per_service() {
    let store = get_test_store().await;
    let event_id = EventId::new();

    store
        .record_processed(IdempotencyRecord::new(event_id, "cart-service", "mark_checked_out", "checked_out"))
        .await
        .unwrap();

    assert!(store.is_processed(event_id, "cart-service").await.unwrap());
    assert!(!store.is_processed(event_id, "product-service").await.unwrap());
}
