//! Consumer tests against PostgreSQL.
//!
//! ```bash
//! cargo test -p saga --test postgres_saga -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::NaiveDate;
use saga::{InboundMessage, Outcome, ReservationLine, STOCK_RESERVED, SagaConsumer};
use sqlx::PgPool;
use stock_store::{CorrelationId, LotId, MedicineId, Money, NewLot, PostgresStore};
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

            let pool = PgPool::connect(&connection_string).await.unwrap();
            PostgresStore::new(pool.clone())
                .run_migrations()
                .await
                .unwrap();
            pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE lot_allocations, lots, outbox_messages, inbox_history RESTART IDENTITY",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresStore::new(pool)
}

async fn seed(
    store: &PostgresStore,
    medicine: i32,
    batch: &str,
    expires: NaiveDate,
    quantity: i32,
    cents: i64,
) -> LotId {
    store
        .insert_lot(NewLot::new(
            MedicineId::new(medicine),
            batch,
            expires,
            quantity,
            Money::from_cents(cents),
        ))
        .await
        .unwrap()
        .id
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[tokio::test]
async fn test_reserve_and_cancel_round_trip() {
    let store = get_test_store().await;
    let early = seed(&store, 1, "L1", date(2025, 1, 1), 5, 100).await;
    let late = seed(&store, 1, "L2", date(2025, 6, 1), 10, 200).await;
    let consumer = SagaConsumer::new(store.clone());

    let reserved = consumer
        .handle(&InboundMessage::reservation_requested(
            "m-1",
            "sale-1",
            vec![ReservationLine::new(1, 8)],
        ))
        .await
        .unwrap();
    assert_eq!(
        reserved,
        Outcome::Confirmed {
            total_cost: Money::from_cents(1100)
        }
    );
    assert_eq!(store.get_lot(early).await.unwrap().unwrap().quantity, 0);
    assert_eq!(store.get_lot(late).await.unwrap().unwrap().quantity, 7);

    let events = store.outbox_for(&CorrelationId::new("sale-1")).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].routing_key, STOCK_RESERVED);
    assert_eq!(events[0].payload["totalCost"], "11.00");

    let released = consumer
        .handle(&InboundMessage::reservation_cancelled("m-2", "sale-1"))
        .await
        .unwrap();
    assert_eq!(released, Outcome::Released { restored_quantity: 8 });
    assert_eq!(store.get_lot(early).await.unwrap().unwrap().quantity, 5);
    assert_eq!(store.get_lot(late).await.unwrap().unwrap().quantity, 10);

    let again = consumer
        .handle(&InboundMessage::reservation_cancelled("m-2", "sale-1"))
        .await
        .unwrap();
    assert_eq!(again, Outcome::Duplicate);
}

#[tokio::test]
async fn test_concurrent_consumers_never_oversell() {
    let store = get_test_store().await;
    let lot = seed(&store, 2, "ONLY", date(2025, 1, 1), 5, 100).await;

    let first = SagaConsumer::new(store.clone());
    let second = SagaConsumer::new(store.clone());
    let a = InboundMessage::reservation_requested(
        "m-a",
        "sale-a",
        vec![ReservationLine::new(2, 3)],
    );
    let b = InboundMessage::reservation_requested(
        "m-b",
        "sale-b",
        vec![ReservationLine::new(2, 3)],
    );

    let (ra, rb) = tokio::join!(first.handle(&a), second.handle(&b));
    let outcomes = [ra.unwrap(), rb.unwrap()];

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Confirmed { .. }))
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Failed { .. }))
            .count(),
        1
    );
    assert_eq!(store.get_lot(lot).await.unwrap().unwrap().quantity, 2);
}

#[tokio::test]
async fn test_concurrent_redeliveries_apply_once() {
    let store = get_test_store().await;
    let lot = seed(&store, 3, "L1", date(2025, 1, 1), 10, 100).await;

    let first = SagaConsumer::new(store.clone());
    let second = SagaConsumer::new(store.clone());
    let message = InboundMessage::reservation_requested(
        "m-dup",
        "sale-dup",
        vec![ReservationLine::new(3, 4)],
    );

    let (ra, rb) = tokio::join!(first.handle(&message), second.handle(&message));
    let outcomes = [ra.unwrap(), rb.unwrap()];

    assert!(outcomes.contains(&Outcome::Duplicate));
    assert_eq!(store.get_lot(lot).await.unwrap().unwrap().quantity, 6);
    assert_eq!(
        store
            .outbox_for(&CorrelationId::new("sale-dup"))
            .await
            .unwrap()
            .len(),
        1
    );
}
