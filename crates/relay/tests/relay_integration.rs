//! Relay loop tests: background publishing and shutdown.

use std::sync::Arc;
use std::time::Duration;

use relay::{InMemoryPublisher, OutboxRelay, RelayConfig, RetryPolicy};
use stock_store::{
    CorrelationId, InMemoryStore, OutboundEvent, OutboxStatus, TransactionCoordinator, UnitOfWork,
};
use tokio::sync::watch;

async fn enqueue(store: &InMemoryStore, sale: &str) {
    let event = OutboundEvent::pending(
        CorrelationId::new(sale),
        "stock.reserved",
        &serde_json::json!({"correlationId": sale, "totalCost": "1.00"}),
    )
    .unwrap();
    let mut uow = store.begin().await.unwrap();
    uow.outbox().enqueue(&event).await.unwrap();
    uow.commit().await.unwrap();
}

fn fast_config() -> RelayConfig {
    RelayConfig {
        batch_size: 10,
        interval: Duration::from_millis(10),
        publish_timeout: Duration::from_secs(1),
        retry: RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn test_background_relay_publishes_and_stops_on_shutdown() {
    let store = InMemoryStore::new();
    let publisher = InMemoryPublisher::new();
    let relay = Arc::new(OutboxRelay::with_config(
        store.clone(),
        publisher.clone(),
        fast_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let relay = Arc::clone(&relay);
        async move { relay.run(shutdown_rx).await }
    });

    enqueue(&store, "sale-1").await;
    enqueue(&store, "sale-2").await;
    wait_until(|| publisher.published_count() == 2).await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("relay did not stop")
        .unwrap();

    // Rows committed after shutdown stay pending.
    enqueue(&store, "sale-3").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(publisher.published_count(), 2);

    let rows = store.outbox_for(&CorrelationId::new("sale-3")).await;
    assert_eq!(rows[0].status, OutboxStatus::Pending);
}

#[tokio::test]
async fn test_relay_stops_when_sender_is_dropped() {
    let relay = OutboxRelay::with_config(InMemoryStore::new(), InMemoryPublisher::new(), fast_config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    drop(shutdown_tx);

    tokio::time::timeout(Duration::from_secs(1), relay.run(shutdown_rx))
        .await
        .expect("relay did not stop");
}

#[tokio::test]
async fn test_background_relay_dead_letters_unpublishable_rows() {
    let store = InMemoryStore::new();
    let publisher = InMemoryPublisher::new();
    publisher.set_fail_all(true);
    let relay = Arc::new(OutboxRelay::with_config(
        store.clone(),
        publisher.clone(),
        fast_config(),
    ));
    enqueue(&store, "sale-1").await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let relay = Arc::clone(&relay);
        async move { relay.run(shutdown_rx).await }
    });

    let observer = store.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let rows = observer.outbox_events().await;
            if rows[0].status == OutboxStatus::Failed {
                assert_eq!(rows[0].attempt_count, 2);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("row was not dead-lettered");

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
    assert_eq!(publisher.attempts(), 2);
}

#[tokio::test]
async fn test_shutdown_mid_batch_leaves_remaining_rows_untouched() {
    let store = InMemoryStore::new();
    let publisher = InMemoryPublisher::new();
    publisher.set_delay(Some(Duration::from_millis(100)));
    for sale in ["sale-1", "sale-2", "sale-3"] {
        enqueue(&store, sale).await;
    }
    let relay = Arc::new(OutboxRelay::with_config(
        store.clone(),
        publisher.clone(),
        fast_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let relay = Arc::clone(&relay);
        async move { relay.run(shutdown_rx).await }
    });

    // The first publish of the batch is still sleeping.
    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("relay did not stop")
        .unwrap();

    assert_eq!(publisher.published_count(), 1);
    assert_eq!(publisher.attempts(), 1);

    let rows = store.outbox_events().await;
    let published = rows
        .iter()
        .filter(|r| r.status == OutboxStatus::Published)
        .count();
    let untouched: Vec<_> = rows
        .iter()
        .filter(|r| r.status == OutboxStatus::Pending)
        .collect();
    assert_eq!(published, 1);
    assert_eq!(untouched.len(), 2);
    assert!(untouched.iter().all(|r| r.attempt_count == 0));
}
