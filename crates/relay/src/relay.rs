//! The outbox relay loop.

use std::time::Duration;

use chrono::Utc;
use stock_store::{OutboundEvent, OutboxStore};
use tokio::sync::watch;

use crate::backoff::RetryPolicy;
use crate::error::{RelayError, Result};
use crate::publisher::EventPublisher;

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum rows fetched per cycle.
    pub batch_size: usize,

    /// Sleep between cycles.
    pub interval: Duration,

    /// Upper bound on a single publish call.
    pub publish_timeout: Duration,

    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            interval: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// Publishes committed outbox rows, independently of the consumer.
pub struct OutboxRelay<S: OutboxStore, P: EventPublisher> {
    store: S,
    publisher: P,
    config: RelayConfig,
}

impl<S: OutboxStore, P: EventPublisher> OutboxRelay<S, P> {
    pub fn new(store: S, publisher: P) -> Self {
        Self::with_config(store, publisher, RelayConfig::default())
    }

    pub fn with_config(store: S, publisher: P, config: RelayConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Runs cycles every `interval` until `shutdown` turns true or its sender
    /// is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.config.batch_size,
            interval_ms = self.config.interval.as_millis() as u64,
            "outbox relay started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let stop = &shutdown;
            if let Err(e) = self.cycle(|| *stop.borrow()).await {
                tracing::error!(error = %e, "outbox relay cycle failed");
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        tracing::info!("outbox relay stopped");
    }

    /// Runs a single cycle over the rows due now.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.cycle(|| false).await
    }

    #[tracing::instrument(skip(self, stop_requested))]
    async fn cycle<F>(&self, stop_requested: F) -> Result<CycleReport>
    where
        F: Fn() -> bool + Send + Sync,
    {
        let pending = self
            .store
            .fetch_pending(self.config.batch_size, Utc::now())
            .await?;

        let mut report = CycleReport {
            fetched: pending.len(),
            ..CycleReport::default()
        };

        for event in &pending {
            if stop_requested() {
                tracing::info!("shutdown requested, leaving rest of batch pending");
                break;
            }
            self.relay_one(event, &mut report).await;
        }

        if report.fetched > 0 {
            tracing::debug!(
                fetched = report.fetched,
                published = report.published,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                "outbox cycle complete"
            );
        }
        Ok(report)
    }

    /// Publishes one row and records the result. Errors are logged, never
    /// propagated, so one bad row cannot stall the batch.
    async fn relay_one(&self, event: &OutboundEvent, report: &mut CycleReport) {
        match self.publish(event).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_published(event.id, Utc::now()).await {
                    // The row stays pending and will be published again.
                    tracing::error!(outbox_id = %event.id, error = %e, "failed to mark row published");
                    return;
                }
                metrics::counter!("outbox_published_total").increment(1);
                report.published += 1;
            }
            Err(e) => {
                let attempt = event.attempt_count + 1;
                let failure = self.config.retry.failure(attempt, e.to_string(), Utc::now());

                tracing::warn!(
                    outbox_id = %event.id,
                    routing_key = %event.routing_key,
                    attempt,
                    dead_letter = failure.dead_letter,
                    error = %e,
                    "publish failed"
                );

                if let Err(store_err) = self.store.record_failure(event.id, &failure).await {
                    tracing::error!(outbox_id = %event.id, error = %store_err, "failed to record publish failure");
                    return;
                }

                metrics::counter!("outbox_publish_failures_total").increment(1);
                report.failed += 1;
                if failure.dead_letter {
                    metrics::counter!("outbox_dead_lettered_total").increment(1);
                    report.dead_lettered += 1;
                }
            }
        }
    }

    async fn publish(&self, event: &OutboundEvent) -> Result<()> {
        match tokio::time::timeout(self.config.publish_timeout, self.publisher.publish(event)).await
        {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout(self.config.publish_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::InMemoryPublisher;
    use stock_store::{
        CorrelationId, InMemoryStore, OutboxStatus, TransactionCoordinator, UnitOfWork,
    };

    async fn enqueue(store: &InMemoryStore, sale: &str, routing_key: &str) -> OutboundEvent {
        let event = OutboundEvent::pending(
            CorrelationId::new(sale),
            routing_key,
            &serde_json::json!({"correlationId": sale}),
        )
        .unwrap();
        let mut uow = store.begin().await.unwrap();
        uow.outbox().enqueue(&event).await.unwrap();
        uow.commit().await.unwrap();
        event
    }

    fn relay(
        store: &InMemoryStore,
        publisher: &InMemoryPublisher,
    ) -> OutboxRelay<InMemoryStore, InMemoryPublisher> {
        OutboxRelay::with_config(
            store.clone(),
            publisher.clone(),
            RelayConfig {
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_backoff: Duration::ZERO,
                    max_backoff: Duration::ZERO,
                },
                ..RelayConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_published_rows_are_not_republished() {
        let store = InMemoryStore::new();
        let publisher = InMemoryPublisher::new();
        enqueue(&store, "sale-1", "stock.reserved").await;
        let relay = relay(&store, &publisher);

        let first = relay.run_cycle().await.unwrap();
        let second = relay.run_cycle().await.unwrap();

        assert_eq!(first.published, 1);
        assert_eq!(second.fetched, 0);
        assert_eq!(publisher.published_count(), 1);

        let rows = store.outbox_events().await;
        assert_eq!(rows[0].status, OutboxStatus::Published);
        assert!(rows[0].published_at.is_some());
    }

    #[tokio::test]
    async fn test_failure_increments_attempt_once_per_cycle() {
        let store = InMemoryStore::new();
        let publisher = InMemoryPublisher::new();
        publisher.set_fail_all(true);
        enqueue(&store, "sale-1", "stock.reserved").await;
        let relay = relay(&store, &publisher);

        relay.run_cycle().await.unwrap();
        let rows = store.outbox_events().await;
        assert_eq!(rows[0].attempt_count, 1);
        assert_eq!(rows[0].status, OutboxStatus::Pending);
        assert!(rows[0].error_text.as_deref().unwrap().contains("broker rejected"));

        relay.run_cycle().await.unwrap();
        assert_eq!(store.outbox_events().await[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn test_row_is_dead_lettered_after_max_attempts() {
        let store = InMemoryStore::new();
        let publisher = InMemoryPublisher::new();
        publisher.set_fail_all(true);
        enqueue(&store, "sale-1", "stock.reserved").await;
        let relay = relay(&store, &publisher);

        for _ in 0..3 {
            relay.run_cycle().await.unwrap();
        }
        let report = relay.run_cycle().await.unwrap();

        let rows = store.outbox_events().await;
        assert_eq!(rows[0].status, OutboxStatus::Failed);
        assert_eq!(rows[0].attempt_count, 3);
        assert_eq!(report.fetched, 0);
        assert_eq!(publisher.attempts(), 3);
    }

    #[tokio::test]
    async fn test_one_failing_row_does_not_block_the_batch() {
        let store = InMemoryStore::new();
        let publisher = InMemoryPublisher::new();
        publisher.fail_routing_key("stock.reservation_failed");
        enqueue(&store, "sale-1", "stock.reservation_failed").await;
        enqueue(&store, "sale-2", "stock.reserved").await;
        let relay = relay(&store, &publisher);

        let report = relay.run_cycle().await.unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.published, 1);
        assert_eq!(publisher.published()[0].correlation_id.as_str(), "sale-2");
    }

    #[tokio::test]
    async fn test_publish_timeout_counts_as_failure() {
        let store = InMemoryStore::new();
        let publisher = InMemoryPublisher::new();
        publisher.set_delay(Some(Duration::from_millis(200)));
        enqueue(&store, "sale-1", "stock.reserved").await;
        let relay = OutboxRelay::with_config(
            store.clone(),
            publisher.clone(),
            RelayConfig {
                publish_timeout: Duration::from_millis(20),
                ..RelayConfig::default()
            },
        );

        let report = relay.run_cycle().await.unwrap();

        assert_eq!(report.failed, 1);
        let rows = store.outbox_events().await;
        assert_eq!(rows[0].status, OutboxStatus::Pending);
        assert!(rows[0].error_text.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_store_outage_fails_the_cycle() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let relay = relay(&store, &InMemoryPublisher::new());

        let err = relay.run_cycle().await.unwrap_err();
        assert!(matches!(err, RelayError::Store(_)));
    }
}
