//! Broker port and its in-process implementations.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use stock_store::{CorrelationId, OutboundEvent, OutboxId};

use crate::error::{RelayError, Result};

/// Publishes outbound events to the message broker.
///
/// Returning `Ok` means the broker accepted the message; only then does the
/// relay mark the outbox row as published.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboundEvent) -> Result<()>;
}

/// Writes every event as a structured log record.
///
/// Stands in for a broker connection when the worker runs without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event: &OutboundEvent) -> Result<()> {
        tracing::info!(
            target: "broker",
            outbox_id = %event.id,
            routing_key = %event.routing_key,
            correlation_id = %event.correlation_id,
            payload = %event.payload,
            "event published"
        );
        Ok(())
    }
}

/// A message accepted by the [`InMemoryPublisher`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub outbox_id: OutboxId,
    pub routing_key: String,
    pub correlation_id: CorrelationId,
    pub payload: serde_json::Value,
}

#[derive(Debug, Default)]
struct InMemoryPublisherState {
    published: Vec<PublishedMessage>,
    attempts: usize,
    fail_all: bool,
    failing_routing_keys: HashSet<String>,
    delay: Option<Duration>,
}

/// In-memory publisher for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPublisher {
    state: Arc<RwLock<InMemoryPublisherState>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every publish fail until reset.
    pub fn set_fail_all(&self, fail: bool) {
        self.write().fail_all = fail;
    }

    /// Makes publishes under `routing_key` fail.
    pub fn fail_routing_key(&self, routing_key: &str) {
        self.write()
            .failing_routing_keys
            .insert(routing_key.to_string());
    }

    /// Delays every publish, to exercise the publish timeout.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.write().delay = delay;
    }

    /// Returns the accepted messages in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.read().published.clone()
    }

    pub fn published_count(&self) -> usize {
        self.read().published.len()
    }

    /// Returns the number of publish calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.read().attempts
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryPublisherState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryPublisherState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, event: &OutboundEvent) -> Result<()> {
        let delay = self.read().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.write();
        state.attempts += 1;

        if state.fail_all || state.failing_routing_keys.contains(&event.routing_key) {
            return Err(RelayError::Publish(format!(
                "broker rejected {}",
                event.routing_key
            )));
        }

        state.published.push(PublishedMessage {
            outbox_id: event.id,
            routing_key: event.routing_key.clone(),
            correlation_id: event.correlation_id.clone(),
            payload: event.payload.clone(),
        });
        Ok(())
    }
}
