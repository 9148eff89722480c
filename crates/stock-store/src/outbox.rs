use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationId, OutboxId, Result, StoreError};

/// Relay status of an outbox row.
///
/// ```text
/// Pending ──┬──► Published
///           └──► Failed   (retry budget exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    #[default]
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    /// Returns the status as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// An outbound event persisted in the same transaction as the state change it
/// reports, waiting to be relayed to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub id: OutboxId,

    /// The originating business transaction.
    pub correlation_id: CorrelationId,

    /// Broker routing key, e.g. `stock.reserved`.
    pub routing_key: String,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,

    /// Number of failed publish attempts.
    pub attempt_count: i32,

    /// Last publish error, if any.
    pub error_text: Option<String>,

    /// The relay skips the row until this instant.
    pub next_attempt_at: DateTime<Utc>,
}

impl OutboundEvent {
    /// Creates a pending event with a serialized payload.
    pub fn pending<P: Serialize>(
        correlation_id: CorrelationId,
        routing_key: impl Into<String>,
        payload: &P,
    ) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            id: OutboxId::new(),
            correlation_id,
            routing_key: routing_key.into(),
            payload: serde_json::to_value(payload)?,
            status: OutboxStatus::Pending,
            created_at: now,
            published_at: None,
            attempt_count: 0,
            error_text: None,
            next_attempt_at: now,
        })
    }

    /// Returns true if the relay should pick this row up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_attempt_at <= now
    }
}

/// A failed publish attempt, as recorded by the relay.
#[derive(Debug, Clone)]
pub struct PublishFailure {
    pub error: String,

    /// Earliest instant of the next attempt.
    pub next_attempt_at: DateTime<Utc>,

    /// Park the row as [`OutboxStatus::Failed`] instead of retrying.
    pub dead_letter: bool,
}
