//! Saga error types.

use std::time::Duration;

use stock_store::StoreError;
use thiserror::Error;

use crate::state::MessageState;

/// Errors that can occur while consuming an inbound message.
///
/// Business shortfalls are not errors: they are recorded as a
/// `stock.reservation_failed` outbound event and acknowledged.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Store error. The unit of work has been rolled back.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The delivery arrived under a routing key this participant does not handle.
    #[error("Unknown routing key: {0}")]
    UnknownRoutingKey(String),

    /// The envelope decoded but is missing required fields.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A message moved between states in an order the protocol forbids.
    #[error("Invalid message state transition from {from} to {to}")]
    InvalidTransition { from: MessageState, to: MessageState },

    /// The transactional unit did not finish in time and was rolled back.
    #[error("Processing timed out after {0:?}")]
    Timeout(Duration),
}

impl SagaError {
    /// Returns true if the failure came from the infrastructure, so a later
    /// redelivery may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SagaError::Store(_) | SagaError::Timeout(_))
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
