//! Relay error types.

use std::time::Duration;

use stock_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The broker refused or failed to accept the message.
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The broker did not answer within the configured bound.
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, RelayError>;
