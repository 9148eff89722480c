use std::time::Duration;

use thiserror::Error;

use crate::{LotId, MedicineId};

/// Errors raised by the ledgers and the transaction coordinator.
///
/// Every variant is an infrastructure failure from the point of view of the
/// saga consumer: the unit of work is rolled back and the inbound delivery is
/// negatively acknowledged.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A lot referenced by an allocation record no longer exists.
    #[error("Lot not found: {0}")]
    LotNotFound(LotId),

    /// The transaction could not be committed and was rolled back.
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// The store refused to serve the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A store call did not complete within the configured bound.
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// Restoring units would push a lot past the largest representable
    /// quantity.
    #[error("Quantity overflow on lot {0}")]
    QuantityOverflow(LotId),

    /// An outbox row carried a status this version does not know.
    #[error("Unknown outbox status: {0}")]
    UnknownStatus(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a failed FEFO allocation for one reservation line.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Eligible lots were exhausted before the requested quantity was met.
    #[error(
        "Insufficient stock for medicine {medicine_id}: requested {requested}, short by {shortfall}"
    )]
    InsufficientStock {
        medicine_id: MedicineId,
        requested: i32,
        shortfall: i32,
    },

    /// The requested quantity was zero or negative.
    #[error("Invalid quantity {quantity} requested for medicine {medicine_id}")]
    InvalidQuantity {
        medicine_id: MedicineId,
        quantity: i32,
    },

    /// The cost of the allocated units does not fit in the money type.
    #[error("Cost overflow while allocating medicine {medicine_id}")]
    CostOverflow { medicine_id: MedicineId },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AllocationError {
    /// Returns true for outcomes that belong to the business protocol rather
    /// than to the infrastructure.
    pub fn is_business_outcome(&self) -> bool {
        !matches!(self, AllocationError::Store(_))
    }
}
