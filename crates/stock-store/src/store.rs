use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    AllocationRecord, CorrelationId, Lot, LotId, LotTake, MedicineId, MessageId, OutboundEvent,
    OutboxId, PublishFailure, Result,
};

/// Transaction-scoped access to the lot ledger.
#[async_trait]
pub trait LotLedger: Send {
    /// Returns the allocatable lots of a medicine in FEFO order: expiration
    /// date ascending, then lot id ascending.
    ///
    /// The returned rows are locked until the enclosing transaction ends, so
    /// concurrent allocations of the same medicine serialize on them.
    async fn eligible_lots(&mut self, medicine_id: MedicineId) -> Result<Vec<Lot>>;

    /// Overwrites the quantity of a lot read earlier in this transaction.
    async fn set_quantity(&mut self, lot_id: LotId, quantity: i32) -> Result<()>;

    /// Adds `quantity` back to a lot and returns the new quantity.
    async fn restore_quantity(&mut self, lot_id: LotId, quantity: i32) -> Result<i32>;
}

/// Transaction-scoped access to the per-reservation allocation records.
#[async_trait]
pub trait AllocationLedger: Send {
    /// Records the lot quantities taken for a reservation.
    async fn record(&mut self, correlation_id: &CorrelationId, takes: &[LotTake]) -> Result<()>;

    /// Returns the records of a reservation that have not been released yet,
    /// locking them until the enclosing transaction ends.
    async fn outstanding(&mut self, correlation_id: &CorrelationId)
    -> Result<Vec<AllocationRecord>>;

    /// Marks every outstanding record of a reservation as released.
    ///
    /// Returns the number of records released.
    async fn release(&mut self, correlation_id: &CorrelationId, at: DateTime<Utc>) -> Result<u64>;
}

/// The idempotency ledger: processed inbound message ids.
#[async_trait]
pub trait IdempotencyLedger: Send {
    async fn has_processed(&mut self, message_id: &MessageId) -> Result<bool>;

    /// Inserts the message id unless it is already present.
    ///
    /// Returns `true` if this call inserted the record. A second call for the
    /// same id is silent and returns `false`.
    async fn mark_processed(&mut self, message_id: &MessageId, routing_key: &str) -> Result<bool>;
}

/// Transaction-scoped write access to the outbox.
#[async_trait]
pub trait OutboxLedger: Send {
    async fn enqueue(&mut self, event: &OutboundEvent) -> Result<()>;
}

/// One open transaction together with the ledger handles bound to it.
///
/// Handles borrow the unit mutably, so none of them can be used after
/// [`commit`](UnitOfWork::commit) or [`rollback`](UnitOfWork::rollback)
/// consume it. Dropping an unfinished unit rolls it back.
#[async_trait]
pub trait UnitOfWork: Send {
    fn lots(&mut self) -> &mut dyn LotLedger;

    fn allocations(&mut self) -> &mut dyn AllocationLedger;

    fn idempotency(&mut self) -> &mut dyn IdempotencyLedger;

    fn outbox(&mut self) -> &mut dyn OutboxLedger;

    /// Commits the transaction. On failure the transaction is rolled back and
    /// the error returned.
    async fn commit(self) -> Result<()>;

    /// Rolls the transaction back.
    async fn rollback(self) -> Result<()>;
}

/// Opens units of work against a store.
#[async_trait]
pub trait TransactionCoordinator: Send + Sync {
    type Unit: UnitOfWork + 'static;

    /// Acquires a connection and starts a transaction on it.
    async fn begin(&self) -> Result<Self::Unit>;

    /// Idempotency check outside any transaction, used to short-circuit
    /// redeliveries before a connection is held for a transaction.
    async fn has_processed(&self, message_id: &MessageId) -> Result<bool>;
}

/// Relay-side access to the outbox. Only committed rows are visible.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` pending rows due at `now`, oldest first.
    async fn fetch_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboundEvent>>;

    /// Marks a pending row as published. Rows in any other status are left
    /// untouched.
    async fn mark_published(&self, id: OutboxId, at: DateTime<Utc>) -> Result<()>;

    /// Increments the attempt counter of a pending row and records the error.
    async fn record_failure(&self, id: OutboxId, failure: &PublishFailure) -> Result<()>;
}
