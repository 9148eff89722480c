//! Transactional ledgers for the lot reservation participant.
//!
//! The store keeps four durable collections: lots, allocation records,
//! processed inbound messages and the outbox. All writes made on behalf of an
//! inbound message go through a [`UnitOfWork`] obtained from a
//! [`TransactionCoordinator`], so stock changes, allocation records, the
//! idempotency marker and the outbound event commit or roll back together.

pub mod allocation;
pub mod error;
pub mod lot;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod processed;
pub mod store;

pub use allocation::{Allocation, LotLedgerExt, LotTake};
pub use common::{CorrelationId, LotId, MedicineId, MessageId, Money, OutboxId};
pub use error::{AllocationError, Result, StoreError};
pub use lot::{AllocationRecord, Lot, NewLot};
pub use memory::{InMemoryStore, InMemoryUnitOfWork};
pub use outbox::{OutboundEvent, OutboxStatus, PublishFailure};
pub use postgres::{PostgresStore, PostgresUnitOfWork};
pub use processed::ProcessedMessage;
pub use store::{
    AllocationLedger, IdempotencyLedger, LotLedger, OutboxLedger, OutboxStore,
    TransactionCoordinator, UnitOfWork,
};
