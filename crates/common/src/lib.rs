//! Shared identifiers and value types used across the lot reservation crates.

pub mod ids;
pub mod money;

pub use ids::{CorrelationId, LotId, MedicineId, MessageId, OutboxId};
pub use money::Money;
