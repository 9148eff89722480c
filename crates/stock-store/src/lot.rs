use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationId, LotId, MedicineId, Money};

/// A persisted inventory batch of one medicine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub id: LotId,

    /// Lots imported without a catalogue reference are never allocated.
    pub medicine_id: Option<MedicineId>,

    /// Manufacturer batch code.
    pub batch_code: String,

    pub expiration_date: NaiveDate,

    /// Units on hand. Never negative.
    pub quantity: i32,

    /// Cost of a single unit.
    pub unit_cost: Money,

    /// Soft-delete flag set by the CRUD path.
    pub is_deleted: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Lot {
    /// Returns true if the lot may take part in a FEFO allocation.
    pub fn is_allocatable(&self) -> bool {
        self.quantity > 0 && !self.is_deleted
    }
}

/// Data needed to insert a lot.
///
/// The lots CRUD service owns lot creation; this type exists so tests and
/// local runs can seed the ledger.
#[derive(Debug, Clone)]
pub struct NewLot {
    pub medicine_id: Option<MedicineId>,
    pub batch_code: String,
    pub expiration_date: NaiveDate,
    pub quantity: i32,
    pub unit_cost: Money,
}

impl NewLot {
    pub fn new(
        medicine_id: MedicineId,
        batch_code: impl Into<String>,
        expiration_date: NaiveDate,
        quantity: i32,
        unit_cost: Money,
    ) -> Self {
        Self {
            medicine_id: Some(medicine_id),
            batch_code: batch_code.into(),
            expiration_date,
            quantity,
            unit_cost,
        }
    }
}

/// Durable record of a quantity taken from a lot for one reservation.
///
/// Cancellation of the reservation adds `quantity` back to `lot_id` and sets
/// `released_at`, so each record is compensated at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub id: i64,
    pub correlation_id: CorrelationId,
    pub lot_id: LotId,
    pub medicine_id: MedicineId,
    pub quantity: i32,
    pub unit_cost: Money,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}
