//! FEFO allocation over a transaction-scoped lot ledger.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::LotLedger;
use crate::{AllocationError, LotId, MedicineId, Money};

/// Quantity taken from a single lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotTake {
    pub lot_id: LotId,
    pub medicine_id: MedicineId,
    pub quantity: i32,
    pub unit_cost: Money,
}

impl LotTake {
    /// `take * unit_cost`, or `None` if it does not fit.
    pub fn cost(&self) -> Option<Money> {
        self.unit_cost.checked_multiply(self.quantity)
    }
}

/// A satisfied reservation line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub medicine_id: MedicineId,
    pub requested: i32,

    /// Lots touched, in the order they were consumed.
    pub takes: Vec<LotTake>,

    /// Sum of `take * unit_cost` over all takes.
    pub cost: Money,
}

/// Extension trait adding FEFO allocation to every lot ledger.
#[async_trait]
pub trait LotLedgerExt: LotLedger {
    /// Takes `requested` units of a medicine from its eligible lots,
    /// soonest-to-expire first.
    ///
    /// Each lot mutation is written immediately within the caller's
    /// transaction. On [`AllocationError::InsufficientStock`] or
    /// [`AllocationError::CostOverflow`] the lots already
    /// decremented for this call stay decremented; the caller must roll the
    /// transaction back to discard them.
    async fn allocate(
        &mut self,
        medicine_id: MedicineId,
        requested: i32,
    ) -> std::result::Result<Allocation, AllocationError> {
        if requested <= 0 {
            return Err(AllocationError::InvalidQuantity {
                medicine_id,
                quantity: requested,
            });
        }

        let lots = self.eligible_lots(medicine_id).await?;

        let mut remaining = requested;
        let mut takes = Vec::new();
        let mut cost = Money::zero();

        for lot in lots {
            if remaining == 0 {
                break;
            }

            let take = remaining.min(lot.quantity);
            if take <= 0 {
                continue;
            }

            self.set_quantity(lot.id, lot.quantity - take).await?;
            remaining -= take;

            let lot_take = LotTake {
                lot_id: lot.id,
                medicine_id,
                quantity: take,
                unit_cost: lot.unit_cost,
            };
            cost = lot_take
                .cost()
                .and_then(|take_cost| cost.checked_add(take_cost))
                .ok_or(AllocationError::CostOverflow { medicine_id })?;
            takes.push(lot_take);
        }

        if remaining > 0 {
            tracing::debug!(%medicine_id, requested, shortfall = remaining, "insufficient stock");
            return Err(AllocationError::InsufficientStock {
                medicine_id,
                requested,
                shortfall: remaining,
            });
        }

        Ok(Allocation {
            medicine_id,
            requested,
            takes,
            cost,
        })
    }
}

// Blanket implementation for all lot ledgers, including trait objects
impl<T: LotLedger + ?Sized> LotLedgerExt for T {}
