//! Sample stock for running the worker without a database.

use chrono::{Days, Utc};
use stock_store::{InMemoryStore, MedicineId, Money, NewLot};

/// Seeds two medicines with lots spread over the coming year.
///
/// Medicine 1 has 40 units over three lots; medicine 2 has 12 units in one lot.
pub async fn seed_demo_lots(store: &InMemoryStore) {
    let today = Utc::now().date_naive();
    let lots = [
        (1, "AMX-2401", 30, 10, 125),
        (1, "AMX-2402", 90, 20, 120),
        (1, "AMX-2403", 180, 10, 118),
        (2, "IBU-2401", 365, 12, 75),
    ];

    for (medicine, batch, days, quantity, cents) in lots {
        let expires = today + Days::new(days);
        store
            .insert_lot(NewLot::new(
                MedicineId::new(medicine),
                batch,
                expires,
                quantity,
                Money::from_cents(cents),
            ))
            .await;
    }

    tracing::info!(lots = lots.len(), "seeded demo lots");
}
