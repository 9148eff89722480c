use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    AllocationRecord, CorrelationId, Lot, LotId, LotTake, MedicineId, MessageId, NewLot,
    OutboundEvent, OutboxId, OutboxStatus, ProcessedMessage, PublishFailure, Result, StoreError,
    store::{
        AllocationLedger, IdempotencyLedger, LotLedger, OutboxLedger, OutboxStore,
        TransactionCoordinator, UnitOfWork,
    },
};

#[derive(Debug, Clone, Default)]
struct State {
    lots: BTreeMap<LotId, Lot>,
    next_lot_id: i64,
    allocations: Vec<AllocationRecord>,
    next_allocation_id: i64,
    processed: HashMap<MessageId, ProcessedMessage>,
    outbox: Vec<OutboundEvent>,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_next_commit: AtomicBool,
}

/// In-memory store implementation for testing.
///
/// A unit of work holds the store lock for its whole lifetime, so units are
/// fully serialized. That is stricter than the row locks of the PostgreSQL
/// implementation but gives the same observable results.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a lot and returns it with its assigned id.
    pub async fn insert_lot(&self, new_lot: NewLot) -> Lot {
        let mut state = self.state.lock().await;
        state.next_lot_id += 1;
        let lot = Lot {
            id: LotId::new(state.next_lot_id),
            medicine_id: new_lot.medicine_id,
            batch_code: new_lot.batch_code,
            expiration_date: new_lot.expiration_date,
            quantity: new_lot.quantity,
            unit_cost: new_lot.unit_cost,
            is_deleted: false,
            created_at: Utc::now(),
            updated_at: None,
        };
        state.lots.insert(lot.id, lot.clone());
        lot
    }

    /// Soft-deletes a lot, as the CRUD path would.
    pub async fn soft_delete_lot(&self, lot_id: LotId) {
        let mut state = self.state.lock().await;
        if let Some(lot) = state.lots.get_mut(&lot_id) {
            lot.is_deleted = true;
            lot.updated_at = Some(Utc::now());
        }
    }

    pub async fn get_lot(&self, lot_id: LotId) -> Option<Lot> {
        self.state.lock().await.lots.get(&lot_id).cloned()
    }

    /// Returns every outbox row in insertion order.
    pub async fn outbox_events(&self) -> Vec<OutboundEvent> {
        self.state.lock().await.outbox.clone()
    }

    /// Returns the outbox rows of one business transaction.
    pub async fn outbox_for(&self, correlation_id: &CorrelationId) -> Vec<OutboundEvent> {
        self.state
            .lock()
            .await
            .outbox
            .iter()
            .filter(|e| &e.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    /// Returns every allocation record of a reservation, released or not.
    pub async fn allocations_for(&self, correlation_id: &CorrelationId) -> Vec<AllocationRecord> {
        self.state
            .lock()
            .await
            .allocations
            .iter()
            .filter(|r| &r.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    pub async fn processed_count(&self) -> usize {
        self.state.lock().await.processed.len()
    }

    /// Makes `begin` and the idempotency pre-check fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next commit fail and roll back.
    pub fn fail_next_commit(&self) {
        self.faults.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        Ok(())
    }
}

/// A unit of work over the in-memory store.
///
/// Mutations are applied in place; a snapshot taken at `begin` is restored on
/// rollback, on a failed commit, or when the unit is dropped unfinished.
pub struct InMemoryUnitOfWork {
    guard: OwnedMutexGuard<State>,
    snapshot: Option<State>,
    faults: Arc<Faults>,
}

impl InMemoryUnitOfWork {
    fn restore(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

impl Drop for InMemoryUnitOfWork {
    fn drop(&mut self) {
        self.restore();
    }
}

#[async_trait]
impl TransactionCoordinator for InMemoryStore {
    type Unit = InMemoryUnitOfWork;

    async fn begin(&self) -> Result<InMemoryUnitOfWork> {
        self.check_available()?;
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = guard.clone();
        Ok(InMemoryUnitOfWork {
            guard,
            snapshot: Some(snapshot),
            faults: Arc::clone(&self.faults),
        })
    }

    async fn has_processed(&self, message_id: &MessageId) -> Result<bool> {
        self.check_available()?;
        Ok(self.state.lock().await.processed.contains_key(message_id))
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    fn lots(&mut self) -> &mut dyn LotLedger {
        self
    }

    fn allocations(&mut self) -> &mut dyn AllocationLedger {
        self
    }

    fn idempotency(&mut self) -> &mut dyn IdempotencyLedger {
        self
    }

    fn outbox(&mut self) -> &mut dyn OutboxLedger {
        self
    }

    async fn commit(mut self) -> Result<()> {
        if self.faults.fail_next_commit.swap(false, Ordering::SeqCst) {
            self.restore();
            return Err(StoreError::CommitFailed("injected commit failure".to_string()));
        }
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.restore();
        Ok(())
    }
}

#[async_trait]
impl LotLedger for InMemoryUnitOfWork {
    async fn eligible_lots(&mut self, medicine_id: MedicineId) -> Result<Vec<Lot>> {
        let mut lots: Vec<Lot> = self
            .guard
            .lots
            .values()
            .filter(|lot| lot.medicine_id == Some(medicine_id) && lot.is_allocatable())
            .cloned()
            .collect();
        lots.sort_by(|a, b| {
            a.expiration_date
                .cmp(&b.expiration_date)
                .then(a.id.cmp(&b.id))
        });
        Ok(lots)
    }

    async fn set_quantity(&mut self, lot_id: LotId, quantity: i32) -> Result<()> {
        let lot = self
            .guard
            .lots
            .get_mut(&lot_id)
            .ok_or(StoreError::LotNotFound(lot_id))?;
        lot.quantity = quantity;
        lot.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn restore_quantity(&mut self, lot_id: LotId, quantity: i32) -> Result<i32> {
        let lot = self
            .guard
            .lots
            .get_mut(&lot_id)
            .ok_or(StoreError::LotNotFound(lot_id))?;
        lot.quantity = lot
            .quantity
            .checked_add(quantity)
            .ok_or(StoreError::QuantityOverflow(lot_id))?;
        lot.updated_at = Some(Utc::now());
        Ok(lot.quantity)
    }
}

#[async_trait]
impl AllocationLedger for InMemoryUnitOfWork {
    async fn record(&mut self, correlation_id: &CorrelationId, takes: &[LotTake]) -> Result<()> {
        let now = Utc::now();
        for take in takes {
            self.guard.next_allocation_id += 1;
            let id = self.guard.next_allocation_id;
            self.guard.allocations.push(AllocationRecord {
                id,
                correlation_id: correlation_id.clone(),
                lot_id: take.lot_id,
                medicine_id: take.medicine_id,
                quantity: take.quantity,
                unit_cost: take.unit_cost,
                created_at: now,
                released_at: None,
            });
        }
        Ok(())
    }

    async fn outstanding(
        &mut self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<AllocationRecord>> {
        Ok(self
            .guard
            .allocations
            .iter()
            .filter(|r| &r.correlation_id == correlation_id && r.released_at.is_none())
            .cloned()
            .collect())
    }

    async fn release(&mut self, correlation_id: &CorrelationId, at: DateTime<Utc>) -> Result<u64> {
        let mut released = 0;
        for record in self
            .guard
            .allocations
            .iter_mut()
            .filter(|r| &r.correlation_id == correlation_id && r.released_at.is_none())
        {
            record.released_at = Some(at);
            released += 1;
        }
        Ok(released)
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryUnitOfWork {
    async fn has_processed(&mut self, message_id: &MessageId) -> Result<bool> {
        Ok(self.guard.processed.contains_key(message_id))
    }

    async fn mark_processed(&mut self, message_id: &MessageId, routing_key: &str) -> Result<bool> {
        if self.guard.processed.contains_key(message_id) {
            return Ok(false);
        }
        self.guard.processed.insert(
            message_id.clone(),
            ProcessedMessage {
                message_id: message_id.clone(),
                routing_key: routing_key.to_string(),
                processed_at: Utc::now(),
            },
        );
        Ok(true)
    }
}

#[async_trait]
impl OutboxLedger for InMemoryUnitOfWork {
    async fn enqueue(&mut self, event: &OutboundEvent) -> Result<()> {
        self.guard.outbox.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn fetch_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboundEvent>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut pending: Vec<OutboundEvent> = state
            .outbox
            .iter()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_published(&self, id: OutboxId, at: DateTime<Utc>) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(event) = state
            .outbox
            .iter_mut()
            .find(|e| e.id == id && e.status == OutboxStatus::Pending)
        {
            event.status = OutboxStatus::Published;
            event.published_at = Some(at);
        }
        Ok(())
    }

    async fn record_failure(&self, id: OutboxId, failure: &PublishFailure) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some(event) = state
            .outbox
            .iter_mut()
            .find(|e| e.id == id && e.status == OutboxStatus::Pending)
        {
            event.attempt_count += 1;
            event.error_text = Some(failure.error.clone());
            event.next_attempt_at = failure.next_attempt_at;
            if failure.dead_letter {
                event.status = OutboxStatus::Failed;
            }
        }
        Ok(())
    }
}
