//! The saga consumer: one inbound delivery in, one committed outcome out.

use std::time::{Duration, Instant};

use chrono::Utc;
use stock_store::{
    Allocation, AllocationError, LotLedgerExt, Money, OutboundEvent, TransactionCoordinator,
    UnitOfWork,
};

use crate::error::{Result, SagaError};
use crate::messages::{
    InboundMessage, ReservationLine, RoutingKey, STOCK_RELEASED, STOCK_RESERVATION_FAILED,
    STOCK_RESERVED, StockReleased, StockReservationFailed, StockReserved,
};
use crate::state::MessageState;

/// Reason recorded when a reservation request carries no lines.
const EMPTY_RESERVATION: &str = "reservation has no items";

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Upper bound on one transactional unit, from idempotency check to commit.
    pub unit_timeout: Duration,

    /// Ask the transport to requeue deliveries that failed for infrastructure
    /// reasons. Off by default: a dead-letter policy on the queue decides.
    pub requeue_on_transient: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            unit_timeout: Duration::from_secs(10),
            requeue_on_transient: false,
        }
    }
}

/// The committed effect of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The message id was already processed; nothing changed.
    Duplicate,

    /// Every line was allocated and `stock.reserved` enqueued.
    Confirmed { total_cost: Money },

    /// The reservation could not be satisfied and `stock.reservation_failed`
    /// enqueued.
    Failed { reason: String },

    /// Outstanding allocations were restored and `stock.released` enqueued.
    Released { restored_quantity: i64 },
}

impl Outcome {
    /// Metric label for this outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Duplicate => "duplicate",
            Outcome::Confirmed { .. } => "confirmed",
            Outcome::Failed { .. } => "failed",
            Outcome::Released { .. } => "released",
        }
    }

    /// The state the message is in once this outcome is durable.
    pub fn state(&self) -> MessageState {
        match self {
            Outcome::Duplicate => MessageState::Done,
            _ => MessageState::Recorded,
        }
    }
}

/// What the transport should do with the delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Processing finished, or had already finished for this message id.
    Ack(Outcome),

    /// The delivery can never be processed.
    Reject { reason: String },

    /// Processing failed and nothing was committed.
    Nack { requeue: bool, reason: String },
}

impl Acknowledgement {
    pub fn is_ack(&self) -> bool {
        matches!(self, Acknowledgement::Ack(_))
    }
}

/// Consumes `reservation.requested` and `reservation.cancelled` deliveries.
///
/// Each delivery runs in one unit of work: the idempotency marker, the lot
/// mutations, the allocation records and the outbound event commit together
/// or not at all.
pub struct SagaConsumer<C: TransactionCoordinator> {
    coordinator: C,
    config: ConsumerConfig,
}

impl<C: TransactionCoordinator> SagaConsumer<C> {
    /// Creates a consumer with the default configuration.
    pub fn new(coordinator: C) -> Self {
        Self::with_config(coordinator, ConsumerConfig::default())
    }

    pub fn with_config(coordinator: C, config: ConsumerConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    pub fn coordinator(&self) -> &C {
        &self.coordinator
    }

    /// Handles one raw delivery and tells the transport how to settle it.
    ///
    /// Undecodable deliveries are rejected. Infrastructure failures and
    /// timeouts are nacked after the unit of work has been rolled back.
    #[tracing::instrument(skip(self, body), fields(message_id, correlation_id))]
    pub async fn handle_delivery(&self, routing_key: &str, body: &[u8]) -> Acknowledgement {
        let message = match InboundMessage::decode(routing_key, body) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting undecodable delivery");
                metrics::counter!("reservations_processed_total", "outcome" => "rejected")
                    .increment(1);
                return Acknowledgement::Reject {
                    reason: e.to_string(),
                };
            }
        };

        let span = tracing::Span::current();
        span.record("message_id", message.message_id.as_str());
        span.record("correlation_id", message.correlation_id.as_str());

        match self.handle(&message).await {
            Ok(outcome) => Acknowledgement::Ack(outcome),
            Err(e) => {
                tracing::error!(error = %e, "message processing failed, nothing committed");
                metrics::counter!("reservations_processed_total", "outcome" => "nacked")
                    .increment(1);
                Acknowledgement::Nack {
                    requeue: self.config.requeue_on_transient && e.is_transient(),
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Processes a decoded message within the configured time bound.
    ///
    /// A unit of work still open when the bound expires is dropped, which
    /// rolls it back.
    pub async fn handle(&self, message: &InboundMessage) -> Result<Outcome> {
        let start = Instant::now();

        let outcome = tokio::time::timeout(self.config.unit_timeout, self.process(message))
            .await
            .map_err(|_| SagaError::Timeout(self.config.unit_timeout))??;

        if outcome.state() == MessageState::Recorded {
            outcome.state().transition_to(MessageState::Acknowledged)?;
        }

        metrics::counter!("reservations_processed_total", "outcome" => outcome.as_str())
            .increment(1);
        metrics::histogram!("reservation_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        tracing::info!(
            routing_key = %message.routing_key,
            outcome = outcome.as_str(),
            "message processed"
        );

        Ok(outcome)
    }

    async fn process(&self, message: &InboundMessage) -> Result<Outcome> {
        let mut state = MessageState::Received;

        if self.coordinator.has_processed(&message.message_id).await? {
            advance(&mut state, MessageState::Done)?;
            return Ok(duplicate(message));
        }

        match message.routing_key {
            RoutingKey::ReservationRequested if message.items.is_empty() => {
                advance(&mut state, MessageState::Failed)?;
                self.record_failure(message, EMPTY_RESERVATION.to_string(), &mut state)
                    .await
            }
            RoutingKey::ReservationRequested => self.reserve(message, &mut state).await,
            RoutingKey::ReservationCancelled => self.release(message, &mut state).await,
        }
    }

    async fn reserve(&self, message: &InboundMessage, state: &mut MessageState) -> Result<Outcome> {
        advance(state, MessageState::Allocating)?;

        let mut uow = self.coordinator.begin().await?;
        if !claim(&mut uow, message).await? {
            uow.rollback().await?;
            advance(state, MessageState::Done)?;
            return Ok(duplicate(message));
        }

        let (allocations, total_cost) = match allocate_lines(&mut uow, &message.items).await {
            Ok(allocated) => allocated,
            Err(AllocationError::Store(e)) => {
                // The unit is dropped on the error path, which rolls it back.
                return Err(e.into());
            }
            Err(shortfall) => {
                uow.rollback().await?;
                tracing::info!(reason = %shortfall, "reservation cannot be satisfied");
                advance(state, MessageState::Failed)?;
                return self
                    .record_failure(message, shortfall.to_string(), state)
                    .await;
            }
        };

        for allocation in &allocations {
            uow.allocations()
                .record(&message.correlation_id, &allocation.takes)
                .await?;
        }

        let event = OutboundEvent::pending(
            message.correlation_id.clone(),
            STOCK_RESERVED,
            &StockReserved::new(message.correlation_id.clone(), total_cost),
        )?;
        uow.outbox().enqueue(&event).await?;

        advance(state, MessageState::Confirmed)?;
        uow.commit().await?;
        advance(state, MessageState::Recorded)?;

        Ok(Outcome::Confirmed { total_cost })
    }

    /// Records a business failure in a fresh unit of work, after the unit that
    /// attempted the allocation has been rolled back.
    async fn record_failure(
        &self,
        message: &InboundMessage,
        reason: String,
        state: &mut MessageState,
    ) -> Result<Outcome> {
        let mut uow = self.coordinator.begin().await?;
        if !claim(&mut uow, message).await? {
            uow.rollback().await?;
            advance(state, MessageState::Done)?;
            return Ok(duplicate(message));
        }

        let event = OutboundEvent::pending(
            message.correlation_id.clone(),
            STOCK_RESERVATION_FAILED,
            &StockReservationFailed {
                correlation_id: message.correlation_id.clone(),
                reason: reason.clone(),
            },
        )?;
        uow.outbox().enqueue(&event).await?;
        uow.commit().await?;
        advance(state, MessageState::Recorded)?;

        Ok(Outcome::Failed { reason })
    }

    /// Restores every outstanding allocation of the reservation.
    ///
    /// A cancellation with nothing outstanding still commits its idempotency
    /// marker and reports zero restored units.
    async fn release(&self, message: &InboundMessage, state: &mut MessageState) -> Result<Outcome> {
        advance(state, MessageState::Releasing)?;

        let mut uow = self.coordinator.begin().await?;
        if !claim(&mut uow, message).await? {
            uow.rollback().await?;
            advance(state, MessageState::Done)?;
            return Ok(duplicate(message));
        }

        let records = uow
            .allocations()
            .outstanding(&message.correlation_id)
            .await?;

        let mut restored_quantity: i64 = 0;
        for record in &records {
            uow.lots()
                .restore_quantity(record.lot_id, record.quantity)
                .await?;
            restored_quantity += i64::from(record.quantity);
        }
        uow.allocations()
            .release(&message.correlation_id, Utc::now())
            .await?;

        let event = OutboundEvent::pending(
            message.correlation_id.clone(),
            STOCK_RELEASED,
            &StockReleased {
                correlation_id: message.correlation_id.clone(),
                restored_quantity,
            },
        )?;
        uow.outbox().enqueue(&event).await?;
        uow.commit().await?;
        advance(state, MessageState::Recorded)?;

        tracing::info!(
            records = records.len(),
            restored_quantity,
            "reservation released"
        );
        Ok(Outcome::Released { restored_quantity })
    }
}

fn advance(state: &mut MessageState, next: MessageState) -> Result<()> {
    *state = state.transition_to(next)?;
    tracing::debug!(state = %state, "message state changed");
    Ok(())
}

fn duplicate(message: &InboundMessage) -> Outcome {
    tracing::info!(message_id = %message.message_id, "duplicate delivery ignored");
    metrics::counter!("duplicate_messages_total").increment(1);
    Outcome::Duplicate
}

/// Claims the message id inside the unit. Returns false if a concurrent
/// delivery of the same message committed first.
async fn claim<U: UnitOfWork>(uow: &mut U, message: &InboundMessage) -> Result<bool> {
    Ok(uow
        .idempotency()
        .mark_processed(&message.message_id, message.routing_key.as_str())
        .await?)
}

/// Allocates every line and sums their cost, stopping at the first line that
/// cannot be satisfied.
///
/// Lines are visited in medicine id order so that concurrent reservations
/// lock lots in the same order.
async fn allocate_lines<U: UnitOfWork>(
    uow: &mut U,
    lines: &[ReservationLine],
) -> std::result::Result<(Vec<Allocation>, Money), AllocationError> {
    let mut ordered: Vec<&ReservationLine> = lines.iter().collect();
    ordered.sort_by_key(|line| line.medicine_id);

    let mut allocations = Vec::with_capacity(ordered.len());
    let mut total_cost = Money::zero();
    for line in ordered {
        let allocation = uow.lots().allocate(line.medicine_id, line.quantity).await?;
        total_cost = total_cost
            .checked_add(allocation.cost)
            .ok_or(AllocationError::CostOverflow {
                medicine_id: line.medicine_id,
            })?;
        allocations.push(allocation);
    }
    Ok((allocations, total_cost))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use stock_store::{CorrelationId, InMemoryStore, MedicineId, NewLot};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn store_with_stock(quantity: i32) -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .insert_lot(NewLot::new(
                MedicineId::new(1),
                "LOT-1",
                date(2025, 1, 1),
                quantity,
                Money::from_cents(250),
            ))
            .await;
        store
    }

    #[tokio::test]
    async fn test_undecodable_delivery_is_rejected_without_effect() {
        let store = store_with_stock(5).await;
        let consumer = SagaConsumer::new(store.clone());

        let ack = consumer
            .handle_delivery("reservation.requested", b"{\"messageId\":")
            .await;

        assert!(matches!(ack, Acknowledgement::Reject { .. }));
        assert_eq!(store.processed_count().await, 0);
        assert!(store.outbox_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_routing_key_is_rejected() {
        let consumer = SagaConsumer::new(InMemoryStore::new());
        let ack = consumer
            .handle_delivery(
                "payment.captured",
                br#"{"messageId":"m","correlationId":"c"}"#,
            )
            .await;
        assert!(matches!(ack, Acknowledgement::Reject { .. }));
    }

    #[tokio::test]
    async fn test_empty_reservation_records_failure() {
        let store = InMemoryStore::new();
        let consumer = SagaConsumer::new(store.clone());

        let message = InboundMessage::reservation_requested("m-empty", "sale-empty", vec![]);
        let outcome = consumer.handle(&message).await.unwrap();

        assert_eq!(
            outcome,
            Outcome::Failed {
                reason: EMPTY_RESERVATION.to_string()
            }
        );
        let events = store.outbox_for(&CorrelationId::new("sale-empty")).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].routing_key, STOCK_RESERVATION_FAILED);
    }

    #[tokio::test]
    async fn test_unavailable_store_nacks_without_requeue() {
        let store = store_with_stock(5).await;
        store.set_unavailable(true);
        let consumer = SagaConsumer::new(store.clone());

        let ack = consumer
            .handle_delivery(
                "reservation.requested",
                br#"{"messageId":"m-1","correlationId":"s-1","items":[{"medicineId":1,"quantity":1}]}"#,
            )
            .await;

        assert!(matches!(ack, Acknowledgement::Nack { requeue: false, .. }));
        store.set_unavailable(false);
        assert_eq!(store.processed_count().await, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_when_configured() {
        let store = store_with_stock(5).await;
        store.set_unavailable(true);
        let consumer = SagaConsumer::with_config(
            store,
            ConsumerConfig {
                requeue_on_transient: true,
                ..ConsumerConfig::default()
            },
        );

        let message = InboundMessage::reservation_requested(
            "m-2",
            "s-2",
            vec![ReservationLine::new(1, 1)],
        );
        let err = consumer.handle(&message).await.unwrap_err();
        assert!(err.is_transient());

        let ack = consumer
            .handle_delivery(
                "reservation.requested",
                br#"{"messageId":"m-2","correlationId":"s-2","items":[{"medicineId":1,"quantity":1}]}"#,
            )
            .await;
        assert!(matches!(ack, Acknowledgement::Nack { requeue: true, .. }));
    }

    #[test]
    fn test_default_unit_timeout_leaves_room_for_several_store_calls() {
        let config = ConsumerConfig::default();
        assert_eq!(config.unit_timeout, Duration::from_secs(10));
        assert!(!config.requeue_on_transient);
    }

    #[test]
    fn test_outcome_states() {
        assert_eq!(Outcome::Duplicate.state(), MessageState::Done);
        assert_eq!(
            Outcome::Released {
                restored_quantity: 0
            }
            .state(),
            MessageState::Recorded
        );
        assert_eq!(
            Outcome::Confirmed {
                total_cost: Money::zero()
            }
            .as_str(),
            "confirmed"
        );
    }
}
