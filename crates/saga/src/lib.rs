//! Saga participant reserving medicine lots for the sale saga.
//!
//! The consumer reacts to two inbound events:
//! 1. `reservation.requested`: allocate every line FEFO, all or nothing
//! 2. `reservation.cancelled`: give back exactly what the reservation took
//!
//! Each inbound message has at most one business effect. Its outcome is
//! written to the outbox in the same transaction as the stock change and the
//! idempotency marker; the relay delivers it to the originating saga later.

pub mod consumer;
pub mod error;
pub mod messages;
pub mod state;

pub use consumer::{Acknowledgement, ConsumerConfig, Outcome, SagaConsumer};
pub use error::SagaError;
pub use messages::{
    InboundMessage, ReservationLine, RoutingKey, STOCK_RELEASED, STOCK_RESERVATION_FAILED,
    STOCK_RESERVED, StockReleased, StockReservationFailed, StockReserved,
};
pub use state::MessageState;
