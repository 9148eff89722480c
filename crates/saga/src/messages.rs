//! Inbound envelopes and outbound payloads exchanged with the sale saga.
//!
//! Field names on the wire are camelCase.

use serde::{Deserialize, Serialize};
use stock_store::{CorrelationId, MedicineId, MessageId, Money};

use crate::error::{Result, SagaError};

/// Routing key for a successful reservation.
pub const STOCK_RESERVED: &str = "stock.reserved";

/// Routing key for a reservation that could not be satisfied.
pub const STOCK_RESERVATION_FAILED: &str = "stock.reservation_failed";

/// Routing key for a completed compensation.
pub const STOCK_RELEASED: &str = "stock.released";

/// Inbound routing keys this participant consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    ReservationRequested,
    ReservationCancelled,
}

impl RoutingKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingKey::ReservationRequested => "reservation.requested",
            RoutingKey::ReservationCancelled => "reservation.cancelled",
        }
    }
}

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RoutingKey {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reservation.requested" => Ok(RoutingKey::ReservationRequested),
            "reservation.cancelled" => Ok(RoutingKey::ReservationCancelled),
            other => Err(SagaError::UnknownRoutingKey(other.to_string())),
        }
    }
}

/// One requested line of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationLine {
    pub medicine_id: MedicineId,
    pub quantity: i32,
}

impl ReservationLine {
    pub fn new(medicine_id: impl Into<MedicineId>, quantity: i32) -> Self {
        Self {
            medicine_id: medicine_id.into(),
            quantity,
        }
    }
}

/// Wire shape shared by both inbound events.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    message_id: MessageId,
    correlation_id: CorrelationId,
    #[serde(default)]
    items: Vec<ReservationLine>,
}

/// A decoded inbound delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub routing_key: RoutingKey,

    /// Unique per logical delivery. Redeliveries carry the same id.
    pub message_id: MessageId,

    /// The sale transaction this message belongs to.
    pub correlation_id: CorrelationId,

    /// Requested lines. Ignored for cancellations.
    pub items: Vec<ReservationLine>,
}

impl InboundMessage {
    pub fn reservation_requested(
        message_id: impl Into<MessageId>,
        correlation_id: impl Into<CorrelationId>,
        items: Vec<ReservationLine>,
    ) -> Self {
        Self {
            routing_key: RoutingKey::ReservationRequested,
            message_id: message_id.into(),
            correlation_id: correlation_id.into(),
            items,
        }
    }

    pub fn reservation_cancelled(
        message_id: impl Into<MessageId>,
        correlation_id: impl Into<CorrelationId>,
    ) -> Self {
        Self {
            routing_key: RoutingKey::ReservationCancelled,
            message_id: message_id.into(),
            correlation_id: correlation_id.into(),
            items: Vec::new(),
        }
    }

    /// Decodes a raw delivery body received under `routing_key`.
    pub fn decode(routing_key: &str, body: &[u8]) -> Result<Self> {
        let routing_key: RoutingKey = routing_key.parse()?;
        let envelope: Envelope = serde_json::from_slice(body)?;

        if envelope.message_id.as_str().trim().is_empty() {
            return Err(SagaError::InvalidMessage("messageId is empty".to_string()));
        }
        if envelope.correlation_id.as_str().trim().is_empty() {
            return Err(SagaError::InvalidMessage(
                "correlationId is empty".to_string(),
            ));
        }

        Ok(Self {
            routing_key,
            message_id: envelope.message_id,
            correlation_id: envelope.correlation_id,
            items: envelope.items,
        })
    }
}

/// Payload of `stock.reserved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReserved {
    pub correlation_id: CorrelationId,

    /// Decimal with two fraction digits, e.g. `"12.50"`.
    pub total_cost: String,
}

impl StockReserved {
    pub fn new(correlation_id: CorrelationId, total_cost: Money) -> Self {
        Self {
            correlation_id,
            total_cost: total_cost.to_string(),
        }
    }
}

/// Payload of `stock.reservation_failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReservationFailed {
    pub correlation_id: CorrelationId,
    pub reason: String,
}

/// Payload of `stock.released`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReleased {
    pub correlation_id: CorrelationId,
    /// Summed over every record of the reservation, so it can exceed one
    /// line's quantity range.
    pub restored_quantity: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reservation_request() {
        let body = br#"{
            "messageId": "m-1",
            "correlationId": "sale-1",
            "items": [{"medicineId": 7, "quantity": 3}]
        }"#;

        let message = InboundMessage::decode("reservation.requested", body).unwrap();

        assert_eq!(message.routing_key, RoutingKey::ReservationRequested);
        assert_eq!(message.message_id.as_str(), "m-1");
        assert_eq!(message.correlation_id.as_str(), "sale-1");
        assert_eq!(message.items, vec![ReservationLine::new(7, 3)]);
    }

    #[test]
    fn test_decode_cancellation_without_items() {
        let body = br#"{"messageId": "m-2", "correlationId": "sale-1"}"#;

        let message = InboundMessage::decode("reservation.cancelled", body).unwrap();

        assert_eq!(message.routing_key, RoutingKey::ReservationCancelled);
        assert!(message.items.is_empty());
    }

    #[test]
    fn test_decode_rejects_unknown_routing_key() {
        let body = br#"{"messageId": "m-3", "correlationId": "sale-1"}"#;
        let err = InboundMessage::decode("order.created", body).unwrap_err();
        assert!(matches!(err, SagaError::UnknownRoutingKey(key) if key == "order.created"));
    }

    #[test]
    fn test_decode_rejects_malformed_body() {
        let err = InboundMessage::decode("reservation.requested", b"not json").unwrap_err();
        assert!(matches!(err, SagaError::Serialization(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_decode_rejects_blank_ids() {
        let body = br#"{"messageId": " ", "correlationId": "sale-1"}"#;
        let err = InboundMessage::decode("reservation.requested", body).unwrap_err();
        assert!(matches!(err, SagaError::InvalidMessage(_)));
    }

    #[test]
    fn test_stock_reserved_wire_format() {
        let payload = StockReserved::new(CorrelationId::new("sale-9"), Money::from_cents(1250));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"correlationId": "sale-9", "totalCost": "12.50"})
        );
    }

    #[test]
    fn test_stock_released_wire_format() {
        let payload = StockReleased {
            correlation_id: CorrelationId::new("sale-9"),
            restored_quantity: 4,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"correlationId": "sale-9", "restoredQuantity": 4})
        );
    }
}
