//! Inbound delivery endpoint.
//!
//! A thin transport adapter: the broker bridge posts each delivery here and
//! settles it according to the status code.
//!
//! | status | disposition                  |
//! |--------|------------------------------|
//! | 200    | ack                          |
//! | 409    | ack, duplicate delivery      |
//! | 422    | reject, never redeliver      |
//! | 503    | nack, nothing was committed  |

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use saga::{Acknowledgement, Outcome};
use serde::Serialize;
use stock_store::TransactionCoordinator;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct DeliveryResponse {
    pub disposition: &'static str,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored_quantity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<Outcome> for DeliveryResponse {
    fn from(outcome: Outcome) -> Self {
        let mut response = DeliveryResponse {
            disposition: "ack",
            outcome: outcome.as_str(),
            total_cost: None,
            restored_quantity: None,
            reason: None,
        };
        match outcome {
            Outcome::Duplicate => {}
            Outcome::Confirmed { total_cost } => response.total_cost = Some(total_cost.to_string()),
            Outcome::Failed { reason } => response.reason = Some(reason),
            Outcome::Released { restored_quantity } => {
                response.restored_quantity = Some(restored_quantity)
            }
        }
        response
    }
}

/// POST /deliveries/{routing_key}: consumes one inbound event.
pub async fn deliver<C: TransactionCoordinator + 'static>(
    State(state): State<Arc<AppState<C>>>,
    Path(routing_key): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<DeliveryResponse>), ApiError> {
    match state.consumer.handle_delivery(&routing_key, &body).await {
        Acknowledgement::Ack(outcome) => {
            let status = if outcome == Outcome::Duplicate {
                StatusCode::CONFLICT
            } else {
                StatusCode::OK
            };
            Ok((status, Json(outcome.into())))
        }
        Acknowledgement::Reject { reason } => Err(ApiError::Rejected(reason)),
        Acknowledgement::Nack { requeue, reason } => {
            Err(ApiError::Unavailable { reason, requeue })
        }
    }
}
