//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;
use stock_store::{MessageId, TransactionCoordinator};

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
}

/// GET /health: reports whether the store answers a read.
pub async fn check<C: TransactionCoordinator + 'static>(
    State(state): State<Arc<AppState<C>>>,
) -> (StatusCode, Json<HealthResponse>) {
    let probe = MessageId::new("health-probe");
    match state.consumer.coordinator().has_processed(&probe).await {
        Ok(_) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                store: state.store_backend,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "health probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                    store: state.store_backend,
                }),
            )
        }
    }
}
