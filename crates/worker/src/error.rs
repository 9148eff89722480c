//! Worker error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use stock_store::StoreError;
use thiserror::Error;

/// A delivery the ingress could not acknowledge.
#[derive(Debug)]
pub enum ApiError {
    /// The delivery can never be processed; the transport must not retry it.
    Rejected(String),

    /// Nothing was committed; the transport decides whether to redeliver.
    Unavailable { reason: String, requeue: bool },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Rejected(reason) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                serde_json::json!({ "disposition": "reject", "error": reason }),
            ),
            ApiError::Unavailable { reason, requeue } => {
                tracing::error!(error = %reason, "delivery not processed");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    serde_json::json!({
                        "disposition": "nack",
                        "requeue": requeue,
                        "error": reason,
                    }),
                )
            }
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Errors that stop the worker from starting or serving.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Metrics recorder error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}
