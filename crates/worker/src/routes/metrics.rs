//! Prometheus scrape endpoint for the consumer and relay metrics.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use metrics::Unit;
use metrics_exporter_prometheus::PrometheusHandle;

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Registers help text for every metric the worker emits. Call once, after
/// the recorder is installed.
pub fn describe() {
    metrics::describe_counter!(
        "reservations_processed_total",
        "Deliveries handled, labelled by outcome"
    );
    metrics::describe_counter!(
        "duplicate_messages_total",
        "Deliveries skipped because their message id was already processed"
    );
    metrics::describe_histogram!(
        "reservation_duration_seconds",
        Unit::Seconds,
        "Time from delivery to committed outcome"
    );
    metrics::describe_counter!(
        "store_transactions_total",
        "PostgreSQL units of work, labelled by how they ended"
    );
    metrics::describe_counter!("outbox_published_total", "Outbox rows published");
    metrics::describe_counter!(
        "outbox_publish_failures_total",
        "Outbox publish attempts that failed"
    );
    metrics::describe_counter!(
        "outbox_dead_lettered_total",
        "Outbox rows moved to FAILED after exhausting their attempts"
    );
}

/// GET /metrics
///
/// Histogram buckets are drained on scrape since the worker runs no
/// exporter listener of its own.
pub async fn get(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.run_upkeep();
    ([(header::CONTENT_TYPE, PROMETHEUS_TEXT)], handle.render())
}
