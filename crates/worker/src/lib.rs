//! Lot reservation worker.
//!
//! Wires the saga consumer behind an HTTP delivery ingress, exposes health
//! and Prometheus metrics, and hosts the outbox relay.

pub mod config;
pub mod demo;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::SagaConsumer;
use stock_store::TransactionCoordinator;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state of the HTTP handlers.
pub struct AppState<C: TransactionCoordinator> {
    pub consumer: SagaConsumer<C>,

    /// Backend label reported by `/health`.
    pub store_backend: &'static str,
}

impl<C: TransactionCoordinator> AppState<C> {
    pub fn new(consumer: SagaConsumer<C>, store_backend: &'static str) -> Self {
        Self {
            consumer,
            store_backend,
        }
    }
}

/// Creates the Axum application router.
///
/// At most `concurrency` deliveries are processed at once; further requests
/// wait for a slot.
pub fn create_app<C: TransactionCoordinator + 'static>(
    state: Arc<AppState<C>>,
    metrics_handle: PrometheusHandle,
    concurrency: usize,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    let deliveries_router = Router::new()
        .route(
            "/deliveries/{routing_key}",
            post(routes::deliveries::deliver::<C>),
        )
        .layer(ConcurrencyLimitLayer::new(concurrency))
        .with_state(Arc::clone(&state));

    Router::new()
        .route("/health", get(routes::health::check::<C>))
        .with_state(state)
        .merge(deliveries_router)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
