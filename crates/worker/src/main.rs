//! Worker entry point.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use relay::{OutboxRelay, TracingPublisher};
use saga::SagaConsumer;
use sqlx::postgres::PgPoolOptions;
use stock_store::{InMemoryStore, OutboxStore, PostgresStore, TransactionCoordinator};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::config::{Config, LogFormat};
use worker::error::WorkerError;
use worker::{AppState, demo};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Serves deliveries and runs the relay until a shutdown signal arrives.
async fn serve<S>(
    config: Config,
    store: S,
    store_backend: &'static str,
    metrics_handle: PrometheusHandle,
) -> Result<(), WorkerError>
where
    S: TransactionCoordinator + OutboxStore + Clone + 'static,
{
    let consumer = SagaConsumer::with_config(store.clone(), config.consumer_config());
    let state = Arc::new(AppState::new(consumer, store_backend));

    let relay = OutboxRelay::with_config(store, TracingPublisher, config.relay_config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_task = tokio::spawn(async move { relay.run(shutdown_rx).await });

    let app = worker::create_app(state, metrics_handle, config.consumer_concurrency);

    let addr = config.addr();
    tracing::info!(%addr, store = store_backend, "starting worker");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Stop the relay even if the server failed.
    let _ = shutdown_tx.send(true);
    if let Err(e) = relay_task.await {
        tracing::error!(error = %e, "outbox relay task panicked");
    }
    served?;

    tracing::info!("worker shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle =
        metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    worker::routes::metrics::describe();

    // 3. Pick the store and serve
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .acquire_timeout(config.store_timeout)
                .connect(&url)
                .await?;
            let store = PostgresStore::new(pool).with_timeout(config.store_timeout);
            store.run_migrations().await?;
            tracing::info!("database migrations applied");

            serve(config, store, "postgres", metrics_handle).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            let store = InMemoryStore::new();
            if config.seed_demo_lots {
                demo::seed_demo_lots(&store).await;
            }

            serve(config, store, "memory", metrics_handle).await
        }
    }
}
