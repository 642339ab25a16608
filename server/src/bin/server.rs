//! Reservation engine server.
//!
//! This binary:
//! - Connects `PostgreSQL`, Redis and Redpanda and applies migrations
//! - Starts the Prometheus endpoint
//! - Spawns the issuance consumers
//! - Serves the HTTP API until Ctrl+C / SIGTERM
//!
//! # Usage
//!
//! ```bash
//! docker compose up -d
//! cargo run -p reservation-server --bin server
//! ```

use reservation_runtime::metrics::MetricsServer;
use reservation_runtime::{IssuanceWorker, WorkerPool};
use reservation_server::bootstrap::connect_backends;
use reservation_server::{AppState, Application, Config, build_router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reservation=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting reservation server...");

    let config = Config::from_env()?;
    tracing::info!(
        strategy = %config.engine.strategy,
        redpanda = %config.redpanda.brokers,
        topic = %config.redpanda.topic,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr().parse()?);
    metrics.start()?;
    let metrics_listener = TcpListener::bind(metrics.addr()).await?;

    let backends = connect_backends(&config).await?;
    tracing::info!("Backends connected");

    let (shutdown_tx, _) = broadcast::channel(1);
    let worker_config = config.worker_config();
    let worker = Arc::new(IssuanceWorker::new(backends.clone(), worker_config.clone()));
    let workers = WorkerPool::spawn(&backends.queue, &worker, &worker_config, &shutdown_tx);
    tracing::info!(concurrency = worker_config.concurrency, "Issuance consumers started");

    let state = AppState::new(
        backends,
        config.coordinator_config(),
        config.lifecycle_config(),
    )?;
    let listener = TcpListener::bind(config.http_addr()).await?;

    Application::new(
        listener,
        build_router(state),
        workers,
        shutdown_tx,
        config.server.shutdown_timeout,
    )
    .with_metrics(metrics_listener, Arc::new(metrics))
    .run()
    .await?;

    Ok(())
}
