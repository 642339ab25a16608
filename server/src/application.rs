//! Application lifecycle management and graceful shutdown.
//!
//! # Graceful Shutdown
//!
//! When a shutdown signal is received (Ctrl+C or SIGTERM):
//! 1. HTTP server stops accepting new connections
//! 2. Shutdown signal broadcast to the issuance consumers and the metrics listener
//! 3. Wait for consumers to finish their current intent (`SHUTDOWN_TIMEOUT`)
//! 4. Clean exit

use axum::{Router, extract::State, http::StatusCode, routing::get};
use reservation_runtime::WorkerPool;
use reservation_runtime::metrics::MetricsServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Running application: HTTP API, metrics endpoint and issuance consumers.
pub struct Application {
    listener: TcpListener,
    app: Router,
    metrics: Option<(TcpListener, Arc<MetricsServer>)>,
    workers: WorkerPool,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl Application {
    /// Assemble an application from already-bound listeners and a spawned pool.
    ///
    /// `shutdown_tx` must be the sender the pool was spawned with.
    #[must_use]
    pub const fn new(
        listener: TcpListener,
        app: Router,
        workers: WorkerPool,
        shutdown_tx: broadcast::Sender<()>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            app,
            metrics: None,
            workers,
            shutdown_tx,
            shutdown_timeout,
        }
    }

    /// Serve `GET /metrics` from `server` on `listener`.
    #[must_use]
    pub fn with_metrics(mut self, listener: TcpListener, server: Arc<MetricsServer>) -> Self {
        self.metrics = Some((listener, server));
        self
    }

    /// Run until a shutdown signal is received, then drain the consumers.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the HTTP server fails.
    pub async fn run(self) -> Result<(), std::io::Error> {
        if let Some((listener, server)) = self.metrics {
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let router = metrics_router(server);
                let served = axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.recv().await;
                    })
                    .await;
                if let Err(e) = served {
                    error!(error = %e, "Metrics listener failed");
                }
            });
        }

        info!(address = ?self.listener.local_addr().ok(), "HTTP server listening for requests");
        axum::serve(self.listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("HTTP server stopped, initiating graceful shutdown...");
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.shutdown_timeout, self.workers.join()).await {
            Ok(()) => info!("Issuance consumers stopped gracefully"),
            Err(_) => warn!(
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Issuance consumer shutdown timed out"
            ),
        }

        info!("Graceful shutdown complete");
        Ok(())
    }
}

/// Router exposing the Prometheus scrape endpoint.
pub fn metrics_router(server: Arc<MetricsServer>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(server)
}

async fn render_metrics(State(server): State<Arc<MetricsServer>>) -> (StatusCode, String) {
    server.render().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "metrics recorder not installed".to_string(),
            )
        },
        |body| (StatusCode::OK, body),
    )
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
