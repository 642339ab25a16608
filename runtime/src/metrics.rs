//! Prometheus metrics for the admission path and the issuance pipeline.
//!
//! # Example
//!
//! ```rust,no_run
//! use reservation_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! let body = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use reservation_core::RejectReason;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder whose output the server exposes on `addr`.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for `addr` (e.g., `0.0.0.0:9090`).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics exporter installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Address the metrics endpoint should be served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Handle for rendering, if this server installed the recorder.
    #[must_use]
    pub fn handle(&self) -> Option<PrometheusHandle> {
        self.handle.clone()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "reservation_admissions_total",
        "Admission decisions by result (accepted, replayed or a rejection code)"
    );
    describe_counter!(
        "reservation_compensations_total",
        "Counter increments applied to undo a decrement, by outcome"
    );
    describe_counter!(
        "reservation_issuance_total",
        "Intents processed by issuance workers, by result"
    );
    describe_histogram!(
        "reservation_lock_wait_seconds",
        "Time spent acquiring the policy lock"
    );
    describe_histogram!(
        "reservation_admission_duration_seconds",
        "End-to-end admission latency"
    );
}

/// Admission path recorder.
pub struct AdmissionMetrics;

impl AdmissionMetrics {
    /// Record an accepted admission.
    pub fn record_accepted(replayed: bool, duration: Duration) {
        let result = if replayed { "replayed" } else { "accepted" };
        counter!("reservation_admissions_total", "result" => result).increment(1);
        histogram!("reservation_admission_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a rejection.
    pub fn record_rejected(reason: RejectReason, duration: Duration) {
        counter!("reservation_admissions_total", "result" => reason.code()).increment(1);
        histogram!("reservation_admission_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an infrastructure fault.
    pub fn record_fault() {
        counter!("reservation_admissions_total", "result" => "fault").increment(1);
    }

    /// Record lock acquisition latency.
    pub fn record_lock_wait(duration: Duration) {
        histogram!("reservation_lock_wait_seconds").record(duration.as_secs_f64());
    }

    /// Record a compensation attempt.
    pub fn record_compensation(succeeded: bool) {
        let outcome = if succeeded { "applied" } else { "failed" };
        counter!("reservation_compensations_total", "outcome" => outcome).increment(1);
    }
}

/// Issuance worker recorder.
pub struct IssuanceMetrics;

impl IssuanceMetrics {
    /// Record a newly written reservation.
    pub fn record_issued() {
        counter!("reservation_issuance_total", "result" => "issued").increment(1);
    }

    /// Record a redelivered intent that resolved to an existing record.
    pub fn record_duplicate() {
        counter!("reservation_issuance_total", "result" => "duplicate").increment(1);
    }

    /// Record an intent that ended in failure.
    pub fn record_failed(code: &'static str) {
        counter!("reservation_issuance_total", "result" => code).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.render().is_none());
    }

    #[test]
    fn recorders_work_without_an_installed_exporter() {
        AdmissionMetrics::record_accepted(false, Duration::from_millis(3));
        AdmissionMetrics::record_rejected(RejectReason::Exhausted, Duration::from_millis(1));
        AdmissionMetrics::record_compensation(true);
        IssuanceMetrics::record_issued();
        IssuanceMetrics::record_failed("PERSISTENCE_FAILURE");
    }
}
