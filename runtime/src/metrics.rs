//! Prometheus metrics for the pipeline.
//!
//! Counters are recorded through the `metrics` facade. Without an installed
//! recorder they are no-ops, so library code records unconditionally and the
//! binary decides whether to export.
//!
//! # Example
//!
//! ```rust,no_run
//! use eventline_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use eventline_core::handler::HandlerOutcome;
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

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

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and start the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or a recorder is
    /// already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        let addr = self.addr;
        tokio::spawn(async move {
            if let Err(e) = exporter.await {
                tracing::error!(addr = %addr, error = ?e, "Metrics exporter stopped");
            }
        });

        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        self.handle = Some(handle);
        Ok(())
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "eventline_events_published_total",
        "Total number of events published to the queue"
    );
    describe_counter!(
        "eventline_events_claimed_total",
        "Total number of successful queue claims"
    );
    describe_counter!(
        "eventline_events_finalized_total",
        "Total number of events moved into the log"
    );
    describe_counter!(
        "eventline_handler_outcomes_total",
        "Handler outcomes by kind of outcome"
    );
    describe_counter!(
        "eventline_projection_entries_applied_total",
        "Log entries applied by projection builders"
    );
    describe_counter!(
        "eventline_loop_errors_total",
        "Errors caught by the long-running loops"
    );
}

/// Pipeline metrics recorder.
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Record a publication.
    pub fn record_published(event_type: &str) {
        counter!("eventline_events_published_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    /// Record a claim.
    pub fn record_claimed() {
        counter!("eventline_events_claimed_total").increment(1);
    }

    /// Record a move into the log.
    pub fn record_finalized() {
        counter!("eventline_events_finalized_total").increment(1);
    }

    /// Record a handler outcome.
    pub fn record_outcome(outcome: &HandlerOutcome) {
        counter!("eventline_handler_outcomes_total", "outcome" => outcome.as_str()).increment(1);
    }

    /// Record an applied projection entry.
    pub fn record_projection_applied(builder: &str) {
        counter!("eventline_projection_entries_applied_total", "builder" => builder.to_string())
            .increment(1);
    }

    /// Record an error caught by a loop.
    pub fn record_loop_error(loop_name: &'static str) {
        counter!("eventline_loop_errors_total", "loop" => loop_name).increment(1);
    }
}
