//! Prometheus metrics for the store, the update client and the board.
//!
//! # Example
//!
//! ```rust,no_run
//! use packboard_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

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

/// Prometheus metrics recorder.
///
/// Installs the global recorder and renders the scrape text; `addr` is the
/// address the embedding process serves it on.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the metrics exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this will fail
    /// with `MetricsError::Install`. In production, ensure this is only called once.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        // Register all metric descriptions
        register_metrics();

        // Build and install the Prometheus exporter
        let builder = PrometheusBuilder::new()
            // Configure histogram buckets for latency measurements
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        // Try to install the recorder
        // In tests, this may fail if a recorder is already installed
        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics recorder installed, scrape at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    // In tests, multiple MetricsServer instances may be created
                    // We'll allow this but warn about it
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
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
fn register_metrics() {
    // Store
    describe_counter!(
        "store_actions_processed_total",
        "Total number of actions reduced by the store"
    );
    describe_histogram!(
        "store_reducer_duration_seconds",
        "Time taken to run the reducer for one action"
    );
    describe_counter!(
        "store_effects_executed_total",
        "Total number of effects executed, by type"
    );
    describe_counter!(
        "store_effects_cancelled_total",
        "Total number of in-flight effects aborted by a newer effect or a cancel"
    );

    // Update client
    describe_counter!(
        "update_attempts_total",
        "Total number of update attempts sent to the backend"
    );
    describe_counter!(
        "update_retries_total",
        "Total number of update attempts that were retries"
    );
    describe_counter!(
        "update_dedup_total",
        "Updates the backend reported as already applied"
    );
    describe_counter!(
        "update_failures_total",
        "Updates that failed after all attempts"
    );
    describe_histogram!(
        "update_duration_seconds",
        "Time taken by an update including retries"
    );

    // Board
    describe_counter!(
        "board_stale_queries_discarded_total",
        "Query results discarded because a newer query was issued"
    );
    describe_counter!(
        "board_actions_rejected_total",
        "Board commands rejected by validation"
    );
}

/// Update client metrics recorder.
pub struct UpdateMetrics;

impl UpdateMetrics {
    /// Record one attempt; `attempt` is zero-based.
    pub fn record_attempt(attempt: usize) {
        counter!("update_attempts_total").increment(1);
        if attempt > 0 {
            counter!("update_retries_total").increment(1);
        }
    }

    /// Record a deduplicated success.
    pub fn record_dedup() {
        counter!("update_dedup_total").increment(1);
    }

    /// Record a terminal failure.
    pub fn record_failure() {
        counter!("update_failures_total").increment(1);
    }

    /// Record the total duration of a send.
    pub fn record_duration(duration: std::time::Duration) {
        histogram!("update_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Board metrics recorder.
pub struct BoardMetrics;

impl BoardMetrics {
    /// Record a discarded stale query result.
    pub fn record_stale_query() {
        counter!("board_stale_queries_discarded_total").increment(1);
    }

    /// Record a rejected command, labelled by action.
    pub fn record_rejected(action: &'static str) {
        counter!("board_actions_rejected_total", "action" => action).increment(1);
    }
}
