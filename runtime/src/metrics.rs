//! Prometheus metrics for observability and monitoring.
//!
//! Covers the store lanes and the salon components running on them:
//! - Action throughput and reducer latency per lane
//! - Timer scheduling and cancellation
//! - Delay alerts and departure predictions
//! - Waitlist offers and their outcomes
//! - Hub deliveries and pruned connections
//!
//! # Example
//!
//! ```rust,no_run
//! use salon_queue_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! // Served by the HTTP layer at /metrics
//! let body = exporter.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

// Re-export metrics macros for use in other crates
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

/// Prometheus exporter.
///
/// Installs the global recorder and renders the scrape body; the HTTP server
/// mounts [`MetricsExporter::render`] on `/metrics`.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create an exporter that has not been installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Register metric descriptions and install the recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g. by another test), this logs a warning
    /// and leaves the handle empty.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Empty when the recorder was not installed by this exporter.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Store lanes
    describe_counter!("store.commands.total", "Total number of actions sent to store lanes");
    describe_histogram!(
        "store.reducer.duration_seconds",
        "Time spent inside a reducer per action"
    );
    describe_counter!(
        "store.effects.executed",
        "Effects executed by the runtime, labelled by type"
    );
    describe_counter!("store.timers.cancelled", "Pending timers cancelled before firing");
    describe_counter!(
        "store.shutdown.rejected_actions",
        "Actions rejected because a lane was shutting down"
    );

    // Staff queue and departure predictor
    describe_counter!("queue.delay_alerts", "Delay alerts sent to customers");
    describe_counter!("queue.caught_up", "Queue caught up notifications sent");
    describe_gauge!("queue.max_delay_minutes", "Largest current staff delay per salon");

    // Waitlist
    describe_counter!("waitlist.joined", "Waitlist entries created");
    describe_counter!("waitlist.offers.sent", "Slot offers sent to waitlisted customers");
    describe_counter!("waitlist.offers.accepted", "Slot offers accepted");
    describe_counter!("waitlist.offers.expired", "Slot offers that lapsed or were declined");
    describe_counter!("waitlist.slots.unclaimed", "Released slots nobody claimed");

    // Distribution hub
    describe_counter!("hub.deliveries", "Messages delivered to subscriber connections");
    describe_counter!("hub.connections.pruned", "Dead subscriber connections removed");
    describe_gauge!("hub.connections", "Currently connected subscribers");
}

/// Queue metrics recorder.
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record a delay alert sent to one customer.
    pub fn record_delay_alert() {
        counter!("queue.delay_alerts").increment(1);
    }

    /// Record a caught-up notification.
    pub fn record_caught_up() {
        counter!("queue.caught_up").increment(1);
    }

    /// Record the largest delay currently observed in a salon.
    pub fn record_max_delay(salon: &str, minutes: i64) {
        #[allow(clippy::cast_precision_loss)] // minutes stay far below f64 precision
        gauge!("queue.max_delay_minutes", "salon" => salon.to_string()).set(minutes as f64);
    }
}

/// Waitlist metrics recorder.
pub struct WaitlistMetrics;

impl WaitlistMetrics {
    /// Record a new waitlist entry.
    pub fn record_join() {
        counter!("waitlist.joined").increment(1);
    }

    /// Record an offer sent.
    pub fn record_offer() {
        counter!("waitlist.offers.sent").increment(1);
    }

    /// Record an accepted offer.
    pub fn record_accept() {
        counter!("waitlist.offers.accepted").increment(1);
    }

    /// Record a lapsed or declined offer.
    pub fn record_expired() {
        counter!("waitlist.offers.expired").increment(1);
    }

    /// Record a release that went unclaimed.
    pub fn record_unclaimed() {
        counter!("waitlist.slots.unclaimed").increment(1);
    }
}

/// Hub metrics recorder.
pub struct HubMetrics;

impl HubMetrics {
    /// Record deliveries to subscriber connections.
    pub fn record_deliveries(count: usize) {
        counter!("hub.deliveries").increment(count as u64);
    }

    /// Record dead connections removed during fan-out.
    pub fn record_pruned(count: usize) {
        counter!("hub.connections.pruned").increment(count as u64);
    }

    /// Record the current number of connections.
    pub fn record_connections(count: usize) {
        #[allow(clippy::cast_precision_loss)]
        gauge!("hub.connections").set(count as f64);
    }
}
