//! Application state shared by every handler.

use crate::app::QueueService;
use salon_queue_runtime::metrics::MetricsExporter;
use std::sync::Arc;

/// Shared handler state, cloned per request
#[derive(Clone)]
pub struct AppState {
    /// The queue service
    pub service: Arc<QueueService>,
    /// Prometheus exporter; `/metrics` is empty without one
    pub metrics: Option<Arc<MetricsExporter>>,
}

impl AppState {
    /// State without a metrics exporter
    #[must_use]
    pub const fn new(service: Arc<QueueService>) -> Self {
        Self {
            service,
            metrics: None,
        }
    }

    /// Attach the installed metrics exporter
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}
