//! Periodic re-evaluation of every lane.
//!
//! Delays grow while nothing happens: a customer in the chair past their slot
//! pushes everyone back even though no booking event arrives. The ticker sends
//! a `Tick` to every started lane so queues, predictions and waitlist listings
//! follow the clock.

use crate::app::QueueService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Shortest accepted tick period
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Drives [`QueueService::tick`] on a fixed period until shut down
pub struct Ticker {
    service: Arc<QueueService>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Ticker {
    /// Creates a ticker and the sender that stops it
    ///
    /// Send `true` to stop. Periods under one second are raised to one second.
    #[must_use]
    pub fn new(service: Arc<QueueService>, period: Duration) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ticker = Self {
            service,
            period: period.max(MIN_PERIOD),
            shutdown: shutdown_rx,
        };
        (ticker, shutdown_tx)
    }

    /// Runs until the shutdown signal
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        tracing::info!(period = ?self.period, "Ticker started");

        while !*self.shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    self.service.tick().await;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Ticker stopped");
    }

    /// Runs on a background task
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
