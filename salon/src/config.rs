//! Configuration management for the salon queue service.
//!
//! Loads configuration from environment variables with sensible defaults.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Staff queue and departure prediction configuration
    pub queue: QueueConfig,
    /// Waitlist configuration
    pub waitlist: WaitlistConfig,
    /// Store lane configuration
    pub runtime: RuntimeConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Log filter (`RUST_LOG` syntax)
    pub log_level: String,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
}

/// Staff queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Minimum delay increase (minutes) before a customer is alerted again
    pub delay_alert_threshold_minutes: i64,
    /// Travel buffer used for customers without an override
    pub default_travel_buffer_minutes: i64,
    /// Interval of the re-evaluation tick in seconds
    pub tick_interval_seconds: u64,
    /// JSON file with the staff roster, loaded at startup
    pub staff_roster_path: Option<String>,
}

/// Waitlist configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitlistConfig {
    /// How long a customer has to answer an offer
    pub offer_timeout_minutes: i64,
}

/// Store lane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// How long a request waits for its lane to reply
    pub request_timeout_ms: u64,
    /// Capacity of each lane's action broadcast channel
    pub action_broadcast_capacity: usize,
    /// Deliveries a live connection may have queued before it is dropped
    pub connection_buffer: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Missing or unparsable values fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<i64>().ok());

        Self {
            server: ServerConfig {
                host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: lookup("PORT")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(8080),
                log_level: lookup("RUST_LOG")
                    .unwrap_or_else(|| "salon_queue=info,tower_http=debug".to_string()),
                shutdown_timeout: lookup("SHUTDOWN_TIMEOUT")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            },
            queue: QueueConfig {
                delay_alert_threshold_minutes: parsed("DELAY_ALERT_THRESHOLD_MINUTES")
                    .filter(|m| *m > 0)
                    .unwrap_or(10),
                default_travel_buffer_minutes: parsed("DEFAULT_TRAVEL_BUFFER_MINUTES")
                    .filter(|m| *m >= 0)
                    .unwrap_or(20),
                tick_interval_seconds: lookup("TICK_INTERVAL_SECONDS")
                    .and_then(|s| s.parse().ok())
                    .filter(|s| *s > 0)
                    .unwrap_or(60),
                staff_roster_path: lookup("STAFF_ROSTER_PATH").filter(|p| !p.is_empty()),
            },
            waitlist: WaitlistConfig {
                offer_timeout_minutes: parsed("OFFER_TIMEOUT_MINUTES")
                    .filter(|m| *m > 0)
                    .unwrap_or(15),
            },
            runtime: RuntimeConfig {
                request_timeout_ms: lookup("REQUEST_TIMEOUT_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2000),
                action_broadcast_capacity: lookup("ACTION_BROADCAST_CAPACITY")
                    .and_then(|s| s.parse().ok())
                    .filter(|c| *c > 0)
                    .unwrap_or(256),
                connection_buffer: lookup("CONNECTION_BUFFER")
                    .and_then(|s| s.parse().ok())
                    .filter(|c| *c > 0)
                    .unwrap_or(1024),
            },
        }
    }

    /// Socket address string for the HTTP listener
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Graceful shutdown timeout
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout)
    }

    /// Offer answer window
    #[must_use]
    pub fn offer_timeout(&self) -> TimeDelta {
        TimeDelta::minutes(self.waitlist.offer_timeout_minutes)
    }

    /// Default travel buffer
    #[must_use]
    pub fn default_travel_buffer(&self) -> TimeDelta {
        TimeDelta::minutes(self.queue.default_travel_buffer_minutes)
    }

    /// Re-evaluation tick interval
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.queue.tick_interval_seconds)
    }

    /// Lane reply timeout
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.runtime.request_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
