//! # Salon Queue
//!
//! Real-time queue tracking, departure prediction and waitlist matching for
//! salons, delivered to staff and customers over WebSocket topics.
//!
//! ## Architecture
//!
//! ```text
//! booking events ──► QueueService ──► queue lane (per salon) ──┐
//!                         │            StaffQueue + Departure   │ publish
//! slot releases  ──►      └─────────► waitlist lane (per salon) ┤ in-lane
//!                                      offers + 15 min timers   │
//!                                                               ▼
//!                                         Hub ──► salon:{id} / user:{id}
//! ```
//!
//! Each lane is a [`salon_queue_runtime::Store`] driving a pure reducer.
//! A lane reduces one action at a time and publishes that action's events
//! before it accepts the next, so subscribers of one salon see events in
//! the order they were produced.
//!
//! ## Modules
//!
//! - [`aggregates`]: reducers for the staff queue, departure predictor and waitlist
//! - [`distribution`]: topics, outbound events and the subscription hub
//! - [`app`]: the queue service routing commands to lanes, plus the ticker
//! - [`api`] / [`server`]: axum HTTP and WebSocket surface
//! - [`providers`]: staff directory, slot availability and travel buffers
//! - [`config`]: environment configuration

pub mod aggregates;
pub mod api;
pub mod app;
pub mod config;
pub mod distribution;
pub mod error;
pub mod providers;
pub mod server;
pub mod types;

pub use app::QueueService;
pub use config::Config;
pub use error::{QueueError, Result};
