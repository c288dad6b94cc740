//! HTTP and WebSocket handlers.

pub mod appointments;
pub mod error;
pub mod principal;
pub mod snapshots;
pub mod waitlist;
pub mod websocket;

pub use error::AppError;
pub use principal::Caller;
