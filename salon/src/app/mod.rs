//! Application layer: the queue service and its periodic ticker.

pub mod service;
pub mod ticker;

pub use service::{Collaborators, LaneSettings, QueueService, ReleasedSlot};
pub use ticker::Ticker;
