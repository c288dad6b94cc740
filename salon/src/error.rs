//! Errors surfaced by the queue service.

use crate::aggregates::WaitlistRejection;
use crate::distribution::TopicError;
use crate::types::SalonId;
use salon_queue_runtime::error::StoreError;
use thiserror::Error;

/// Errors from [`crate::app::QueueService`] operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// A processing lane did not accept or answer the command
    #[error("Processing lane unavailable: {0}")]
    LaneUnavailable(#[from] StoreError),

    /// The waitlist refused the command
    #[error(transparent)]
    Rejected(#[from] WaitlistRejection),

    /// Subscription failed
    #[error(transparent)]
    Topic(#[from] TopicError),

    /// No staff member is registered for the salon
    #[error("Unknown salon {0}")]
    UnknownSalon(SalonId),

    /// Caller may not act on this resource
    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl QueueError {
    /// Stable error code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::LaneUnavailable(_) => "LANE_UNAVAILABLE",
            Self::Rejected(rejection) => rejection.code(),
            Self::Topic(TopicError::Malformed(_)) => "MALFORMED_TOPIC",
            Self::Topic(TopicError::Forbidden(_)) | Self::Forbidden(_) => "FORBIDDEN",
            Self::Topic(TopicError::UnknownConnection(_)) => "UNKNOWN_CONNECTION",
            Self::UnknownSalon(_) => "UNKNOWN_SALON",
        }
    }
}

/// Result type for queue service operations
pub type Result<T> = std::result::Result<T, QueueError>;
