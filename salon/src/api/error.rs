//! HTTP error responses.
//!
//! Bridges [`QueueError`] to status codes and a JSON body carrying the same
//! stable codes the waitlist uses (`SLOTS_AVAILABLE`, `OFFER_EXPIRED`, ...).

use crate::aggregates::WaitlistRejection;
use crate::distribution::TopicError;
use crate::error::QueueError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use salon_queue_runtime::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error returned by HTTP handlers
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    code: String,
    /// Internal error (logged, never sent to the client)
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: code.into(),
            source: None,
        }
    }

    /// Attach the underlying cause
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// 400 Bad Request
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, "BAD_REQUEST")
    }

    /// 401 Unauthorized
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message, "UNAUTHORIZED")
    }

    /// 403 Forbidden
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message, "FORBIDDEN")
    }

    /// 404 Not Found
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("{resource} with id {id} not found"),
            "NOT_FOUND",
        )
    }

    /// 500 Internal Server Error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, "INTERNAL_SERVER_ERROR")
    }

    /// 503 Service Unavailable
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message, "SERVICE_UNAVAILABLE")
    }

    /// HTTP status of the response
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Stable error code of the response
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            match &self.source {
                Some(source) => tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    error = %source,
                    "Request failed"
                ),
                None => tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    "Request failed"
                ),
            }
        }

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };

        (self.status, Json(body)).into_response()
    }
}

impl From<WaitlistRejection> for AppError {
    fn from(rejection: WaitlistRejection) -> Self {
        let status = match rejection {
            WaitlistRejection::SlotsAvailable
            | WaitlistRejection::DuplicateEntry
            | WaitlistRejection::NoPendingOffer => StatusCode::CONFLICT,
            WaitlistRejection::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            WaitlistRejection::EntryNotFound => StatusCode::NOT_FOUND,
            WaitlistRejection::OfferExpired => StatusCode::GONE,
        };
        Self::new(status, rejection.to_string(), rejection.code())
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        let code = err.code();
        match err {
            QueueError::Rejected(rejection) => rejection.into(),
            QueueError::LaneUnavailable(StoreError::Timeout) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "Request timed out", code)
            },
            QueueError::LaneUnavailable(store) => {
                let message = store.to_string();
                Self::new(StatusCode::SERVICE_UNAVAILABLE, message, code)
                    .with_source(anyhow::Error::new(store))
            },
            QueueError::Topic(TopicError::Malformed(_)) => {
                Self::new(StatusCode::BAD_REQUEST, err.to_string(), code)
            },
            QueueError::Topic(TopicError::UnknownConnection(_)) | QueueError::UnknownSalon(_) => {
                Self::new(StatusCode::NOT_FOUND, err.to_string(), code)
            },
            QueueError::Topic(TopicError::Forbidden(_)) | QueueError::Forbidden(_) => {
                Self::new(StatusCode::FORBIDDEN, err.to_string(), code)
            },
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred").with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SalonId;

    #[test]
    fn display_includes_code() {
        let err = AppError::bad_request("Invalid input");
        assert_eq!(err.to_string(), "[BAD_REQUEST] Invalid input");
    }

    #[test]
    fn rejections_keep_their_codes() {
        let cases = [
            (WaitlistRejection::SlotsAvailable, StatusCode::CONFLICT),
            (WaitlistRejection::DuplicateEntry, StatusCode::CONFLICT),
            (WaitlistRejection::NoPendingOffer, StatusCode::CONFLICT),
            (
                WaitlistRejection::InvalidRequest("window".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (WaitlistRejection::EntryNotFound, StatusCode::NOT_FOUND),
            (WaitlistRejection::OfferExpired, StatusCode::GONE),
        ];

        for (rejection, status) in cases {
            let code = rejection.code();
            let err = AppError::from(QueueError::Rejected(rejection));
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn lane_failures_are_unavailable() {
        let err = AppError::from(QueueError::LaneUnavailable(StoreError::ShutdownInProgress));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "LANE_UNAVAILABLE");

        let err = AppError::from(QueueError::LaneUnavailable(StoreError::Timeout));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn unknown_salon_is_not_found() {
        let err = AppError::from(QueueError::UnknownSalon(SalonId::new()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "UNKNOWN_SALON");
    }
}
