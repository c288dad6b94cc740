//! Booking lifecycle and staff status endpoints.
//!
//! - POST /appointments/:staff_id/events - booking inserted/started/completed/cancelled
//! - PUT /staff/:staff_id/status - staff status change
//!
//! Callers are staff of the salon the staff member works at (the booking
//! engine acts as salon staff). Events for unknown staff are accepted and
//! dropped, reported as `applied: false`.

use crate::aggregates::NewBooking;
use crate::api::error::AppError;
use crate::api::principal::Caller;
use crate::server::state::AppState;
use crate::types::{BookingId, StaffId, StaffStatus};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A booking lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppointmentEvent {
    /// Booking confirmed
    Inserted {
        /// The booking
        booking: NewBooking,
        /// Walk-in position; `None` orders by scheduled start
        #[serde(default)]
        position: Option<usize>,
    },
    /// Service started
    Started {
        /// Booking
        booking_id: BookingId,
    },
    /// Service ended
    Completed {
        /// Booking
        booking_id: BookingId,
        /// Actual end; defaults to now
        #[serde(default)]
        actual_end: Option<DateTime<Utc>>,
    },
    /// Booking cancelled
    Cancelled {
        /// Booking
        booking_id: BookingId,
    },
}

/// Staff status change
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusChange {
    /// New status
    pub status: StaffStatus,
}

/// Outcome of an accepted event
#[derive(Debug, Serialize, Deserialize)]
pub struct EventAccepted {
    /// False when the event referred to an unknown staff member and was dropped
    pub applied: bool,
}

/// Staff of another salon may not post events for this staff member
fn authorize(state: &AppState, caller: &Caller, staff_id: StaffId) -> Result<(), AppError> {
    match state.service.staff_salon(staff_id) {
        Some(salon_id) if !caller.0.is_staff_of(salon_id) => {
            Err(AppError::forbidden("Not staff of this salon"))
        },
        None if caller.0.user_id().is_some() => {
            Err(AppError::forbidden("Staff access required"))
        },
        _ => Ok(()),
    }
}

/// Apply a booking lifecycle event
///
/// # Errors
///
/// - 403 if the caller is not staff of the staff member's salon
/// - 503 if the salon's lane is shutting down
pub async fn post_event(
    State(state): State<AppState>,
    caller: Caller,
    Path(staff_id): Path<StaffId>,
    Json(event): Json<AppointmentEvent>,
) -> Result<(StatusCode, Json<EventAccepted>), AppError> {
    authorize(&state, &caller, staff_id)?;
    tracing::debug!(%staff_id, ?event, "Appointment event");

    let service = &state.service;
    let applied = match event {
        AppointmentEvent::Inserted { booking, position } => {
            service.appointment_inserted(staff_id, booking, position).await?
        },
        AppointmentEvent::Started { booking_id } => {
            service.appointment_started(staff_id, booking_id).await?
        },
        AppointmentEvent::Completed {
            booking_id,
            actual_end,
        } => {
            service
                .appointment_completed(staff_id, booking_id, actual_end)
                .await?
        },
        AppointmentEvent::Cancelled { booking_id } => {
            service.appointment_cancelled(staff_id, booking_id).await?
        },
    };

    Ok((StatusCode::ACCEPTED, Json(EventAccepted { applied })))
}

/// Change a staff member's status
///
/// # Errors
///
/// - 403 if the caller is not staff of the staff member's salon
/// - 503 if the salon's lane is shutting down
pub async fn put_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(staff_id): Path<StaffId>,
    Json(change): Json<StatusChange>,
) -> Result<(StatusCode, Json<EventAccepted>), AppError> {
    authorize(&state, &caller, staff_id)?;
    let applied = state
        .service
        .staff_status_changed(staff_id, change.status)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(EventAccepted { applied })))
}
