//! Waitlist and slot release endpoints.
//!
//! - POST /waitlist - join (customer)
//! - GET /waitlist/:id - read an entry (owner or salon staff)
//! - POST /waitlist/:id/response - accept or decline the current offer
//! - DELETE /waitlist/:id - withdraw
//! - POST /slots/released - a booked slot became free (salon staff)

use crate::aggregates::{JoinRequest, WaitlistEntry};
use crate::api::error::AppError;
use crate::api::principal::Caller;
use crate::app::ReleasedSlot;
use crate::server::state::AppState;
use crate::types::{ReleaseId, SalonId, ServiceId, StaffId, TimeWindow, WaitlistEntryId};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Request to join a salon's waitlist
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinWaitlistRequest {
    /// Salon
    pub salon_id: SalonId,
    /// Service wanted
    pub service_id: ServiceId,
    /// Specific staff member, or any
    #[serde(default)]
    pub staff_id: Option<StaffId>,
    /// Preferred date
    pub requested_date: NaiveDate,
    /// Acceptable time of day
    pub window: TimeWindow,
    /// Days either side of the preferred date that also work
    #[serde(default)]
    pub flexibility_days: i64,
}

/// Answer to an offer
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OfferResponse {
    /// True to book the offered slot
    pub accept: bool,
}

/// Request announcing a released slot
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlotReleasedRequest {
    /// Salon owning the slot
    pub salon_id: SalonId,
    /// The slot
    #[serde(flatten)]
    pub slot: ReleasedSlot,
}

/// Release accepted for matching
#[derive(Debug, Serialize, Deserialize)]
pub struct SlotReleasedResponse {
    /// Release
    pub release_id: ReleaseId,
}

/// Join a waitlist
///
/// # Errors
///
/// - 403 if the caller is not a customer
/// - 400 `INVALID_REQUEST`, 409 `SLOTS_AVAILABLE` or `DUPLICATE_ENTRY`
/// - 404 if the salon is unknown
pub async fn join(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<JoinWaitlistRequest>,
) -> Result<(StatusCode, Json<WaitlistEntry>), AppError> {
    let user_id = caller
        .0
        .user_id()
        .ok_or_else(|| AppError::forbidden("Only customers join waitlists"))?;

    let request = JoinRequest {
        user_id,
        service_id: body.service_id,
        staff_id: body.staff_id,
        requested_date: body.requested_date,
        window: body.window,
        flexibility_days: body.flexibility_days,
    };
    let entry = state.service.join_waitlist(body.salon_id, request).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Read an entry
///
/// # Errors
///
/// 404 `ENTRY_NOT_FOUND` if the entry does not exist or belongs to someone else.
pub async fn get_entry(
    State(state): State<AppState>,
    caller: Caller,
    Path(entry_id): Path<WaitlistEntryId>,
) -> Result<Json<WaitlistEntry>, AppError> {
    let entry = state.service.waitlist_entry(entry_id, &caller.0).await?;
    Ok(Json(entry))
}

/// Accept or decline an offer
///
/// # Errors
///
/// - 404 `ENTRY_NOT_FOUND`
/// - 409 `NO_PENDING_OFFER`
/// - 410 `OFFER_EXPIRED` once the deadline has passed
pub async fn respond(
    State(state): State<AppState>,
    caller: Caller,
    Path(entry_id): Path<WaitlistEntryId>,
    Json(body): Json<OfferResponse>,
) -> Result<Json<WaitlistEntry>, AppError> {
    let entry = state
        .service
        .respond_to_offer(entry_id, &caller.0, body.accept)
        .await?;
    Ok(Json(entry))
}

/// Leave the waitlist
///
/// # Errors
///
/// - 404 `ENTRY_NOT_FOUND`
/// - 400 `INVALID_REQUEST` if the entry already ended
pub async fn withdraw(
    State(state): State<AppState>,
    caller: Caller,
    Path(entry_id): Path<WaitlistEntryId>,
) -> Result<Json<WaitlistEntry>, AppError> {
    let entry = state.service.withdraw(entry_id, &caller.0).await?;
    Ok(Json(entry))
}

/// Announce a released slot
///
/// # Errors
///
/// - 403 if the caller is not staff of the salon
/// - 404 if the salon is unknown
pub async fn slot_released(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<SlotReleasedRequest>,
) -> Result<(StatusCode, Json<SlotReleasedResponse>), AppError> {
    if !caller.0.is_staff_of(body.salon_id) {
        return Err(AppError::forbidden("Not staff of this salon"));
    }
    let release_id = state.service.slot_released(body.salon_id, body.slot).await?;
    Ok((StatusCode::ACCEPTED, Json(SlotReleasedResponse { release_id })))
}
