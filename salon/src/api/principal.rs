//! Caller identity asserted by the gateway.
//!
//! Authentication happens upstream; requests arrive with exactly one of
//! `x-user-id` (a customer) or `x-staff-salon-id` (staff of that salon).

use crate::api::error::AppError;
use crate::types::{Principal, SalonId, UserId};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};
use std::str::FromStr;

/// Header naming the calling customer
pub const USER_HEADER: &str = "x-user-id";

/// Header naming the salon of the calling staff member
pub const STAFF_SALON_HEADER: &str = "x-staff-salon-id";

/// Extracts the [`Principal`] of a request
///
/// Rejects with 401 when neither or both headers are present, or when the
/// value is not a UUID.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        principal_from_headers(&parts.headers).map(Self)
    }
}

/// Resolve the principal carried by `headers`
///
/// # Errors
///
/// [`AppError::unauthorized`] if the identity headers are missing, ambiguous
/// or malformed.
pub fn principal_from_headers(headers: &HeaderMap) -> Result<Principal, AppError> {
    let user = header_id::<UserId>(headers, USER_HEADER)?;
    let salon = header_id::<SalonId>(headers, STAFF_SALON_HEADER)?;

    match (user, salon) {
        (Some(user_id), None) => Ok(Principal::Customer { user_id }),
        (None, Some(salon_id)) => Ok(Principal::Staff { salon_id }),
        (Some(_), Some(_)) => Err(AppError::unauthorized("Ambiguous caller identity")),
        (None, None) => Err(AppError::unauthorized("Missing caller identity")),
    }
}

fn header_id<T: FromStr>(headers: &HeaderMap, name: &str) -> Result<Option<T>, AppError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| AppError::unauthorized(format!("Malformed {name} header")))
        })
        .transpose()
}
