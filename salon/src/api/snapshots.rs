//! Polling fallback for clients without a live connection.
//!
//! - GET /snapshots/:topic - the same snapshot a subscriber receives

use crate::api::error::AppError;
use crate::api::principal::Caller;
use crate::distribution::{Snapshot, Topic};
use crate::error::QueueError;
use crate::server::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};

/// Current state behind a topic
///
/// # Errors
///
/// - 400 if the topic is malformed
/// - 403 if the caller may not read the topic
pub async fn get_snapshot(
    State(state): State<AppState>,
    caller: Caller,
    Path(topic): Path<String>,
) -> Result<Json<Snapshot>, AppError> {
    let topic: Topic = topic.parse().map_err(QueueError::from)?;
    if !topic.authorizes(&caller.0) {
        return Err(AppError::forbidden(format!("Not allowed to read {topic}")));
    }
    Ok(Json(state.service.snapshot(topic).await))
}
