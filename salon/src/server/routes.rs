//! Router configuration.

use super::health::{health_check, metrics, readiness_check};
use super::state::AppState;
use crate::api::{appointments, snapshots, waitlist, websocket};
use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::trace::TraceLayer;

/// Build the complete router
///
/// - Booking lifecycle: `POST /appointments/:staff_id/events`, `PUT /staff/:staff_id/status`
/// - Waitlist: `POST /waitlist`, `GET|DELETE /waitlist/:id`, `POST /waitlist/:id/response`
/// - Slot releases: `POST /slots/released`
/// - Live updates: `GET /ws`, polling via `GET /snapshots/:topic`
/// - Operations: `GET /health`, `GET /ready`, `GET /metrics`
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .route("/appointments/:staff_id/events", post(appointments::post_event))
        .route("/staff/:staff_id/status", put(appointments::put_status))
        .route("/slots/released", post(waitlist::slot_released))
        .route("/waitlist", post(waitlist::join))
        .route(
            "/waitlist/:entry_id",
            get(waitlist::get_entry).delete(waitlist::withdraw),
        )
        .route("/waitlist/:entry_id/response", post(waitlist::respond))
        .route("/snapshots/:topic", get(snapshots::get_snapshot))
        .route("/ws", get(websocket::upgrade))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
