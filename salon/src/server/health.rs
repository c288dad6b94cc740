//! Liveness, readiness and metrics endpoints.

use super::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use salon_queue_runtime::HealthStatus;
use serde::Serialize;

/// Liveness response
#[derive(Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
}

/// Liveness check
///
/// ```bash
/// curl http://localhost:8080/health
/// # {"status":"ok","version":"0.1.0"}
/// ```
pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// One lane's health
#[derive(Serialize)]
pub struct LaneHealth {
    /// `queue:{salon}` or `waitlist:{salon}`
    pub component: String,
    /// healthy, degraded or unhealthy
    pub status: String,
    /// Explanation when not healthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    /// False if any lane stopped accepting work
    pub ready: bool,
    /// Worst status across lanes
    pub status: String,
    /// Open live connections
    pub connections: usize,
    /// Every started lane
    pub lanes: Vec<LaneHealth>,
}

/// Readiness check
///
/// Degraded lanes (a large effect backlog) still count as ready; a lane that
/// is shutting down does not.
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let checks = state.service.health();
    let worst = checks
        .iter()
        .fold(HealthStatus::Healthy, |acc, check| acc.worst(check.status));
    let ready = worst != HealthStatus::Unhealthy;

    let lanes = checks
        .into_iter()
        .map(|check| LaneHealth {
            component: check.component,
            status: check.status.to_string(),
            message: check.message,
        })
        .collect();

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            status: worst.to_string(),
            connections: state.service.hub().connection_count(),
            lanes,
        }),
    )
}

/// Prometheus scrape endpoint
pub async fn metrics(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(|exporter| exporter.render())
        .unwrap_or_default()
}
