use axum::{extract::State, Json};
use serde::Serialize;
use tracing::info;

use crate::api::{error::ApiError, response::ApiResponse};
use crate::controller::{ControllerHandle, EventEntry, SystemSnapshot};

#[derive(Debug, Serialize)]
pub struct Liveness {
    status: &'static str,
    version: &'static str,
}

/// GET /healthz - process liveness; dispatch health lives in /api/status
pub async fn healthz() -> Json<Liveness> {
    Json(Liveness {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /api/status - latest published system snapshot
pub async fn get_status(
    State(handle): State<ControllerHandle>,
) -> Json<ApiResponse<SystemSnapshot>> {
    Json(ApiResponse::success(handle.snapshot()))
}

/// GET /api/logs - recent controller events, oldest first
pub async fn get_logs(State(handle): State<ControllerHandle>) -> Json<ApiResponse<Vec<EventEntry>>> {
    let events = handle.snapshot().events;
    let count = events.len();
    Json(ApiResponse::success(events).with_count(count))
}

/// POST /api/control/pause - stop the fleet and hold dispatch
pub async fn pause(
    State(handle): State<ControllerHandle>,
) -> Result<Json<ApiResponse<SystemSnapshot>>, ApiError> {
    info!("pause requested over HTTP");
    Ok(Json(ApiResponse::success(handle.pause().await?)))
}

/// POST /api/control/resume
pub async fn resume(
    State(handle): State<ControllerHandle>,
) -> Result<Json<ApiResponse<SystemSnapshot>>, ApiError> {
    info!("resume requested over HTTP");
    Ok(Json(ApiResponse::success(handle.resume().await?)))
}

/// POST /api/statistics/reset
pub async fn reset_statistics(
    State(handle): State<ControllerHandle>,
) -> Result<Json<ApiResponse<SystemSnapshot>>, ApiError> {
    Ok(Json(ApiResponse::success(handle.reset_statistics().await?)))
}
