//! Read-mostly HTTP surface over the control loop.
//!
//! Handlers only see a [`ControllerHandle`]: reads come from the latest
//! published snapshot, operator actions travel as commands to the loop.

pub mod error;
pub mod response;
pub mod status;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ServerConfig;
use crate::controller::ControllerHandle;

pub fn router(handle: ControllerHandle, server: &ServerConfig) -> Router {
    Router::new()
        .route("/healthz", get(status::healthz))
        .route("/api/status", get(status::get_status))
        .route("/api/logs", get(status::get_logs))
        .route("/api/control/pause", post(status::pause))
        .route("/api/control/resume", post(status::resume))
        .route("/api/statistics/reset", post(status::reset_statistics))
        .with_state(handle)
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(64 * 1024))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    server.request_timeout(),
                )),
        )
        .layer(TraceLayer::new_for_http())
}
