use crate::AppState;
use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub scanner: String,
    pub active_jobs: usize,
    pub stalled_jobs: usize,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "System health status", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_status = if state.db.ping().await.is_ok() {
        "connected"
    } else {
        "disconnected"
    };

    let scanner_status = if !state.config.enable_virus_scan {
        "disabled"
    } else if state.scanner.health_check().await {
        "connected"
    } else {
        "unreachable"
    };

    let stalled = state.queue.stalled_jobs().len();
    let status = if db_status == "connected" && stalled == 0 {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        database: db_status.to_string(),
        scanner: scanner_status.to_string(),
        active_jobs: state.queue.active_count(),
        stalled_jobs: stalled,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
