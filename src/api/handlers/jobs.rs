use crate::AppState;
use crate::api::error::AppError;
use crate::models::ProcessingJob;
use crate::utils::auth::Claims;
use axum::{
    Extension, Json,
    extract::{Path, State},
};
use uuid::Uuid;

#[utoipa::path(
    get,
    path = "/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Current job state", body = ProcessingJob),
        (status = 403, description = "Not the job owner"),
        (status = 404, description = "Job not found"),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProcessingJob>, AppError> {
    let job = state.queue.status(id, &claims.sub).await?;
    Ok(Json(job))
}

#[utoipa::path(
    delete,
    path = "/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job cancelled", body = ProcessingJob),
        (status = 403, description = "Not the job owner"),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job already finished"),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProcessingJob>, AppError> {
    let job = state.queue.cancel(id, &claims.sub).await?;
    Ok(Json(job))
}
