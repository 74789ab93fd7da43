use crate::AppState;
use crate::api::error::AppError;
use crate::models::FilePermission;
use crate::utils::auth::Claims;
use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct GrantPermissionRequest {
    #[validate(length(min = 1, max = 255, message = "Grantee must be between 1 and 255 characters"))]
    pub grantee_id: String,
    /// Lifetime of the grant, one minute to thirty days
    #[validate(range(min = 60, max = 2592000, message = "Expiry must be between 60 seconds and 30 days"))]
    pub expires_in_secs: i64,
}

#[utoipa::path(
    delete,
    path = "/files/{id}",
    params(
        ("id" = Uuid, Path, description = "File ID")
    ),
    responses(
        (status = 204, description = "File deleted"),
        (status = 403, description = "Not the file owner"),
        (status = 404, description = "File not found"),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "files"
)]
pub async fn delete_file(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.files.delete_file(id, &claims.sub).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/files/{id}/permissions",
    params(
        ("id" = Uuid, Path, description = "File ID")
    ),
    request_body = GrantPermissionRequest,
    responses(
        (status = 201, description = "Access granted", body = FilePermission),
        (status = 400, description = "Invalid request"),
        (status = 403, description = "Not the file owner"),
        (status = 404, description = "File not found"),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "files"
)]
pub async fn grant_permission(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<Uuid>,
    Json(req): Json<GrantPermissionRequest>,
) -> Result<(StatusCode, Json<FilePermission>), AppError> {
    req.validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let expires_at = Utc::now() + Duration::seconds(req.expires_in_secs);
    let permission = state
        .files
        .grant_permission(id, &claims.sub, &req.grantee_id, expires_at)
        .await?;
    Ok((StatusCode::CREATED, Json(permission)))
}
