use crate::AppState;
use crate::api::error::AppError;
use crate::models::{ChunkSubmission, Severity, ValidationIssue};
use crate::services::ingest::{ChunkProgress, IngestOutcome};
use crate::utils::auth::Claims;
use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Multipart, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Serialize, ToSchema)]
pub struct UploadResponse {
    pub file_id: Uuid,
    pub job_id: Uuid,
    pub risk_level: Severity,
    /// Findings below the blocking threshold.
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChunkProgressResponse {
    pub chunks_received: u32,
    pub total_chunks: u32,
    pub progress_percent: f32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QuarantineResponse {
    pub error: String,
    pub quarantine_id: Uuid,
    pub threat_name: Option<String>,
    pub issues: Vec<ValidationIssue>,
}

fn outcome_response(outcome: IngestOutcome) -> Result<Response, AppError> {
    match outcome {
        IngestOutcome::Accepted {
            file_id,
            job_id,
            verdict,
        } => Ok((
            StatusCode::CREATED,
            Json(UploadResponse {
                file_id,
                job_id,
                risk_level: verdict.risk_level,
                issues: verdict.issues,
            }),
        )
            .into_response()),
        IngestOutcome::Rejected { verdict } => Err(AppError::Validation {
            message: "File failed validation".to_string(),
            issues: verdict.issues,
        }),
        IngestOutcome::Quarantined {
            quarantine_id,
            verdict,
        } => Ok((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(QuarantineResponse {
                error: "Malware detected; the file has been quarantined".to_string(),
                quarantine_id,
                threat_name: verdict.threat_name,
                issues: verdict.issues,
            }),
        )
            .into_response()),
    }
}

#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = Multipart, description = "Spreadsheet upload in the `file` field"),
    responses(
        (status = 201, description = "Stored encrypted and queued for parsing", body = UploadResponse),
        (status = 400, description = "Validation failed"),
        (status = 413, description = "File too large"),
        (status = 422, description = "Malware detected", body = QuarantineResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "upload"
)]
pub async fn upload_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut upload: Option<(String, String, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("unnamed").to_string();
        let content_type = field
            .content_type()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM.as_ref())
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read upload: {}", e)))?;
        upload = Some((file_name, content_type, data));
    }

    let (file_name, content_type, data) =
        upload.ok_or_else(|| AppError::BadRequest("Missing 'file' field".to_string()))?;
    if data.is_empty() {
        return Err(AppError::BadRequest("Uploaded file is empty".to_string()));
    }

    let outcome = state
        .ingest
        .ingest(&claims.sub, &file_name, &content_type, data)
        .await?;
    outcome_response(outcome)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("Missing or invalid header '{}'", name)))
}

fn header_num<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Result<T, AppError> {
    header_str(headers, name)?
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Header '{}' must be a number", name)))
}

#[utoipa::path(
    post,
    path = "/upload/chunk",
    request_body(content = Vec<u8>, description = "Chunk data", content_type = "application/octet-stream"),
    params(
        ("x-file-id" = String, Header, description = "Client-chosen upload id shared by all chunks"),
        ("x-file-name" = String, Header, description = "Original file name"),
        ("x-file-size" = u64, Header, description = "Total file size in bytes"),
        ("x-chunk-index" = u32, Header, description = "Zero-based chunk index"),
        ("x-total-chunks" = u32, Header, description = "Number of chunks"),
        ("x-file-type" = Option<String>, Header, description = "Declared MIME type")
    ),
    responses(
        (status = 202, description = "Chunk stored, more expected", body = ChunkProgressResponse),
        (status = 201, description = "Final chunk; file stored and queued", body = UploadResponse),
        (status = 400, description = "Invalid chunk or validation failure"),
        (status = 410, description = "Upload session expired"),
        (status = 413, description = "Chunk or file too large"),
        (status = 422, description = "Malware detected", body = QuarantineResponse),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "upload"
)]
pub async fn upload_chunk_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let submission = ChunkSubmission {
        owner_id: claims.sub,
        file_id: header_str(&headers, "x-file-id")?.to_string(),
        file_name: header_str(&headers, "x-file-name")?.to_string(),
        mime_type: header_str(&headers, "x-file-type")
            .unwrap_or(mime::APPLICATION_OCTET_STREAM.as_ref())
            .to_string(),
        declared_size: header_num(&headers, "x-file-size")?,
        chunk_index: header_num(&headers, "x-chunk-index")?,
        total_chunks: header_num(&headers, "x-total-chunks")?,
        payload: body,
    };

    match state.ingest.submit_chunk(submission).await? {
        ChunkProgress::Partial {
            received,
            total,
            progress,
        } => Ok((
            StatusCode::ACCEPTED,
            Json(ChunkProgressResponse {
                chunks_received: received,
                total_chunks: total,
                progress_percent: progress,
            }),
        )
            .into_response()),
        ChunkProgress::Finished(outcome) => outcome_response(outcome),
    }
}
