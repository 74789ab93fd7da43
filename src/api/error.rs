use crate::models::ValidationIssue;
use crate::services::chunk_assembly::ChunkError;
use crate::services::encryption::CryptoError;
use crate::services::file_manager::FileError;
use crate::services::ingest::IngestError;
use crate::services::job_queue::JobError;
use crate::services::retrieval::RetrievalError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upload session expired")]
    Gone(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    #[error("Service Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Validation { message, issues } => {
                let body = Json(json!({
                    "error": message,
                    "issues": issues,
                }));
                return (StatusCode::BAD_REQUEST, body).into_response();
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Gone(msg) => (StatusCode::GONE, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::Unavailable(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::Anyhow(e) => {
                tracing::error!("Anyhow error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<ChunkError> for AppError {
    fn from(e: ChunkError) -> Self {
        match e {
            ChunkError::PayloadTooLarge(msg) => AppError::PayloadTooLarge(msg),
            ChunkError::SessionExpired => AppError::Gone(e.to_string()),
            ChunkError::MissingChunk(_)
            | ChunkError::InvalidChunk(_)
            | ChunkError::SizeMismatch { .. } => AppError::BadRequest(e.to_string()),
            ChunkError::Store(e) => AppError::Anyhow(e),
        }
    }
}

impl From<CryptoError> for AppError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Timeout(_) => AppError::Unavailable(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<JobError> for AppError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::InvalidTransition(t) => AppError::Conflict(t.to_string()),
            JobError::NotFound => AppError::NotFound("Job not found".to_string()),
            JobError::AccessDenied => AppError::Forbidden("Access denied".to_string()),
            JobError::Store(e) => AppError::Anyhow(e),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Chunk(e) => e.into(),
            IngestError::PayloadTooLarge(msg) => AppError::PayloadTooLarge(msg),
            IngestError::Crypto(e) => e.into(),
            IngestError::Job(e) => e.into(),
            IngestError::Internal(e) => AppError::Anyhow(e),
        }
    }
}

impl From<RetrievalError> for AppError {
    fn from(e: RetrievalError) -> Self {
        match e {
            RetrievalError::NotFound => AppError::NotFound("File not found".to_string()),
            RetrievalError::NotYetProcessed { .. } => AppError::Conflict(e.to_string()),
            RetrievalError::AccessDenied => AppError::Forbidden("Access denied".to_string()),
            RetrievalError::UnsupportedFormat(msg) => AppError::BadRequest(msg),
            RetrievalError::SheetNotFound(_) => AppError::NotFound(e.to_string()),
            RetrievalError::Store(e) => AppError::Anyhow(e),
        }
    }
}

impl From<FileError> for AppError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::NotFound => AppError::NotFound("File not found".to_string()),
            FileError::AccessDenied => AppError::Forbidden("Access denied".to_string()),
            FileError::InvalidRequest(msg) => AppError::BadRequest(msg),
            FileError::Store(e) => AppError::Anyhow(e),
        }
    }
}
