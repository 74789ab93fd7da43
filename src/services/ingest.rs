use crate::models::{
    ChunkOutcome, ChunkSubmission, ProcessingStatus, SecureFileRecord, ValidationVerdict,
};
use crate::services::audit::{AuditEventType, AuditService};
use crate::services::chunk_assembly::{ChunkAssemblyManager, ChunkError};
use crate::services::encryption::{CryptoError, EncryptionService};
use crate::services::job_queue::{JobError, JobQueue};
use crate::services::key_management::KeyProvider;
use crate::services::metadata_store::MetadataStore;
use crate::services::quarantine::QuarantineService;
use crate::services::storage::StorageService;
use crate::services::validation::ValidationPipeline;
use crate::utils::validation::{SpreadsheetKind, normalize_mime, sanitize_filename};
use anyhow::Context;
use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// Stored encrypted and queued for parsing.
    Accepted {
        file_id: Uuid,
        job_id: Uuid,
        verdict: ValidationVerdict,
    },
    /// Blocked by validation; nothing was stored.
    Rejected { verdict: ValidationVerdict },
    /// Flagged by the malware scanner and isolated.
    Quarantined {
        quarantine_id: Uuid,
        verdict: ValidationVerdict,
    },
}

#[derive(Debug, Clone)]
pub enum ChunkProgress {
    Partial {
        received: u32,
        total: u32,
        progress: f32,
    },
    Finished(IngestOutcome),
}

/// Entry point for uploads: validate, encrypt, persist, enqueue.
pub struct IngestService {
    pipeline: Arc<ValidationPipeline>,
    chunks: Arc<ChunkAssemblyManager>,
    keys: Arc<dyn KeyProvider>,
    storage: Arc<dyn StorageService>,
    metadata: Arc<dyn MetadataStore>,
    quarantine: QuarantineService,
    queue: JobQueue,
    max_file_size: u64,
    encryption_timeout: Duration,
    audit: AuditService,
}

impl IngestService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: Arc<ValidationPipeline>,
        chunks: Arc<ChunkAssemblyManager>,
        keys: Arc<dyn KeyProvider>,
        storage: Arc<dyn StorageService>,
        metadata: Arc<dyn MetadataStore>,
        queue: JobQueue,
        max_file_size: u64,
        encryption_timeout: Duration,
    ) -> Self {
        let audit = AuditService::new();
        Self {
            quarantine: QuarantineService::new(storage.clone(), metadata.clone(), audit.clone()),
            pipeline,
            chunks,
            keys,
            storage,
            metadata,
            queue,
            max_file_size,
            encryption_timeout,
            audit,
        }
    }

    pub fn chunks(&self) -> &ChunkAssemblyManager {
        &self.chunks
    }

    /// Single-shot upload.
    pub async fn ingest(
        &self,
        owner_id: &str,
        file_name: &str,
        mime_type: &str,
        buffer: Bytes,
    ) -> Result<IngestOutcome, IngestError> {
        if buffer.len() as u64 > self.max_file_size {
            return Err(IngestError::PayloadTooLarge(format!(
                "file is {} bytes, limit is {}",
                buffer.len(),
                self.max_file_size
            )));
        }

        let verdict = self.pipeline.validate(file_name, mime_type, &buffer).await;

        if verdict.is_infected() {
            let (key_id, key) = self.keys.active_key()?;
            let payload =
                EncryptionService::encrypt_with_timeout(buffer, key, self.encryption_timeout)
                    .await?;
            let record = self
                .quarantine
                .quarantine(owner_id, file_name, &verdict, payload, &key_id)
                .await?;
            return Ok(IngestOutcome::Quarantined {
                quarantine_id: record.id,
                verdict,
            });
        }

        if !verdict.valid {
            info!(
                owner = %owner_id,
                risk = %verdict.risk_level,
                issues = verdict.issues.len(),
                "🚫 Upload rejected by validation"
            );
            self.audit.log(
                AuditEventType::FileRejected,
                Some(owner_id),
                None,
                "upload",
                "rejected",
                Some(json!({
                    "file_name": file_name,
                    "risk": verdict.risk_level,
                    "hash": verdict.content_hash,
                })),
            );
            return Ok(IngestOutcome::Rejected { verdict });
        }

        let file_id = Uuid::new_v4();
        let sanitized_name = sanitize_filename(file_name).unwrap_or_else(|_| {
            let ext = SpreadsheetKind::from_signature(&buffer)
                .map(|k| k.extension())
                .unwrap_or("bin");
            format!("{}.{}", file_id, ext)
        });
        let stored_mime = SpreadsheetKind::from_signature(&buffer)
            .map(|k| k.mime_type().to_string())
            .unwrap_or_else(|| normalize_mime(mime_type));
        let size_bytes = buffer.len() as u64;

        let (key_id, key) = self.keys.active_key()?;
        let payload =
            EncryptionService::encrypt_with_timeout(buffer, key, self.encryption_timeout).await?;
        let encryption = payload.metadata(&key_id);

        let storage_key = format!("files/{}", file_id);
        self.storage
            .upload_file(&storage_key, payload.ciphertext)
            .await
            .context("Failed to store encrypted upload")?;

        let now = Utc::now();
        let record = SecureFileRecord {
            id: file_id,
            owner_id: owner_id.to_string(),
            original_name: file_name.to_string(),
            sanitized_name,
            size_bytes,
            content_hash: verdict.content_hash.clone(),
            mime_type: stored_mime,
            storage_key: storage_key.clone(),
            encryption,
            verdict: verdict.clone(),
            processing_status: ProcessingStatus::Pending,
            access_count: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        if let Err(e) = self.metadata.insert_file(&record).await {
            if let Err(cleanup) = self.storage.delete_file(&storage_key).await {
                warn!(file_id = %file_id, "Failed to remove orphaned ciphertext: {:#}", cleanup);
            }
            return Err(IngestError::Internal(e.context("Failed to record upload")));
        }

        self.audit.log(
            AuditEventType::FileEncrypt,
            Some(owner_id),
            Some(&file_id.to_string()),
            "encrypt",
            "success",
            Some(json!({ "key_id": key_id })),
        );
        self.audit.log(
            AuditEventType::FileUpload,
            Some(owner_id),
            Some(&file_id.to_string()),
            "upload",
            "success",
            Some(json!({ "size": size_bytes, "hash": record.content_hash })),
        );

        let job = self.queue.submit(file_id, owner_id).await?;
        info!(file_id = %file_id, job_id = %job.id, size = size_bytes, "✅ Upload accepted");

        Ok(IngestOutcome::Accepted {
            file_id,
            job_id: job.id,
            verdict,
        })
    }

    /// Chunked upload. The final chunk runs the assembled buffer through
    /// [`Self::ingest`].
    pub async fn submit_chunk(&self, submission: ChunkSubmission) -> Result<ChunkProgress, IngestError> {
        match self.chunks.submit_chunk(submission).await? {
            ChunkOutcome::Pending {
                received,
                total,
                progress,
            } => Ok(ChunkProgress::Partial {
                received,
                total,
                progress,
            }),
            ChunkOutcome::Assembled { session, buffer } => {
                info!(
                    upload_id = %session.file_id,
                    chunks = session.total_chunks,
                    size = buffer.len(),
                    "🧩 Chunked upload assembled"
                );
                let outcome = self
                    .ingest(
                        &session.owner_id,
                        &session.file_name,
                        &session.mime_type,
                        buffer,
                    )
                    .await?;
                Ok(ChunkProgress::Finished(outcome))
            }
        }
    }
}
