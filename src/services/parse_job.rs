use crate::models::{JobSummary, ProcessingJob};
use crate::services::audit::{AuditEventType, AuditService};
use crate::services::encryption::{CryptoError, EncryptionService};
use crate::services::job_queue::{JobCompletion, JobContext, JobFailure, JobHandler};
use crate::services::key_management::KeyProvider;
use crate::services::metadata_store::MetadataStore;
use crate::services::storage::StorageService;
use crate::services::workbook_cache::WorkbookCache;
use crate::services::workbook_parser::{ParseError, WorkbookParser};
use crate::utils::hash::verify_hash;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Fetches, decrypts and parses a stored upload, then publishes the result
/// to the workbook cache once the queue confirms the run still counts.
pub struct ParseJobHandler {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageService>,
    keys: Arc<dyn KeyProvider>,
    parser: Arc<WorkbookParser>,
    cache: Arc<WorkbookCache>,
    decrypt_timeout: Duration,
    audit: AuditService,
}

impl ParseJobHandler {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageService>,
        keys: Arc<dyn KeyProvider>,
        parser: Arc<WorkbookParser>,
        cache: Arc<WorkbookCache>,
        decrypt_timeout: Duration,
    ) -> Self {
        Self {
            metadata,
            storage,
            keys,
            parser,
            cache,
            decrypt_timeout,
            audit: AuditService::new(),
        }
    }
}

#[async_trait]
impl JobHandler for ParseJobHandler {
    async fn run(&self, job: &ProcessingJob, ctx: JobContext) -> Result<JobCompletion, JobFailure> {
        let record = self
            .metadata
            .get_file(job.file_id)
            .await
            .map_err(|e| JobFailure::retryable(format!("metadata unavailable: {}", e)))?
            .filter(|r| !r.is_deleted())
            .ok_or_else(|| JobFailure::fatal("file record no longer exists"))?;

        let ciphertext = self
            .storage
            .get_file(&record.storage_key)
            .await
            .map_err(|e| JobFailure::retryable(format!("storage read failed: {}", e)))?;
        ctx.progress.report(5.0);

        let key = self
            .keys
            .key(&record.encryption.key_id)
            .map_err(|e| JobFailure::fatal(e.to_string()))?;

        let plaintext = match EncryptionService::decrypt_with_timeout(
            ciphertext,
            key,
            record.encryption.clone(),
            self.decrypt_timeout,
        )
        .await
        {
            Ok(plaintext) => plaintext,
            Err(CryptoError::Timeout(t)) => {
                return Err(JobFailure::retryable(format!(
                    "decryption timed out after {:?}",
                    t
                )));
            }
            Err(e) => {
                error!(file_id = %record.id, "🚨 Stored payload failed authentication: {}", e);
                self.audit.log(
                    AuditEventType::IntegrityViolation,
                    Some(&record.owner_id),
                    Some(&record.id.to_string()),
                    "decrypt",
                    "failure",
                    Some(json!({ "job_id": job.id, "error": e.to_string() })),
                );
                return Err(JobFailure::fatal(e.to_string()));
            }
        };

        if !verify_hash(&plaintext, &record.content_hash) {
            self.audit.log(
                AuditEventType::IntegrityViolation,
                Some(&record.owner_id),
                Some(&record.id.to_string()),
                "hash_check",
                "failure",
                None,
            );
            return Err(JobFailure::fatal(
                "decrypted content does not match the recorded hash",
            ));
        }
        self.audit.log(
            AuditEventType::FileDecrypt,
            Some(&record.owner_id),
            Some(&record.id.to_string()),
            "decrypt",
            "success",
            None,
        );
        ctx.progress.report(10.0);

        let parser = self.parser.clone();
        let progress = ctx.progress.scoped(10.0, 95.0);
        let cancel = ctx.cancel.clone();
        let file_id = record.id;
        let parsed = tokio::task::spawn_blocking(move || {
            parser.parse(file_id, &plaintext, &|p| progress.report(p), &cancel)
        })
        .await
        .map_err(|e| JobFailure::retryable(format!("parser task failed: {}", e)))?;

        let workbook = match parsed {
            Ok(workbook) => workbook,
            Err(ParseError::Cancelled) => return Err(JobFailure::Cancelled),
            Err(e) => return Err(JobFailure::retryable(e.to_string())),
        };
        ctx.progress.report(100.0);

        let summary = JobSummary {
            sheet_count: workbook.summary.total_sheets,
            processed_sheets: workbook.summary.processed_sheets,
            total_rows: workbook.total_rows,
            total_columns: workbook.total_columns,
            warning_count: workbook.warnings.len(),
            truncated: workbook.summary.truncated,
            duration_ms: workbook.summary.processing_time_ms,
        };
        info!(
            job_id = %job.id,
            sheets = summary.processed_sheets,
            rows = summary.total_rows,
            warnings = summary.warning_count,
            "📊 Workbook parsed"
        );

        let cache = self.cache.clone();
        Ok(JobCompletion {
            summary,
            finalize: Some(Box::pin(async move {
                cache.store(workbook).await?;
                Ok(())
            })),
        })
    }
}
