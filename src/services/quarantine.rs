use crate::models::{QuarantineRecord, ValidationVerdict};
use crate::services::audit::{AuditEventType, AuditService};
use crate::services::encryption::EncryptedPayload;
use crate::services::metadata_store::MetadataStore;
use crate::services::storage::StorageService;
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Isolates infected uploads. The ciphertext lands under `quarantine/` and a
/// quarantine row is written; no file record or job is ever created for it.
pub struct QuarantineService {
    storage: Arc<dyn StorageService>,
    metadata: Arc<dyn MetadataStore>,
    audit: AuditService,
}

impl QuarantineService {
    pub fn new(
        storage: Arc<dyn StorageService>,
        metadata: Arc<dyn MetadataStore>,
        audit: AuditService,
    ) -> Self {
        Self {
            storage,
            metadata,
            audit,
        }
    }

    pub async fn quarantine(
        &self,
        owner_id: &str,
        original_name: &str,
        verdict: &ValidationVerdict,
        payload: EncryptedPayload,
        key_id: &str,
    ) -> Result<QuarantineRecord> {
        let id = Uuid::new_v4();
        let storage_key = format!("quarantine/{}", id);
        let encryption = payload.metadata(key_id);

        self.storage
            .upload_file(&storage_key, payload.ciphertext)
            .await
            .context("Failed to store quarantined payload")?;

        let record = QuarantineRecord {
            id,
            owner_id: owner_id.to_string(),
            original_name: original_name.to_string(),
            content_hash: verdict.content_hash.clone(),
            threat_name: verdict
                .threat_name
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            risk_level: verdict.risk_level,
            storage_key,
            encryption,
            verdict: verdict.clone(),
            created_at: Utc::now(),
        };

        if let Err(e) = self.metadata.insert_quarantine(&record).await {
            // Without a row the payload is unreachable; remove it.
            if let Err(cleanup) = self.storage.delete_file(&record.storage_key).await {
                warn!(
                    quarantine_id = %record.id,
                    "Failed to remove orphaned quarantine payload: {:#}",
                    cleanup
                );
            }
            return Err(e.context("Failed to record quarantined file"));
        }

        warn!(
            quarantine_id = %record.id,
            threat = %record.threat_name,
            "☣️  File quarantined"
        );
        self.audit.log(
            AuditEventType::FileQuarantine,
            Some(owner_id),
            Some(&record.id.to_string()),
            "quarantine",
            "success",
            Some(json!({ "threat": record.threat_name, "hash": record.content_hash })),
        );

        Ok(record)
    }
}
