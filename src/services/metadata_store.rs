use crate::entities::{file_permissions, prelude::*, processing_jobs, quarantined_files, secure_files};
use crate::models::{
    EncryptionMetadata, FilePermission, JobState, ProcessingJob, ProcessingStatus,
    QuarantineRecord, SecureFileRecord, ValidationVerdict,
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

/// Durable metadata for files, permissions, jobs and quarantine entries.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert_file(&self, record: &SecureFileRecord) -> Result<()>;
    /// Returns soft-deleted records too; callers decide how to treat them.
    async fn get_file(&self, id: Uuid) -> Result<Option<SecureFileRecord>>;
    async fn set_processing_status(&self, id: Uuid, status: ProcessingStatus) -> Result<()>;
    async fn increment_access_count(&self, id: Uuid) -> Result<()>;
    async fn soft_delete_file(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;
    /// Files soft-deleted before `before`, oldest first.
    async fn deleted_files_before(&self, before: DateTime<Utc>) -> Result<Vec<SecureFileRecord>>;
    async fn purge_file(&self, id: Uuid) -> Result<()>;

    async fn insert_permission(&self, permission: &FilePermission) -> Result<()>;
    async fn active_permission(
        &self,
        file_id: Uuid,
        grantee_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FilePermission>>;

    async fn insert_job(&self, job: &ProcessingJob) -> Result<()>;
    async fn update_job(&self, job: &ProcessingJob) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<Option<ProcessingJob>>;
    async fn latest_job_for_file(&self, file_id: Uuid) -> Result<Option<ProcessingJob>>;
    async fn jobs_in_states(&self, states: &[JobState]) -> Result<Vec<ProcessingJob>>;

    async fn insert_quarantine(&self, record: &QuarantineRecord) -> Result<()>;
    async fn get_quarantine(&self, id: Uuid) -> Result<Option<QuarantineRecord>>;
}

pub struct SeaOrmMetadataStore {
    db: DatabaseConnection,
}

impl SeaOrmMetadataStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn file_from_model(m: secure_files::Model) -> Result<SecureFileRecord> {
    let verdict: ValidationVerdict = serde_json::from_value(m.validation_verdict)
        .context("stored validation verdict is unreadable")?;
    Ok(SecureFileRecord {
        id: m.id,
        owner_id: m.owner_id,
        original_name: m.original_name,
        sanitized_name: m.sanitized_name,
        size_bytes: m.size_bytes.max(0) as u64,
        content_hash: m.content_hash,
        mime_type: m.mime_type,
        storage_key: m.storage_key,
        encryption: EncryptionMetadata {
            key_id: m.encryption_key_id,
            iv: m.encryption_iv,
            auth_tag: m.encryption_auth_tag,
        },
        verdict,
        processing_status: m.processing_status.parse().map_err(|e: String| anyhow!(e))?,
        access_count: m.access_count.max(0) as u64,
        created_at: m.created_at,
        updated_at: m.updated_at,
        deleted_at: m.deleted_at,
    })
}

fn job_from_model(m: processing_jobs::Model) -> Result<ProcessingJob> {
    let result_summary = m
        .result_summary
        .map(serde_json::from_value)
        .transpose()
        .context("stored job summary is unreadable")?;
    Ok(ProcessingJob {
        id: m.id,
        file_id: m.file_id,
        owner_id: m.owner_id,
        state: m.state.parse().map_err(|e: String| anyhow!(e))?,
        progress: m.progress.clamp(0, 100) as u8,
        attempts_made: m.attempts_made.max(0) as u32,
        max_attempts: m.max_attempts.max(1) as u32,
        created_at: m.created_at,
        started_at: m.started_at,
        completed_at: m.completed_at,
        next_attempt_at: m.next_attempt_at,
        failure_reason: m.failure_reason,
        result_summary,
    })
}

fn job_to_active(job: &ProcessingJob) -> Result<processing_jobs::ActiveModel> {
    let summary = job
        .result_summary
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;
    Ok(processing_jobs::ActiveModel {
        id: Set(job.id),
        file_id: Set(job.file_id),
        owner_id: Set(job.owner_id.clone()),
        state: Set(job.state.as_str().to_string()),
        progress: Set(job.progress as i32),
        attempts_made: Set(job.attempts_made as i32),
        max_attempts: Set(job.max_attempts as i32),
        created_at: Set(job.created_at),
        started_at: Set(job.started_at),
        completed_at: Set(job.completed_at),
        next_attempt_at: Set(job.next_attempt_at),
        failure_reason: Set(job.failure_reason.clone()),
        result_summary: Set(summary),
    })
}

fn permission_from_model(m: file_permissions::Model) -> FilePermission {
    FilePermission {
        id: m.id,
        file_id: m.file_id,
        grantee_id: m.grantee_id,
        granted_by: m.granted_by,
        expires_at: m.expires_at,
        created_at: m.created_at,
    }
}

fn quarantine_from_model(m: quarantined_files::Model) -> Result<QuarantineRecord> {
    Ok(QuarantineRecord {
        id: m.id,
        owner_id: m.owner_id,
        original_name: m.original_name,
        content_hash: m.content_hash,
        threat_name: m.threat_name,
        risk_level: serde_json::from_value(serde_json::Value::String(m.risk_level))?,
        storage_key: m.storage_key,
        encryption: EncryptionMetadata {
            key_id: m.encryption_key_id,
            iv: m.encryption_iv,
            auth_tag: m.encryption_auth_tag,
        },
        verdict: serde_json::from_value(m.validation_verdict)?,
        created_at: m.created_at,
    })
}

#[async_trait]
impl MetadataStore for SeaOrmMetadataStore {
    async fn insert_file(&self, record: &SecureFileRecord) -> Result<()> {
        secure_files::ActiveModel {
            id: Set(record.id),
            owner_id: Set(record.owner_id.clone()),
            original_name: Set(record.original_name.clone()),
            sanitized_name: Set(record.sanitized_name.clone()),
            size_bytes: Set(record.size_bytes as i64),
            content_hash: Set(record.content_hash.clone()),
            mime_type: Set(record.mime_type.clone()),
            storage_key: Set(record.storage_key.clone()),
            encryption_key_id: Set(record.encryption.key_id.clone()),
            encryption_iv: Set(record.encryption.iv.clone()),
            encryption_auth_tag: Set(record.encryption.auth_tag.clone()),
            validation_verdict: Set(serde_json::to_value(&record.verdict)?),
            processing_status: Set(record.processing_status.as_str().to_string()),
            access_count: Set(record.access_count as i64),
            created_at: Set(record.created_at),
            updated_at: Set(record.updated_at),
            deleted_at: Set(record.deleted_at),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    async fn get_file(&self, id: Uuid) -> Result<Option<SecureFileRecord>> {
        SecureFiles::find_by_id(id)
            .one(&self.db)
            .await?
            .map(file_from_model)
            .transpose()
    }

    async fn set_processing_status(&self, id: Uuid, status: ProcessingStatus) -> Result<()> {
        SecureFiles::update_many()
            .col_expr(
                secure_files::Column::ProcessingStatus,
                Expr::value(status.as_str()),
            )
            .col_expr(secure_files::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(secure_files::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn increment_access_count(&self, id: Uuid) -> Result<()> {
        SecureFiles::update_many()
            .col_expr(
                secure_files::Column::AccessCount,
                Expr::col(secure_files::Column::AccessCount).add(1),
            )
            .filter(secure_files::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn soft_delete_file(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let res = SecureFiles::update_many()
            .col_expr(secure_files::Column::DeletedAt, Expr::value(Some(at)))
            .col_expr(secure_files::Column::UpdatedAt, Expr::value(at))
            .filter(secure_files::Column::Id.eq(id))
            .filter(secure_files::Column::DeletedAt.is_null())
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected > 0)
    }

    async fn deleted_files_before(&self, before: DateTime<Utc>) -> Result<Vec<SecureFileRecord>> {
        SecureFiles::find()
            .filter(secure_files::Column::DeletedAt.lt(before))
            .order_by_asc(secure_files::Column::DeletedAt)
            .all(&self.db)
            .await?
            .into_iter()
            .map(file_from_model)
            .collect()
    }

    async fn purge_file(&self, id: Uuid) -> Result<()> {
        FilePermissions::delete_many()
            .filter(file_permissions::Column::FileId.eq(id))
            .exec(&self.db)
            .await?;
        ProcessingJobs::delete_many()
            .filter(processing_jobs::Column::FileId.eq(id))
            .exec(&self.db)
            .await?;
        SecureFiles::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    async fn insert_permission(&self, permission: &FilePermission) -> Result<()> {
        file_permissions::ActiveModel {
            id: Set(permission.id),
            file_id: Set(permission.file_id),
            grantee_id: Set(permission.grantee_id.clone()),
            granted_by: Set(permission.granted_by.clone()),
            expires_at: Set(permission.expires_at),
            created_at: Set(permission.created_at),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    async fn active_permission(
        &self,
        file_id: Uuid,
        grantee_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FilePermission>> {
        let found = FilePermissions::find()
            .filter(file_permissions::Column::FileId.eq(file_id))
            .filter(file_permissions::Column::GranteeId.eq(grantee_id))
            .filter(file_permissions::Column::ExpiresAt.gt(now))
            .order_by_desc(file_permissions::Column::ExpiresAt)
            .one(&self.db)
            .await?;
        Ok(found.map(permission_from_model))
    }

    async fn insert_job(&self, job: &ProcessingJob) -> Result<()> {
        job_to_active(job)?.insert(&self.db).await?;
        Ok(())
    }

    async fn update_job(&self, job: &ProcessingJob) -> Result<()> {
        job_to_active(job)?.update(&self.db).await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ProcessingJob>> {
        ProcessingJobs::find_by_id(id)
            .one(&self.db)
            .await?
            .map(job_from_model)
            .transpose()
    }

    async fn latest_job_for_file(&self, file_id: Uuid) -> Result<Option<ProcessingJob>> {
        ProcessingJobs::find()
            .filter(processing_jobs::Column::FileId.eq(file_id))
            .order_by_desc(processing_jobs::Column::CreatedAt)
            .one(&self.db)
            .await?
            .map(job_from_model)
            .transpose()
    }

    async fn jobs_in_states(&self, states: &[JobState]) -> Result<Vec<ProcessingJob>> {
        let names: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
        ProcessingJobs::find()
            .filter(processing_jobs::Column::State.is_in(names))
            .order_by_asc(processing_jobs::Column::CreatedAt)
            .all(&self.db)
            .await?
            .into_iter()
            .map(job_from_model)
            .collect()
    }

    async fn insert_quarantine(&self, record: &QuarantineRecord) -> Result<()> {
        quarantined_files::ActiveModel {
            id: Set(record.id),
            owner_id: Set(record.owner_id.clone()),
            original_name: Set(record.original_name.clone()),
            content_hash: Set(record.content_hash.clone()),
            threat_name: Set(record.threat_name.clone()),
            risk_level: Set(record.risk_level.as_str().to_string()),
            storage_key: Set(record.storage_key.clone()),
            encryption_key_id: Set(record.encryption.key_id.clone()),
            encryption_iv: Set(record.encryption.iv.clone()),
            encryption_auth_tag: Set(record.encryption.auth_tag.clone()),
            validation_verdict: Set(serde_json::to_value(&record.verdict)?),
            created_at: Set(record.created_at),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    async fn get_quarantine(&self, id: Uuid) -> Result<Option<QuarantineRecord>> {
        QuarantinedFiles::find_by_id(id)
            .one(&self.db)
            .await?
            .map(quarantine_from_model)
            .transpose()
    }
}
