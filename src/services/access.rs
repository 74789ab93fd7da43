use crate::models::SecureFileRecord;
use crate::services::audit::{AuditEventType, AuditService};
use crate::services::metadata_store::MetadataStore;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("file not found")]
    NotFound,

    #[error("access denied")]
    Denied,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Owner-or-grant access checks for file reads.
pub struct AccessControl {
    metadata: Arc<dyn MetadataStore>,
    audit: AuditService,
}

impl AccessControl {
    pub fn new(metadata: Arc<dyn MetadataStore>, audit: AuditService) -> Self {
        Self { metadata, audit }
    }

    /// Loads a live (not soft-deleted) file the user may read: the owner, or
    /// a grantee holding an unexpired permission.
    pub async fn authorize_read(
        &self,
        file_id: Uuid,
        user_id: &str,
    ) -> Result<SecureFileRecord, AccessError> {
        let record = self
            .metadata
            .get_file(file_id)
            .await?
            .filter(|r| !r.is_deleted())
            .ok_or(AccessError::NotFound)?;

        if record.owner_id == user_id {
            return Ok(record);
        }

        let grant = self
            .metadata
            .active_permission(file_id, user_id, Utc::now())
            .await?;
        if grant.is_some() {
            return Ok(record);
        }

        self.audit.log(
            AuditEventType::FileAccessDenied,
            Some(user_id),
            Some(&file_id.to_string()),
            "read",
            "denied",
            None,
        );
        Err(AccessError::Denied)
    }

    /// Owner-only operations: delete, granting permissions.
    pub async fn authorize_owner(
        &self,
        file_id: Uuid,
        user_id: &str,
    ) -> Result<SecureFileRecord, AccessError> {
        let record = self
            .metadata
            .get_file(file_id)
            .await?
            .filter(|r| !r.is_deleted())
            .ok_or(AccessError::NotFound)?;

        if record.owner_id != user_id {
            self.audit.log(
                AuditEventType::FileAccessDenied,
                Some(user_id),
                Some(&file_id.to_string()),
                "owner_action",
                "denied",
                None,
            );
            return Err(AccessError::Denied);
        }
        Ok(record)
    }
}
