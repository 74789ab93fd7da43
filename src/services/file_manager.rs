use crate::models::FilePermission;
use crate::services::access::{AccessControl, AccessError};
use crate::services::audit::{AuditEventType, AuditService};
use crate::services::metadata_store::MetadataStore;
use crate::services::workbook_cache::WorkbookCache;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file not found")]
    NotFound,

    #[error("access denied")]
    AccessDenied,

    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<AccessError> for FileError {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::NotFound => FileError::NotFound,
            AccessError::Denied => FileError::AccessDenied,
            AccessError::Store(e) => FileError::Store(e),
        }
    }
}

/// Owner-only operations on stored files.
pub struct FileManager {
    metadata: Arc<dyn MetadataStore>,
    access: Arc<AccessControl>,
    cache: Arc<WorkbookCache>,
    audit: AuditService,
}

impl FileManager {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        access: Arc<AccessControl>,
        cache: Arc<WorkbookCache>,
    ) -> Self {
        Self {
            metadata,
            access,
            cache,
            audit: AuditService::new(),
        }
    }

    /// Soft delete: the row stays with `deleted_at` set, parsed data is
    /// evicted right away.
    pub async fn delete_file(&self, file_id: Uuid, user_id: &str) -> Result<(), FileError> {
        self.access.authorize_owner(file_id, user_id).await?;

        if !self.metadata.soft_delete_file(file_id, Utc::now()).await? {
            return Err(FileError::NotFound);
        }
        if let Err(e) = self.cache.evict(file_id).await {
            warn!(file_id = %file_id, "Failed to evict cached workbook: {}", e);
        }

        info!(file_id = %file_id, "🗑️  File deleted");
        self.audit.log(
            AuditEventType::FileDelete,
            Some(user_id),
            Some(&file_id.to_string()),
            "delete",
            "success",
            None,
        );
        Ok(())
    }

    pub async fn grant_permission(
        &self,
        file_id: Uuid,
        owner_id: &str,
        grantee_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<FilePermission, FileError> {
        let grantee_id = grantee_id.trim();
        if grantee_id.is_empty() {
            return Err(FileError::InvalidRequest("grantee is required".into()));
        }
        if grantee_id == owner_id {
            return Err(FileError::InvalidRequest(
                "owners already have access to their files".into(),
            ));
        }
        let now = Utc::now();
        if expires_at <= now {
            return Err(FileError::InvalidRequest(
                "expiry must be in the future".into(),
            ));
        }

        self.access.authorize_owner(file_id, owner_id).await?;

        let permission = FilePermission {
            id: Uuid::new_v4(),
            file_id,
            grantee_id: grantee_id.to_string(),
            granted_by: owner_id.to_string(),
            expires_at,
            created_at: now,
        };
        self.metadata.insert_permission(&permission).await?;

        self.audit.log(
            AuditEventType::PermissionGrant,
            Some(owner_id),
            Some(&file_id.to_string()),
            "grant",
            "success",
            Some(json!({ "grantee": grantee_id, "expires_at": expires_at })),
        );
        Ok(permission)
    }
}
