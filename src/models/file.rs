use crate::models::verdict::{Severity, ValidationVerdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            "cancelled" => Ok(ProcessingStatus::Cancelled),
            other => Err(format!("unknown processing status '{}'", other)),
        }
    }
}

/// Encryption parameters stored next to a ciphertext. Only the key id is
/// persisted, never key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    pub key_id: String,
    /// Hex-encoded nonce.
    pub iv: String,
    /// Hex-encoded authentication tag.
    pub auth_tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecureFileRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub original_name: String,
    pub sanitized_name: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub mime_type: String,
    pub storage_key: String,
    pub encryption: EncryptionMetadata,
    pub verdict: ValidationVerdict,
    pub processing_status: ProcessingStatus,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SecureFileRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Time-bounded read access granted by a file's owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FilePermission {
    pub id: Uuid,
    pub file_id: Uuid,
    pub grantee_id: String,
    pub granted_by: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl FilePermission {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub original_name: String,
    pub content_hash: String,
    pub threat_name: String,
    pub risk_level: Severity,
    pub storage_key: String,
    pub encryption: EncryptionMetadata,
    pub verdict: ValidationVerdict,
    pub created_at: DateTime<Utc>,
}
