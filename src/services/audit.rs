use serde_json::Value;
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    FileUpload,
    FileRejected,
    FileQuarantine,
    FileEncrypt,
    FileDecrypt,
    FileAccess,
    FileAccessDenied,
    FileDelete,
    PermissionGrant,
    JobCancel,
    IntegrityViolation,
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Security-relevant events, emitted on the `audit` tracing target so they
/// can be routed separately from operational logs.
#[derive(Clone, Default)]
pub struct AuditService;

impl AuditService {
    pub fn new() -> Self {
        Self
    }

    pub fn log(
        &self,
        event_type: AuditEventType,
        user_id: Option<&str>,
        resource_id: Option<&str>,
        action: &str,
        status: &str,
        details: Option<Value>,
    ) {
        let details = details.map(|v| v.to_string());
        if status == "success" {
            info!(
                target: "audit",
                event_type = %event_type,
                user_id = ?user_id,
                resource_id = ?resource_id,
                action = %action,
                status = %status,
                details = ?details,
                "Audit Event Occurred"
            );
        } else {
            warn!(
                target: "audit",
                event_type = %event_type,
                user_id = ?user_id,
                resource_id = ?resource_id,
                action = %action,
                status = %status,
                details = ?details,
                "Audit Event Occurred"
            );
        }
    }
}
