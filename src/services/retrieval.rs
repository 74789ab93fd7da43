use crate::models::workbook::{SheetPage, SheetSelector, WorkbookOverview};
use crate::models::JobState;
use crate::services::access::{AccessControl, AccessError};
use crate::services::audit::{AuditEventType, AuditService};
use crate::services::export::ExportFormat;
use crate::services::metadata_store::MetadataStore;
use crate::services::workbook_cache::{CacheError, ExportedData, WorkbookCache};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("no parsed data for this file")]
    NotFound,

    #[error("file is still being processed ({state}, {progress}%)")]
    NotYetProcessed { state: JobState, progress: u8 },

    #[error("access denied")]
    AccessDenied,

    #[error("{0}")]
    UnsupportedFormat(String),

    #[error("sheet not found: {0}")]
    SheetNotFound(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<AccessError> for RetrievalError {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::NotFound => RetrievalError::NotFound,
            AccessError::Denied => RetrievalError::AccessDenied,
            AccessError::Store(e) => RetrievalError::Store(e),
        }
    }
}

impl From<CacheError> for RetrievalError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::NotFound => RetrievalError::NotFound,
            CacheError::SheetNotFound(s) => RetrievalError::SheetNotFound(s),
            CacheError::Corrupt(e) => RetrievalError::Store(e.into()),
            CacheError::Store(e) => RetrievalError::Store(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataQuery {
    Summary,
    Sheet {
        selector: SheetSelector,
        page: usize,
        page_size: usize,
    },
    Export {
        format: String,
    },
}

#[derive(Debug, Clone)]
pub enum DataResponse {
    Summary(WorkbookOverview),
    Sheet(SheetPage),
    Export(ExportedData),
}

/// Authorized reads of parsed workbook data.
pub struct DataService {
    access: Arc<AccessControl>,
    metadata: Arc<dyn MetadataStore>,
    cache: Arc<WorkbookCache>,
    audit: AuditService,
}

impl DataService {
    pub fn new(
        access: Arc<AccessControl>,
        metadata: Arc<dyn MetadataStore>,
        cache: Arc<WorkbookCache>,
    ) -> Self {
        Self {
            access,
            metadata,
            cache,
            audit: AuditService::new(),
        }
    }

    pub async fn fetch(
        &self,
        file_id: Uuid,
        user_id: &str,
        query: DataQuery,
    ) -> Result<DataResponse, RetrievalError> {
        self.access.authorize_read(file_id, user_id).await?;

        let format = match &query {
            DataQuery::Export { format } => Some(
                format
                    .parse::<ExportFormat>()
                    .map_err(RetrievalError::UnsupportedFormat)?,
            ),
            _ => None,
        };

        // A pending job means any cache miss is "not yet", not "gone".
        let latest = self.metadata.latest_job_for_file(file_id).await?;
        if let Some(job) = latest.filter(|j| j.state.is_pending()) {
            return Err(RetrievalError::NotYetProcessed {
                state: job.state,
                progress: job.progress,
            });
        }

        let response = match (query, format) {
            (DataQuery::Export { .. }, Some(format)) => {
                DataResponse::Export(self.cache.export(file_id, format).await?)
            }
            (DataQuery::Sheet {
                selector,
                page,
                page_size,
            }, _) => DataResponse::Sheet(
                self.cache
                    .get_page(file_id, &selector, page, page_size)
                    .await?,
            ),
            _ => DataResponse::Summary(self.cache.get_summary(file_id).await?),
        };

        if let Err(e) = self.metadata.increment_access_count(file_id).await {
            warn!(file_id = %file_id, "Failed to bump access count: {:#}", e);
        }
        self.audit.log(
            AuditEventType::FileAccess,
            Some(user_id),
            Some(&file_id.to_string()),
            "read",
            "success",
            None,
        );

        Ok(response)
    }
}
