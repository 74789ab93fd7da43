use crate::config::IngestConfig;
use crate::models::workbook::{
    Pagination, ParsedWorkbook, Row, SheetPage, SheetSelector, WorkbookOverview,
};
use crate::services::export::{self, ExportFormat};
use crate::services::kv_store::KeyValueStore;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no parsed data for this file")]
    NotFound,

    #[error("sheet not found: {0}")]
    SheetNotFound(String),

    #[error("cached workbook is unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// A rendered export ready to be sent.
#[derive(Debug, Clone)]
pub struct ExportedData {
    pub format: ExportFormat,
    pub body: Vec<u8>,
}

/// Computes the row window for a 1-indexed page. `page_size` is clamped to
/// `1..=max_page_size`; a page past the end yields an empty window.
pub fn paginate(
    total_rows: usize,
    page: usize,
    page_size: usize,
    max_page_size: usize,
) -> (Pagination, Range<usize>) {
    let page = page.max(1);
    let page_size = page_size.clamp(1, max_page_size.max(1));
    let total_pages = total_rows.div_ceil(page_size);

    let start = (page - 1).saturating_mul(page_size).min(total_rows);
    let end = start.saturating_add(page_size).min(total_rows);

    (
        Pagination {
            page,
            page_size,
            total_rows,
            total_pages,
            has_next: page < total_pages,
            has_previous: page > 1,
        },
        start..end,
    )
}

/// Parsed workbooks keyed by file id, stored as JSON with a TTL. The
/// workbook shell (summary, sheet metadata, merges) and each sheet's rows
/// live under separate keys so a summary or a page never decodes other
/// sheets' rows.
pub struct WorkbookCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
    max_page_size: usize,
}

fn cache_key(file_id: Uuid) -> String {
    format!("workbook:{}", file_id)
}

fn rows_key(file_id: Uuid, sheet_id: usize) -> String {
    format!("workbook:{}:rows:{}", file_id, sheet_id)
}

impl WorkbookCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration, max_page_size: usize) -> Self {
        Self {
            store,
            ttl,
            max_page_size: max_page_size.max(1),
        }
    }

    pub fn from_config(store: Arc<dyn KeyValueStore>, config: &IngestConfig) -> Self {
        Self::new(store, config.cache_ttl(), config.max_page_size)
    }

    pub fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    /// Writes the whole workbook, replacing any earlier entry for the file.
    pub async fn store(&self, mut workbook: ParsedWorkbook) -> Result<DateTime<Utc>, CacheError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        workbook.expires_at = Some(expires_at);
        let file_id = workbook.file_id;

        self.evict(file_id).await?;

        let mut total = 0;
        for sheet in &mut workbook.sheets {
            let rows = std::mem::take(&mut sheet.rows);
            let body = serde_json::to_vec(&rows)?;
            total += body.len();
            self.store
                .set(&rows_key(file_id, sheet.id), Bytes::from(body), self.ttl)
                .await?;
        }
        // The shell goes last: once it is visible every sheet's rows are too.
        let shell = serde_json::to_vec(&workbook)?;
        total += shell.len();
        self.store
            .set(&cache_key(file_id), Bytes::from(shell), self.ttl)
            .await?;

        debug!(file_id = %file_id, bytes = total, sheets = workbook.sheets.len(), "Caching parsed workbook");
        Ok(expires_at)
    }

    /// The workbook without any sheet rows.
    async fn shell(&self, file_id: Uuid) -> Result<ParsedWorkbook, CacheError> {
        let raw = self
            .store
            .get(&cache_key(file_id))
            .await?
            .ok_or(CacheError::NotFound)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn rows(&self, file_id: Uuid, sheet_id: usize) -> Result<Vec<Row>, CacheError> {
        let raw = self
            .store
            .get(&rows_key(file_id, sheet_id))
            .await?
            .ok_or(CacheError::NotFound)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// The complete workbook with every sheet's rows.
    pub async fn get(&self, file_id: Uuid) -> Result<ParsedWorkbook, CacheError> {
        let mut workbook = self.shell(file_id).await?;
        for sheet in &mut workbook.sheets {
            sheet.rows = self.rows(file_id, sheet.id).await?;
        }
        Ok(workbook)
    }

    pub async fn get_summary(&self, file_id: Uuid) -> Result<WorkbookOverview, CacheError> {
        let workbook = self.shell(file_id).await?;
        Ok(WorkbookOverview::from(&workbook))
    }

    pub async fn get_page(
        &self,
        file_id: Uuid,
        selector: &SheetSelector,
        page: usize,
        page_size: usize,
    ) -> Result<SheetPage, CacheError> {
        let mut workbook = self.shell(file_id).await?;
        let position = match selector {
            SheetSelector::Id(id) => workbook.sheets.iter().position(|s| s.id == *id),
            SheetSelector::Name(name) => workbook.sheets.iter().position(|s| &s.name == name),
        }
        .ok_or_else(|| {
            CacheError::SheetNotFound(match selector {
                SheetSelector::Id(id) => id.to_string(),
                SheetSelector::Name(name) => name.clone(),
            })
        })?;

        let sheet = workbook.sheets.swap_remove(position);
        let mut rows = self.rows(file_id, sheet.id).await?;
        let (pagination, window) = paginate(rows.len(), page, page_size, self.max_page_size);
        let rows = rows.drain(window).collect();

        Ok(SheetPage {
            file_id,
            sheet_id: sheet.id,
            sheet_name: sheet.name,
            rows,
            merged_ranges: sheet.merged_ranges,
            pagination,
        })
    }

    pub async fn export(
        &self,
        file_id: Uuid,
        format: ExportFormat,
    ) -> Result<ExportedData, CacheError> {
        let workbook = self.get(file_id).await?;
        let body = export::render(&workbook, format)?;
        Ok(ExportedData { format, body })
    }

    /// Drops the workbook and its sheet rows. Returns false when nothing
    /// was cached.
    pub async fn evict(&self, file_id: Uuid) -> Result<bool, CacheError> {
        let sheet_ids: Vec<usize> = match self.shell(file_id).await {
            Ok(workbook) => workbook.sheets.iter().map(|s| s.id).collect(),
            Err(CacheError::NotFound) | Err(CacheError::Corrupt(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        for id in sheet_ids {
            self.store.delete(&rows_key(file_id, id)).await?;
        }
        Ok(self.store.delete(&cache_key(file_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_cover_rows_once() {
        let (p, w) = paginate(25, 1, 10, 1000);
        assert_eq!((p.total_pages, p.has_next, p.has_previous), (3, true, false));
        assert_eq!(w, 0..10);

        let (p, w) = paginate(25, 3, 10, 1000);
        assert_eq!(w, 20..25);
        assert!(!p.has_next);
        assert!(p.has_previous);
    }

    #[test]
    fn out_of_range_page_is_empty() {
        let (p, w) = paginate(25, 9, 10, 1000);
        assert!(w.is_empty());
        assert_eq!(p.page, 9);
        assert!(!p.has_next);
    }

    #[test]
    fn page_size_is_clamped() {
        let (p, _) = paginate(5000, 1, 50_000, 1000);
        assert_eq!(p.page_size, 1000);
        assert_eq!(p.total_pages, 5);

        let (p, w) = paginate(3, 0, 0, 1000);
        assert_eq!((p.page, p.page_size), (1, 1));
        assert_eq!(w, 0..1);
    }

    #[test]
    fn empty_sheet_has_no_pages() {
        let (p, w) = paginate(0, 1, 10, 1000);
        assert_eq!(p.total_pages, 0);
        assert!(w.is_empty());
    }
}
