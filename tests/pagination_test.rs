mod common;

use common::*;
use sheet_ingest::models::workbook::{ParsedWorkbook, SheetSelector};
use sheet_ingest::services::export::ExportFormat;
use sheet_ingest::services::kv_store::{KeyValueStore, MemoryKvStore};
use sheet_ingest::services::workbook_cache::{CacheError, WorkbookCache};
use sheet_ingest::services::workbook_parser::{ParseOptions, WorkbookParser};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn parsed(bytes: &[u8]) -> ParsedWorkbook {
    WorkbookParser::new(ParseOptions::default())
        .parse(Uuid::new_v4(), bytes, &|_| {}, &CancellationToken::new())
        .unwrap()
}

fn cache(ttl: Duration) -> WorkbookCache {
    WorkbookCache::new(Arc::new(MemoryKvStore::new()), ttl, 100)
}

#[tokio::test]
async fn test_pages_concatenate_to_the_full_sheet() {
    let workbook = parsed(&numbered_workbook(237));
    let file_id = workbook.file_id;
    let expected = workbook.sheets[0].rows.clone();
    assert_eq!(expected.len(), 238);

    let cache = cache(Duration::from_secs(60));
    cache.store(workbook).await.unwrap();

    for page_size in [1, 7, 25, 100, 238, 500] {
        let mut collected = Vec::new();
        let mut page = 1;
        loop {
            let result = cache
                .get_page(file_id, &SheetSelector::Id(1), page, page_size)
                .await
                .unwrap();
            assert_eq!(result.pagination.page, page);
            assert_eq!(result.pagination.total_rows, 238);
            assert!(result.rows.len() <= result.pagination.page_size);
            collected.extend(result.rows);
            if !result.pagination.has_next {
                assert_eq!(page, result.pagination.total_pages);
                break;
            }
            page += 1;
        }
        assert_eq!(collected, expected, "page size {}", page_size);
    }
}

#[tokio::test]
async fn test_page_size_is_capped() {
    let workbook = parsed(&numbered_workbook(300));
    let file_id = workbook.file_id;
    let cache = cache(Duration::from_secs(60));
    cache.store(workbook).await.unwrap();

    let page = cache
        .get_page(file_id, &SheetSelector::Id(1), 1, 10_000)
        .await
        .unwrap();
    assert_eq!(page.pagination.page_size, 100);
    assert_eq!(page.rows.len(), 100);
    assert_eq!(page.pagination.total_pages, 4);

    let past_end = cache
        .get_page(file_id, &SheetSelector::Id(1), 9, 100)
        .await
        .unwrap();
    assert!(past_end.rows.is_empty());
    assert!(!past_end.pagination.has_next);
}

#[tokio::test]
async fn test_sheet_selection() {
    let workbook = parsed(&sample_workbook());
    let file_id = workbook.file_id;
    let cache = cache(Duration::from_secs(60));
    cache.store(workbook).await.unwrap();

    let by_name = cache
        .get_page(file_id, &SheetSelector::Name("Notes".into()), 1, 10)
        .await
        .unwrap();
    let by_id = cache
        .get_page(file_id, &SheetSelector::Id(2), 1, 10)
        .await
        .unwrap();
    assert_eq!(by_name, by_id);
    assert_eq!(by_name.sheet_name, "Notes");

    let summary = cache
        .get_page(file_id, &SheetSelector::Id(1), 1, 10)
        .await
        .unwrap();
    assert_eq!(summary.merged_ranges.len(), 1);

    let missing = cache
        .get_page(file_id, &SheetSelector::Name("Nope".into()), 1, 10)
        .await
        .unwrap_err();
    assert!(matches!(missing, CacheError::SheetNotFound(name) if name == "Nope"));
}

#[tokio::test]
async fn test_summary_and_exports() {
    let workbook = parsed(&sample_workbook());
    let file_id = workbook.file_id;
    let cache = cache(Duration::from_secs(60));
    let expires_at = cache.store(workbook).await.unwrap();

    let overview = cache.get_summary(file_id).await.unwrap();
    assert_eq!(overview.sheets.len(), 2);
    assert_eq!(overview.summary.total_rows, 6);
    assert_eq!(overview.expires_at, Some(expires_at));

    let json = cache.export(file_id, ExportFormat::Json).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&json.body).unwrap();
    assert_eq!(value["sheets"].as_array().unwrap().len(), 2);

    let csv = cache.export(file_id, ExportFormat::Csv).await.unwrap();
    let csv = String::from_utf8(csv.body).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "Quarterly report,");
    assert_eq!(lines[1], "Region,Revenue");
    assert_eq!(lines[4], "Total,200.5");

    let html = cache.export(file_id, ExportFormat::Html).await.unwrap();
    let html = String::from_utf8(html.body).unwrap();
    assert!(html.contains("<td colspan=\"2\">Quarterly report</td>"));
    assert!(html.contains("<h2>Notes</h2>"));
}

#[tokio::test]
async fn test_entries_expire_and_can_be_evicted() {
    let short = cache(Duration::from_millis(30));
    let workbook = parsed(&sample_workbook());
    let file_id = workbook.file_id;
    short.store(workbook).await.unwrap();
    assert!(short.get(file_id).await.is_ok());
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(matches!(short.get(file_id).await, Err(CacheError::NotFound)));

    let long = cache(Duration::from_secs(60));
    let workbook = parsed(&sample_workbook());
    let file_id = workbook.file_id;
    long.store(workbook).await.unwrap();
    assert!(long.evict(file_id).await.unwrap());
    assert!(!long.evict(file_id).await.unwrap());
    assert!(matches!(
        long.get_summary(file_id).await,
        Err(CacheError::NotFound)
    ));
}

#[tokio::test]
async fn test_sheets_are_cached_independently() {
    let kv = Arc::new(MemoryKvStore::new());
    let cache = WorkbookCache::new(kv.clone(), Duration::from_secs(60), 100);
    let workbook = parsed(&sample_workbook());
    let file_id = workbook.file_id;
    let summary_rows = workbook.sheets[0].rows.len();
    cache.store(workbook).await.unwrap();
    // Shell plus one entry per sheet.
    assert_eq!(kv.len(), 3);

    // Reading one sheet never touches another sheet's rows.
    assert!(kv.delete(&format!("workbook:{}:rows:2", file_id)).await.unwrap());
    let page = cache
        .get_page(file_id, &SheetSelector::Id(1), 1, 100)
        .await
        .unwrap();
    assert_eq!(page.rows.len(), summary_rows);
    let overview = cache.get_summary(file_id).await.unwrap();
    assert_eq!(overview.sheets.len(), 2);

    // The full workbook needs every sheet.
    assert!(matches!(cache.get(file_id).await, Err(CacheError::NotFound)));

    assert!(cache.evict(file_id).await.unwrap());
    assert!(kv.is_empty());
}
