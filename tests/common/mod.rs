#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::Request;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sheet_ingest::config::IngestConfig;
use sheet_ingest::models::ProcessingJob;
use sheet_ingest::services::job_queue::JobQueue;
use sheet_ingest::services::key_management::MasterKeyProvider;
use sheet_ingest::services::scanner::{NoOpScanner, ScanResult, VirusScanner};
use sheet_ingest::services::storage::MemoryStorage;
use sheet_ingest::utils::auth::create_jwt;
use sheet_ingest::{AppState, assemble, create_app};
use std::io::{Cursor, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use uuid::Uuid;
use zip::write::FileOptions;

pub const TEST_SECRET: &str = "test_secret_for_sheet_ingest";
pub const MASTER_SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";
pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

pub async fn setup_test_db() -> DatabaseConnection {
    let _ = tracing_subscriber::fmt::try_init();
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(opt).await.unwrap();
    sheet_ingest::infrastructure::database::run_migrations(&db)
        .await
        .unwrap();
    db
}

/// Config tuned for tests: no network scanner, fast retries.
pub fn test_config() -> IngestConfig {
    let mut config = IngestConfig::development();
    config.job_retry_base_delay_ms = 10;
    config.scan_timeout_secs = 2;
    config
}

pub fn token_for(user: &str) -> String {
    create_jwt(user, TEST_SECRET, chrono::Duration::hours(1)).unwrap()
}

// --- scanner doubles ---

pub struct InfectedScanner;

#[async_trait]
impl VirusScanner for InfectedScanner {
    async fn scan(&self, _reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult> {
        Ok(ScanResult::Infected {
            threat_name: "Eicar-Test-Signature".to_string(),
        })
    }

    async fn health_check(&self) -> bool {
        true
    }
}

pub struct SlowScanner(pub Duration);

#[async_trait]
impl VirusScanner for SlowScanner {
    async fn scan(&self, _reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult> {
        tokio::time::sleep(self.0).await;
        Ok(ScanResult::Clean)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

// --- application harness ---

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub storage: Arc<MemoryStorage>,
    pub db: DatabaseConnection,
    shutdown: watch::Sender<bool>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::with(Arc::new(NoOpScanner), test_config()).await
    }

    pub async fn with(scanner: Arc<dyn VirusScanner>, config: IngestConfig) -> Self {
        let db = setup_test_db().await;
        let storage = Arc::new(MemoryStorage::new());
        let keys = Arc::new(
            MasterKeyProvider::new(MASTER_SECRET, &config.master_key_id, &config.retired_key_ids)
                .unwrap(),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);

        let components = assemble(
            db.clone(),
            storage.clone(),
            scanner,
            keys,
            config,
            TEST_SECRET,
            shutdown_rx,
        );
        let app = create_app(components.state.clone());

        Self {
            app,
            state: components.state,
            storage,
            db,
            shutdown,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.state.queue
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Polls until the job leaves the queued/active states.
pub async fn wait_for_job(queue: &JobQueue, job_id: Uuid, owner: &str) -> ProcessingJob {
    for _ in 0..500 {
        let job = queue.status(job_id, owner).await.unwrap();
        if !job.state.is_pending() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} did not finish in time", job_id);
}

// --- request helpers ---

pub fn multipart_upload(token: &str, file_name: &str, mime: &str, data: &[u8]) -> Request<Body> {
    let boundary = "----sheet-ingest-test-boundary";
    let mut body = Vec::new();
    write!(
        body,
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: {m}\r\n\r\n",
        b = boundary,
        f = file_name,
        m = mime
    )
    .unwrap();
    body.extend_from_slice(data);
    write!(body, "\r\n--{}--\r\n", boundary).unwrap();

    Request::builder()
        .method("POST")
        .uri("/upload")
        .header("Authorization", format!("Bearer {}", token))
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn authed(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    use http_body_util::BodyExt;
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    use http_body_util::BodyExt;
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

// --- in-memory workbooks ---

/// One cell of a generated worksheet.
#[derive(Debug, Clone)]
pub enum CellSpec {
    Empty,
    Num(f64),
    Text(&'static str),
    /// Formula text without the leading `=` and its cached result.
    Formula(&'static str, f64),
}

pub struct SheetSpec {
    pub name: &'static str,
    pub rows: Vec<Vec<CellSpec>>,
    pub merged: Vec<&'static str>,
}

impl SheetSpec {
    pub fn new(name: &'static str, rows: Vec<Vec<CellSpec>>) -> Self {
        Self {
            name,
            rows,
            merged: Vec::new(),
        }
    }
}

fn column_letters(mut col: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'A' + (col % 26) as u8);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    name.reverse();
    String::from_utf8(name).unwrap()
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn worksheet_xml(sheet: &SheetSpec) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (r, row) in sheet.rows.iter().enumerate() {
        xml.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, cell) in row.iter().enumerate() {
            let addr = format!("{}{}", column_letters(c), r + 1);
            match cell {
                CellSpec::Empty => {}
                CellSpec::Num(n) => xml.push_str(&format!(r#"<c r="{}"><v>{}</v></c>"#, addr, n)),
                CellSpec::Text(t) => xml.push_str(&format!(
                    r#"<c r="{}" t="inlineStr"><is><t>{}</t></is></c>"#,
                    addr,
                    xml_escape(t)
                )),
                CellSpec::Formula(f, v) => xml.push_str(&format!(
                    r#"<c r="{}"><f>{}</f><v>{}</v></c>"#,
                    addr,
                    xml_escape(f),
                    v
                )),
            }
        }
        xml.push_str("</row>");
    }
    xml.push_str("</sheetData>");
    if !sheet.merged.is_empty() {
        xml.push_str(&format!(r#"<mergeCells count="{}">"#, sheet.merged.len()));
        for m in &sheet.merged {
            xml.push_str(&format!(r#"<mergeCell ref="{}"/>"#, m));
        }
        xml.push_str("</mergeCells>");
    }
    xml.push_str("</worksheet>");
    xml
}

/// Builds a minimal but well-formed `.xlsx` package.
pub fn build_xlsx(sheets: &[SheetSpec]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut content_types = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>"#,
    );
    for i in 1..=sheets.len() {
        content_types.push_str(&format!(
            r#"<Override PartName="/xl/worksheets/sheet{}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#,
            i
        ));
    }
    content_types.push_str("</Types>");

    let mut workbook = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>"#,
    );
    let mut rels = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    );
    for (i, sheet) in sheets.iter().enumerate() {
        workbook.push_str(&format!(
            r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
            xml_escape(sheet.name),
            i + 1,
            i + 1
        ));
        rels.push_str(&format!(
            r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{}.xml"/>"#,
            i + 1,
            i + 1
        ));
    }
    workbook.push_str("</sheets></workbook>");
    rels.push_str("</Relationships>");

    let root_rels = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

    let mut parts: Vec<(String, String)> = vec![
        ("[Content_Types].xml".to_string(), content_types),
        ("_rels/.rels".to_string(), root_rels.to_string()),
        ("xl/workbook.xml".to_string(), workbook),
        ("xl/_rels/workbook.xml.rels".to_string(), rels),
    ];
    for (i, sheet) in sheets.iter().enumerate() {
        parts.push((
            format!("xl/worksheets/sheet{}.xml", i + 1),
            worksheet_xml(sheet),
        ));
    }

    for (name, body) in parts {
        zip.start_file(name, options).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// A small two-sheet workbook with a header, numbers, a safe formula and a
/// merged title cell.
pub fn sample_workbook() -> Vec<u8> {
    use CellSpec::*;
    let mut summary = SheetSpec::new(
        "Summary",
        vec![
            vec![Text("Quarterly report"), Empty],
            vec![Text("Region"), Text("Revenue")],
            vec![Text("North"), Num(120.0)],
            vec![Text("South"), Num(80.5)],
            vec![Text("Total"), Formula("SUM(B3:B4)", 200.5)],
        ],
    );
    summary.merged.push("A1:B1");
    let notes = SheetSpec::new("Notes", vec![vec![Text("Prepared by finance")]]);
    build_xlsx(&[summary, notes])
}

/// A sheet with `rows` numbered data rows below a header.
pub fn numbered_workbook(rows: usize) -> Vec<u8> {
    let mut data = vec![vec![CellSpec::Text("id"), CellSpec::Text("label")]];
    for i in 0..rows {
        data.push(vec![CellSpec::Num(i as f64), CellSpec::Text("row")]);
    }
    build_xlsx(&[SheetSpec::new("Data", data)])
}
