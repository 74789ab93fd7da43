use crate::config::IngestConfig;
use crate::models::workbook::{
    BLOCKED_SENTINEL, Cell, CellStyle, CellType, CellValue, FormulaRecord, MergedRange,
    ParsedWorkbook, Row, Sheet, SheetMetadata, WorkbookMetadata, WorkbookSummary,
};
use crate::services::ooxml;
use crate::utils::formula::FormulaPolicy;
use crate::utils::validation::SpreadsheetKind;
use calamine::{Data, Dimensions, Range, Reader, Xls, Xlsx};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use std::collections::HashSet;
use std::io::Cursor;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Rows between cancellation checks and progress reports inside one sheet.
const ROW_CHECKPOINT: usize = 5_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unsupported workbook format: {0}")]
    UnsupportedFormat(String),

    #[error("workbook could not be read: {0}")]
    Workbook(String),

    #[error("parse cancelled")]
    Cancelled,
}

/// Resource bounds for a single parse.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub max_rows: usize,
    pub max_sheets: usize,
    pub extract_images: bool,
    pub preserve_formatting: bool,
    pub formula_policy: FormulaPolicy,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            max_rows: 100_000,
            max_sheets: 50,
            extract_images: true,
            preserve_formatting: true,
            formula_policy: FormulaPolicy::default(),
        }
    }
}

impl From<&IngestConfig> for ParseOptions {
    fn from(config: &IngestConfig) -> Self {
        Self {
            max_rows: config.parse_max_rows,
            max_sheets: config.parse_max_sheets,
            extract_images: config.parse_extract_images,
            preserve_formatting: config.parse_preserve_formatting,
            formula_policy: FormulaPolicy::new(config.max_formula_depth),
        }
    }
}

type Source<'a> = Cursor<&'a [u8]>;

enum Workbook<'a> {
    Xlsx(Box<Xlsx<Source<'a>>>),
    Xls(Box<Xls<Source<'a>>>),
}

impl<'a> Workbook<'a> {
    fn open(kind: SpreadsheetKind, bytes: &'a [u8]) -> Result<Self, ParseError> {
        match kind {
            SpreadsheetKind::Xlsx => {
                let mut wb = Xlsx::new(Cursor::new(bytes))
                    .map_err(|e| ParseError::Workbook(e.to_string()))?;
                wb.load_merged_regions()
                    .map_err(|e| ParseError::Workbook(format!("merged regions: {}", e)))?;
                Ok(Workbook::Xlsx(Box::new(wb)))
            }
            SpreadsheetKind::Xls => {
                let wb = Xls::new(Cursor::new(bytes))
                    .map_err(|e| ParseError::Workbook(e.to_string()))?;
                Ok(Workbook::Xls(Box::new(wb)))
            }
        }
    }

    fn sheet_names(&self) -> Vec<String> {
        match self {
            Workbook::Xlsx(wb) => wb.sheet_names(),
            Workbook::Xls(wb) => wb.sheet_names(),
        }
    }

    fn values(&mut self, name: &str) -> Result<Range<Data>, ParseError> {
        let result = match self {
            Workbook::Xlsx(wb) => wb.worksheet_range(name).map_err(|e| e.to_string()),
            Workbook::Xls(wb) => wb.worksheet_range(name).map_err(|e| e.to_string()),
        };
        result.map_err(|e| ParseError::Workbook(format!("sheet '{}': {}", name, e)))
    }

    /// Formula text per cell. A sheet whose formulas cannot be read parses
    /// with cached values only.
    fn formulas(&mut self, name: &str) -> Range<String> {
        let result = match self {
            Workbook::Xlsx(wb) => wb.worksheet_formula(name).map_err(|e| e.to_string()),
            Workbook::Xls(wb) => wb.worksheet_formula(name).map_err(|e| e.to_string()),
        };
        result.unwrap_or_else(|e| {
            debug!(sheet = %name, "No formula data: {}", e);
            Range::empty()
        })
    }

    fn merged(&mut self, name: &str) -> Vec<Dimensions> {
        match self {
            Workbook::Xlsx(wb) => wb
                .worksheet_merge_cells(name)
                .unwrap_or(Ok(Vec::new()))
                .unwrap_or_default(),
            Workbook::Xls(wb) => wb.worksheet_merge_cells(name).unwrap_or_default(),
        }
    }
}

/// Zero-based column index to letters: 0 -> "A", 27 -> "AB".
pub fn column_name(mut col: u32) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (col % 26) as u8);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

pub fn cell_address(row: u32, col: u32) -> String {
    format!("{}{}", column_name(col), row + 1)
}

fn excel_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).unwrap_or_default()
}

/// Excel serial date to ISO 8601. Serials below 60 sit before the phantom
/// 1900-02-29 and are shifted by a day.
pub fn excel_serial_to_iso(serial: f64) -> Option<String> {
    if !serial.is_finite() || serial < 0.0 {
        return None;
    }
    let adjusted = if serial < 60.0 { serial + 1.0 } else { serial };
    let millis = (adjusted * 86_400_000.0).round() as i64;
    let dt = excel_epoch()
        .and_hms_opt(0, 0, 0)?
        .checked_add_signed(ChronoDuration::milliseconds(millis))?;
    if serial.fract() == 0.0 {
        Some(dt.format("%Y-%m-%d").to_string())
    } else {
        Some(dt.format("%Y-%m-%dT%H:%M:%S").to_string())
    }
}

fn format_duration(days: f64) -> String {
    let total = (days * 86_400.0).round() as i64;
    let sign = if total < 0 { "-" } else { "" };
    let total = total.abs();
    format!("{}{}:{:02}:{:02}", sign, total / 3600, (total / 60) % 60, total % 60)
}

struct Converted {
    value: CellValue,
    cell_type: CellType,
    number_format: Option<String>,
}

fn convert(data: &Data, preserve_formatting: bool) -> Converted {
    let plain = |value, cell_type| Converted {
        value,
        cell_type,
        number_format: None,
    };
    match data {
        Data::Empty => plain(CellValue::Null, CellType::Empty),
        Data::Bool(b) => plain(CellValue::Bool(*b), CellType::Boolean),
        Data::Int(i) => plain(CellValue::Number(*i as f64), CellType::Number),
        Data::Float(f) => plain(CellValue::Number(*f), CellType::Number),
        Data::String(s) => plain(CellValue::Text(s.clone()), CellType::String),
        Data::Error(e) => plain(CellValue::Text(e.to_string()), CellType::Error),
        Data::DateTime(dt) => {
            let serial = dt.as_f64();
            if dt.is_duration() {
                Converted {
                    value: CellValue::Text(format_duration(serial)),
                    cell_type: CellType::Duration,
                    number_format: preserve_formatting.then(|| "[h]:mm:ss".to_string()),
                }
            } else {
                match excel_serial_to_iso(serial) {
                    Some(iso) => Converted {
                        number_format: preserve_formatting.then(|| {
                            if serial.fract() == 0.0 {
                                "yyyy-mm-dd".to_string()
                            } else {
                                "yyyy-mm-dd hh:mm:ss".to_string()
                            }
                        }),
                        value: CellValue::Text(iso),
                        cell_type: CellType::Date,
                    },
                    None => plain(CellValue::Number(serial), CellType::Number),
                }
            }
        }
        Data::DateTimeIso(s) => plain(CellValue::Text(s.clone()), CellType::Date),
        Data::DurationIso(s) => plain(CellValue::Text(s.clone()), CellType::Duration),
    }
}

/// Smallest rectangle covering both ranges, absolute coordinates.
fn union_bounds(a: &Range<Data>, b: &Range<String>) -> Option<((u32, u32), (u32, u32))> {
    let boxes = [a.start().zip(a.end()), b.start().zip(b.end())];
    boxes
        .into_iter()
        .flatten()
        .reduce(|(s1, e1), (s2, e2)| {
            (
                (s1.0.min(s2.0), s1.1.min(s2.1)),
                (e1.0.max(e2.0), e1.1.max(e2.1)),
            )
        })
}

fn merged_range(dim: &Dimensions) -> MergedRange {
    MergedRange {
        range: format!(
            "{}:{}",
            cell_address(dim.start.0, dim.start.1),
            cell_address(dim.end.0, dim.end.1)
        ),
        start_row: dim.start.0,
        start_column: dim.start.1,
        end_row: dim.end.0,
        end_column: dim.end.1,
    }
}

/// Running state shared across sheets of one parse.
struct Budget {
    rows_left: usize,
    truncated: bool,
}

pub struct WorkbookParser {
    options: ParseOptions,
}

impl WorkbookParser {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    /// Parses a validated workbook. Progress is reported in `0.0..=100.0`;
    /// the token is checked between sheets and every few thousand rows.
    pub fn parse(
        &self,
        file_id: Uuid,
        bytes: &[u8],
        on_progress: &dyn Fn(f32),
        cancel: &CancellationToken,
    ) -> Result<ParsedWorkbook, ParseError> {
        let started = Instant::now();
        let kind = SpreadsheetKind::from_signature(bytes).ok_or_else(|| {
            ParseError::UnsupportedFormat("content is neither OOXML nor OLE2".to_string())
        })?;

        let mut workbook = Workbook::open(kind, bytes)?;
        let sheet_names = workbook.sheet_names();
        let mut warnings = Vec::new();

        let selected = sheet_names.len().min(self.options.max_sheets);
        if sheet_names.len() > selected {
            warnings.push(format!(
                "Workbook has {} sheets; only the first {} were processed",
                sheet_names.len(),
                selected
            ));
        }

        let drawings = match kind {
            SpreadsheetKind::Xlsx => ooxml::sheets_with_drawings(bytes).unwrap_or_else(|e| {
                warnings.push(format!("Drawing relationships unreadable: {}", e));
                HashSet::new()
            }),
            SpreadsheetKind::Xls => HashSet::new(),
        };

        let mut budget = Budget {
            rows_left: self.options.max_rows,
            truncated: false,
        };
        let mut sheets = Vec::with_capacity(selected);

        for (index, name) in sheet_names.iter().take(selected).enumerate() {
            if cancel.is_cancelled() {
                return Err(ParseError::Cancelled);
            }
            if budget.truncated {
                warnings.push(format!("Sheet '{}' skipped: row limit reached", name));
                continue;
            }

            let base = index as f32 / selected as f32 * 100.0;
            let span = 100.0 / selected as f32;
            let report = |fraction: f32| on_progress(base + span * fraction);

            let mut sheet = self.parse_sheet(
                &mut workbook,
                name,
                sheets.len() + 1,
                &mut budget,
                &mut warnings,
                &report,
                cancel,
            )?;
            sheet.metadata.has_images = drawings.contains(name);
            sheets.push(sheet);
            on_progress(base + span);
        }

        let images = if self.options.extract_images && kind == SpreadsheetKind::Xlsx {
            match ooxml::extract_media(bytes) {
                Ok(media) => {
                    warnings.extend(media.warnings);
                    media.images
                }
                Err(e) => {
                    warnings.push(format!("Embedded images unreadable: {}", e));
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let total_rows = sheets.iter().map(|s| s.metadata.row_count).sum();
        let total_columns = sheets
            .iter()
            .map(|s| s.metadata.column_count)
            .max()
            .unwrap_or(0);

        let summary = WorkbookSummary {
            total_sheets: sheet_names.len(),
            processed_sheets: sheets.len(),
            total_rows,
            total_columns,
            has_formulas: sheets.iter().any(|s| s.metadata.has_formulas),
            has_images: !images.is_empty() || sheets.iter().any(|s| s.metadata.has_images),
            has_merged_cells: sheets.iter().any(|s| s.metadata.has_merged_cells),
            truncated: budget.truncated,
            processing_time_ms: started.elapsed().as_millis() as u64,
        };

        if !warnings.is_empty() {
            warn!(file_id = %file_id, count = warnings.len(), "Workbook parsed with warnings");
        }

        Ok(ParsedWorkbook {
            file_id,
            sheets,
            total_rows,
            total_columns,
            summary,
            warnings,
            metadata: WorkbookMetadata {
                format: kind.extension().to_string(),
                size_bytes: bytes.len(),
                sheet_names,
                parsed_at: Utc::now(),
            },
            images,
            expires_at: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_sheet(
        &self,
        workbook: &mut Workbook<'_>,
        name: &str,
        id: usize,
        budget: &mut Budget,
        warnings: &mut Vec<String>,
        report: &dyn Fn(f32),
        cancel: &CancellationToken,
    ) -> Result<Sheet, ParseError> {
        let values = workbook.values(name)?;
        let formulas = workbook.formulas(name);
        let merged_ranges: Vec<MergedRange> =
            workbook.merged(name).iter().map(merged_range).collect();

        let mut rows = Vec::new();
        let mut formula_records = Vec::new();
        let mut column_count = 0usize;
        let mut truncated = false;

        if let Some(((row_start, col_start), (row_end, col_end))) = union_bounds(&values, &formulas)
        {
            let height = (row_end - row_start + 1) as usize;
            for (offset, r) in (row_start..=row_end).enumerate() {
                if offset > 0 && offset % ROW_CHECKPOINT == 0 {
                    if cancel.is_cancelled() {
                        return Err(ParseError::Cancelled);
                    }
                    report(offset as f32 / height as f32);
                }

                let mut cells = Vec::new();
                for c in col_start..=col_end {
                    let data = values.get_value((r, c));
                    let formula = formulas
                        .get_value((r, c))
                        .filter(|f| !f.trim().is_empty());
                    if let Some(cell) =
                        self.build_cell(name, r, c, data, formula, &mut formula_records, warnings)
                    {
                        cells.push(cell);
                    }
                }
                if cells.is_empty() {
                    continue;
                }

                if budget.rows_left == 0 {
                    truncated = true;
                    budget.truncated = true;
                    warnings.push(format!(
                        "Row limit of {} reached in sheet '{}' at row {}; remaining rows were not processed",
                        self.options.max_rows,
                        name,
                        r + 1
                    ));
                    break;
                }
                budget.rows_left -= 1;

                if let Some(last) = cells.last() {
                    column_count = column_count.max(last.column as usize + 1);
                }
                rows.push(Row { index: r, cells });
            }
        }

        let metadata = SheetMetadata {
            row_count: rows.len(),
            column_count,
            has_formulas: !formula_records.is_empty(),
            has_images: false,
            has_merged_cells: !merged_ranges.is_empty(),
            truncated,
        };

        Ok(Sheet {
            id,
            name: name.to_string(),
            rows,
            merged_ranges,
            formulas: formula_records,
            metadata,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_cell(
        &self,
        sheet: &str,
        row: u32,
        col: u32,
        data: Option<&Data>,
        formula: Option<&String>,
        records: &mut Vec<FormulaRecord>,
        warnings: &mut Vec<String>,
    ) -> Option<Cell> {
        let converted = data.map(|d| convert(d, self.options.preserve_formatting));
        let address = cell_address(row, col);

        let Some(raw) = formula else {
            let converted = converted?;
            if converted.cell_type == CellType::Empty {
                return None;
            }
            return Some(Cell {
                address,
                column: col,
                value: converted.value,
                cell_type: converted.cell_type,
                formula: None,
                style: CellStyle {
                    blocked: false,
                    number_format: converted.number_format,
                },
            });
        };

        let text = raw.trim_start_matches('=');
        let analysis = self.options.formula_policy.analyze(text);
        let (value, stored, blocked, number_format) = if analysis.is_safe() {
            let (value, number_format) = converted
                .map(|c| (c.value, c.number_format))
                .unwrap_or((CellValue::Null, None));
            (value, format!("={}", text), false, number_format)
        } else {
            let sanitized = self.options.formula_policy.sanitize(text);
            warnings.push(format!(
                "Unsafe formula at {}!{} replaced: {}",
                sheet,
                address,
                analysis.describe()
            ));
            (
                CellValue::Text(BLOCKED_SENTINEL.to_string()),
                format!("={}", sanitized),
                true,
                None,
            )
        };

        records.push(FormulaRecord {
            address: address.clone(),
            formula: stored.clone(),
            blocked,
        });

        Some(Cell {
            address,
            column: col,
            value,
            cell_type: CellType::Formula,
            formula: Some(stored),
            style: CellStyle {
                blocked,
                number_format,
            },
        })
    }
}
