use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Value shown in place of a cell or formula that was neutralised.
pub const BLOCKED_SENTINEL: &str = "#BLOCKED!";
/// Value substituted for external workbook references.
pub const EXTERNAL_REF_SENTINEL: &str = "#REF!";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Null => true,
            CellValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Plain-text rendering used by the CSV and HTML exports.
    pub fn display(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            CellValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            CellValue::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Empty,
    String,
    Number,
    Boolean,
    Date,
    Duration,
    Formula,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellStyle {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_format: Option<String>,
}

impl CellStyle {
    pub fn is_default(&self) -> bool {
        !self.blocked && self.number_format.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// A1-style address, e.g. "C3".
    pub address: String,
    /// Zero-based column index.
    pub column: u32,
    pub value: CellValue,
    #[serde(rename = "type")]
    pub cell_type: CellType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "CellStyle::is_default")]
    pub style: CellStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Zero-based row index in the source sheet.
    pub index: u32,
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRange {
    /// A1-style range, e.g. "A1:C1".
    pub range: String,
    pub start_row: u32,
    pub start_column: u32,
    pub end_row: u32,
    pub end_column: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaRecord {
    pub address: String,
    /// The formula as stored; blocked parts are already replaced by sentinels.
    pub formula: String,
    pub blocked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SheetMetadata {
    pub row_count: usize,
    pub column_count: usize,
    pub has_formulas: bool,
    pub has_images: bool,
    pub has_merged_cells: bool,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    /// One-based position among the processed sheets.
    pub id: usize,
    pub name: String,
    pub rows: Vec<Row>,
    pub merged_ranges: Vec<MergedRange>,
    pub formulas: Vec<FormulaRecord>,
    pub metadata: SheetMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedImage {
    pub name: String,
    pub content_type: String,
    pub encoding: String,
    pub size: usize,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkbookSummary {
    pub total_sheets: usize,
    pub processed_sheets: usize,
    pub total_rows: usize,
    pub total_columns: usize,
    pub has_formulas: bool,
    pub has_images: bool,
    pub has_merged_cells: bool,
    pub truncated: bool,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkbookMetadata {
    pub format: String,
    pub size_bytes: usize,
    pub sheet_names: Vec<String>,
    pub parsed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedWorkbook {
    pub file_id: Uuid,
    pub sheets: Vec<Sheet>,
    pub total_rows: usize,
    pub total_columns: usize,
    pub summary: WorkbookSummary,
    pub warnings: Vec<String>,
    pub metadata: WorkbookMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<EmbeddedImage>,
    /// Set when the workbook is written to the cache.
    pub expires_at: Option<DateTime<Utc>>,
}

impl ParsedWorkbook {
    /// Finds a sheet by its one-based id.
    pub fn sheet_by_id(&self, id: usize) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.id == id)
    }

    pub fn sheet_by_name(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }
}

/// The summary view returned without the row payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetOverview {
    pub id: usize,
    pub name: String,
    pub metadata: SheetMetadata,
    pub merged_ranges: Vec<MergedRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkbookOverview {
    pub file_id: Uuid,
    pub summary: WorkbookSummary,
    pub sheets: Vec<SheetOverview>,
    pub warnings: Vec<String>,
    pub metadata: WorkbookMetadata,
    pub image_count: usize,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&ParsedWorkbook> for WorkbookOverview {
    fn from(wb: &ParsedWorkbook) -> Self {
        Self {
            file_id: wb.file_id,
            summary: wb.summary.clone(),
            sheets: wb
                .sheets
                .iter()
                .map(|s| SheetOverview {
                    id: s.id,
                    name: s.name.clone(),
                    metadata: s.metadata.clone(),
                    merged_ranges: s.merged_ranges.clone(),
                })
                .collect(),
            warnings: wb.warnings.clone(),
            metadata: wb.metadata.clone(),
            image_count: wb.images.len(),
            expires_at: wb.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
    pub total_rows: usize,
    pub total_pages: usize,
    pub has_next: bool,
    pub has_previous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetPage {
    pub file_id: Uuid,
    pub sheet_id: usize,
    pub sheet_name: String,
    pub rows: Vec<Row>,
    pub merged_ranges: Vec<MergedRange>,
    pub pagination: Pagination,
}

/// Selects a sheet by id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheetSelector {
    Id(usize),
    Name(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_value_json_shape() {
        let json = serde_json::to_string(&vec![
            CellValue::Null,
            CellValue::Bool(true),
            CellValue::Number(1.5),
            CellValue::Text("x".into()),
        ])
        .unwrap();
        assert_eq!(json, r#"[null,true,1.5,"x"]"#);

        let back: Vec<CellValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[0], CellValue::Null);
        assert_eq!(back[3], CellValue::Text("x".into()));
    }

    #[test]
    fn display_drops_trailing_zero_fraction() {
        assert_eq!(CellValue::Number(42.0).display(), "42");
        assert_eq!(CellValue::Number(0.25).display(), "0.25");
        assert_eq!(CellValue::Bool(false).display(), "FALSE");
    }
}
