use crate::models::workbook::{CellType, MergedRange, ParsedWorkbook, Row, Sheet};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// The full parsed workbook as JSON.
    Json,
    /// First sheet only, comma separated.
    Csv,
    /// Every sheet as an HTML table.
    Html,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Html => "text/html; charset=utf-8",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Html => "html",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "html" => Ok(ExportFormat::Html),
            other => Err(format!("unsupported export format '{}'", other)),
        }
    }
}

pub fn render(workbook: &ParsedWorkbook, format: ExportFormat) -> Result<Vec<u8>, serde_json::Error> {
    match format {
        ExportFormat::Json => serde_json::to_vec_pretty(workbook),
        ExportFormat::Csv => Ok(to_csv(workbook).into_bytes()),
        ExportFormat::Html => Ok(to_html(workbook).into_bytes()),
    }
}

fn csv_field(raw: &str, is_text: bool) -> String {
    // Leading formula characters in text would be evaluated by the
    // spreadsheet that opens the export.
    let guarded = if is_text && raw.starts_with(['=', '+', '-', '@']) {
        format!("'{}", raw)
    } else {
        raw.to_string()
    };

    if guarded.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", guarded.replace('"', "\"\""))
    } else {
        guarded
    }
}

fn csv_line(row: &Row, width: usize) -> String {
    let mut fields = vec![String::new(); width];
    for cell in &row.cells {
        if let Some(slot) = fields.get_mut(cell.column as usize) {
            *slot = csv_field(&cell.value.display(), cell.cell_type == CellType::String);
        }
    }
    fields.join(",")
}

/// CSV of the first processed sheet. Missing cells become empty fields so
/// every line has the sheet's column count.
pub fn to_csv(workbook: &ParsedWorkbook) -> String {
    let Some(sheet) = workbook.sheets.first() else {
        return String::new();
    };
    let width = sheet.metadata.column_count;
    let mut out = String::new();
    for row in &sheet.rows {
        out.push_str(&csv_line(row, width));
        out.push_str("\r\n");
    }
    out
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Rows of `sheet` whose index falls inside `start..=end`; rows are sorted.
fn present_rows(sheet: &Sheet, start: u32, end: u32) -> usize {
    let lo = sheet.rows.partition_point(|r| r.index < start);
    let hi = sheet.rows.partition_point(|r| r.index <= end);
    hi.saturating_sub(lo)
}

fn html_table(sheet: &Sheet, out: &mut String) {
    let width = sheet.metadata.column_count as u32;

    let _ = writeln!(out, "<h2>{}</h2>", escape_html(&sheet.name));
    out.push_str("<table>\n");
    for row in &sheet.rows {
        let values: HashMap<u32, String> = row
            .cells
            .iter()
            .map(|c| (c.column, escape_html(&c.value.display())))
            .collect();
        // Spans are resolved against the ranges touching this row, never by
        // expanding a range cell by cell.
        let active: Vec<&MergedRange> = sheet
            .merged_ranges
            .iter()
            .filter(|m| m.start_row <= row.index && row.index <= m.end_row)
            .filter(|m| m.start_column < width)
            .collect();

        out.push_str("<tr>");
        for col in 0..width {
            let text = values.get(&col).map(String::as_str).unwrap_or("");
            let range = active
                .iter()
                .find(|m| m.start_column <= col && col <= m.end_column);
            match range {
                Some(m) if m.start_row == row.index && m.start_column == col => {
                    let rowspan = present_rows(sheet, m.start_row, m.end_row);
                    let colspan = m.end_column.min(width - 1) - m.start_column + 1;
                    out.push_str("<td");
                    if rowspan > 1 {
                        let _ = write!(out, " rowspan=\"{}\"", rowspan);
                    }
                    if colspan > 1 {
                        let _ = write!(out, " colspan=\"{}\"", colspan);
                    }
                    let _ = write!(out, ">{}</td>", text);
                }
                Some(_) => {}
                None => {
                    let _ = write!(out, "<td>{}</td>", text);
                }
            }
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</table>\n");
}

pub fn to_html(workbook: &ParsedWorkbook) -> String {
    let mut out = String::from(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Workbook export</title></head>\n<body>\n",
    );
    for sheet in &workbook.sheets {
        html_table(sheet, &mut out);
    }
    out.push_str("</body>\n</html>\n");
    out
}
