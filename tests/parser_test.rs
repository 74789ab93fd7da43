mod common;

use common::*;
use sheet_ingest::models::workbook::{BLOCKED_SENTINEL, CellType, CellValue, ParsedWorkbook};
use sheet_ingest::services::workbook_parser::{ParseError, ParseOptions, WorkbookParser};
use std::cell::RefCell;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn parse_with(options: ParseOptions, bytes: &[u8]) -> Result<ParsedWorkbook, ParseError> {
    WorkbookParser::new(options).parse(Uuid::new_v4(), bytes, &|_| {}, &CancellationToken::new())
}

#[test]
fn test_values_formulas_and_merges() {
    let file_id = Uuid::new_v4();
    let parsed = WorkbookParser::new(ParseOptions::default())
        .parse(file_id, &sample_workbook(), &|_| {}, &CancellationToken::new())
        .unwrap();

    assert_eq!(parsed.file_id, file_id);
    assert_eq!(parsed.metadata.format, "xlsx");
    assert_eq!(parsed.metadata.sheet_names, vec!["Summary", "Notes"]);
    assert_eq!(parsed.summary.total_sheets, 2);
    assert_eq!(parsed.summary.processed_sheets, 2);
    assert_eq!(parsed.total_rows, 6);
    assert_eq!(parsed.total_columns, 2);
    assert!(parsed.summary.has_formulas);
    assert!(parsed.summary.has_merged_cells);
    assert!(!parsed.summary.truncated);
    assert!(parsed.warnings.is_empty(), "{:?}", parsed.warnings);

    let summary = parsed.sheet_by_name("Summary").unwrap();
    assert_eq!(summary.id, 1);
    assert_eq!(summary.rows.len(), 5);

    let north = &summary.rows[2];
    assert_eq!(north.index, 2);
    assert_eq!(north.cells[0].value, CellValue::Text("North".into()));
    assert_eq!(north.cells[0].cell_type, CellType::String);
    assert_eq!(north.cells[1].address, "B3");
    assert_eq!(north.cells[1].value, CellValue::Number(120.0));
    assert_eq!(north.cells[1].cell_type, CellType::Number);

    let total = &summary.rows[4].cells[1];
    assert_eq!(total.cell_type, CellType::Formula);
    assert_eq!(total.formula.as_deref(), Some("=SUM(B3:B4)"));
    assert_eq!(total.value, CellValue::Number(200.5));
    assert!(!total.style.blocked);
    assert_eq!(summary.formulas.len(), 1);
    assert!(!summary.formulas[0].blocked);

    assert_eq!(summary.merged_ranges.len(), 1);
    let merged = &summary.merged_ranges[0];
    assert_eq!(merged.range, "A1:B1");
    assert_eq!((merged.start_row, merged.start_column), (0, 0));
    assert_eq!((merged.end_row, merged.end_column), (0, 1));

    let notes = parsed.sheet_by_id(2).unwrap();
    assert_eq!(notes.name, "Notes");
    assert!(notes.merged_ranges.is_empty());
}

#[test]
fn test_dangerous_formula_is_neutralised() {
    use CellSpec::*;
    let bytes = build_xlsx(&[SheetSpec::new(
        "Summary",
        vec![vec![Num(1.0), Num(2.0), Formula("EXEC(A1)", 0.0)]],
    )]);

    let parsed = parse_with(ParseOptions::default(), &bytes).unwrap();
    let cell = &parsed.sheets[0].rows[0].cells[2];
    assert_eq!(cell.address, "C1");
    assert_eq!(cell.value, CellValue::Text(BLOCKED_SENTINEL.to_string()));
    assert_eq!(cell.formula.as_deref(), Some("=#BLOCKED!(A1)"));
    assert!(cell.style.blocked);
    assert!(parsed.sheets[0].formulas[0].blocked);

    assert_eq!(parsed.warnings.len(), 1);
    assert!(parsed.warnings[0].contains("Summary!C1"), "{}", parsed.warnings[0]);
    assert!(parsed.warnings[0].contains("EXEC"), "{}", parsed.warnings[0]);
}

#[test]
fn test_dde_link_is_neutralised() {
    use CellSpec::*;
    let bytes = build_xlsx(&[SheetSpec::new(
        "Summary",
        vec![vec![Formula("cmd|' /C calc'!A0", 0.0)]],
    )]);

    let parsed = parse_with(ParseOptions::default(), &bytes).unwrap();
    let cell = &parsed.sheets[0].rows[0].cells[0];
    assert_eq!(cell.value, CellValue::Text(BLOCKED_SENTINEL.to_string()));
    assert_eq!(cell.formula.as_deref(), Some("=#REF!"));
    assert!(cell.style.blocked);

    assert_eq!(parsed.warnings.len(), 1);
    assert!(parsed.warnings[0].contains("Summary!A1"), "{}", parsed.warnings[0]);
    assert!(parsed.warnings[0].contains("cmd|"), "{}", parsed.warnings[0]);
}

#[test]
fn test_row_limit_truncates_and_warns() {
    let options = ParseOptions {
        max_rows: 10,
        ..ParseOptions::default()
    };
    let parsed = parse_with(options, &numbered_workbook(50)).unwrap();

    assert_eq!(parsed.total_rows, 10);
    assert!(parsed.summary.truncated);
    assert!(parsed.sheets[0].metadata.truncated);
    assert_eq!(parsed.sheets[0].rows.last().unwrap().index, 9);
    assert!(parsed
        .warnings
        .iter()
        .any(|w| w.contains("Row limit of 10")));
}

#[test]
fn test_row_limit_spans_sheets() {
    use CellSpec::*;
    let bytes = build_xlsx(&[
        SheetSpec::new("First", vec![vec![Num(1.0)], vec![Num(2.0)], vec![Num(3.0)]]),
        SheetSpec::new("Second", vec![vec![Num(4.0)], vec![Num(5.0)]]),
        SheetSpec::new("Third", vec![vec![Num(6.0)]]),
    ]);
    let options = ParseOptions {
        max_rows: 4,
        ..ParseOptions::default()
    };
    let parsed = parse_with(options, &bytes).unwrap();

    assert_eq!(parsed.total_rows, 4);
    assert_eq!(parsed.sheets.len(), 2);
    assert_eq!(parsed.sheets[1].rows.len(), 1);
    assert!(parsed.warnings.iter().any(|w| w.contains("'Third' skipped")));
}

#[test]
fn test_sheet_limit() {
    use CellSpec::*;
    let bytes = build_xlsx(&[
        SheetSpec::new("A", vec![vec![Num(1.0)]]),
        SheetSpec::new("B", vec![vec![Num(2.0)]]),
        SheetSpec::new("C", vec![vec![Num(3.0)]]),
    ]);
    let options = ParseOptions {
        max_sheets: 2,
        ..ParseOptions::default()
    };
    let parsed = parse_with(options, &bytes).unwrap();

    assert_eq!(parsed.summary.total_sheets, 3);
    assert_eq!(parsed.summary.processed_sheets, 2);
    assert!(parsed.sheet_by_name("C").is_none());
    assert!(parsed.warnings[0].contains("only the first 2"));
}

#[test]
fn test_cancelled_before_start() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = WorkbookParser::new(ParseOptions::default())
        .parse(Uuid::new_v4(), &sample_workbook(), &|_| {}, &cancel)
        .unwrap_err();
    assert_eq!(err, ParseError::Cancelled);
}

#[test]
fn test_progress_is_monotonic_and_completes() {
    let seen = RefCell::new(Vec::new());
    WorkbookParser::new(ParseOptions::default())
        .parse(
            Uuid::new_v4(),
            &sample_workbook(),
            &|p| seen.borrow_mut().push(p),
            &CancellationToken::new(),
        )
        .unwrap();

    let seen = seen.into_inner();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
    assert!(seen.iter().all(|p| (0.0..=100.0).contains(p)));
    assert_eq!(*seen.last().unwrap(), 100.0);
}

#[test]
fn test_empty_rows_are_skipped() {
    use CellSpec::*;
    let bytes = build_xlsx(&[SheetSpec::new(
        "Sparse",
        vec![vec![Text("top")], vec![Empty], vec![Empty, Num(7.0)]],
    )]);
    let parsed = parse_with(ParseOptions::default(), &bytes).unwrap();
    let rows = &parsed.sheets[0].rows;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].index, 2);
    assert_eq!(rows[1].cells[0].address, "B3");
    assert_eq!(parsed.sheets[0].metadata.column_count, 2);
}
