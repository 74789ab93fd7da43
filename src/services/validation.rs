use crate::config::IngestConfig;
use crate::models::{CheckName, CheckResult, Severity, ValidationIssue, ValidationVerdict};
use crate::services::content_scan::scan_content;
use crate::services::scanner::{ScanResult, VirusScanner, scan_buffer};
use crate::utils::formula::{FormulaPolicy, blocked_calls_in_text};
use crate::utils::hash::calculate_hash;
use crate::utils::validation::{
    SpreadsheetKind, file_extension, is_allowed_mime, is_executable_content, normalize_mime,
    sanitize_filename,
};
use bytes::Bytes;
use regex::bytes::Regex;
use std::io::{Cursor, Read};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound on decompressed worksheet XML inspected for formulas.
const FORMULA_SCAN_BUDGET: u64 = 16 * 1024 * 1024;
/// Unsafe formulas reported individually before the rest are summarised.
const MAX_FORMULA_ISSUES: usize = 20;

static CELL_FORMULA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?-u)<c\b[^>]*?\br="([A-Za-z]+[0-9]+)"[^>]*>\s*<f\b[^>]*>([^<]+)</f>"#)
        .expect("cell formula regex")
});

static BARE_FORMULA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?-u)<f\b[^>]*>([^<]+)</f>").expect("formula element regex")
});

#[derive(Debug, Clone)]
pub struct ValidationSettings {
    pub content_scan_limit: usize,
    pub formula_policy: FormulaPolicy,
    pub enable_virus_scan: bool,
    pub scan_timeout: Duration,
}

impl From<&IngestConfig> for ValidationSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            content_scan_limit: config.content_scan_limit,
            formula_policy: FormulaPolicy::new(config.max_formula_depth),
            enable_virus_scan: config.enable_virus_scan,
            scan_timeout: config.scan_timeout(),
        }
    }
}

struct CheckInput<'a> {
    file_name: &'a str,
    mime_type: &'a str,
    buffer: &'a [u8],
    settings: &'a ValidationSettings,
}

type StaticCheck = fn(&CheckInput<'_>) -> CheckResult;

/// Synchronous checks in execution order. The malware scan runs after them.
const STATIC_CHECKS: [StaticCheck; 5] = [
    check_extension,
    check_mime_type,
    check_signature,
    check_dangerous_content,
    check_formula_safety,
];

/// Runs every check against a buffer and folds the results into one verdict.
pub struct ValidationPipeline {
    settings: ValidationSettings,
    scanner: Arc<dyn VirusScanner>,
}

impl ValidationPipeline {
    pub fn new(settings: ValidationSettings, scanner: Arc<dyn VirusScanner>) -> Self {
        Self { settings, scanner }
    }

    pub fn settings(&self) -> &ValidationSettings {
        &self.settings
    }

    #[tracing::instrument(skip(self, buffer), fields(size = buffer.len()))]
    pub async fn validate(&self, file_name: &str, mime_type: &str, buffer: &Bytes) -> ValidationVerdict {
        let content_hash = calculate_hash(buffer);

        let input = CheckInput {
            file_name,
            mime_type,
            buffer,
            settings: &self.settings,
        };
        let mut results: Vec<CheckResult> = STATIC_CHECKS.iter().map(|check| check(&input)).collect();

        if self.settings.enable_virus_scan {
            results.push(self.check_malware(buffer.clone()).await);
        } else {
            warn!("Malware scanning disabled, skipping scan for {}", file_name);
        }

        let verdict = ValidationVerdict::aggregate(results, content_hash);
        info!(
            valid = verdict.valid,
            risk = %verdict.risk_level,
            issues = verdict.issues.len(),
            "Validation finished"
        );
        verdict
    }

    async fn check_malware(&self, buffer: Bytes) -> CheckResult {
        let check = CheckName::MalwareScan;
        match scan_buffer(self.scanner.as_ref(), buffer, self.settings.scan_timeout).await {
            Ok(ScanResult::Infected { threat_name }) => {
                warn!("🦠 Malware detected: {}", threat_name);
                let mut result = CheckResult::with_issues(
                    check,
                    vec![ValidationIssue::new(
                        check,
                        "MALWARE_DETECTED",
                        Severity::Critical,
                        format!("Malware detected: {}", threat_name),
                    )],
                );
                result.threat_name = Some(threat_name);
                result
            }
            Ok(_) => CheckResult::passed(check),
            Err(e) => {
                warn!("Malware scan failed, rejecting file: {}", e);
                CheckResult::with_issues(
                    check,
                    vec![ValidationIssue::new(
                        check,
                        "SCAN_FAILED",
                        Severity::Critical,
                        format!("Malware scan could not be completed: {}", e),
                    )],
                )
            }
        }
    }
}

fn check_extension(input: &CheckInput<'_>) -> CheckResult {
    let check = CheckName::Extension;
    let mut issues = Vec::new();

    if let Err(e) = sanitize_filename(input.file_name) {
        issues.push(ValidationIssue::new(check, e.code, Severity::High, e.message));
    }

    match file_extension(input.file_name) {
        None => issues.push(ValidationIssue::new(
            check,
            "MISSING_EXTENSION",
            Severity::High,
            "File name has no extension; expected .xlsx or .xls",
        )),
        Some(ext) if SpreadsheetKind::from_extension(&ext).is_none() => {
            issues.push(ValidationIssue::new(
                check,
                "INVALID_EXTENSION",
                Severity::High,
                format!("File extension '.{}' is not allowed; expected .xlsx or .xls", ext),
            ))
        }
        Some(_) => {}
    }

    CheckResult::with_issues(check, issues)
}

fn check_mime_type(input: &CheckInput<'_>) -> CheckResult {
    let check = CheckName::MimeType;
    let mime = normalize_mime(input.mime_type);

    if !is_allowed_mime(&mime) {
        return CheckResult::with_issues(
            check,
            vec![ValidationIssue::new(
                check,
                "INVALID_MIME_TYPE",
                Severity::High,
                format!("MIME type '{}' is not an accepted spreadsheet type", input.mime_type),
            )],
        );
    }

    // A specific spreadsheet MIME type has to agree with the extension.
    if let Some(kind) = SpreadsheetKind::from_file_name(input.file_name) {
        let claimed = [SpreadsheetKind::Xlsx, SpreadsheetKind::Xls]
            .into_iter()
            .find(|k| k.mime_type() == mime);
        if let Some(claimed) = claimed.filter(|c| *c != kind) {
            return CheckResult::with_issues(
                check,
                vec![ValidationIssue::new(
                    check,
                    "MIME_EXTENSION_MISMATCH",
                    Severity::Medium,
                    format!(
                        "MIME type is for .{} but the file is named .{}",
                        claimed.extension(),
                        kind.extension()
                    ),
                )],
            );
        }
    }

    CheckResult::passed(check)
}

fn check_signature(input: &CheckInput<'_>) -> CheckResult {
    let check = CheckName::Signature;
    let mut issues = Vec::new();

    if input.buffer.is_empty() {
        issues.push(ValidationIssue::new(
            check,
            "EMPTY_FILE",
            Severity::Critical,
            "File appears to be empty",
        ));
        return CheckResult::with_issues(check, issues);
    }

    if is_executable_content(input.buffer) {
        issues.push(ValidationIssue::new(
            check,
            "EXECUTABLE_CONTENT",
            Severity::Critical,
            "File contains executable content which is not allowed",
        ));
    }

    let detected = SpreadsheetKind::from_signature(input.buffer);
    let expected = SpreadsheetKind::from_file_name(input.file_name);
    let described = || {
        infer::get(input.buffer)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    };

    match (expected, detected) {
        (Some(exp), Some(det)) if exp == det => {}
        (Some(exp), _) => issues.push(ValidationIssue::new(
            check,
            "SIGNATURE_MISMATCH",
            Severity::Critical,
            format!(
                "File content ({}) does not match the .{} signature",
                described(),
                exp.extension()
            ),
        )),
        (None, None) => issues.push(ValidationIssue::new(
            check,
            "UNKNOWN_SIGNATURE",
            Severity::High,
            format!("File content ({}) is not a recognised spreadsheet", described()),
        )),
        (None, Some(_)) => {}
    }

    CheckResult::with_issues(check, issues)
}

fn check_dangerous_content(input: &CheckInput<'_>) -> CheckResult {
    let check = CheckName::DangerousContent;
    let report = scan_content(input.buffer, input.settings.content_scan_limit);

    let issues = report
        .matches
        .iter()
        .map(|m| {
            ValidationIssue::new(
                check,
                "DANGEROUS_CONTENT",
                m.severity,
                format!(
                    "Found {} marker '{}' ({} occurrence(s), first at byte {})",
                    m.category.as_str(),
                    m.pattern,
                    m.occurrences,
                    m.first_offset
                ),
            )
        })
        .collect();

    let mut result = CheckResult::with_issues(check, issues);
    result.risk = Some(report.risk());
    result
}

/// A formula lifted out of raw workbook bytes.
struct FoundFormula {
    location: String,
    text: String,
}

fn unescape_xml(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn formulas_in_worksheets(buffer: &[u8]) -> Result<Vec<FoundFormula>, zip::result::ZipError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(buffer))?;
    let mut found = Vec::new();
    let mut budget = FORMULA_SCAN_BUDGET;

    for i in 0..archive.len() {
        if budget == 0 {
            break;
        }
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        let is_sheet = (name.starts_with("xl/worksheets/") || name.starts_with("xl/macrosheets/"))
            && name.ends_with(".xml");
        if !is_sheet {
            continue;
        }

        let mut xml = Vec::new();
        // Bounded read: a compressed sheet may expand far beyond its size.
        (&mut entry)
            .take(budget)
            .read_to_end(&mut xml)
            .map_err(zip::result::ZipError::Io)?;
        budget = budget.saturating_sub(xml.len() as u64);

        for caps in CELL_FORMULA.captures_iter(&xml) {
            found.push(FoundFormula {
                location: format!("{}!{}", name, String::from_utf8_lossy(&caps[1])),
                text: unescape_xml(&caps[2]),
            });
        }
    }

    Ok(found)
}

fn check_formula_safety(input: &CheckInput<'_>) -> CheckResult {
    let check = CheckName::FormulaSafety;
    let policy = &input.settings.formula_policy;
    let window = &input.buffer[..input.buffer.len().min(input.settings.content_scan_limit)];
    let mut issues = Vec::new();

    let mut formulas: Vec<FoundFormula> = BARE_FORMULA
        .captures_iter(window)
        .map(|caps| FoundFormula {
            location: "raw content".to_string(),
            text: unescape_xml(&caps[1]),
        })
        .collect();

    match SpreadsheetKind::from_signature(input.buffer) {
        Some(SpreadsheetKind::Xlsx) => match formulas_in_worksheets(input.buffer) {
            Ok(found) => formulas.extend(found),
            Err(e) => issues.push(ValidationIssue::new(
                check,
                "UNREADABLE_CONTAINER",
                Severity::Medium,
                format!("Worksheets could not be inspected for formulas: {}", e),
            )),
        },
        _ => {
            // Binary workbooks store formulas as tokens; look for bare calls.
            let text = String::from_utf8_lossy(window);
            for name in blocked_calls_in_text(&text) {
                issues.push(ValidationIssue::new(
                    check,
                    "BLOCKED_FUNCTION",
                    Severity::High,
                    format!("Blocked function {} found in file content", name),
                ));
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    let mut unsafe_count = 0usize;
    let mut overflow_severity: Option<Severity> = None;

    for formula in formulas {
        if !seen.insert((formula.location.clone(), formula.text.clone())) {
            continue;
        }
        let analysis = policy.analyze(&formula.text);
        let Some(severity) = analysis.severity() else {
            continue;
        };

        unsafe_count += 1;
        if unsafe_count > MAX_FORMULA_ISSUES {
            overflow_severity = overflow_severity.max(Some(severity));
            continue;
        }
        issues.push(
            ValidationIssue::new(
                check,
                analysis.issue_type(),
                severity,
                format!("Unsafe formula in {}: {}", formula.location, analysis.describe()),
            )
            .with_detail(policy.sanitize(&formula.text)),
        );
    }

    if let Some(severity) = overflow_severity {
        issues.push(ValidationIssue::new(
            check,
            "UNSAFE_FORMULAS_TRUNCATED",
            severity,
            format!(
                "{} further unsafe formula(s) not listed",
                unsafe_count - MAX_FORMULA_ISSUES
            ),
        ));
    }

    CheckResult::with_issues(check, issues)
}
