use crate::models::Severity;
use regex::bytes::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternCategory {
    Macro,
    ExternalCall,
    Shell,
    Script,
}

impl PatternCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternCategory::Macro => "macro",
            PatternCategory::ExternalCall => "external_call",
            PatternCategory::Shell => "shell",
            PatternCategory::Script => "script",
        }
    }
}

struct DangerousPattern {
    name: &'static str,
    category: PatternCategory,
    severity: Severity,
    regex: Regex,
}

fn pattern(
    name: &'static str,
    category: PatternCategory,
    severity: Severity,
    expr: &str,
) -> DangerousPattern {
    DangerousPattern {
        name,
        category,
        severity,
        regex: Regex::new(expr).expect("dangerous content pattern"),
    }
}

static PATTERNS: LazyLock<Vec<DangerousPattern>> = LazyLock::new(|| {
    use PatternCategory::*;
    vec![
        pattern("vba_project", Macro, Severity::High, r"(?i-u)vbaProject\.bin"),
        pattern(
            "auto_exec_macro",
            Macro,
            Severity::High,
            r"(?i-u)\b(?:Auto_Open|Auto_Close|Workbook_Open|Document_Open|AutoExec)\b",
        ),
        pattern("xlm_macro_sheet", Macro, Severity::High, r"(?i-u)xl/macrosheets/"),
        pattern(
            "web_function",
            ExternalCall,
            Severity::High,
            r"(?i-u)\b(?:WEBSERVICE|FILTERXML|IMPORTXML|IMPORTDATA|IMPORTHTML)\s*\(",
        ),
        pattern("external_link", ExternalCall, Severity::Medium, r"(?i-u)xl/externalLinks/"),
        pattern("cmd_exec", Shell, Severity::Critical, r"(?i-u)\bcmd(?:\.exe)?\s*(?:\|\s*'|/[ck]\b)"),
        pattern("powershell", Shell, Severity::Critical, r"(?i-u)\bpowershell(?:\.exe)?\b"),
        pattern("wscript_shell", Shell, Severity::Critical, r"(?i-u)WScript\.Shell"),
        pattern("unix_shell", Shell, Severity::Critical, r"(?-u)/bin/(?:ba|z|da)?sh\b"),
        pattern("mshta", Shell, Severity::Critical, r"(?i-u)\bmshta(?:\.exe)?\b"),
        pattern("dde", Shell, Severity::Critical, r"(?i-u)\bDDEAUTO\b|=\s*DDE\s*\("),
        pattern("script_tag", Script, Severity::High, r"(?i-u)<script[\s>]"),
        pattern("javascript_uri", Script, Severity::High, r"(?i-u)javascript:"),
        pattern("vbscript_uri", Script, Severity::High, r"(?i-u)vbscript:"),
        pattern(
            "event_handler",
            Script,
            Severity::Medium,
            r"(?i-u)\bon(?:load|error|click|mouseover)\s*=",
        ),
    ]
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub pattern: &'static str,
    pub category: PatternCategory,
    pub severity: Severity,
    /// Byte offset of the first occurrence.
    pub first_offset: usize,
    pub occurrences: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentScanReport {
    pub matches: Vec<PatternMatch>,
    pub scanned_bytes: usize,
}

impl ContentScanReport {
    pub fn total_occurrences(&self) -> usize {
        self.matches.iter().map(|m| m.occurrences).sum()
    }

    /// Critical if any critical pattern matched, high if more than five
    /// occurrences in total, medium for any match, low otherwise.
    pub fn risk(&self) -> Severity {
        if self.matches.iter().any(|m| m.severity == Severity::Critical) {
            Severity::Critical
        } else if self.total_occurrences() > 5 {
            Severity::High
        } else if !self.matches.is_empty() {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Scans at most `limit` leading bytes for known-dangerous markers.
pub fn scan_content(buffer: &[u8], limit: usize) -> ContentScanReport {
    let window = &buffer[..buffer.len().min(limit)];

    let matches = PATTERNS
        .iter()
        .filter_map(|p| {
            let mut iter = p.regex.find_iter(window);
            let first = iter.next()?;
            Some(PatternMatch {
                pattern: p.name,
                category: p.category,
                severity: p.severity,
                first_offset: first.start(),
                occurrences: 1 + iter.count(),
            })
        })
        .collect();

    ContentScanReport {
        matches,
        scanned_bytes: window.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_buffer_is_low_risk() {
        let report = scan_content(b"PK\x03\x04 plain workbook data SUM(A1:A9)", 1024);
        assert!(report.matches.is_empty());
        assert_eq!(report.risk(), Severity::Low);
    }

    #[test]
    fn shell_invocation_is_critical() {
        let report = scan_content(b"=cmd|' /c calc.exe'!A0", 1024);
        assert!(report.matches.iter().any(|m| m.category == PatternCategory::Shell));
        assert_eq!(report.risk(), Severity::Critical);
    }

    #[test]
    fn many_medium_hits_escalate_to_high() {
        let data = b"onload= onload= onload= onerror= onclick= onmouseover=";
        let report = scan_content(data, 1024);
        assert_eq!(report.total_occurrences(), 6);
        assert_eq!(report.risk(), Severity::High);
    }

    #[test]
    fn single_macro_marker_is_medium_risk() {
        let report = scan_content(b"xl/vbaProject.bin", 1024);
        assert_eq!(report.matches[0].pattern, "vba_project");
        assert_eq!(report.matches[0].severity, Severity::High);
        assert_eq!(report.risk(), Severity::Medium);
    }

    #[test]
    fn only_the_window_is_scanned() {
        let mut data = vec![b' '; 2048];
        data.extend_from_slice(b"powershell -enc AAAA");
        let report = scan_content(&data, 1024);
        assert!(report.matches.is_empty());
        assert_eq!(report.scanned_bytes, 1024);
    }
}
