use crate::models::Severity;
use crate::models::workbook::{BLOCKED_SENTINEL, EXTERNAL_REF_SENTINEL};
use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

/// Functions that can reach outside the workbook: network fetches, DLL
/// calls, DDE channels and XLM macro commands.
pub const BLOCKED_FUNCTIONS: &[&str] = &[
    "WEBSERVICE",
    "FILTERXML",
    "IMPORTXML",
    "IMPORTDATA",
    "IMPORTHTML",
    "IMPORTFEED",
    "IMPORTRANGE",
    "CALL",
    "REGISTER",
    "REGISTER.ID",
    "EXEC",
    "EXECUTE",
    "RUN",
    "SHELL",
    "DDE",
    "DDEAUTO",
    "EVALUATE",
    "FOPEN",
    "FWRITE",
    "FWRITELN",
    "FREAD",
    "FREADLN",
    "RTD",
];

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_.]*").expect("identifier regex"));

/// `[Book.xlsx]Sheet1!A1`, `'[1]Data'!B2:C9`, `[Budget.xlsx]!Total`
static EXTERNAL_WORKBOOK_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"'?\[[^\]\[]+\][^!(),]*'?!(?:\$?[A-Za-z]{1,3}\$?[0-9]+(?::\$?[A-Za-z]{1,3}\$?[0-9]+)?|[A-Za-z_][A-Za-z0-9_.]*)",
    )
    .expect("external reference regex")
});

/// DDE links, `app|topic!item`: `cmd|' /C calc'!A0`, `MSEXCEL|'\..\cmd.exe'!''`
static DDE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b[A-Za-z0-9_.]+\|(?:'[^']*'|[A-Za-z0-9_.]+)!(?:''|[A-Za-z0-9_.$:]+)?",
    )
    .expect("dde link regex")
});

static URL_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:https?|ftp|file)://[^\s"')]+"#).expect("url regex")
});

static UNC_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\\\\[A-Za-z0-9._$-]+\\[^\s"')]+"#).expect("unc regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormulaAnalysis {
    /// Upper-cased blocked function names, deduplicated in order of appearance.
    pub blocked_functions: Vec<String>,
    pub external_references: Vec<String>,
    pub depth: usize,
    pub too_deep: bool,
}

impl FormulaAnalysis {
    pub fn is_safe(&self) -> bool {
        self.blocked_functions.is_empty() && self.external_references.is_empty() && !self.too_deep
    }

    pub fn severity(&self) -> Option<Severity> {
        if !self.blocked_functions.is_empty() || !self.external_references.is_empty() {
            Some(Severity::High)
        } else if self.too_deep {
            Some(Severity::Medium)
        } else {
            None
        }
    }

    /// Issue code matching the most severe finding.
    pub fn issue_type(&self) -> &'static str {
        if !self.blocked_functions.is_empty() {
            "BLOCKED_FUNCTION"
        } else if !self.external_references.is_empty() {
            "EXTERNAL_REFERENCE"
        } else {
            "FORMULA_TOO_DEEP"
        }
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.blocked_functions.is_empty() {
            parts.push(format!(
                "blocked function(s) {}",
                self.blocked_functions.join(", ")
            ));
        }
        if !self.external_references.is_empty() {
            parts.push(format!(
                "external reference(s) {}",
                self.external_references.join(", ")
            ));
        }
        if self.too_deep {
            parts.push(format!("nesting depth {}", self.depth));
        }
        parts.join("; ")
    }
}

/// Deny-list based formula analysis.
#[derive(Debug, Clone)]
pub struct FormulaPolicy {
    pub max_depth: usize,
}

impl Default for FormulaPolicy {
    fn default() -> Self {
        Self { max_depth: 10 }
    }
}

impl FormulaPolicy {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn analyze(&self, formula: &str) -> FormulaAnalysis {
        let strings = string_literal_spans(formula);

        let mut blocked_functions: Vec<String> = Vec::new();
        for (_, name) in blocked_calls(formula, &strings) {
            if !blocked_functions.contains(&name) {
                blocked_functions.push(name);
            }
        }

        let external_references = external_references(formula);
        let depth = nesting_depth(formula);

        FormulaAnalysis {
            blocked_functions,
            external_references,
            depth,
            too_deep: depth > self.max_depth,
        }
    }

    /// Returns a safe rendering of the formula. Blocked calls become
    /// `#BLOCKED!`, external references become `#REF!`, and a formula nested
    /// beyond the limit is replaced by `#BLOCKED!` entirely.
    pub fn sanitize(&self, formula: &str) -> String {
        if nesting_depth(formula) > self.max_depth {
            return BLOCKED_SENTINEL.to_string();
        }

        let mut text = formula.to_string();
        for re in [&*EXTERNAL_WORKBOOK_REF, &*DDE_LINK, &*URL_REF, &*UNC_PATH] {
            text = re.replace_all(&text, EXTERNAL_REF_SENTINEL).into_owned();
        }

        let strings = string_literal_spans(&text);
        let calls = blocked_calls(&text, &strings);
        if calls.is_empty() {
            return text;
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for (span, _) in calls {
            out.push_str(&text[last..span.start]);
            out.push_str(BLOCKED_SENTINEL);
            last = span.end;
        }
        out.push_str(&text[last..]);
        out
    }
}

/// Blocked function names that appear anywhere in free text as `NAME(`.
/// Used on raw file bytes where quoting carries no formula meaning.
pub fn blocked_calls_in_text(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for (_, name) in blocked_calls(text, &[]) {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn blocked_calls(text: &str, skip: &[Range<usize>]) -> Vec<(Range<usize>, String)> {
    IDENTIFIER
        .find_iter(text)
        .filter(|m| !skip.iter().any(|s| s.contains(&m.start())))
        .filter(|m| text[m.end()..].trim_start().starts_with('('))
        .filter_map(|m| {
            let upper = m.as_str().to_ascii_uppercase();
            let name = upper
                .strip_prefix("_XLFN.")
                .or_else(|| upper.strip_prefix("_XLL."))
                .unwrap_or(&upper)
                .to_string();
            BLOCKED_FUNCTIONS
                .contains(&name.as_str())
                .then(|| (m.range(), name))
        })
        .collect()
}

fn external_references(formula: &str) -> Vec<String> {
    let mut refs: Vec<String> = Vec::new();
    for re in [&*EXTERNAL_WORKBOOK_REF, &*DDE_LINK, &*URL_REF, &*UNC_PATH] {
        for m in re.find_iter(formula) {
            let found = m.as_str().to_string();
            if !refs.contains(&found) {
                refs.push(found);
            }
        }
    }
    refs
}

/// Byte ranges of `"..."` literals; `""` inside a literal is an escaped quote.
fn string_literal_spans(formula: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    let bytes = formula.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            match start {
                None => start = Some(i),
                Some(s) => {
                    if bytes.get(i + 1) == Some(&b'"') {
                        i += 1;
                    } else {
                        spans.push(s..i + 1);
                        start = None;
                    }
                }
            }
        }
        i += 1;
    }
    if let Some(s) = start {
        spans.push(s..bytes.len());
    }
    spans
}

/// Deepest parenthesis nesting outside string literals.
pub fn nesting_depth(formula: &str) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    let mut in_string = false;
    for c in formula.chars() {
        match c {
            '"' => in_string = !in_string,
            '(' if !in_string => {
                depth += 1;
                max = max.max(depth);
            }
            ')' if !in_string => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}
