use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Ordered severity scale shared by validation issues and the verdict's risk level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical issues make a file invalid.
    pub fn is_blocking(self) -> bool {
        self >= Severity::High
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    Extension,
    MimeType,
    Signature,
    DangerousContent,
    FormulaSafety,
    MalwareScan,
}

impl CheckName {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckName::Extension => "extension",
            CheckName::MimeType => "mime_type",
            CheckName::Signature => "signature",
            CheckName::DangerousContent => "dangerous_content",
            CheckName::FormulaSafety => "formula_safety",
            CheckName::MalwareScan => "malware_scan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ValidationIssue {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub check: CheckName,
    pub message: String,
    pub severity: Severity,
    /// Extra context such as the sanitized form of an unsafe formula.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ValidationIssue {
    pub fn new(
        check: CheckName,
        issue_type: &str,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            issue_type: issue_type.to_string(),
            check,
            message: message.into(),
            severity,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Output of a single validation check before aggregation.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub check: CheckName,
    pub issues: Vec<ValidationIssue>,
    /// Risk contributed independently of the issues (content scan heuristics).
    pub risk: Option<Severity>,
    pub threat_name: Option<String>,
}

impl CheckResult {
    pub fn passed(check: CheckName) -> Self {
        Self {
            check,
            issues: Vec::new(),
            risk: None,
            threat_name: None,
        }
    }

    pub fn with_issues(check: CheckName, issues: Vec<ValidationIssue>) -> Self {
        Self {
            check,
            issues,
            risk: None,
            threat_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ValidationVerdict {
    pub valid: bool,
    pub risk_level: Severity,
    pub content_hash: String,
    pub checks_run: Vec<CheckName>,
    pub issues: Vec<ValidationIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat_name: Option<String>,
}

impl ValidationVerdict {
    /// Folds every check result into one verdict. Nothing short-circuits: all
    /// issues from all checks are kept in execution order.
    pub fn aggregate(results: Vec<CheckResult>, content_hash: String) -> Self {
        let mut checks_run = Vec::with_capacity(results.len());
        let mut issues = Vec::new();
        let mut risk_level = Severity::Low;
        let mut threat_name = None;

        for result in results {
            checks_run.push(result.check);
            if let Some(risk) = result.risk {
                risk_level = risk_level.max(risk);
            }
            if threat_name.is_none() {
                threat_name = result.threat_name;
            }
            for issue in result.issues {
                risk_level = risk_level.max(issue.severity);
                issues.push(issue);
            }
        }

        let valid = !issues.iter().any(|i| i.severity.is_blocking());

        Self {
            valid,
            risk_level,
            content_hash,
            checks_run,
            issues,
            threat_name,
        }
    }

    /// True when the malware scanner reported an infection.
    pub fn is_infected(&self) -> bool {
        self.threat_name.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medium_issues_do_not_invalidate() {
        let verdict = ValidationVerdict::aggregate(
            vec![CheckResult::with_issues(
                CheckName::FormulaSafety,
                vec![ValidationIssue::new(
                    CheckName::FormulaSafety,
                    "FORMULA_TOO_DEEP",
                    Severity::Medium,
                    "nested too deep",
                )],
            )],
            "abc".into(),
        );
        assert!(verdict.valid);
        assert_eq!(verdict.risk_level, Severity::Medium);
    }

    #[test]
    fn content_risk_raises_level_without_issues() {
        let mut scan = CheckResult::passed(CheckName::DangerousContent);
        scan.risk = Some(Severity::High);
        let verdict = ValidationVerdict::aggregate(
            vec![CheckResult::passed(CheckName::Extension), scan],
            "abc".into(),
        );
        assert!(verdict.valid);
        assert_eq!(verdict.risk_level, Severity::High);
        assert_eq!(
            verdict.checks_run,
            vec![CheckName::Extension, CheckName::DangerousContent]
        );
    }

    #[test]
    fn keeps_issues_from_every_check() {
        let results = vec![
            CheckResult::with_issues(
                CheckName::Extension,
                vec![ValidationIssue::new(
                    CheckName::Extension,
                    "INVALID_EXTENSION",
                    Severity::High,
                    "bad ext",
                )],
            ),
            CheckResult::with_issues(
                CheckName::Signature,
                vec![ValidationIssue::new(
                    CheckName::Signature,
                    "SIGNATURE_MISMATCH",
                    Severity::Critical,
                    "bad magic",
                )],
            ),
        ];
        let verdict = ValidationVerdict::aggregate(results, "abc".into());
        assert!(!verdict.valid);
        assert_eq!(verdict.issues.len(), 2);
        assert_eq!(verdict.risk_level, Severity::Critical);
    }
}
