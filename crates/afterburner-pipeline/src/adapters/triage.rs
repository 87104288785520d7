//! Deterministic, keyword-driven severity triage.
//!
//! Stands in for a model-backed classifier: anything that must be fixed
//! before shipping is raised to Critical, purely informational noise is
//! lowered to Info, everything else keeps the scanner's severity.

use async_trait::async_trait;

use afterburner_core::domain::FindingCategory;
use afterburner_core::{Finding, ScanFinding, Severity, SeverityTriage, ToolError};

const MUST_FIX: &[&str] = &[
    "sql injection",
    "sql built from",
    "command injection",
    "remote code execution",
    "shell=true",
    "auth bypass",
    "authentication bypass",
    "private key",
    "hardcoded password",
    "hardcoded secret",
    "deserialization",
];

const INFORMATIONAL: &[&str] = &["style", "best practice", "best-practice", "unused import"];

#[derive(Debug, Default, Clone)]
pub struct RuleTriage;

impl RuleTriage {
    pub fn severity_for(raw: &ScanFinding) -> Severity {
        if raw.category == FindingCategory::Secret {
            return Severity::Critical;
        }
        let message = raw.message.to_ascii_lowercase();
        if MUST_FIX.iter().any(|k| message.contains(k)) {
            return Severity::Critical;
        }
        if INFORMATIONAL.iter().any(|k| message.contains(k)) {
            return Severity::Info;
        }
        raw.severity
    }
}

#[async_trait]
impl SeverityTriage for RuleTriage {
    async fn classify_severity(&self, raw: &ScanFinding) -> Result<Finding, ToolError> {
        let severity = Self::severity_for(raw);
        if severity != raw.severity {
            tracing::debug!(
                tool = %raw.tool,
                from = ?raw.severity,
                to = ?severity,
                "triage reclassified finding"
            );
        }
        let mut finding = raw.to_finding();
        finding.severity = severity;
        Ok(finding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(category: FindingCategory, severity: Severity, message: &str) -> ScanFinding {
        ScanFinding {
            tool: "semgrep".into(),
            category,
            severity,
            file: Some("app.py".into()),
            line: Some(3),
            end_line: None,
            message: message.into(),
            rule_id: None,
        }
    }

    #[tokio::test]
    async fn injection_is_raised_to_critical() {
        let f = RuleTriage
            .classify_severity(&raw(
                FindingCategory::CodeVulnerability,
                Severity::Medium,
                "Possible SQL injection via string formatting",
            ))
            .await
            .unwrap();
        assert_eq!(f.severity, Severity::Critical);
        assert_eq!(f.file(), Some("app.py"));
    }

    #[tokio::test]
    async fn secrets_are_always_critical() {
        let f = RuleTriage
            .classify_severity(&raw(FindingCategory::Secret, Severity::Info, "token in source"))
            .await
            .unwrap();
        assert_eq!(f.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn style_noise_is_lowered_and_the_rest_kept() {
        let style = RuleTriage
            .classify_severity(&raw(
                FindingCategory::CodeVulnerability,
                Severity::Medium,
                "Style: prefer f-strings",
            ))
            .await
            .unwrap();
        assert_eq!(style.severity, Severity::Info);

        let weak = RuleTriage
            .classify_severity(&raw(
                FindingCategory::CodeVulnerability,
                Severity::Medium,
                "Use of weak MD5 hash",
            ))
            .await
            .unwrap();
        assert_eq!(weak.severity, Severity::Medium);
    }
}
