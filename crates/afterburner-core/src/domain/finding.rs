//! Canonical finding shape shared by every stage.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use afterburner_state::ContentDigest;

/// Finding severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" | "warning" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// What kind of problem a finding describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    CodeVulnerability,
    Secret,
    DependencyAdvisory,
    TestFailure,
    Deployment,
    ExternalRejection,
    /// Synthetic: an external call failed.
    ToolUnavailable,
    /// Synthetic: a stage or call exceeded its time budget.
    Timeout,
}

impl FindingCategory {
    /// Findings the pipeline manufactures itself rather than receiving from a tool.
    pub fn is_synthetic(self) -> bool {
        matches!(
            self,
            FindingCategory::ToolUnavailable | FindingCategory::Timeout
        )
    }
}

/// Inclusive, 1-indexed line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    pub fn single(line: u32) -> Self {
        Self::new(line, line)
    }

    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    /// Never empty; present to satisfy the `len` convention.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Intersecting lines divided by the length of the shorter range.
    pub fn overlap_fraction(&self, other: &LineRange) -> f64 {
        let lo = self.start.max(other.start);
        let hi = self.end.min(other.end);
        if lo > hi {
            return 0.0;
        }
        let shared = f64::from(hi - lo + 1);
        shared / f64::from(self.len().min(other.len()))
    }
}

/// Where a finding points. `lines == None` means the whole file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub lines: Option<LineRange>,
}

impl Location {
    pub fn file(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            lines: None,
        }
    }

    pub fn at(file: impl Into<String>, lines: LineRange) -> Self {
        Self {
            file: file.into(),
            lines: Some(lines),
        }
    }

    /// Overlap between two locations in the same file; 0.0 across files.
    pub fn overlap_fraction(&self, other: &Location) -> f64 {
        if self.file != other.file {
            return 0.0;
        }
        match (&self.lines, &other.lines) {
            (None, None) => 1.0,
            (Some(a), Some(b)) => a.overlap_fraction(b),
            _ => 0.0,
        }
    }
}

/// Deterministic finding identifier (short digest of its identity fields).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FindingId(pub String);

impl std::fmt::Display for FindingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: FindingId,
    pub source_tool: String,
    pub category: FindingCategory,
    pub severity: Severity,
    pub location: Option<Location>,
    pub message: String,
    #[serde(default)]
    pub rule_id: Option<String>,
    #[serde(default)]
    pub resolved: bool,
    /// Set when the aggregator folded this finding into a higher-severity one.
    #[serde(default)]
    pub duplicate_of: Option<FindingId>,
}

impl Finding {
    pub fn new(
        source_tool: impl Into<String>,
        category: FindingCategory,
        severity: Severity,
        location: Option<Location>,
        message: impl Into<String>,
    ) -> Self {
        let source_tool = source_tool.into();
        let message = message.into();
        let id = finding_id(&source_tool, category, location.as_ref(), &message);
        Self {
            id,
            source_tool,
            category,
            severity,
            location,
            message,
            rule_id: None,
            resolved: false,
            duplicate_of: None,
        }
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    /// Synthetic finding for a failed external call.
    pub fn tool_unavailable(tool: &str, severity: Severity, detail: &str) -> Self {
        Self::new(
            tool,
            FindingCategory::ToolUnavailable,
            severity,
            None,
            format!("{tool} unavailable: {detail}"),
        )
    }

    /// Synthetic finding for an exceeded time budget.
    pub fn timeout(tool: &str, severity: Severity, secs: u64) -> Self {
        Self::new(
            tool,
            FindingCategory::Timeout,
            severity,
            None,
            format!("{tool} timed out after {secs}s"),
        )
    }

    pub fn file(&self) -> Option<&str> {
        self.location.as_ref().map(|l| l.file.as_str())
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }

    /// Counts toward a gate at `threshold`.
    pub fn blocks_at(&self, threshold: Severity) -> bool {
        !self.resolved && !self.is_duplicate() && self.severity >= threshold
    }
}

/// Lowercase, collapse every non-alphanumeric run to one space, trim.
pub fn normalize_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut pending_space = false;
    for c in message.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(c.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

fn finding_id(
    tool: &str,
    category: FindingCategory,
    location: Option<&Location>,
    message: &str,
) -> FindingId {
    let (file, start, end) = match location {
        Some(Location {
            file,
            lines: Some(r),
        }) => (file.as_str(), r.start, r.end),
        Some(Location { file, lines: None }) => (file.as_str(), 0, 0),
        None => ("", 0, 0),
    };
    let key = format!(
        "{tool}\0{category:?}\0{file}\0{start}\0{end}\0{}",
        normalize_message(message)
    );
    let digest = ContentDigest::from_bytes(key.as_bytes());
    FindingId(digest.short().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_and_parses() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Info < Severity::Low);
        assert_eq!("WARNING".parse::<Severity>().unwrap(), Severity::Medium);
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn normalize_collapses_punctuation_and_case() {
        assert_eq!(
            normalize_message("  SQL Injection -- via `query()`!! "),
            "sql injection via query"
        );
    }

    #[test]
    fn overlap_uses_shorter_range() {
        let a = LineRange::new(10, 19);
        let b = LineRange::new(15, 16);
        assert!((a.overlap_fraction(&b) - 1.0).abs() < f64::EPSILON);
        let c = LineRange::new(18, 27);
        assert!((a.overlap_fraction(&c) - 0.2).abs() < 1e-9);
        assert_eq!(a.overlap_fraction(&LineRange::single(30)), 0.0);
    }

    #[test]
    fn location_overlap_requires_same_file() {
        let a = Location::at("a.py", LineRange::single(3));
        let b = Location::at("b.py", LineRange::single(3));
        assert_eq!(a.overlap_fraction(&b), 0.0);
        assert_eq!(Location::file("x").overlap_fraction(&Location::file("x")), 1.0);
    }

    #[test]
    fn ids_are_deterministic() {
        let a = Finding::new(
            "semgrep",
            FindingCategory::CodeVulnerability,
            Severity::High,
            Some(Location::at("auth.py", LineRange::single(4))),
            "Hardcoded password",
        );
        let b = Finding::new(
            "semgrep",
            FindingCategory::CodeVulnerability,
            Severity::Low,
            Some(Location::at("auth.py", LineRange::single(4))),
            "hardcoded   PASSWORD",
        );
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn resolved_and_duplicates_never_block() {
        let mut f = Finding::tool_unavailable("bandit", Severity::Medium, "not installed");
        assert!(f.blocks_at(Severity::Medium));
        f.resolved = true;
        assert!(!f.blocks_at(Severity::Info));
    }
}
