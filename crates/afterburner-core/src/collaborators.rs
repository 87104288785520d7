//! Contracts for external collaborators.
//!
//! Scanners, test runners, the fix proposer, triage, git and deployment are
//! opaque capabilities. The pipeline depends only on these traits; concrete
//! command-backed adapters live in `afterburner-pipeline`, deterministic
//! stubs in [`crate::fakes`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ChangeSet, Finding, FindingCategory, LineRange, Location, Severity};

/// Failure of an external call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("{tool} is not installed")]
    NotInstalled { tool: String },

    #[error("{tool} failed: {detail}")]
    Failed { tool: String, detail: String },

    #[error("could not parse {tool} output: {detail}")]
    Parse { tool: String, detail: String },

    #[error("{tool} timed out after {secs}s")]
    TimedOut { tool: String, secs: u64 },
}

impl ToolError {
    pub fn failed(tool: impl Into<String>, detail: impl Into<String>) -> Self {
        ToolError::Failed {
            tool: tool.into(),
            detail: detail.into(),
        }
    }
}

// ---- Security ----

/// Raw finding as reported by a scanner, before triage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFinding {
    pub tool: String,
    pub category: FindingCategory,
    pub severity: Severity,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub end_line: Option<u32>,
    pub message: String,
    pub rule_id: Option<String>,
}

impl ScanFinding {
    /// Canonical finding at the scanner's own severity.
    pub fn to_finding(&self) -> Finding {
        let location = self.file.as_ref().map(|file| match self.line {
            Some(start) => Location::at(file, LineRange::new(start, self.end_line.unwrap_or(start))),
            None => Location::file(file),
        });
        let finding = Finding::new(&self.tool, self.category, self.severity, location, &self.message);
        match &self.rule_id {
            Some(rule) => finding.with_rule(rule),
            None => finding,
        }
    }
}

#[async_trait]
pub trait SecurityScanner: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this scanner has anything to look at in `changeset`.
    fn applies_to(&self, _changeset: &ChangeSet, _repo: &Path) -> bool {
        true
    }

    async fn scan(&self, repo: &Path, files: &[String]) -> Result<Vec<ScanFinding>, ToolError>;
}

/// Opaque severity classification (LLM or rule-based).
#[async_trait]
pub trait SeverityTriage: Send + Sync {
    async fn classify_severity(&self, raw: &ScanFinding) -> Result<Finding, ToolError>;
}

// ---- Tests ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingCase {
    pub name: String,
    pub file: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub framework: String,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub failing_cases: Vec<FailingCase>,
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the framework is configured in `repo`.
    fn detect(&self, repo: &Path) -> bool;

    async fn run(&self, repo: &Path, files: &[String]) -> Result<TestReport, ToolError>;
}

// ---- Fix proposal ----

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FixError {
    #[error("no fix available: {0}")]
    NoFixAvailable(String),

    #[error("fix rejected: {0}")]
    Rejected(String),

    #[error("fix capability unavailable: {0}")]
    Unavailable(String),
}

/// Proposes and applies a fix, returning the patched ChangeSet.
///
/// Implementations write to the working tree themselves; the returned
/// ChangeSet must carry the new fingerprints of every file they touched.
#[async_trait]
pub trait FixProposer: Send + Sync {
    async fn propose_fix(
        &self,
        repo: &Path,
        failing_cases: &[FailingCase],
        context: &ChangeSet,
    ) -> Result<ChangeSet, FixError>;
}

// ---- Git ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub branch: String,
    pub commit_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrRequest {
    pub branch: String,
    pub base_branch: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub reviewers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReviewState {
    Approved,
    Pending,
    Rejected { reason: String },
}

#[async_trait]
pub trait GitAdapter: Send + Sync {
    async fn commit_and_branch(
        &self,
        repo: &Path,
        changeset: &ChangeSet,
        branch: &str,
        message: &str,
    ) -> Result<CommitInfo, ToolError>;

    /// Returns the PR URL, or `None` when PRs are not configured.
    async fn open_pr(&self, repo: &Path, request: &PrRequest) -> Result<Option<String>, ToolError>;

    async fn review_state(&self, pr_url: &str) -> Result<ReviewState, ToolError>;
}

// ---- Launch ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeployStatus {
    Success,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub status: DeployStatus,
    pub url: Option<String>,
}

#[async_trait]
pub trait LaunchAdapter: Send + Sync {
    /// Write (or confirm) the CI manifest; returns its path.
    async fn generate_ci_manifest(&self, repo: &Path) -> Result<PathBuf, ToolError>;

    async fn deploy(&self, repo: &Path, target: &str) -> Result<DeployOutcome, ToolError>;
}
