//! Stage records: one per gate per Run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{AfterburnerError, Result};
use super::finding::{Finding, Severity};

/// The four gates, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Security,
    Test,
    Git,
    Launch,
}

impl StageName {
    pub const ALL: [StageName; 4] = [
        StageName::Security,
        StageName::Test,
        StageName::Git,
        StageName::Launch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Security => "security",
            StageName::Test => "test",
            StageName::Git => "git",
            StageName::Launch => "launch",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "security" => Ok(StageName::Security),
            "test" | "tests" => Ok(StageName::Test),
            "git" => Ok(StageName::Git),
            "launch" | "deploy" | "deployment" => Ok(StageName::Launch),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Passed,
    Failed,
    Blocked,
    Skipped,
    /// Parked on a human-gated step; resumed from persisted state.
    AwaitingExternal,
}

impl StageState {
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            StageState::Passed | StageState::Failed | StageState::Blocked | StageState::Skipped
        )
    }
}

/// Outcome of a single `classify` (or external poll).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    PendingExternal,
}

/// Pass/fail counts reported by test runners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestTally {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Names of failing cases, sorted and unique.
    pub failing_cases: Vec<String>,
}

impl TestTally {
    pub fn merge(&mut self, other: &TestTally) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.failing_cases.extend(other.failing_cases.iter().cloned());
        self.failing_cases.sort();
        self.failing_cases.dedup();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: StageName,
    pub state: StageState,
    pub attempts: u32,
    pub findings: Vec<Finding>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Skip reason, block detail or parking note.
    pub note: Option<String>,
    /// Outputs worth surfacing: branch, commit, pr_url, deploy_url.
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default)]
    pub tally: Option<TestTally>,
}

impl StageRecord {
    pub fn pending(name: StageName) -> Self {
        Self {
            name,
            state: StageState::Pending,
            attempts: 0,
            findings: Vec::new(),
            started_at: None,
            ended_at: None,
            note: None,
            artifacts: BTreeMap::new(),
            tally: None,
        }
    }

    /// Enter (or re-enter) the stage. Re-entry bumps `attempts` on the same record.
    pub fn begin(&mut self) {
        self.state = StageState::Running;
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.ended_at = None;
    }

    /// Mark Passed. Refused while an unresolved finding at or above
    /// `threshold` remains.
    pub fn pass(&mut self, threshold: Severity) -> Result<()> {
        if let Some(f) = self.findings.iter().find(|f| f.blocks_at(threshold)) {
            return Err(AfterburnerError::InvariantViolation(format!(
                "stage {} cannot pass with unresolved {} finding {}",
                self.name, f.severity, f.id
            )));
        }
        self.finish(StageState::Passed, None);
        Ok(())
    }

    pub fn finish(&mut self, state: StageState, note: Option<String>) {
        self.state = state;
        self.ended_at = Some(Utc::now());
        if note.is_some() {
            self.note = note;
        }
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.finish(StageState::Skipped, Some(reason.into()));
    }

    pub fn unresolved_at(&self, threshold: Severity) -> Vec<&Finding> {
        self.findings
            .iter()
            .filter(|f| f.blocks_at(threshold))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::finding::FindingCategory;

    #[test]
    fn reentry_increments_attempts_without_resetting_start() {
        let mut rec = StageRecord::pending(StageName::Test);
        rec.begin();
        let first_start = rec.started_at;
        rec.begin();
        assert_eq!(rec.attempts, 2);
        assert_eq!(rec.started_at, first_start);
    }

    #[test]
    fn pass_refused_with_unresolved_blocking_finding() {
        let mut rec = StageRecord::pending(StageName::Security);
        rec.begin();
        rec.findings.push(Finding::new(
            "semgrep",
            FindingCategory::CodeVulnerability,
            Severity::High,
            None,
            "eval of user input",
        ));
        assert!(rec.pass(Severity::High).is_err());
        assert_eq!(rec.state, StageState::Running);

        rec.findings[0].resolved = true;
        rec.pass(Severity::High).unwrap();
        assert_eq!(rec.state, StageState::Passed);
    }

    #[test]
    fn tally_merge_dedupes_cases() {
        let mut a = TestTally {
            passed: 1,
            failed: 1,
            skipped: 0,
            failing_cases: vec!["t::a".into()],
        };
        a.merge(&TestTally {
            passed: 2,
            failed: 1,
            skipped: 1,
            failing_cases: vec!["t::a".into()],
        });
        assert_eq!(a.passed, 3);
        assert_eq!(a.failing_cases, vec!["t::a".to_string()]);
    }
}
