//! Summary: the derived, write-once report for a terminal Run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::BlockReason;
use super::finding::Finding;
use super::retry::RetryCycle;
use super::run::{BaselineCommit, ExitStatus};
use super::stage::{StageName, StageState, TestTally};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub name: StageName,
    pub state: StageState,
    pub attempts: u32,
    pub findings_total: usize,
    pub duplicates: usize,
    pub unresolved: usize,
    pub note: Option<String>,
    #[serde(default)]
    pub tally: Option<TestTally>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub run_id: String,
    pub overall_status: ExitStatus,
    pub changed_files: Vec<String>,
    pub stages: Vec<StageOutcome>,
    /// Unresolved Critical/High findings, most severe first.
    pub unresolved_findings: Vec<Finding>,
    pub retry_history: Vec<RetryCycle>,
    pub block_reason: Option<BlockReason>,
    /// branch, commit, pr_url, deploy_url when produced.
    pub artifacts: BTreeMap<String, String>,
    pub baseline: BaselineCommit,
    pub duration_ms: u64,
    pub generated_at: DateTime<Utc>,
}

impl Summary {
    pub fn is_empty(&self) -> bool {
        self.changed_files.is_empty()
            && self.stages.is_empty()
            && self.unresolved_findings.is_empty()
            && self.retry_history.is_empty()
    }
}
