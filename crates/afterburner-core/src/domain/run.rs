//! The Run record: all mutable state of one pipeline execution.
//!
//! A Run is created from a trigger, mutated only by the orchestrator and
//! persisted after every transition. Nothing about a Run lives in globals.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::changeset::ChangeSet;
use super::error::{AfterburnerError, BlockReason, FailureKind, Result};
use super::retry::RetryCycle;
use super::stage::{StageName, StageRecord, StageState};
use super::summary::Summary;
use afterburner_state::{ContentDigest, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Explicit invocation (CLI, API).
    Manual,
    /// Detected file-system delta (watch mode).
    FileSystem,
    /// Editor or git hook.
    Hook,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Manual => f.write_str("manual"),
            TriggerKind::FileSystem => f.write_str("file_system"),
            TriggerKind::Hook => f.write_str("hook"),
        }
    }
}

/// Inbound trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub repo_path: PathBuf,
    pub kind: TriggerKind,
    /// Restricts the ChangeSet to these repository-relative paths.
    pub files: Option<Vec<String>>,
}

impl TriggerEvent {
    pub fn manual(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            kind: TriggerKind::Manual,
            files: None,
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_kind(mut self, kind: TriggerKind) -> Self {
        self.kind = kind;
        self
    }

    /// Key used for the per-repository baseline table.
    pub fn repo_key(&self) -> String {
        self.repo_path
            .canonicalize()
            .unwrap_or_else(|_| self.repo_path.clone())
            .display()
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Active,
    /// Parked on a human-gated stage.
    PendingExternal,
    Blocked,
    Completed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Active => "active",
            RunStatus::PendingExternal => "pending_external",
            RunStatus::Blocked => "blocked",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Blocked | RunStatus::Completed | RunStatus::Aborted
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable overall outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Completed,
    Blocked,
    Aborted,
    PendingExternal,
}

impl ExitStatus {
    pub fn from_status(status: RunStatus) -> Option<Self> {
        match status {
            RunStatus::Completed => Some(ExitStatus::Completed),
            RunStatus::Blocked => Some(ExitStatus::Blocked),
            RunStatus::Aborted => Some(ExitStatus::Aborted),
            RunStatus::PendingExternal => Some(ExitStatus::PendingExternal),
            RunStatus::Idle | RunStatus::Active => None,
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            ExitStatus::Completed => 0,
            ExitStatus::Blocked => 2,
            ExitStatus::PendingExternal => 3,
            ExitStatus::Aborted => 130,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitStatus::Completed => "completed",
            ExitStatus::Blocked => "blocked",
            ExitStatus::Aborted => "aborted",
            ExitStatus::PendingExternal => "pending-external",
        };
        f.write_str(s)
    }
}

/// Position of the top-level state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Detecting,
    SecurityReview,
    TestExecution,
    ReflectionLoop,
    GitOperations,
    Deployment,
    Summarized,
    Blocked,
    Aborted,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Summarized | PipelineState::Blocked | PipelineState::Aborted
        )
    }

    /// The stage record this state drives, if any.
    pub fn stage(self) -> Option<StageName> {
        match self {
            PipelineState::SecurityReview | PipelineState::ReflectionLoop => {
                Some(StageName::Security)
            }
            PipelineState::TestExecution => Some(StageName::Test),
            PipelineState::GitOperations => Some(StageName::Git),
            PipelineState::Deployment => Some(StageName::Launch),
            _ => None,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub at: DateTime<Utc>,
}

/// Result of trying to advance the repository baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BaselineCommit {
    NotAttempted,
    Committed { version: u64, digest: String },
    /// Someone else advanced the baseline first; a fresh Run is required.
    Stale { detail: String },
    Failed { detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub repo_path: PathBuf,
    pub trigger: TriggerEvent,
    /// Identity digest over repo, trigger kind, ChangeSet and gating config.
    pub identity: Option<String>,
    /// The ChangeSet computed at Detecting. Never mutated.
    pub changeset: ChangeSet,
    /// Latest ChangeSet after fix attempts.
    pub current_changeset: ChangeSet,
    /// Delta ChangeSets produced for reflection, oldest first.
    #[serde(default)]
    pub deltas: Vec<ChangeSet>,
    /// Baseline digest the Run started from (`None` = no baseline).
    pub baseline_digest: Option<ContentDigest>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub state: PipelineState,
    pub stages: Vec<StageRecord>,
    pub retry_history: Vec<RetryCycle>,
    pub transitions: Vec<StateTransition>,
    pub block_reason: Option<BlockReason>,
    /// Test block held while reflection re-audits the fix delta.
    #[serde(default)]
    pub pending_block: Option<BlockReason>,
    pub baseline_commit: BaselineCommit,
    pub summary: Option<Summary>,
}

impl Run {
    pub fn new(id: RunId, trigger: TriggerEvent) -> Self {
        Self {
            id,
            repo_path: trigger.repo_path.clone(),
            trigger,
            identity: None,
            changeset: ChangeSet::default(),
            current_changeset: ChangeSet::default(),
            deltas: Vec::new(),
            baseline_digest: None,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Idle,
            state: PipelineState::Idle,
            stages: StageName::ALL
                .iter()
                .map(|n| StageRecord::pending(*n))
                .collect(),
            retry_history: Vec::new(),
            transitions: Vec::new(),
            block_reason: None,
            pending_block: None,
            baseline_commit: BaselineCommit::NotAttempted,
            summary: None,
        }
    }

    /// Fix the ChangeSet the Run operates on. Only valid once.
    pub fn set_changeset(&mut self, changeset: ChangeSet) -> Result<()> {
        if !self.changeset.is_empty() {
            return Err(AfterburnerError::InvariantViolation(format!(
                "run {} already has a ChangeSet",
                self.id
            )));
        }
        self.current_changeset = changeset.clone();
        self.changeset = changeset;
        Ok(())
    }

    /// Every Run carries one record per stage, in pipeline order. Documents
    /// read back from storage are checked here before use.
    pub fn check_stages(&self) -> Result<()> {
        let well_formed = self.stages.len() == StageName::ALL.len()
            && self.stages.iter().zip(StageName::ALL).all(|(s, n)| s.name == n);
        if well_formed {
            Ok(())
        } else {
            Err(AfterburnerError::InvariantViolation(format!(
                "run {} has malformed stage records",
                self.id
            )))
        }
    }

    pub fn stage(&self, name: StageName) -> &StageRecord {
        // Indexing is safe: Run::new builds all four and loads go through check_stages.
        &self.stages[name as usize]
    }

    pub fn stage_mut(&mut self, name: StageName) -> &mut StageRecord {
        &mut self.stages[name as usize]
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn transition(&mut self, to: PipelineState) {
        self.transitions.push(StateTransition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        self.state = to;
        if self.status == RunStatus::Idle {
            self.status = RunStatus::Active;
        }
    }

    pub fn park(&mut self) {
        self.status = RunStatus::PendingExternal;
    }

    pub fn unpark(&mut self) {
        self.status = RunStatus::Active;
    }

    pub fn block(&mut self, reason: BlockReason) {
        self.transition(PipelineState::Blocked);
        self.status = RunStatus::Blocked;
        self.block_reason = Some(reason);
        self.finished_at = Some(Utc::now());
    }

    pub fn abort(&mut self, detail: impl Into<String>) {
        let stage = self.state.stage();
        if let Some(name) = stage {
            let rec = self.stage_mut(name);
            if !rec.state.is_settled() {
                rec.finish(StageState::Failed, Some("cancelled".to_string()));
            }
        }
        self.transition(PipelineState::Aborted);
        self.status = RunStatus::Aborted;
        self.block_reason = Some(BlockReason::new(
            FailureKind::CancellationObserved,
            stage,
            detail,
        ));
        self.finished_at = Some(Utc::now());
    }

    /// Stages that keep the Run from completing under `skippable` policy.
    pub fn completion_violations(&self, skippable: &[StageName]) -> Vec<String> {
        self.stages
            .iter()
            .filter_map(|s| match s.state {
                StageState::Passed => None,
                StageState::Skipped if skippable.contains(&s.name) => None,
                StageState::Skipped => Some(format!("required stage {} was skipped", s.name)),
                other => Some(format!("stage {} is {:?}", s.name, other)),
            })
            .collect()
    }

    pub fn complete(&mut self, skippable: &[StageName]) -> Result<()> {
        let violations = self.completion_violations(skippable);
        if !violations.is_empty() {
            return Err(AfterburnerError::InvariantViolation(violations.join("; ")));
        }
        self.transition(PipelineState::Summarized);
        self.status = RunStatus::Completed;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Terminal for an empty ChangeSet: no stage is entered.
    pub fn complete_without_changes(&mut self) {
        self.transition(PipelineState::Summarized);
        self.status = RunStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    /// Attach the Summary. Write-once.
    pub fn seal(&mut self, summary: Summary) -> Result<()> {
        if self.summary.is_some() {
            return Err(AfterburnerError::SummaryAlreadySealed {
                run_id: self.id.0.clone(),
            });
        }
        self.summary = Some(summary);
        Ok(())
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> Run {
        Run::new(RunId("r".into()), TriggerEvent::manual("/tmp/repo"))
    }

    #[test]
    fn new_run_has_one_pending_record_per_stage() {
        let r = run();
        assert_eq!(r.stages.len(), 4);
        for name in StageName::ALL {
            assert_eq!(r.stage(name).name, name);
            assert_eq!(r.stage(name).state, StageState::Pending);
        }
    }

    #[test]
    fn complete_requires_passed_or_skippable_stages() {
        let mut r = run();
        r.stage_mut(StageName::Security).skip("no source files");
        r.stage_mut(StageName::Test).skip("no tests");
        r.stage_mut(StageName::Git).skip("dry run");
        r.stage_mut(StageName::Launch).skip("no target");

        let skippable = [StageName::Security, StageName::Test, StageName::Launch];
        let err = r.complete(&skippable).unwrap_err();
        assert!(err.to_string().contains("git"));

        r.stage_mut(StageName::Git).state = StageState::Passed;
        r.complete(&skippable).unwrap();
        assert_eq!(r.status, RunStatus::Completed);
        assert_eq!(r.state, PipelineState::Summarized);
    }

    #[test]
    fn abort_fails_the_running_stage() {
        let mut r = run();
        r.transition(PipelineState::TestExecution);
        r.stage_mut(StageName::Test).begin();
        r.abort("ctrl-c");
        assert_eq!(r.status, RunStatus::Aborted);
        assert_eq!(r.stage(StageName::Test).state, StageState::Failed);
        assert_eq!(
            r.block_reason.as_ref().map(|b| b.kind),
            Some(FailureKind::CancellationObserved)
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExitStatus::Completed.exit_code(), 0);
        assert_eq!(ExitStatus::from_status(RunStatus::Active), None);
        assert_eq!(ExitStatus::PendingExternal.to_string(), "pending-external");
    }
}
