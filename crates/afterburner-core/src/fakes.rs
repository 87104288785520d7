//! Deterministic stubs for every external capability (testing only).
//!
//! Each fake replays a script and records what it was asked to do, so the
//! state machine and both controllers run without any real tool.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::capability::{
    Applicability, CallStatus, RawToolOutput, RawToolOutputs, RunContext, StageCapability,
    StageResult,
};
use crate::collaborators::{
    CommitInfo, DeployOutcome, DeployStatus, FailingCase, FixError, FixProposer, GitAdapter,
    LaunchAdapter, PrRequest, ReviewState, ScanFinding, SecurityScanner, SeverityTriage,
    TestReport, TestRunner, ToolError,
};
use crate::domain::{
    ChangeSet, FileChange, Finding, Result, Severity, StageName, StageRecord,
    Verdict,
};

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pop the next scripted item; the last one repeats forever.
fn next_or_last<T: Clone>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut q = locked(queue);
    if q.len() > 1 {
        q.pop_front()
    } else {
        q.front().cloned()
    }
}

// ---------------------------------------------------------------------------
// ScriptedStage
// ---------------------------------------------------------------------------

/// A `StageCapability` that replays canned `StageResult`s.
pub struct ScriptedStage {
    name: StageName,
    results: Mutex<VecDeque<StageResult>>,
    polls: Mutex<VecDeque<StageResult>>,
    applicability: Applicability,
    delay: Option<Duration>,
    seen: Mutex<Vec<ChangeSet>>,
}

impl ScriptedStage {
    pub fn new(name: StageName, results: Vec<StageResult>) -> Self {
        Self {
            name,
            results: Mutex::new(results.into()),
            polls: Mutex::new(VecDeque::new()),
            applicability: Applicability::Applicable,
            delay: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Always passes with no findings.
    pub fn passing(name: StageName) -> Self {
        Self::new(name, vec![StageResult::new(name, Vec::new(), Verdict::Pass)])
    }

    pub fn not_applicable(mut self, reason: impl Into<String>) -> Self {
        self.applicability = Applicability::NotApplicable(reason.into());
        self
    }

    /// Sleep before answering; pair with a short stage budget to force a timeout.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_polls(self, polls: Vec<StageResult>) -> Self {
        *locked(&self.polls) = polls.into();
        self
    }

    /// ChangeSets passed to `execute`, in call order.
    pub fn seen(&self) -> Vec<ChangeSet> {
        locked(&self.seen).clone()
    }

    pub fn calls(&self) -> usize {
        locked(&self.seen).len()
    }
}

#[async_trait]
impl StageCapability for ScriptedStage {
    fn name(&self) -> StageName {
        self.name
    }

    fn precheck(&self, _changeset: &ChangeSet, _ctx: &RunContext) -> Applicability {
        self.applicability.clone()
    }

    async fn execute(&self, changeset: &ChangeSet, ctx: &RunContext) -> Result<RawToolOutputs> {
        ctx.check_cancelled()?;
        locked(&self.seen).push(changeset.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = next_or_last(&self.results)
            .unwrap_or_else(|| StageResult::new(self.name, Vec::new(), Verdict::Pass));
        let mut raw = RawToolOutputs::new(self.name);
        raw.outputs.push(RawToolOutput {
            tool: "scripted".into(),
            status: CallStatus::Succeeded,
            payload: serde_json::to_value(result)?,
            elapsed_ms: 0,
        });
        Ok(raw)
    }

    async fn classify(&self, raw: RawToolOutputs, _ctx: &RunContext) -> StageResult {
        raw.outputs
            .into_iter()
            .next()
            .and_then(|o| serde_json::from_value(o.payload).ok())
            .unwrap_or_else(|| StageResult::new(self.name, Vec::new(), Verdict::Pass))
    }

    async fn poll_external(&self, _record: &StageRecord, _ctx: &RunContext) -> Result<StageResult> {
        Ok(next_or_last(&self.polls)
            .unwrap_or_else(|| StageResult::new(self.name, Vec::new(), Verdict::PendingExternal)))
    }
}

// ---------------------------------------------------------------------------
// Scanners and triage
// ---------------------------------------------------------------------------

pub struct ScriptedScanner {
    name: String,
    script: Mutex<VecDeque<std::result::Result<Vec<ScanFinding>, ToolError>>>,
    calls: Mutex<Vec<Vec<String>>>,
    delay: Option<Duration>,
}

impl ScriptedScanner {
    pub fn new(
        name: impl Into<String>,
        script: Vec<std::result::Result<Vec<ScanFinding>, ToolError>>,
    ) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn clean(name: impl Into<String>) -> Self {
        Self::new(name, vec![Ok(Vec::new())])
    }

    pub fn unavailable(name: impl Into<String>) -> Self {
        let name = name.into();
        let err = ToolError::NotInstalled { tool: name.clone() };
        Self::new(name, vec![Err(err)])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// File lists this scanner was called with.
    pub fn calls(&self) -> Vec<Vec<String>> {
        locked(&self.calls).clone()
    }
}

#[async_trait]
impl SecurityScanner for ScriptedScanner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(
        &self,
        _repo: &Path,
        files: &[String],
    ) -> std::result::Result<Vec<ScanFinding>, ToolError> {
        locked(&self.calls).push(files.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        next_or_last(&self.script).unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Build a raw scan finding; handy in test scripts.
pub fn scan_finding(
    tool: &str,
    severity: Severity,
    file: &str,
    line: u32,
    message: &str,
) -> ScanFinding {
    ScanFinding {
        tool: tool.to_string(),
        category: crate::domain::FindingCategory::CodeVulnerability,
        severity,
        file: Some(file.to_string()),
        line: Some(line),
        end_line: None,
        message: message.to_string(),
        rule_id: None,
    }
}

/// Triage that keeps the scanner's severity, optionally failing every call.
#[derive(Debug, Default)]
pub struct StaticTriage {
    fail: bool,
}

impl StaticTriage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl SeverityTriage for StaticTriage {
    async fn classify_severity(&self, raw: &ScanFinding) -> std::result::Result<Finding, ToolError> {
        if self.fail {
            return Err(ToolError::failed("triage", "classifier offline"));
        }
        Ok(raw.to_finding())
    }
}

// ---------------------------------------------------------------------------
// Test runner and fix proposer
// ---------------------------------------------------------------------------

pub struct ScriptedTestRunner {
    name: String,
    script: Mutex<VecDeque<std::result::Result<TestReport, ToolError>>>,
    runs: AtomicUsize,
}

impl ScriptedTestRunner {
    pub fn new(
        name: impl Into<String>,
        script: Vec<std::result::Result<TestReport, ToolError>>,
    ) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(script.into()),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

/// A report with `passed` green cases and the named failures.
pub fn test_report(framework: &str, passed: u32, failing: &[&str]) -> TestReport {
    TestReport {
        framework: framework.to_string(),
        passed,
        failed: failing.len() as u32,
        skipped: 0,
        failing_cases: failing
            .iter()
            .map(|name| FailingCase {
                name: name.to_string(),
                file: None,
                message: format!("{name} failed"),
            })
            .collect(),
    }
}

#[async_trait]
impl TestRunner for ScriptedTestRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, _repo: &Path) -> bool {
        true
    }

    async fn run(&self, _repo: &Path, _files: &[String]) -> std::result::Result<TestReport, ToolError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        next_or_last(&self.script).unwrap_or_else(|| Ok(test_report(&self.name, 0, &[])))
    }
}

#[derive(Debug, Clone)]
pub enum FixStep {
    /// Apply these file changes on top of the context ChangeSet.
    Patch(Vec<FileChange>),
    Fail(FixError),
}

pub struct ScriptedFixProposer {
    script: Mutex<VecDeque<FixStep>>,
    calls: Mutex<Vec<Vec<FailingCase>>>,
}

impl ScriptedFixProposer {
    pub fn new(script: Vec<FixStep>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        locked(&self.calls).len()
    }

    /// Failing cases handed to each call.
    pub fn requests(&self) -> Vec<Vec<FailingCase>> {
        locked(&self.calls).clone()
    }
}

#[async_trait]
impl FixProposer for ScriptedFixProposer {
    async fn propose_fix(
        &self,
        _repo: &Path,
        failing_cases: &[FailingCase],
        context: &ChangeSet,
    ) -> std::result::Result<ChangeSet, FixError> {
        locked(&self.calls).push(failing_cases.to_vec());
        match next_or_last(&self.script) {
            Some(FixStep::Patch(files)) => Ok(context.with_updates(files)),
            Some(FixStep::Fail(e)) => Err(e),
            None => Err(FixError::NoFixAvailable("script empty".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Git and launch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommit {
    pub branch: String,
    pub message: String,
    pub files: Vec<String>,
}

pub struct RecordingGitAdapter {
    commits: Mutex<Vec<RecordedCommit>>,
    prs: Mutex<Vec<PrRequest>>,
    reviews: Mutex<VecDeque<ReviewState>>,
    review_polls: AtomicUsize,
    commit_error: Option<ToolError>,
    pr_url: Option<String>,
}

impl Default for RecordingGitAdapter {
    fn default() -> Self {
        Self {
            commits: Mutex::new(Vec::new()),
            prs: Mutex::new(Vec::new()),
            reviews: Mutex::new(VecDeque::from(vec![ReviewState::Approved])),
            review_polls: AtomicUsize::new(0),
            commit_error: None,
            pr_url: Some("https://github.com/acme/app/pull/1".into()),
        }
    }
}

impl RecordingGitAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Review states returned by successive `review_state` polls.
    pub fn with_reviews(self, reviews: Vec<ReviewState>) -> Self {
        *locked(&self.reviews) = reviews.into();
        self
    }

    pub fn failing_commit(mut self, error: ToolError) -> Self {
        self.commit_error = Some(error);
        self
    }

    pub fn without_pr(mut self) -> Self {
        self.pr_url = None;
        self
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        locked(&self.commits).clone()
    }

    pub fn prs(&self) -> Vec<PrRequest> {
        locked(&self.prs).clone()
    }

    pub fn review_polls(&self) -> usize {
        self.review_polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GitAdapter for RecordingGitAdapter {
    async fn commit_and_branch(
        &self,
        _repo: &Path,
        changeset: &ChangeSet,
        branch: &str,
        message: &str,
    ) -> std::result::Result<CommitInfo, ToolError> {
        if let Some(e) = &self.commit_error {
            return Err(e.clone());
        }
        let mut commits = locked(&self.commits);
        commits.push(RecordedCommit {
            branch: branch.to_string(),
            message: message.to_string(),
            files: changeset.paths(),
        });
        Ok(CommitInfo {
            branch: branch.to_string(),
            commit_id: format!("{:07x}", commits.len()),
        })
    }

    async fn open_pr(
        &self,
        _repo: &Path,
        request: &PrRequest,
    ) -> std::result::Result<Option<String>, ToolError> {
        locked(&self.prs).push(request.clone());
        Ok(self.pr_url.clone())
    }

    async fn review_state(&self, _pr_url: &str) -> std::result::Result<ReviewState, ToolError> {
        self.review_polls.fetch_add(1, Ordering::SeqCst);
        Ok(next_or_last(&self.reviews).unwrap_or(ReviewState::Pending))
    }
}

pub struct RecordingLaunchAdapter {
    deploys: Mutex<Vec<String>>,
    outcome: DeployOutcome,
    manifest_error: Option<ToolError>,
}

impl Default for RecordingLaunchAdapter {
    fn default() -> Self {
        Self {
            deploys: Mutex::new(Vec::new()),
            outcome: DeployOutcome {
                status: DeployStatus::Success,
                url: Some("https://app.example.test".into()),
            },
            manifest_error: None,
        }
    }
}

impl RecordingLaunchAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(mut self, outcome: DeployOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn failing_manifest(mut self, error: ToolError) -> Self {
        self.manifest_error = Some(error);
        self
    }

    /// Targets deployed to, in call order.
    pub fn deploys(&self) -> Vec<String> {
        locked(&self.deploys).clone()
    }
}

#[async_trait]
impl LaunchAdapter for RecordingLaunchAdapter {
    async fn generate_ci_manifest(&self, repo: &Path) -> std::result::Result<PathBuf, ToolError> {
        match &self.manifest_error {
            Some(e) => Err(e.clone()),
            None => Ok(repo.join(".github/workflows/afterburner.yml")),
        }
    }

    async fn deploy(&self, _repo: &Path, target: &str) -> std::result::Result<DeployOutcome, ToolError> {
        locked(&self.deploys).push(target.to_string());
        Ok(self.outcome.clone())
    }
}
