//! End-to-end Runs against scripted collaborators and in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use afterburner_core::capability::RawToolOutputs;
use afterburner_core::domain::{ChangeStatus, FileChange, FindingCategory};
use afterburner_core::fakes::{
    scan_finding, test_report, FixStep, RecordingGitAdapter, RecordingLaunchAdapter,
    ScriptedFixProposer, ScriptedScanner, ScriptedStage, ScriptedTestRunner, StaticTriage,
};
use afterburner_core::{
    read_summary_artifact, AfterburnerError, Applicability, BaselineCommit, ChangeSet,
    ExitStatus, FailureKind, PipelineConfig, PipelineState, RetryKind, ReviewState,
    Result, RunContext, RunId, RunRepository, RunStatus, Severity, StageCapability, StageName,
    StageResult, StageState, TriggerEvent, Verdict,
};
use afterburner_pipeline::{GitStage, LaunchStage, Orchestrator, SecurityStage, StageSet, TestStage};
use afterburner_state::fakes::{MemoryBaselineStore, MemoryRunStore};
use afterburner_state::{BaselineStore, FingerprintMap};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    orchestrator: Arc<Orchestrator>,
    git: Arc<RecordingGitAdapter>,
    launch: Arc<RecordingLaunchAdapter>,
    runner: Arc<ScriptedTestRunner>,
    fixer: Arc<ScriptedFixProposer>,
    baselines: Arc<MemoryBaselineStore>,
}

struct Collaborators {
    scanner: ScriptedScanner,
    runner: ScriptedTestRunner,
    fixer: ScriptedFixProposer,
    git: RecordingGitAdapter,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            scanner: ScriptedScanner::clean("semgrep"),
            runner: ScriptedTestRunner::new("pytest", vec![Ok(test_report("pytest", 8, &[]))]),
            fixer: ScriptedFixProposer::new(Vec::new()),
            git: RecordingGitAdapter::new(),
        }
    }
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.launch.target = Some("vercel".into());
    config
}

fn harness(config: PipelineConfig, parts: Collaborators) -> Harness {
    let git = Arc::new(parts.git);
    let launch = Arc::new(RecordingLaunchAdapter::new());
    let runner = Arc::new(parts.runner);
    let fixer = Arc::new(parts.fixer);
    let baselines = Arc::new(MemoryBaselineStore::new());
    let stages = StageSet {
        security: Arc::new(SecurityStage::new(
            vec![Arc::new(parts.scanner)],
            Arc::new(StaticTriage::new()),
        )),
        test: Arc::new(TestStage::new(vec![runner.clone()])),
        git: Arc::new(GitStage::new(git.clone())),
        launch: Arc::new(LaunchStage::new(launch.clone())),
    };
    let orchestrator = Orchestrator::new(
        Arc::new(config),
        stages,
        fixer.clone(),
        RunRepository::new(Arc::new(MemoryRunStore::new())),
        baselines.clone(),
    );
    Harness {
        orchestrator: Arc::new(orchestrator),
        git,
        launch,
        runner,
        fixer,
        baselines,
    }
}

fn repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app.py"), "def add(a, b):\n    return a - b\n").unwrap();
    std::fs::write(
        dir.path().join("test_app.py"),
        "from app import add\n\ndef test_add():\n    assert add(1, 2) == 3\n",
    )
    .unwrap();
    dir
}

fn fix(fp: &str) -> FixStep {
    FixStep::Patch(vec![FileChange::new("app.py", fp, ChangeStatus::Modified)])
}

fn retries(run: &afterburner_core::Run, kind: RetryKind) -> usize {
    run.retry_history.iter().filter(|c| c.kind == kind).count()
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_run_completes_and_commits_baseline() {
    let dir = repo();
    let summaries = tempfile::tempdir().unwrap();
    let h = harness(config(), Collaborators::default());
    let orchestrator = rebuild(&h, config(), test_stage_set(&h)).with_summaries_dir(summaries.path());

    let outcome = orchestrator
        .run(TriggerEvent::manual(dir.path()))
        .await
        .unwrap();

    assert_eq!(outcome.exit, ExitStatus::Completed);
    assert_eq!(outcome.exit.exit_code(), 0);
    assert_eq!(outcome.run.status, RunStatus::Completed);
    assert_eq!(outcome.run.state, PipelineState::Summarized);
    for name in [StageName::Security, StageName::Test, StageName::Git, StageName::Launch] {
        assert_eq!(outcome.run.stage(name).state, StageState::Passed, "{name}");
    }
    assert_eq!(h.git.commits().len(), 1);
    assert_eq!(h.launch.deploys(), vec!["vercel".to_string()]);
    assert!(matches!(
        outcome.run.baseline_commit,
        BaselineCommit::Committed { version: 1, .. }
    ));
    assert!(outcome.run.identity.is_some());

    let stored = read_summary_artifact(&outcome.run.id.0, summaries.path()).unwrap();
    assert_eq!(stored, outcome.summary);
    assert_eq!(outcome.run.summary.as_ref(), Some(&outcome.summary));
}

#[tokio::test]
async fn high_security_finding_blocks_before_git() {
    let dir = repo();
    let h = harness(
        config(),
        Collaborators {
            scanner: ScriptedScanner::new(
                "semgrep",
                vec![Ok(vec![scan_finding(
                    "semgrep",
                    Severity::High,
                    "app.py",
                    2,
                    "SQL built from user input",
                )])],
            ),
            ..Collaborators::default()
        },
    );

    let outcome = h.orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();

    assert_eq!(outcome.exit, ExitStatus::Blocked);
    assert_eq!(outcome.exit.exit_code(), 2);
    let reason = outcome.run.block_reason.clone().unwrap();
    assert_eq!(reason.kind, FailureKind::GatingBreach);
    assert_eq!(reason.stage, Some(StageName::Security));
    assert_eq!(reason.findings.len(), 1);
    assert_eq!(outcome.run.stage(StageName::Security).state, StageState::Blocked);
    assert_eq!(outcome.run.stage(StageName::Test).state, StageState::Pending);
    assert!(h.git.commits().is_empty());
    assert!(h.launch.deploys().is_empty());
    assert_eq!(h.runner.runs(), 0);
    assert!(matches!(outcome.run.baseline_commit, BaselineCommit::NotAttempted));
    assert!(h.baselines.current(&TriggerEvent::manual(dir.path()).repo_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn failing_tests_self_debug_then_reflect_before_completing() {
    let dir = repo();
    let h = harness(
        config(),
        Collaborators {
            runner: ScriptedTestRunner::new(
                "pytest",
                vec![
                    Ok(test_report("pytest", 5, &["test_add", "test_sub", "test_mul"])),
                    Ok(test_report("pytest", 7, &["test_mul"])),
                    Ok(test_report("pytest", 8, &[])),
                ],
            ),
            fixer: ScriptedFixProposer::new(vec![fix("fix-1"), fix("fix-2")]),
            ..Collaborators::default()
        },
    );

    let outcome = h.orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();

    assert_eq!(outcome.exit, ExitStatus::Completed);
    assert_eq!(retries(&outcome.run, RetryKind::SelfDebug), 2);
    assert_eq!(retries(&outcome.run, RetryKind::Reflection), 1);
    assert_eq!(h.fixer.calls(), 2);
    assert_eq!(h.fixer.requests()[0].len(), 3);
    assert_eq!(h.runner.runs(), 3);

    let visited: Vec<PipelineState> = outcome.run.transitions.iter().map(|t| t.to).collect();
    assert!(visited.contains(&PipelineState::ReflectionLoop));
    assert_eq!(outcome.run.deltas.len(), 1);
    assert_eq!(outcome.run.deltas[0].paths(), vec!["app.py".to_string()]);
    assert_eq!(
        outcome.run.current_changeset.get("app.py").unwrap().fingerprint,
        "fix-2"
    );

    // Git commits the fixed code, not the code the Run started with.
    let commits = h.git.commits();
    assert_eq!(commits.len(), 1);
    assert!(commits[0].files.contains(&"app.py".to_string()));
    let test = outcome.run.stage(StageName::Test);
    assert_eq!(test.state, StageState::Passed);
    assert_eq!(test.attempts, 3);
}

#[tokio::test]
async fn unchanged_retry_short_circuits_and_blocks() {
    let dir = repo();
    let h = harness(
        config(),
        Collaborators {
            runner: ScriptedTestRunner::new(
                "pytest",
                vec![Ok(test_report("pytest", 5, &["test_add", "test_sub"]))],
            ),
            fixer: ScriptedFixProposer::new(vec![fix("fix-1")]),
            ..Collaborators::default()
        },
    );

    let outcome = h.orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();

    assert_eq!(outcome.exit, ExitStatus::Blocked);
    let reason = outcome.run.block_reason.clone().unwrap();
    assert_eq!(reason.kind, FailureKind::RetryExhausted);
    assert_eq!(reason.stage, Some(StageName::Test));
    assert_eq!(reason.findings.len(), 2);
    assert_eq!(retries(&outcome.run, RetryKind::SelfDebug), 1);
    // The mutated file was still re-audited before the block took effect.
    assert_eq!(retries(&outcome.run, RetryKind::Reflection), 1);
    assert!(outcome.run.pending_block.is_none());
    assert!(h.git.commits().is_empty());
}

#[tokio::test]
async fn declined_fix_blocks_without_reflection() {
    let dir = repo();
    let h = harness(
        config(),
        Collaborators {
            runner: ScriptedTestRunner::new("pytest", vec![Ok(test_report("pytest", 5, &["test_add"]))]),
            fixer: ScriptedFixProposer::new(vec![FixStep::Fail(
                afterburner_core::FixError::NoFixAvailable("no idea".into()),
            )]),
            ..Collaborators::default()
        },
    );

    let outcome = h.orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();

    let reason = outcome.run.block_reason.clone().unwrap();
    assert_eq!(reason.kind, FailureKind::ExternalRejection);
    assert_eq!(retries(&outcome.run, RetryKind::Reflection), 0);
    assert_eq!(outcome.run.stage(StageName::Test).attempts, 1);
}

#[tokio::test]
async fn critical_finding_in_fix_blocks_even_when_tests_pass() {
    let dir = repo();
    let h = harness(
        config(),
        Collaborators {
            scanner: ScriptedScanner::new(
                "semgrep",
                vec![
                    Ok(Vec::new()),
                    Ok(vec![scan_finding(
                        "semgrep",
                        Severity::Critical,
                        "app.py",
                        2,
                        "shell command built from user input",
                    )]),
                ],
            ),
            runner: ScriptedTestRunner::new(
                "pytest",
                vec![
                    Ok(test_report("pytest", 7, &["test_add"])),
                    Ok(test_report("pytest", 8, &[])),
                ],
            ),
            fixer: ScriptedFixProposer::new(vec![fix("fix-1")]),
            ..Collaborators::default()
        },
    );

    let outcome = h.orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();

    assert_eq!(outcome.exit, ExitStatus::Blocked);
    let reason = outcome.run.block_reason.clone().unwrap();
    assert_eq!(reason.kind, FailureKind::GatingBreach);
    assert_eq!(reason.stage, Some(StageName::Security));
    assert!(reason
        .findings
        .iter()
        .any(|f| f.severity == Severity::Critical));
    assert_eq!(retries(&outcome.run, RetryKind::SelfDebug), 1);
    assert_eq!(retries(&outcome.run, RetryKind::Reflection), 1);
    assert!(h.git.commits().is_empty());
    assert!(h.launch.deploys().is_empty());
    assert!(matches!(outcome.run.baseline_commit, BaselineCommit::NotAttempted));
}

#[tokio::test]
async fn unchanged_repository_completes_without_entering_stages() {
    let dir = repo();
    let h = harness(config(), Collaborators::default());

    let first = h.orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();
    assert_eq!(first.exit, ExitStatus::Completed);

    let second = h.orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();
    assert_eq!(second.exit, ExitStatus::Completed);
    let visited: Vec<PipelineState> = second.run.transitions.iter().map(|t| t.to).collect();
    assert_eq!(visited, vec![PipelineState::Detecting, PipelineState::Summarized]);
    assert!(second
        .run
        .stages
        .iter()
        .all(|s| s.state == StageState::Pending));
    assert!(second.run.changeset.is_empty());
    assert!(matches!(second.run.baseline_commit, BaselineCommit::NotAttempted));
    assert!(second.summary.is_empty());
    assert!(second.summary.stages.is_empty());
    assert_eq!(h.git.commits().len(), 1);
}

#[tokio::test]
async fn stage_over_budget_blocks_as_tool_unavailable() {
    let dir = repo();
    let mut config = config();
    config.timeouts.security_secs = 1;
    let h = harness(
        config,
        Collaborators {
            scanner: ScriptedScanner::clean("semgrep").with_delay(Duration::from_secs(10)),
            ..Collaborators::default()
        },
    );

    let outcome = h.orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();

    let reason = outcome.run.block_reason.clone().unwrap();
    assert_eq!(reason.kind, FailureKind::ToolUnavailable);
    assert_eq!(reason.stage, Some(StageName::Security));
    assert!(reason
        .findings
        .iter()
        .any(|f| f.category == FindingCategory::Timeout));
    assert_eq!(outcome.run.stage(StageName::Security).state, StageState::Failed);
}

#[tokio::test]
async fn required_git_stage_cannot_be_skipped() {
    let dir = repo();
    let h = harness(config(), Collaborators::default());
    let stages = StageSet {
        git: Arc::new(ScriptedStage::passing(StageName::Git).not_applicable("no repository")),
        ..test_stage_set(&h)
    };
    let orchestrator = rebuild(&h, config(), stages);

    let outcome = orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();

    let reason = outcome.run.block_reason.clone().unwrap();
    assert_eq!(reason.kind, FailureKind::GatingBreach);
    assert_eq!(reason.stage, Some(StageName::Git));
    assert_eq!(outcome.run.stage(StageName::Git).state, StageState::Skipped);
    assert!(h.launch.deploys().is_empty());
}

#[tokio::test]
async fn skipped_launch_still_completes() {
    let dir = repo();
    let mut config = config();
    config.launch.skip = true;
    let h = harness(config, Collaborators::default());

    let outcome = h.orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();

    assert_eq!(outcome.exit, ExitStatus::Completed);
    assert_eq!(outcome.run.stage(StageName::Launch).state, StageState::Skipped);
    assert!(h.launch.deploys().is_empty());
}

// ---------------------------------------------------------------------------
// Cancellation, parking, baseline races
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_aborts_mid_stage() {
    let dir = repo();
    let h = harness(
        config(),
        Collaborators {
            scanner: ScriptedScanner::clean("semgrep").with_delay(Duration::from_secs(30)),
            ..Collaborators::default()
        },
    );
    let id = RunId::from("cancel-me");
    let orchestrator = h.orchestrator.clone();
    let trigger = TriggerEvent::manual(dir.path());
    let run_id = id.clone();
    let task = tokio::spawn(async move { orchestrator.run_with_id(run_id, trigger).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.orchestrator.cancel(&id).await.unwrap());
    let outcome = task.await.unwrap().unwrap();

    assert_eq!(outcome.exit, ExitStatus::Aborted);
    assert_eq!(outcome.exit.exit_code(), 130);
    assert_eq!(outcome.run.state, PipelineState::Aborted);
    let reason = outcome.run.block_reason.clone().unwrap();
    assert_eq!(reason.kind, FailureKind::CancellationObserved);
    assert_eq!(reason.stage, Some(StageName::Security));
    assert_eq!(outcome.run.stage(StageName::Security).state, StageState::Failed);
    assert!(outcome.run.summary.is_some());
    assert!(h.git.commits().is_empty());

    // Nothing left to cancel.
    assert!(!h.orchestrator.cancel(&id).await.unwrap());
}

#[tokio::test]
async fn parked_run_resumes_after_approval() {
    let dir = repo();
    let mut config = config();
    config.git.require_pr_approval = true;
    let h = harness(
        config,
        Collaborators {
            git: RecordingGitAdapter::new()
                .with_reviews(vec![ReviewState::Pending, ReviewState::Approved]),
            ..Collaborators::default()
        },
    );

    let parked = h.orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();
    assert_eq!(parked.exit, ExitStatus::PendingExternal);
    assert_eq!(parked.exit.exit_code(), 3);
    assert_eq!(parked.run.state, PipelineState::GitOperations);
    assert_eq!(parked.run.stage(StageName::Git).state, StageState::AwaitingExternal);
    assert!(parked.run.summary.is_none());
    assert!(h.launch.deploys().is_empty());

    let id = parked.run.id.clone();
    let still = h.orchestrator.resume(&id).await.unwrap();
    assert_eq!(still.exit, ExitStatus::PendingExternal);

    let done = h.orchestrator.resume(&id).await.unwrap();
    assert_eq!(done.exit, ExitStatus::Completed);
    assert_eq!(done.run.stage(StageName::Git).state, StageState::Passed);
    assert_eq!(h.git.review_polls(), 2);
    assert_eq!(h.launch.deploys().len(), 1);
    assert!(matches!(done.run.baseline_commit, BaselineCommit::Committed { .. }));

    let err = h.orchestrator.resume(&id).await.unwrap_err();
    assert!(matches!(err, AfterburnerError::NotResumable { .. }));
}

#[tokio::test]
async fn rejected_review_blocks_parked_run() {
    let dir = repo();
    let mut config = config();
    config.git.require_pr_approval = true;
    let h = harness(
        config,
        Collaborators {
            git: RecordingGitAdapter::new().with_reviews(vec![ReviewState::Rejected {
                reason: "changes requested by ana".into(),
            }]),
            ..Collaborators::default()
        },
    );

    let parked = h.orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();
    let outcome = h.orchestrator.resume(&parked.run.id).await.unwrap();

    assert_eq!(outcome.exit, ExitStatus::Blocked);
    let reason = outcome.run.block_reason.clone().unwrap();
    assert_eq!(reason.kind, FailureKind::ExternalRejection);
    assert_eq!(reason.stage, Some(StageName::Git));
}

#[tokio::test]
async fn cancelling_a_parked_run_aborts_it() {
    let dir = repo();
    let mut config = config();
    config.git.require_pr_approval = true;
    let h = harness(
        config,
        Collaborators {
            git: RecordingGitAdapter::new().with_reviews(vec![ReviewState::Pending]),
            ..Collaborators::default()
        },
    );

    let parked = h.orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();
    assert!(h.orchestrator.cancel(&parked.run.id).await.unwrap());

    let stored = h.orchestrator.runs().load(&parked.run.id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Aborted);
    assert!(stored.summary.is_some());
}

/// Advances the baseline behind the Run's back while "deploying".
struct Interloper {
    baselines: Arc<MemoryBaselineStore>,
    repo_key: String,
}

#[async_trait]
impl StageCapability for Interloper {
    fn name(&self) -> StageName {
        StageName::Launch
    }

    fn precheck(&self, _changeset: &ChangeSet, _ctx: &RunContext) -> Applicability {
        Applicability::Applicable
    }

    async fn execute(&self, _changeset: &ChangeSet, _ctx: &RunContext) -> Result<RawToolOutputs> {
        let mut fingerprints = FingerprintMap::new();
        fingerprints.insert("other.py".into(), "elsewhere".into());
        self.baselines
            .compare_and_swap(&self.repo_key, None, fingerprints, None)
            .await?;
        Ok(RawToolOutputs::new(StageName::Launch))
    }

    async fn classify(&self, _raw: RawToolOutputs, _ctx: &RunContext) -> StageResult {
        StageResult::new(StageName::Launch, Vec::new(), Verdict::Pass)
    }
}

#[tokio::test]
async fn stale_baseline_requires_a_fresh_run() {
    let dir = repo();
    let h = harness(config(), Collaborators::default());
    let repo_key = TriggerEvent::manual(dir.path()).repo_key();
    let stages = StageSet {
        launch: Arc::new(Interloper {
            baselines: h.baselines.clone(),
            repo_key: repo_key.clone(),
        }),
        ..test_stage_set(&h)
    };
    let orchestrator = rebuild(&h, config(), stages);

    let outcome = orchestrator.run(TriggerEvent::manual(dir.path())).await.unwrap();

    assert_eq!(outcome.run.status, RunStatus::Completed);
    assert!(outcome.requires_fresh_run);
    assert!(matches!(outcome.run.baseline_commit, BaselineCommit::Stale { .. }));
    let current = h.baselines.current(&repo_key).await.unwrap().unwrap();
    assert_eq!(current.version, 1);
    assert!(current.fingerprints.contains_key("other.py"));
    assert!(!current.fingerprints.contains_key("app.py"));
}

// ---------------------------------------------------------------------------
// Helpers sharing the harness stores
// ---------------------------------------------------------------------------

fn test_stage_set(h: &Harness) -> StageSet {
    StageSet {
        security: Arc::new(SecurityStage::new(
            vec![Arc::new(ScriptedScanner::clean("semgrep"))],
            Arc::new(StaticTriage::new()),
        )),
        test: Arc::new(TestStage::new(vec![h.runner.clone()])),
        git: Arc::new(GitStage::new(h.git.clone())),
        launch: Arc::new(LaunchStage::new(h.launch.clone())),
    }
}

fn rebuild(h: &Harness, config: PipelineConfig, stages: StageSet) -> Orchestrator {
    Orchestrator::new(
        Arc::new(config),
        stages,
        h.fixer.clone(),
        RunRepository::new(Arc::new(MemoryRunStore::new())),
        h.baselines.clone(),
    )
}
