//! Pipeline orchestration.
//!
//! The orchestrator owns the Run. It walks the state machine in
//! [`crate::state`], runs each stage through its [`StageCapability`],
//! hands failing tests to the self-debug controller and mutated code to the
//! reflection controller, persists the Run after every transition and
//! finally advances the repository baseline and seals the Summary.
//!
//! Cancellation is observed at every stage boundary and inside fan-outs;
//! either way the Run ends `Aborted` with its partial records intact.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn, Instrument};

use afterburner_core::aggregator::blocking_findings;
use afterburner_core::domain::FindingCategory;
use afterburner_core::metrics::METRICS;
use afterburner_core::{
    build_summary, cancel_pair, obs, resolve_changeset, run_stage, should_reflect,
    write_summary_artifact, AfterburnerError, Applicability, BaselineCommit, BlockReason,
    CancelHandle, CancelSignal, ExitStatus, FailureKind, Finding, FixProposer, PipelineConfig,
    PipelineState, ReflectionController, ReflectionTerminal, Result, Run, RunContext, RunId,
    RunRepository, RunStatus, SelfDebugController, SelfDebugTerminal, StageCapability, StageName,
    StageResult, StageState, Summary, TriggerEvent, Verdict,
};
use afterburner_state::{BaselineStore, FingerprintMap, StorageError};

use crate::gate::CompletionGate;
use crate::spec::RunSpec;
use crate::state::{next_state, StepOutcome};

/// The four stage capabilities a Run walks through.
#[derive(Clone)]
pub struct StageSet {
    pub security: Arc<dyn StageCapability>,
    pub test: Arc<dyn StageCapability>,
    pub git: Arc<dyn StageCapability>,
    pub launch: Arc<dyn StageCapability>,
}

impl StageSet {
    pub fn get(&self, name: StageName) -> &dyn StageCapability {
        match name {
            StageName::Security => self.security.as_ref(),
            StageName::Test => self.test.as_ref(),
            StageName::Git => self.git.as_ref(),
            StageName::Launch => self.launch.as_ref(),
        }
    }
}

/// Where a Run ended up after `run`, `resume` or `cancel`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: Run,
    pub summary: Summary,
    pub exit: ExitStatus,
    /// The baseline moved under this Run; its changes were not committed.
    pub requires_fresh_run: bool,
}

/// What one state handler decided.
enum Step {
    Next(StepOutcome),
    Block(BlockReason),
    Park,
}

pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    stages: StageSet,
    fixer: Arc<dyn FixProposer>,
    runs: RunRepository,
    baselines: Arc<dyn BaselineStore>,
    summaries_dir: Option<PathBuf>,
    live: Mutex<HashMap<RunId, CancelHandle>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        stages: StageSet,
        fixer: Arc<dyn FixProposer>,
        runs: RunRepository,
        baselines: Arc<dyn BaselineStore>,
    ) -> Self {
        Self {
            config,
            stages,
            fixer,
            runs,
            baselines,
            summaries_dir: None,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Also write every sealed Summary as `<dir>/<run_id>.json`.
    pub fn with_summaries_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.summaries_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn runs(&self) -> &RunRepository {
        &self.runs
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    pub async fn run(&self, trigger: TriggerEvent) -> Result<RunOutcome> {
        self.run_with_id(RunId::new(), trigger).await
    }

    /// Start a Run under a caller-chosen id, so it can be cancelled while
    /// it is still in flight.
    pub async fn run_with_id(&self, id: RunId, trigger: TriggerEvent) -> Result<RunOutcome> {
        let signal = self.register(&id);
        let span = obs::run_span(&id.0);
        let outcome = self.start(id.clone(), trigger, signal).instrument(span).await;
        self.deregister(&id);
        outcome
    }

    /// Re-check a Run parked on external approval.
    pub async fn resume(&self, id: &RunId) -> Result<RunOutcome> {
        let mut run = self.runs.load(id).await?;
        if run.status != RunStatus::PendingExternal {
            return Err(AfterburnerError::NotResumable {
                run_id: id.0.clone(),
                status: run.status.as_str().to_string(),
            });
        }
        let signal = self.register(id);
        let span = obs::run_span(&id.0);
        let outcome = async {
            let ctx = self.context(&run, signal);
            let name = run.state.stage().ok_or_else(|| {
                AfterburnerError::InvariantViolation(format!(
                    "run {} parked outside a stage ({})",
                    run.id, run.state
                ))
            })?;
            info!(run_id = %run.id, stage = %name, "resuming parked run");
            run.unpark();
            self.begin(&mut run, name);
            let record = run.stage(name).clone();
            let step = match self.stages.get(name).poll_external(&record, &ctx).await {
                Ok(result) => Ok(self.settle(&mut run, result)),
                Err(e) => Err(e),
            };
            self.apply(&mut run, step)?;
            self.persist(&run).await;
            self.drive(&mut run, &ctx).await?;
            self.finalize(run).await
        }
        .instrument(span)
        .await;
        self.deregister(id);
        outcome
    }

    /// Cancel an in-flight Run, or abort a parked one.
    ///
    /// Returns `false` when the Run is neither live nor parked.
    pub async fn cancel(&self, id: &RunId) -> Result<bool> {
        let live = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        if let Some(handle) = live {
            info!(run_id = %id, "cancellation requested");
            handle.cancel();
            return Ok(true);
        }
        match self.runs.load(id).await {
            Ok(run) if run.status == RunStatus::PendingExternal => {
                self.abort_parked(id).await?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(AfterburnerError::Storage(StorageError::RunNotFound { .. })) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Abort a Run parked on external approval.
    pub async fn abort_parked(&self, id: &RunId) -> Result<RunOutcome> {
        let mut run = self.runs.load(id).await?;
        if run.status != RunStatus::PendingExternal {
            return Err(AfterburnerError::NotResumable {
                run_id: id.0.clone(),
                status: run.status.as_str().to_string(),
            });
        }
        self.abort(&mut run, "aborted while awaiting external approval")?;
        self.finalize(run).await
    }

    // ------------------------------------------------------------------
    // Drive loop
    // ------------------------------------------------------------------

    async fn start(&self, id: RunId, trigger: TriggerEvent, signal: CancelSignal) -> Result<RunOutcome> {
        let mut run = Run::new(id, trigger);
        METRICS.inc_runs_started();
        obs::emit_run_started(
            &run.id.0,
            &run.repo_path.display().to_string(),
            &run.trigger.kind.to_string(),
        );
        let ctx = self.context(&run, signal);
        self.advance(&mut run, StepOutcome::Start)?;
        self.persist(&run).await;
        self.drive(&mut run, &ctx).await?;
        self.finalize(run).await
    }

    async fn drive(&self, run: &mut Run, ctx: &RunContext) -> Result<()> {
        loop {
            if run.is_terminal() || run.status == RunStatus::PendingExternal {
                return Ok(());
            }
            if ctx.cancel.is_cancelled() {
                self.abort(run, "cancellation observed at stage boundary")?;
                self.persist(run).await;
                return Ok(());
            }
            let step = match run.state {
                PipelineState::Detecting => self.detect(run).await,
                PipelineState::SecurityReview => self.plain_stage(run, ctx, StageName::Security).await,
                PipelineState::TestExecution => self.test_execution(run, ctx).await,
                PipelineState::ReflectionLoop => self.reflection_loop(run, ctx).await,
                PipelineState::GitOperations => self.plain_stage(run, ctx, StageName::Git).await,
                PipelineState::Deployment => self.plain_stage(run, ctx, StageName::Launch).await,
                other => Err(AfterburnerError::InvalidTransition {
                    from: other.to_string(),
                    outcome: "drive".to_string(),
                }),
            };
            self.apply(run, step)?;
            self.persist(run).await;
        }
    }

    fn apply(&self, run: &mut Run, step: Result<Step>) -> Result<()> {
        match step {
            Ok(Step::Next(outcome)) => self.advance(run, outcome),
            Ok(Step::Block(reason)) => self.block(run, reason),
            Ok(Step::Park) => self.park(run),
            Err(AfterburnerError::Cancelled) => self.abort(run, "cancellation observed during stage"),
            Err(e) => Err(e),
        }
    }

    fn advance(&self, run: &mut Run, outcome: StepOutcome) -> Result<()> {
        let to = next_state(run.state, outcome)?;
        if to != PipelineState::Summarized {
            obs::emit_state_transition(&run.id.0, run.state, to);
            run.transition(to);
            return Ok(());
        }
        if outcome == StepOutcome::NoChanges {
            obs::emit_state_transition(&run.id.0, run.state, to);
            run.complete_without_changes();
            return Ok(());
        }
        let gate = CompletionGate::evaluate(run, &self.config.skippable_stages);
        if !gate.passed {
            return self.block(
                run,
                BlockReason::new(FailureKind::GatingBreach, None, gate.violations.join("; ")),
            );
        }
        obs::emit_state_transition(&run.id.0, run.state, to);
        run.complete(&self.config.skippable_stages)
    }

    fn block(&self, run: &mut Run, reason: BlockReason) -> Result<()> {
        let to = next_state(run.state, StepOutcome::Block)?;
        obs::emit_state_transition(&run.id.0, run.state, to);
        warn!(
            run_id = %run.id,
            kind = ?reason.kind,
            stage = ?reason.stage,
            detail = %reason.detail,
            "run blocked"
        );
        run.block(reason);
        Ok(())
    }

    fn abort(&self, run: &mut Run, detail: &str) -> Result<()> {
        let to = next_state(run.state, StepOutcome::Abort)?;
        obs::emit_state_transition(&run.id.0, run.state, to);
        run.abort(detail);
        Ok(())
    }

    fn park(&self, run: &mut Run) -> Result<()> {
        next_state(run.state, StepOutcome::Park)?;
        info!(run_id = %run.id, state = %run.state, "run parked on external approval");
        run.park();
        Ok(())
    }

    // ------------------------------------------------------------------
    // State handlers
    // ------------------------------------------------------------------

    async fn detect(&self, run: &mut Run) -> Result<Step> {
        let repo_key = run.trigger.repo_key();
        let baseline = match self.baselines.current(&repo_key).await {
            Ok(b) => b,
            Err(e) => {
                return Ok(Step::Block(BlockReason::new(
                    FailureKind::ToolUnavailable,
                    None,
                    format!("baseline store unavailable: {e}"),
                )))
            }
        };
        run.baseline_digest = baseline.as_ref().map(|b| b.digest.clone());

        match resolve_changeset(&run.trigger, baseline.as_ref().map(|b| &b.fingerprints)) {
            Ok(changeset) => {
                let spec = RunSpec::new(
                    run.repo_path.clone(),
                    run.trigger.kind,
                    &changeset,
                    &self.config.gating,
                )?;
                run.identity = Some(spec.identity());
                info!(run_id = %run.id, files = changeset.len(), "changeset resolved");
                run.set_changeset(changeset)?;
                Ok(Step::Next(StepOutcome::Changes))
            }
            Err(AfterburnerError::NoChangesDetected { .. }) => {
                info!(run_id = %run.id, "no changes since baseline");
                Ok(Step::Next(StepOutcome::NoChanges))
            }
            Err(AfterburnerError::Io(e)) => Ok(Step::Block(BlockReason::new(
                FailureKind::ToolUnavailable,
                None,
                format!("cannot read repository: {e}"),
            ))),
            Err(e) => Err(e),
        }
    }

    /// Security, Git and Launch: precheck, run, gate.
    async fn plain_stage(&self, run: &mut Run, ctx: &RunContext, name: StageName) -> Result<Step> {
        let stage = self.stages.get(name);
        let changeset = run.current_changeset.clone();
        if let Applicability::NotApplicable(reason) = stage.precheck(&changeset, ctx) {
            return Ok(self.skip(run, name, &reason));
        }
        self.begin(run, name);
        let result = run_stage(stage, &changeset, ctx).await?;
        Ok(self.settle(run, result))
    }

    async fn test_execution(&self, run: &mut Run, ctx: &RunContext) -> Result<Step> {
        let stage = self.stages.test.as_ref();
        let entering = run.current_changeset.clone();
        if let Applicability::NotApplicable(reason) = stage.precheck(&entering, ctx) {
            return Ok(self.skip(run, StageName::Test, &reason));
        }
        self.begin(run, StageName::Test);
        let result = run_stage(stage, &entering, ctx).await?;

        let has_failing_cases =
            result.tally.as_ref().is_some_and(|t| t.failed > 0) && !result.all_tools_failed();
        if result.verdict != Verdict::Fail || !has_failing_cases {
            return Ok(self.settle(run, result));
        }

        let outcome = SelfDebugController::new(stage, self.fixer.as_ref(), self.config.retry.max_self_debug)
            .run(result, entering.clone(), ctx)
            .await?;
        run.retry_history.extend(outcome.cycles.iter().cloned());
        // The last attempt of a declined fix never re-ran the tests.
        let reruns = match outcome.terminal {
            SelfDebugTerminal::Rejected | SelfDebugTerminal::Unavailable => {
                outcome.attempts.saturating_sub(1)
            }
            _ => outcome.attempts,
        };
        run.stage_mut(StageName::Test).attempts += reruns;
        run.current_changeset = outcome.changeset.clone();

        let kind = match outcome.terminal {
            SelfDebugTerminal::Resolved => None,
            SelfDebugTerminal::Exhausted => Some(FailureKind::RetryExhausted),
            SelfDebugTerminal::Rejected => Some(FailureKind::ExternalRejection),
            SelfDebugTerminal::Unavailable => Some(FailureKind::ToolUnavailable),
        };
        let step = match kind {
            None => self.settle(run, outcome.result.clone()),
            Some(kind) => {
                let detail = outcome.detail.clone().unwrap_or_else(|| {
                    format!("self-debug ended after {} attempt(s)", outcome.attempts)
                });
                let findings: Vec<Finding> = outcome
                    .result
                    .findings
                    .iter()
                    .filter(|f| f.category == FindingCategory::TestFailure && !f.is_duplicate())
                    .cloned()
                    .collect();
                let record = run.stage_mut(StageName::Test);
                outcome.result.apply_to(record);
                record.finish(StageState::Blocked, Some(detail.clone()));
                self.finished(run, StageName::Test);
                Step::Block(BlockReason::new(kind, Some(StageName::Test), detail).with_findings(findings))
            }
        };

        if !should_reflect(&entering, &run.current_changeset) {
            return Ok(step);
        }
        run.deltas.push(entering.delta(&run.current_changeset));
        match step {
            Step::Next(StepOutcome::Pass) => Ok(Step::Next(StepOutcome::Reflect)),
            Step::Block(reason) => {
                // Mutated code is re-audited first; security outranks tests.
                run.pending_block = Some(reason);
                Ok(Step::Next(StepOutcome::Reflect))
            }
            other => Ok(other),
        }
    }

    async fn reflection_loop(&self, run: &mut Run, ctx: &RunContext) -> Result<Step> {
        let delta = run.deltas.last().cloned().unwrap_or_default();
        let previous = run.stage(StageName::Security).findings.clone();
        self.begin(run, StageName::Security);

        let outcome = ReflectionController::new(self.stages.security.as_ref(), self.config.retry.max_reflection)
            .run(&previous, &delta, ctx)
            .await?;
        run.retry_history.extend(outcome.cycles.iter().cloned());

        let threshold = self.config.gating.threshold;
        run.stage_mut(StageName::Security).findings = outcome.findings.clone();
        let step = match outcome.terminal {
            ReflectionTerminal::Regressed => {
                let detail = format!(
                    "{} finding(s) introduced by fix attempts",
                    outcome.regressions.len()
                );
                run.stage_mut(StageName::Security)
                    .finish(StageState::Blocked, Some(detail.clone()));
                if let Some(dropped) = run.pending_block.take() {
                    info!(run_id = %run.id, kind = ?dropped.kind, "security regression supersedes test block");
                }
                Step::Block(
                    BlockReason::new(FailureKind::GatingBreach, Some(StageName::Security), detail)
                        .with_findings(outcome.regressions.clone()),
                )
            }
            ReflectionTerminal::GatingBreach => {
                let findings = blocking_findings(&outcome.findings, threshold);
                let detail = format!("{} blocking finding(s) after re-audit", findings.len());
                run.stage_mut(StageName::Security)
                    .finish(StageState::Blocked, Some(detail.clone()));
                run.pending_block = None;
                Step::Block(
                    BlockReason::new(FailureKind::GatingBreach, Some(StageName::Security), detail)
                        .with_findings(findings),
                )
            }
            ReflectionTerminal::PassThrough => {
                match run.stage_mut(StageName::Security).pass(threshold) {
                    Ok(()) => match run.pending_block.take() {
                        Some(reason) => Step::Block(reason),
                        None => Step::Next(StepOutcome::Pass),
                    },
                    Err(e) => Step::Block(
                        BlockReason::new(FailureKind::GatingBreach, Some(StageName::Security), e.to_string())
                            .with_findings(blocking_findings(&outcome.findings, threshold)),
                    ),
                }
            }
        };
        self.finished(run, StageName::Security);
        Ok(step)
    }

    // ------------------------------------------------------------------
    // Stage bookkeeping
    // ------------------------------------------------------------------

    fn context(&self, run: &Run, signal: CancelSignal) -> RunContext {
        RunContext::new(run.id.clone(), run.repo_path.clone(), self.config.clone(), signal)
    }

    fn begin(&self, run: &mut Run, name: StageName) {
        let record = run.stage_mut(name);
        record.begin();
        let attempt = record.attempts;
        obs::emit_stage_entered(&run.id.0, name, attempt);
    }

    fn finished(&self, run: &Run, name: StageName) {
        let record = run.stage(name);
        obs::emit_stage_finished(&run.id.0, name, record.state, record.findings.len());
    }

    /// A stage with nothing to do. Only skippable stages let the Run go on.
    fn skip(&self, run: &mut Run, name: StageName, reason: &str) -> Step {
        run.stage_mut(name).skip(reason);
        obs::emit_stage_skipped(&run.id.0, name, reason);
        if self.config.skippable_stages.contains(&name) {
            return Step::Next(StepOutcome::Pass);
        }
        Step::Block(BlockReason::new(
            FailureKind::GatingBreach,
            Some(name),
            format!("required stage {name} not applicable: {reason}"),
        ))
    }

    /// Record a stage result and turn its verdict into a step.
    fn settle(&self, run: &mut Run, result: StageResult) -> Step {
        let name = result.stage;
        let threshold = self.config.gating.threshold;
        let blocking = blocking_findings(&result.findings, threshold);
        obs::emit_gate_evaluated(&run.id.0, name, result.verdict, blocking.len());
        result.apply_to(run.stage_mut(name));

        let step = match result.verdict {
            Verdict::Pass => match run.stage_mut(name).pass(threshold) {
                Ok(()) => Step::Next(StepOutcome::Pass),
                Err(e) => {
                    run.stage_mut(name).finish(StageState::Blocked, None);
                    Step::Block(
                        BlockReason::new(FailureKind::GatingBreach, Some(name), e.to_string())
                            .with_findings(blocking),
                    )
                }
            },
            Verdict::PendingExternal => {
                run.stage_mut(name)
                    .finish(StageState::AwaitingExternal, result.note.clone());
                Step::Park
            }
            Verdict::Fail => {
                let reason = failure_reason(&result, threshold);
                let state = if reason.kind == FailureKind::ToolUnavailable {
                    StageState::Failed
                } else {
                    StageState::Blocked
                };
                run.stage_mut(name).finish(state, result.note.clone());
                Step::Block(reason)
            }
        };
        self.finished(run, name);
        step
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    async fn finalize(&self, mut run: Run) -> Result<RunOutcome> {
        let mut requires_fresh_run = false;
        if run.status == RunStatus::Completed && !run.changeset.is_empty() {
            run.baseline_commit = self.commit_baseline(&run).await;
            requires_fresh_run = matches!(run.baseline_commit, BaselineCommit::Stale { .. });
        }

        let summary = build_summary(&run)?;
        if run.is_terminal() {
            run.seal(summary.clone())?;
            if let Some(dir) = &self.summaries_dir {
                if let Err(e) = write_summary_artifact(&summary, dir) {
                    warn!(run_id = %run.id, dir = %dir.display(), error = %e, "could not write summary artifact");
                }
            }
            match run.status {
                RunStatus::Completed => METRICS.inc_runs_completed(),
                RunStatus::Blocked => METRICS.inc_runs_blocked(),
                RunStatus::Aborted => METRICS.inc_runs_aborted(),
                _ => {}
            }
        }
        obs::emit_run_finished(&run.id.0, run.status.as_str(), run.duration_ms());
        self.persist(&run).await;

        Ok(RunOutcome {
            exit: summary.overall_status,
            summary,
            run,
            requires_fresh_run,
        })
    }

    /// Compare-and-swap the baseline from the digest this Run started on.
    async fn commit_baseline(&self, run: &Run) -> BaselineCommit {
        let repo_key = run.trigger.repo_key();
        let expected = run.baseline_digest.clone();
        let base = match self.baselines.current(&repo_key).await {
            Ok(Some(record)) if Some(&record.digest) == expected.as_ref() => record.fingerprints,
            Ok(_) => FingerprintMap::new(),
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "baseline read failed");
                return BaselineCommit::Failed {
                    detail: e.to_string(),
                };
            }
        };
        let fingerprints = run.current_changeset.apply_to(&base);

        match self
            .baselines
            .compare_and_swap(&repo_key, expected.as_ref(), fingerprints, Some(run.id.clone()))
            .await
        {
            Ok(record) => {
                obs::emit_baseline_committed(&run.id.0, &repo_key, record.version, record.digest.as_str());
                BaselineCommit::Committed {
                    version: record.version,
                    digest: record.digest.as_str().to_string(),
                }
            }
            Err(e @ StorageError::StaleBaseline { .. }) => {
                obs::emit_baseline_stale(&run.id.0, &repo_key, &e);
                BaselineCommit::Stale {
                    detail: e.to_string(),
                }
            }
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "baseline commit failed");
                BaselineCommit::Failed {
                    detail: e.to_string(),
                }
            }
        }
    }

    async fn persist(&self, run: &Run) {
        if let Err(e) = self.runs.save(run).await {
            obs::emit_run_persist_failed(&run.id.0, &e);
        }
    }

    fn register(&self, id: &RunId) -> CancelSignal {
        let (handle, signal) = cancel_pair();
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), handle);
        signal
    }

    fn deregister(&self, id: &RunId) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

/// Classify a failed stage result into the reason the Run blocks with.
fn failure_reason(result: &StageResult, threshold: afterburner_core::Severity) -> BlockReason {
    let kind = if result.all_tools_failed() {
        FailureKind::ToolUnavailable
    } else if result.findings.iter().any(|f| {
        f.category == FindingCategory::ExternalRejection && !f.resolved && !f.is_duplicate()
    }) {
        FailureKind::ExternalRejection
    } else {
        FailureKind::GatingBreach
    };

    let mut findings = blocking_findings(&result.findings, threshold);
    if findings.is_empty() {
        findings = result
            .findings
            .iter()
            .filter(|f| !f.resolved && !f.is_duplicate())
            .cloned()
            .collect();
    }
    let detail = result.note.clone().unwrap_or_else(|| match kind {
        FailureKind::ToolUnavailable => format!("no {} tool could run", result.stage),
        FailureKind::ExternalRejection => format!("{} rejected externally", result.stage),
        _ => format!("{} blocking finding(s) in {}", findings.len(), result.stage),
    });
    BlockReason::new(kind, Some(result.stage), detail).with_findings(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use afterburner_core::Severity;

    fn finding(category: FindingCategory, severity: Severity) -> Finding {
        Finding::new("tool", category, severity, None, "something")
    }

    #[test]
    fn all_tools_failing_is_tool_unavailable() {
        let mut result = StageResult::new(
            StageName::Security,
            vec![Finding::tool_unavailable("semgrep", Severity::Medium, "not installed")],
            Verdict::Fail,
        );
        result.tools_invoked = vec!["semgrep".into()];
        result.tools_failed = vec!["semgrep".into()];
        let reason = failure_reason(&result, Severity::High);
        assert_eq!(reason.kind, FailureKind::ToolUnavailable);
        assert_eq!(reason.findings.len(), 1);
    }

    #[test]
    fn rejection_beats_gating_breach() {
        let result = StageResult::new(
            StageName::Git,
            vec![finding(FindingCategory::ExternalRejection, Severity::High)],
            Verdict::Fail,
        )
        .with_note("pull request rejected: no");
        let reason = failure_reason(&result, Severity::High);
        assert_eq!(reason.kind, FailureKind::ExternalRejection);
        assert_eq!(reason.detail, "pull request rejected: no");
    }

    #[test]
    fn blocking_findings_are_attached_for_a_breach() {
        let result = StageResult::new(
            StageName::Security,
            vec![
                finding(FindingCategory::CodeVulnerability, Severity::Critical),
                finding(FindingCategory::CodeVulnerability, Severity::Low),
            ],
            Verdict::Fail,
        );
        let reason = failure_reason(&result, Severity::High);
        assert_eq!(reason.kind, FailureKind::GatingBreach);
        assert_eq!(reason.findings.len(), 1);
        assert_eq!(reason.findings[0].severity, Severity::Critical);
    }
}
