//! Structured observability hooks for pipeline Run lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans via the `RunSpan` RAII guard
//! - Emission functions for state transitions, gate verdicts, retry
//!   cycles, tool calls and baseline commits
//!
//! Events are emitted at `info!` level unless noted (filter with
//! `AFTERBURNER_LOG`). For JSON output pass `--json` to the CLI.

use tracing::{info, warn};

use crate::domain::{PipelineState, RetryKind, RetryOutcome, StageName, StageState, Verdict};

/// RAII guard that enters a run-scoped tracing span for the duration of a Run.
///
/// ```ignore
/// let _span = RunSpan::enter("9f1c...");
/// // every event below is tagged with run_id = "9f1c..."
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

/// The run-scoped span, for `Instrument`-ing futures that must stay `Send`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("afterburner.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, repo: &str, trigger: &str) {
    info!(event = "run.started", run_id = %run_id, repo = %repo, trigger = %trigger);
}

/// Emit event: run reached a terminal or parked status.
pub fn emit_run_finished(run_id: &str, status: &str, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_state_transition(run_id: &str, from: PipelineState, to: PipelineState) {
    info!(
        event = "run.transition",
        run_id = %run_id,
        from = ?from,
        to = ?to,
    );
}

pub fn emit_stage_entered(run_id: &str, stage: StageName, attempt: u32) {
    info!(event = "stage.entered", run_id = %run_id, stage = %stage, attempt = attempt);
}

pub fn emit_stage_finished(run_id: &str, stage: StageName, state: StageState, findings: usize) {
    info!(
        event = "stage.finished",
        run_id = %run_id,
        stage = %stage,
        state = ?state,
        findings = findings,
    );
}

pub fn emit_stage_skipped(run_id: &str, stage: StageName, reason: &str) {
    info!(event = "stage.skipped", run_id = %run_id, stage = %stage, reason = %reason);
}

/// Emit event: gate verdict with the number of findings at or above threshold.
pub fn emit_gate_evaluated(run_id: &str, stage: StageName, verdict: Verdict, blocking: usize) {
    info!(
        event = "gate.evaluated",
        run_id = %run_id,
        stage = %stage,
        verdict = ?verdict,
        blocking = blocking,
    );
}

pub fn emit_retry_cycle(run_id: &str, kind: RetryKind, iteration: u32, outcome: RetryOutcome) {
    info!(
        event = "retry.cycle",
        run_id = %run_id,
        kind = %kind,
        iteration = iteration,
        outcome = %outcome,
    );
}

pub fn emit_tool_called(run_id: &str, tool: &str) {
    tracing::debug!(event = "tool.called", run_id = %run_id, tool = %tool);
}

/// Emit event: an external call failed (warning level).
pub fn emit_tool_failed(run_id: &str, tool: &str, error: &dyn std::fmt::Display) {
    warn!(event = "tool.failed", run_id = %run_id, tool = %tool, error = %error);
}

pub fn emit_baseline_committed(run_id: &str, repo: &str, version: u64, digest: &str) {
    info!(
        event = "baseline.committed",
        run_id = %run_id,
        repo = %repo,
        version = version,
        digest = %digest,
    );
}

/// Emit event: baseline advanced concurrently; this Run's commit lost (warning level).
pub fn emit_baseline_stale(run_id: &str, repo: &str, error: &dyn std::fmt::Display) {
    warn!(event = "baseline.stale", run_id = %run_id, repo = %repo, error = %error);
}

/// Emit event: persisting the Run document failed (warning level).
pub fn emit_run_persist_failed(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.persist_failed", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_span_enters_without_subscriber() {
        let _span = RunSpan::enter("test-run-id");
        emit_stage_entered("test-run-id", StageName::Security, 1);
        emit_retry_cycle("test-run-id", RetryKind::SelfDebug, 1, RetryOutcome::Improved);
    }
}
