//! Reflection Controller: re-audit code mutated by fix attempts.
//!
//! Triggered when the ChangeSet fingerprint moved after self-debug. Each
//! cycle rescans only the delta and folds the result into the previous
//! security findings. A new finding at or above the reflection block
//! severity is a regression and blocks the Run.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregator::{gate_verdict, reconcile, RescanScope};
use crate::capability::{run_stage, Applicability, RunContext, StageCapability};
use crate::domain::{
    ChangeSet, Finding, FindingId, Result, RetryCycle, RetryKind, RetryOutcome, Verdict,
};
use crate::metrics::METRICS;
use crate::obs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionTerminal {
    /// Rescans settled without regression; the Run moves on.
    PassThrough,
    /// A rescan introduced a finding at or above the block severity.
    Regressed,
    /// No regression, but the merged findings still fail the gate.
    GatingBreach,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionOutcome {
    pub terminal: ReflectionTerminal,
    pub cycles: Vec<RetryCycle>,
    /// Security findings after all rescans.
    pub findings: Vec<Finding>,
    /// New findings that caused a regression.
    pub regressions: Vec<Finding>,
    pub resolved: Vec<FindingId>,
    pub delta: ChangeSet,
}

/// Reflection runs iff the fingerprint moved.
pub fn should_reflect(entering: &ChangeSet, after: &ChangeSet) -> bool {
    entering.fingerprint() != after.fingerprint()
}

pub struct ReflectionController<'a> {
    security: &'a dyn StageCapability,
    max_cycles: u32,
}

impl<'a> ReflectionController<'a> {
    pub fn new(security: &'a dyn StageCapability, max_cycles: u32) -> Self {
        Self {
            security,
            max_cycles,
        }
    }

    /// Rescan `delta` (files mutated by fix attempts) against `previous`
    /// security findings.
    ///
    /// Errors only on cancellation.
    pub async fn run(
        &self,
        previous: &[Finding],
        delta: &ChangeSet,
        ctx: &RunContext,
    ) -> Result<ReflectionOutcome> {
        let run_id = ctx.run_id.0.as_str();
        let cfg = &ctx.config;
        let delta = delta.clone();
        let mut findings = previous.to_vec();
        let mut resolved = Vec::new();
        let mut cycles = Vec::new();

        if let Applicability::NotApplicable(reason) = self.security.precheck(&delta, ctx) {
            record(
                run_id,
                &mut cycles,
                1,
                format!("delta of {} file(s) not scannable: {reason}", delta.len()),
                RetryOutcome::Unchanged,
            );
            return Ok(ReflectionOutcome {
                terminal: ReflectionTerminal::PassThrough,
                cycles,
                findings,
                regressions: Vec::new(),
                resolved,
                delta,
            });
        }

        for cycle in 1..=self.max_cycles {
            ctx.check_cancelled()?;
            let result = run_stage(self.security, &delta, ctx).await?;
            let scope = RescanScope {
                files: delta.present_paths().into_iter().collect(),
                tools: result
                    .tools_invoked
                    .iter()
                    .filter(|t| !result.tools_failed.contains(t))
                    .cloned()
                    .collect(),
            };
            let rec = reconcile(&findings, result.findings, &scope, &cfg.dedupe);
            findings = rec.merged;
            resolved.extend(rec.resolved);

            let regressions: Vec<Finding> = rec
                .new_findings
                .into_iter()
                .filter(|f| !f.category.is_synthetic() && f.severity >= cfg.gating.reflection_block)
                .collect();
            let reason = format!("{} file(s) mutated by fix attempts", delta.len());
            debug!(
                run_id,
                cycle,
                regressions = regressions.len(),
                tools_failed = result.tools_failed.len(),
                "reflection rescan evaluated"
            );

            if !regressions.is_empty() {
                record(run_id, &mut cycles, cycle, reason, RetryOutcome::Regressed);
                return Ok(ReflectionOutcome {
                    terminal: ReflectionTerminal::Regressed,
                    cycles,
                    findings,
                    regressions,
                    resolved,
                    delta,
                });
            }

            let incomplete = !result.tools_failed.is_empty();
            if incomplete && cycle < self.max_cycles {
                record(
                    run_id,
                    &mut cycles,
                    cycle,
                    format!("{reason}; incomplete rescan"),
                    RetryOutcome::Unchanged,
                );
                continue;
            }

            let outcome = if incomplete {
                RetryOutcome::Exhausted
            } else {
                RetryOutcome::Unchanged
            };
            record(run_id, &mut cycles, cycle, reason, outcome);
            break;
        }

        let terminal = match gate_verdict(&findings, cfg.gating.threshold) {
            Verdict::Pass => ReflectionTerminal::PassThrough,
            _ => ReflectionTerminal::GatingBreach,
        };
        Ok(ReflectionOutcome {
            terminal,
            cycles,
            findings,
            regressions: Vec::new(),
            resolved,
            delta,
        })
    }
}

fn record(
    run_id: &str,
    cycles: &mut Vec<RetryCycle>,
    iteration: u32,
    reason: String,
    outcome: RetryOutcome,
) {
    METRICS.inc_retry_cycles();
    obs::emit_retry_cycle(run_id, RetryKind::Reflection, iteration, outcome);
    cycles.push(RetryCycle::new(
        RetryKind::Reflection,
        iteration,
        reason,
        outcome,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChangeStatus, FileChange};

    #[test]
    fn reflect_only_when_fingerprint_moves() {
        let a = ChangeSet::new(vec![FileChange::new("a.py", "1", ChangeStatus::Modified)]);
        let same = a.with_updates(vec![FileChange::new("a.py", "1", ChangeStatus::Modified)]);
        let moved = a.with_updates(vec![FileChange::new("a.py", "2", ChangeStatus::Modified)]);
        assert!(!should_reflect(&a, &same));
        assert!(should_reflect(&a, &moved));
    }
}
