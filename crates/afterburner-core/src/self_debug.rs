//! Self-Debug Controller: bounded fix-then-retest loop local to the Test stage.
//!
//! States are `Attempt(n)` for `n = 1..=max_attempts` plus the terminals
//! below. An attempt is `Improved` iff the failing count strictly drops and
//! at least one previously failing case now passes. The first attempt that
//! is not improved stops the loop early. Improvement never resets the
//! attempt counter.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::{run_stage, RunContext, StageCapability, StageResult};
use crate::collaborators::{FailingCase, FixError, FixProposer};
use crate::domain::{
    AfterburnerError, ChangeSet, FindingCategory, Result, RetryCycle, RetryKind, RetryOutcome,
    TestTally, Verdict,
};
use crate::metrics::METRICS;
use crate::obs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfDebugTerminal {
    /// Tests pass.
    Resolved,
    /// Bound reached, or an attempt made no progress.
    Exhausted,
    /// The fix capability declined (`NoFixAvailable` or rejected).
    Rejected,
    /// The fix capability could not be reached or timed out.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfDebugOutcome {
    pub terminal: SelfDebugTerminal,
    pub cycles: Vec<RetryCycle>,
    /// ChangeSet after the last applied fix.
    pub changeset: ChangeSet,
    /// Last Test stage result.
    pub result: StageResult,
    pub attempts: u32,
    /// Stopped on an `Unchanged` attempt before the bound.
    pub short_circuited: bool,
    pub detail: Option<String>,
}

/// `next` improved on `prev`: fewer failures and some old failure now passes.
pub fn is_improved(prev: &TestTally, next: &TestTally) -> bool {
    next.failed < prev.failed
        && prev
            .failing_cases
            .iter()
            .any(|c| !next.failing_cases.contains(c))
}

/// Failing cases as the fix capability sees them.
pub fn failing_cases(result: &StageResult) -> Vec<FailingCase> {
    result
        .findings
        .iter()
        .filter(|f| f.category == FindingCategory::TestFailure && !f.is_duplicate())
        .map(|f| FailingCase {
            name: f.rule_id.clone().unwrap_or_else(|| f.message.clone()),
            file: f.file().map(String::from),
            message: f.message.clone(),
        })
        .collect()
}

pub struct SelfDebugController<'a> {
    test_stage: &'a dyn StageCapability,
    fixer: &'a dyn FixProposer,
    max_attempts: u32,
}

impl<'a> SelfDebugController<'a> {
    pub fn new(
        test_stage: &'a dyn StageCapability,
        fixer: &'a dyn FixProposer,
        max_attempts: u32,
    ) -> Self {
        Self {
            test_stage,
            fixer,
            max_attempts,
        }
    }

    /// Drive the loop from a failing Test result.
    ///
    /// Errors only on cancellation.
    pub async fn run(
        &self,
        initial: StageResult,
        changeset: ChangeSet,
        ctx: &RunContext,
    ) -> Result<SelfDebugOutcome> {
        let run_id = ctx.run_id.0.as_str();
        let mut current = initial;
        let mut current_cs = changeset;
        let mut cycles = Vec::new();

        for attempt in 1..=self.max_attempts {
            ctx.check_cancelled()?;
            let prev_tally = current.tally.clone().unwrap_or_default();
            let reason = format!("{} failing test(s)", prev_tally.failed);
            let failing = failing_cases(&current);

            let proposal = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(AfterburnerError::Cancelled),
                r = tokio::time::timeout(
                    ctx.config.tool_timeout(),
                    self.fixer.propose_fix(&ctx.repo_path, &failing, &current_cs),
                ) => r.unwrap_or_else(|_| Err(FixError::Unavailable("fix proposal timed out".into()))),
            };

            let patched = match proposal {
                Ok(cs) => cs,
                Err(e) => {
                    let (terminal, outcome) = match e {
                        FixError::Unavailable(_) => {
                            (SelfDebugTerminal::Unavailable, RetryOutcome::Unchanged)
                        }
                        FixError::NoFixAvailable(_) | FixError::Rejected(_) => {
                            (SelfDebugTerminal::Rejected, RetryOutcome::Rejected)
                        }
                    };
                    record(run_id, &mut cycles, attempt, format!("{reason}; {e}"), outcome);
                    return Ok(SelfDebugOutcome {
                        terminal,
                        cycles,
                        changeset: current_cs,
                        result: current,
                        attempts: attempt,
                        short_circuited: attempt < self.max_attempts,
                        detail: Some(e.to_string()),
                    });
                }
            };

            let next = run_stage(self.test_stage, &patched, ctx).await?;
            current_cs = patched;
            let next_tally = next.tally.clone().unwrap_or_default();
            debug!(
                run_id,
                attempt,
                before = prev_tally.failed,
                after = next_tally.failed,
                "self-debug attempt evaluated"
            );

            if next.verdict == Verdict::Pass {
                record(run_id, &mut cycles, attempt, reason, RetryOutcome::Improved);
                return Ok(SelfDebugOutcome {
                    terminal: SelfDebugTerminal::Resolved,
                    cycles,
                    changeset: current_cs,
                    result: next,
                    attempts: attempt,
                    short_circuited: false,
                    detail: None,
                });
            }

            let improved = next.tally.is_some() && is_improved(&prev_tally, &next_tally);
            current = next;

            if improved && attempt < self.max_attempts {
                record(run_id, &mut cycles, attempt, reason, RetryOutcome::Improved);
                continue;
            }

            let (outcome, short_circuited) = if improved {
                (RetryOutcome::Exhausted, false)
            } else {
                (RetryOutcome::Unchanged, attempt < self.max_attempts)
            };
            record(run_id, &mut cycles, attempt, reason, outcome);
            return Ok(SelfDebugOutcome {
                terminal: SelfDebugTerminal::Exhausted,
                cycles,
                changeset: current_cs,
                result: current,
                attempts: attempt,
                short_circuited,
                detail: Some(format!(
                    "{} failing test(s) after {} attempt(s)",
                    next_tally.failed, attempt
                )),
            });
        }

        // Only reachable with max_attempts == 0, which config validation rejects.
        Ok(SelfDebugOutcome {
            terminal: SelfDebugTerminal::Exhausted,
            cycles,
            changeset: current_cs,
            result: current,
            attempts: 0,
            short_circuited: false,
            detail: Some("self-debug disabled".into()),
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
    obs::emit_retry_cycle(run_id, RetryKind::SelfDebug, iteration, outcome);
    cycles.push(RetryCycle::new(
        RetryKind::SelfDebug,
        iteration,
        reason,
        outcome,
    ));
}
