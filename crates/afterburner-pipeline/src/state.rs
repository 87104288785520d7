//! Top-level pipeline state machine.
//!
//! `next_state` is pure: the orchestrator decides *what happened*, this
//! module decides *where that leads*. Anything not listed is an
//! `InvalidTransition`.

use serde::{Deserialize, Serialize};

use afterburner_core::{AfterburnerError, PipelineState, Result};

/// What the orchestrator observed in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Trigger accepted.
    Start,
    /// Detecting produced a non-empty ChangeSet.
    Changes,
    /// Detecting found nothing to do.
    NoChanges,
    /// The current stage passed (or was skipped by policy).
    Pass,
    /// Self-debug mutated code; re-audit before moving on.
    Reflect,
    /// The stage is waiting on a human; the Run parks in place.
    Park,
    Block,
    Abort,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub fn next_state(state: PipelineState, outcome: StepOutcome) -> Result<PipelineState> {
    use PipelineState as S;
    use StepOutcome as O;

    let next = match (state, outcome) {
        (s, _) if s.is_terminal() => None,
        (_, O::Block) => Some(S::Blocked),
        (_, O::Abort) => Some(S::Aborted),

        (S::Idle, O::Start) => Some(S::Detecting),
        (S::Detecting, O::Changes) => Some(S::SecurityReview),
        (S::Detecting, O::NoChanges) => Some(S::Summarized),
        (S::SecurityReview, O::Pass) => Some(S::TestExecution),
        (S::TestExecution, O::Pass) => Some(S::GitOperations),
        (S::TestExecution, O::Reflect) => Some(S::ReflectionLoop),
        (S::ReflectionLoop, O::Pass) => Some(S::GitOperations),
        (S::GitOperations, O::Pass) => Some(S::Deployment),
        (S::GitOperations, O::Park) => Some(S::GitOperations),
        (S::Deployment, O::Pass) => Some(S::Summarized),
        _ => None,
    };

    next.ok_or_else(|| AfterburnerError::InvalidTransition {
        from: state.to_string(),
        outcome: outcome.to_string(),
    })
}
