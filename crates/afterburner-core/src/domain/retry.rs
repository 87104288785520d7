//! Retry cycle records appended by the bounded controllers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryKind {
    SelfDebug,
    Reflection,
}

impl std::fmt::Display for RetryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryKind::SelfDebug => f.write_str("self_debug"),
            RetryKind::Reflection => f.write_str("reflection"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOutcome {
    /// Measurable progress (fewer failing cases, or a clean rescan).
    Improved,
    /// No progress; the controller stops.
    Unchanged,
    /// Last permitted attempt used without resolution.
    Exhausted,
    /// The fix capability declined.
    Rejected,
    /// A rescan introduced a new finding at or above the block severity.
    Regressed,
}

impl std::fmt::Display for RetryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RetryOutcome::Improved => "improved",
            RetryOutcome::Unchanged => "unchanged",
            RetryOutcome::Exhausted => "exhausted",
            RetryOutcome::Rejected => "rejected",
            RetryOutcome::Regressed => "regressed",
        };
        f.write_str(s)
    }
}

/// One controller iteration. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryCycle {
    pub kind: RetryKind,
    /// 1-indexed within its controller invocation.
    pub iteration: u32,
    pub trigger_reason: String,
    pub outcome: RetryOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl RetryCycle {
    pub fn new(
        kind: RetryKind,
        iteration: u32,
        trigger_reason: impl Into<String>,
        outcome: RetryOutcome,
    ) -> Self {
        Self {
            kind,
            iteration,
            trigger_reason: trigger_reason.into(),
            outcome,
            recorded_at: Utc::now(),
        }
    }
}
