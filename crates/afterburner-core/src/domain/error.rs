//! Domain-level error taxonomy for Afterburner.
//!
//! Two layers live here. [`FailureKind`] and [`BlockReason`] are data: they
//! are recorded on a Run and rendered in its Summary. [`AfterburnerError`]
//! is the Rust error type for things that prevent the pipeline from doing
//! its job at all (storage, I/O, illegal state transitions).

use serde::{Deserialize, Serialize};

use super::finding::Finding;
use super::stage::StageName;
use crate::config::ConfigError;
use afterburner_state::StorageError;

/// Why a Run did not reach `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Every external call of a stage failed or timed out.
    ToolUnavailable,
    /// Benign terminal: nothing changed since the baseline.
    NoChangesDetected,
    /// An unresolved finding met the gating threshold.
    GatingBreach,
    /// A bounded controller ran out of attempts without resolution.
    RetryExhausted,
    /// A collaborator declined (no fix, rejected PR, failed deploy).
    ExternalRejection,
    /// Cancellation was observed; the Run is Aborted.
    CancellationObserved,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::ToolUnavailable => "tool_unavailable",
            FailureKind::NoChangesDetected => "no_changes_detected",
            FailureKind::GatingBreach => "gating_breach",
            FailureKind::RetryExhausted => "retry_exhausted",
            FailureKind::ExternalRejection => "external_rejection",
            FailureKind::CancellationObserved => "cancellation_observed",
        };
        f.write_str(s)
    }
}

/// Diagnostic payload attached to every Blocked or Aborted Run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockReason {
    pub kind: FailureKind,
    pub stage: Option<StageName>,
    pub detail: String,
    /// The findings that caused the block, if any.
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl BlockReason {
    pub fn new(kind: FailureKind, stage: Option<StageName>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            detail: detail.into(),
            findings: Vec::new(),
        }
    }

    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = findings;
        self
    }
}

/// Afterburner errors.
#[derive(Debug, thiserror::Error)]
pub enum AfterburnerError {
    #[error("no changes detected in {repo}")]
    NoChangesDetected { repo: String },

    #[error("invalid pipeline transition from {from} on {outcome}")]
    InvalidTransition { from: String, outcome: String },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("summary for run {run_id} is already sealed")]
    SummaryAlreadySealed { run_id: String },

    #[error("run {run_id} cannot be resumed from status {status}")]
    NotResumable { run_id: String, status: String },

    #[error("cancellation observed")]
    Cancelled,

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Afterburner domain operations.
pub type Result<T> = std::result::Result<T, AfterburnerError>;
