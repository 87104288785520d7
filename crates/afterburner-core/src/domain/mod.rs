//! Domain models for Afterburner.
//!
//! Canonical definitions for the core entities:
//! - `Run`: one pipeline execution and its full history
//! - `ChangeSet`: the file deltas a Run operates on
//! - `StageRecord`: one gate's lifecycle within a Run
//! - `Finding`: normalized output of any tool
//! - `RetryCycle`: an iteration of a bounded controller
//! - `Summary`: the final report

pub mod changeset;
pub mod error;
pub mod finding;
pub mod retry;
pub mod run;
pub mod stage;
pub mod summary;

pub use changeset::{ChangeSet, ChangeStatus, FileChange, FileKind, DELETED_FINGERPRINT};
pub use error::{AfterburnerError, BlockReason, FailureKind, Result};
pub use finding::{
    normalize_message, Finding, FindingCategory, FindingId, LineRange, Location, Severity,
};
pub use retry::{RetryCycle, RetryKind, RetryOutcome};
pub use run::{
    BaselineCommit, ExitStatus, PipelineState, Run, RunStatus, StateTransition, TriggerEvent,
    TriggerKind,
};
pub use stage::{StageName, StageRecord, StageState, TestTally, Verdict};
pub use summary::{StageOutcome, Summary};
