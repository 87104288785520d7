//! Afterburner Core Library
//!
//! Domain model, configuration, ChangeSet resolution, the stage capability
//! contract, finding aggregation and the two bounded controllers
//! (self-debug and reflection). The orchestrator and concrete adapters live
//! in `afterburner-pipeline`.

pub mod aggregator;
pub mod cancellation;
pub mod capability;
pub mod collaborators;
pub mod config;
pub mod domain;
pub mod fakes;
pub mod fanout;
pub mod metrics;
pub mod obs;
pub mod persistence;
pub mod reflection;
pub mod reporting;
pub mod resolver;
pub mod self_debug;
pub mod telemetry;

pub use aggregator::{aggregate, gate_verdict, reconcile, Reconciliation, RescanScope};
pub use cancellation::{cancel_pair, CancelHandle, CancelSignal};
pub use capability::{
    run_stage, Applicability, CallStatus, RawToolOutput, RawToolOutputs, RunContext,
    StageCapability, StageResult,
};
pub use collaborators::{
    CommitInfo, DeployOutcome, DeployStatus, FailingCase, FixError, FixProposer, GitAdapter,
    LaunchAdapter, PrRequest, ReviewState, ScanFinding, SecurityScanner, SeverityTriage,
    TestReport, TestRunner, ToolError,
};
pub use config::{ConfigError, PipelineConfig, CONFIG_FILE_NAME};
pub use domain::{
    AfterburnerError, BaselineCommit, BlockReason, ChangeSet, ExitStatus, FailureKind, Finding,
    PipelineState, Result, RetryCycle, RetryKind, RetryOutcome, Run, RunStatus, Severity,
    StageName, StageRecord, StageState, Summary, TriggerEvent, TriggerKind, Verdict,
};
pub use fanout::{fan_out, ToolCall};
pub use persistence::RunRepository;
pub use reflection::{should_reflect, ReflectionController, ReflectionOutcome, ReflectionTerminal};
pub use reporting::{build_summary, read_summary_artifact, render_summary_md, write_summary_artifact};
pub use resolver::{resolve_changeset, refresh_changeset};
pub use self_debug::{SelfDebugController, SelfDebugOutcome, SelfDebugTerminal};

pub use afterburner_state::{ContentDigest, RunId};
