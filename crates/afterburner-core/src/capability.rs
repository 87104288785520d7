//! Stage Capability: the uniform `{precheck, execute, classify}` contract.
//!
//! Every gate implements [`StageCapability`]. The orchestrator and the two
//! bounded controllers only ever talk to this trait, so the whole state
//! machine runs against deterministic stubs in tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancellation::CancelSignal;
use crate::collaborators::ToolError;
use crate::config::PipelineConfig;
use crate::domain::{
    AfterburnerError, ChangeSet, Finding, FindingCategory, Result, Severity, StageName,
    StageRecord, TestTally, Verdict,
};
use crate::fanout::ToolCall;
use afterburner_state::RunId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "reason", rename_all = "snake_case")]
pub enum Applicability {
    Applicable,
    NotApplicable(String),
}

/// Per-Run context handed to stages. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub repo_path: PathBuf,
    pub config: Arc<PipelineConfig>,
    pub cancel: CancelSignal,
}

impl RunContext {
    pub fn new(
        run_id: RunId,
        repo_path: impl Into<PathBuf>,
        config: Arc<PipelineConfig>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            run_id,
            repo_path: repo_path.into(),
            config,
            cancel,
        }
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AfterburnerError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallStatus {
    Succeeded,
    Failed { detail: String },
    TimedOut { secs: u64 },
}

/// One raw tool output, tagged with success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawToolOutput {
    pub tool: String,
    pub status: CallStatus,
    pub payload: serde_json::Value,
    pub elapsed_ms: u64,
}

impl RawToolOutput {
    pub fn from_call<T: Serialize>(call: ToolCall<T>) -> Self {
        let (status, payload) = match call.result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(v) => (CallStatus::Succeeded, v),
                Err(e) => (
                    CallStatus::Failed {
                        detail: format!("unserializable output: {e}"),
                    },
                    serde_json::Value::Null,
                ),
            },
            Err(ToolError::TimedOut { secs, .. }) => {
                (CallStatus::TimedOut { secs }, serde_json::Value::Null)
            }
            Err(e) => (
                CallStatus::Failed {
                    detail: e.to_string(),
                },
                serde_json::Value::Null,
            ),
        };
        Self {
            tool: call.tool,
            status,
            payload,
            elapsed_ms: call.elapsed_ms,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == CallStatus::Succeeded
    }

    /// Synthetic finding for a failed call; `None` when the call succeeded.
    pub fn failure_finding(&self, severity: Severity) -> Option<Finding> {
        match &self.status {
            CallStatus::Succeeded => None,
            CallStatus::Failed { detail } => {
                Some(Finding::tool_unavailable(&self.tool, severity, detail))
            }
            CallStatus::TimedOut { secs } => Some(Finding::timeout(&self.tool, severity, *secs)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawToolOutputs {
    pub stage: StageName,
    pub outputs: Vec<RawToolOutput>,
}

impl RawToolOutputs {
    pub fn new(stage: StageName) -> Self {
        Self {
            stage,
            outputs: Vec::new(),
        }
    }

    pub fn from_calls<T: Serialize>(stage: StageName, calls: Vec<ToolCall<T>>) -> Self {
        Self {
            stage,
            outputs: calls.into_iter().map(RawToolOutput::from_call).collect(),
        }
    }

    pub fn all_failed(&self) -> bool {
        !self.outputs.is_empty() && self.outputs.iter().all(|o| !o.succeeded())
    }
}

/// Normalized result of one `classify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub findings: Vec<Finding>,
    pub verdict: Verdict,
    #[serde(default)]
    pub tally: Option<TestTally>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    /// Tools invoked, in call order.
    #[serde(default)]
    pub tools_invoked: Vec<String>,
    #[serde(default)]
    pub tools_failed: Vec<String>,
    /// Free-form explanation for a non-Pass verdict.
    #[serde(default)]
    pub note: Option<String>,
}

impl StageResult {
    pub fn new(stage: StageName, findings: Vec<Finding>, verdict: Verdict) -> Self {
        Self {
            stage,
            findings,
            verdict,
            tally: None,
            artifacts: BTreeMap::new(),
            tools_invoked: Vec::new(),
            tools_failed: Vec::new(),
            note: None,
        }
    }

    /// Forced Fail for a stage that exceeded its budget.
    pub fn timed_out(stage: StageName, budget: Duration, severity: Severity) -> Self {
        let mut r = Self::new(
            stage,
            vec![Finding::timeout(stage.as_str(), severity, budget.as_secs())],
            Verdict::Fail,
        );
        r.tools_invoked = vec![stage.as_str().to_string()];
        r.tools_failed = r.tools_invoked.clone();
        r.note = Some(format!("stage exceeded {}s", budget.as_secs()));
        r
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Every invoked tool failed (or the stage itself timed out).
    pub fn all_tools_failed(&self) -> bool {
        !self.tools_invoked.is_empty() && self.tools_failed.len() == self.tools_invoked.len()
    }

    pub fn timed_out_stage(&self) -> bool {
        self.all_tools_failed()
            && self
                .findings
                .iter()
                .any(|f| f.category == FindingCategory::Timeout)
    }

    /// Write this result into the stage record it belongs to.
    pub fn apply_to(&self, record: &mut StageRecord) {
        record.findings = self.findings.clone();
        record.tally = self.tally.clone();
        record
            .artifacts
            .extend(self.artifacts.iter().map(|(k, v)| (k.clone(), v.clone())));
        if self.note.is_some() {
            record.note = self.note.clone();
        }
    }
}

#[async_trait]
pub trait StageCapability: Send + Sync {
    fn name(&self) -> StageName;

    fn precheck(&self, changeset: &ChangeSet, ctx: &RunContext) -> Applicability;

    /// Invoke collaborators. Must return every raw output, failed ones included.
    /// Only cancellation is an error.
    async fn execute(&self, changeset: &ChangeSet, ctx: &RunContext) -> Result<RawToolOutputs>;

    async fn classify(&self, raw: RawToolOutputs, ctx: &RunContext) -> StageResult;

    /// Re-check a stage parked on `Verdict::PendingExternal`.
    async fn poll_external(&self, record: &StageRecord, ctx: &RunContext) -> Result<StageResult> {
        let _ = (record, ctx);
        Ok(StageResult::new(
            self.name(),
            vec![Finding::new(
                self.name().as_str(),
                FindingCategory::ExternalRejection,
                Severity::High,
                None,
                format!("stage {} cannot be resumed", self.name()),
            )],
            Verdict::Fail,
        ))
    }
}

/// `execute` then `classify` under the stage's time budget.
///
/// On timeout the result is a forced Fail with a `Timeout` finding.
pub async fn run_stage(
    stage: &dyn StageCapability,
    changeset: &ChangeSet,
    ctx: &RunContext,
) -> Result<StageResult> {
    let budget = ctx.config.stage_timeout(stage.name());
    let work = async {
        let raw = stage.execute(changeset, ctx).await?;
        Ok::<_, AfterburnerError>(stage.classify(raw, ctx).await)
    };
    match tokio::time::timeout(budget, work).await {
        Ok(result) => result,
        Err(_) => Ok(StageResult::timed_out(
            stage.name(),
            budget,
            ctx.config.gating.tool_unavailable,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_output_tags_failures() {
        let ok = RawToolOutput::from_call(ToolCall {
            tool: "semgrep".into(),
            result: Ok(vec![1, 2]),
            elapsed_ms: 3,
        });
        assert!(ok.succeeded());
        assert!(ok.failure_finding(Severity::Medium).is_none());

        let timed_out = RawToolOutput::from_call::<Vec<u8>>(ToolCall {
            tool: "bandit".into(),
            result: Err(ToolError::TimedOut {
                tool: "bandit".into(),
                secs: 120,
            }),
            elapsed_ms: 120_000,
        });
        let f = timed_out.failure_finding(Severity::Medium).unwrap();
        assert_eq!(f.category, FindingCategory::Timeout);
        assert_eq!(f.source_tool, "bandit");
    }

    #[test]
    fn timed_out_stage_is_forced_fail() {
        let r = StageResult::timed_out(StageName::Test, Duration::from_secs(5), Severity::Low);
        assert_eq!(r.verdict, Verdict::Fail);
        assert!(r.all_tools_failed());
        assert!(r.timed_out_stage());
    }
}
