//! Launch stage: CI manifest, then deploy to the configured target.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use afterburner_core::capability::{RawToolOutput, RawToolOutputs};
use afterburner_core::domain::FindingCategory;
use afterburner_core::{
    fan_out, Applicability, ChangeSet, DeployOutcome, DeployStatus, Finding, LaunchAdapter,
    Result, RunContext, Severity, StageCapability, StageName, StageResult, Verdict,
};

const MANIFEST_TOOL: &str = "ci_manifest";
const DEPLOY_TOOL: &str = "deploy";

pub struct LaunchStage {
    adapter: Arc<dyn LaunchAdapter>,
}

impl LaunchStage {
    pub fn new(adapter: Arc<dyn LaunchAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl StageCapability for LaunchStage {
    fn name(&self) -> StageName {
        StageName::Launch
    }

    fn precheck(&self, _changeset: &ChangeSet, ctx: &RunContext) -> Applicability {
        let launch = &ctx.config.launch;
        if launch.skip {
            return Applicability::NotApplicable("deployment skipped".into());
        }
        if launch.target.is_none() {
            return Applicability::NotApplicable("no deploy target configured".into());
        }
        Applicability::Applicable
    }

    async fn execute(&self, _changeset: &ChangeSet, ctx: &RunContext) -> Result<RawToolOutputs> {
        let run_id = ctx.run_id.0.as_str();
        let target = ctx.config.launch.target.clone().unwrap_or_default();
        let timeout = ctx.config.stage_timeout(StageName::Launch);
        let mut raw = RawToolOutputs::new(StageName::Launch);

        let manifest = fan_out(
            run_id,
            vec![(
                MANIFEST_TOOL.to_string(),
                self.adapter.generate_ci_manifest(&ctx.repo_path),
            )],
            ctx.config.tool_timeout(),
            &ctx.cancel,
        )
        .await?;
        raw.outputs
            .extend(manifest.into_iter().map(RawToolOutput::from_call));

        let deploy = fan_out(
            run_id,
            vec![(
                DEPLOY_TOOL.to_string(),
                self.adapter.deploy(&ctx.repo_path, &target),
            )],
            timeout,
            &ctx.cancel,
        )
        .await?;
        raw.outputs
            .extend(deploy.into_iter().map(RawToolOutput::from_call));
        Ok(raw)
    }

    async fn classify(&self, raw: RawToolOutputs, ctx: &RunContext) -> StageResult {
        let severity = ctx.config.gating.tool_unavailable;
        let mut result = StageResult::new(StageName::Launch, Vec::new(), Verdict::Pass);
        if let Some(target) = &ctx.config.launch.target {
            result.artifacts.insert("deploy_target".into(), target.clone());
        }

        let mut deployed = false;
        for output in &raw.outputs {
            result.tools_invoked.push(output.tool.clone());
            if let Some(f) = output.failure_finding(severity) {
                result.tools_failed.push(output.tool.clone());
                result.findings.push(f);
                continue;
            }
            match output.tool.as_str() {
                MANIFEST_TOOL => {
                    if let Ok(path) = serde_json::from_value::<PathBuf>(output.payload.clone()) {
                        let shown = path
                            .strip_prefix(&ctx.repo_path)
                            .unwrap_or(&path)
                            .display()
                            .to_string();
                        result.artifacts.insert("ci_manifest".into(), shown);
                    }
                }
                DEPLOY_TOOL => {
                    match serde_json::from_value::<DeployOutcome>(output.payload.clone()) {
                        Ok(DeployOutcome {
                            status: DeployStatus::Success,
                            url,
                        }) => {
                            deployed = true;
                            if let Some(url) = url {
                                result.artifacts.insert("deploy_url".into(), url);
                            }
                        }
                        Ok(DeployOutcome {
                            status: DeployStatus::Failed { reason },
                            ..
                        }) => {
                            result.findings.push(Finding::new(
                                DEPLOY_TOOL,
                                FindingCategory::ExternalRejection,
                                Severity::High,
                                None,
                                format!("deployment rejected: {reason}"),
                            ));
                            result.note = Some(format!("deployment failed: {reason}"));
                        }
                        Err(e) => {
                            result.tools_failed.push(output.tool.clone());
                            result.findings.push(Finding::tool_unavailable(
                                DEPLOY_TOOL,
                                severity,
                                &format!("unreadable outcome: {e}"),
                            ));
                        }
                    }
                }
                _ => {}
            }
        }

        if !deployed {
            result.verdict = Verdict::Fail;
            if result.note.is_none() {
                result.note = Some("deployment did not run".into());
            }
            if result.tools_failed.iter().any(|t| t == DEPLOY_TOOL) {
                // A deploy that never ran leaves the stage without a usable tool.
                result.tools_failed = result.tools_invoked.clone();
            }
        }
        result
    }
}
