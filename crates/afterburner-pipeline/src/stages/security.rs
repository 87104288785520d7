//! Security stage: concurrent scanners, triage, aggregation, severity gate.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use afterburner_core::capability::{CallStatus, RawToolOutputs};
use afterburner_core::domain::FileKind;
use afterburner_core::{
    aggregate, fan_out, gate_verdict, obs, Applicability, ChangeSet, Finding, Result,
    RunContext, ScanFinding, SecurityScanner, SeverityTriage, StageCapability, StageName,
    StageResult, Verdict,
};

/// Dependency manifests that make dependency audits relevant.
pub const DEPENDENCY_MANIFESTS: &[&str] = &[
    "package.json",
    "package-lock.json",
    "Cargo.toml",
    "Cargo.lock",
    "requirements.txt",
    "pyproject.toml",
];

pub struct SecurityStage {
    scanners: Vec<Arc<dyn SecurityScanner>>,
    triage: Arc<dyn SeverityTriage>,
}

impl SecurityStage {
    pub fn new(scanners: Vec<Arc<dyn SecurityScanner>>, triage: Arc<dyn SeverityTriage>) -> Self {
        Self { scanners, triage }
    }

    fn applicable<'a>(
        &'a self,
        changeset: &ChangeSet,
        ctx: &RunContext,
    ) -> Vec<&'a Arc<dyn SecurityScanner>> {
        self.scanners
            .iter()
            .filter(|s| s.applies_to(changeset, &ctx.repo_path))
            .collect()
    }

    async fn triage_all(&self, run_id: &str, raw: Vec<ScanFinding>) -> Vec<Finding> {
        let classified = join_all(raw.iter().map(|r| self.triage.classify_severity(r))).await;
        raw.iter()
            .zip(classified)
            .map(|(r, c)| match c {
                Ok(finding) => finding,
                Err(e) => {
                    // Triage is advisory; the scanner's own severity stands.
                    obs::emit_tool_failed(run_id, "triage", &e);
                    r.to_finding()
                }
            })
            .collect()
    }
}

fn has_dependency_manifest(changeset: &ChangeSet) -> bool {
    changeset.present_paths().iter().any(|p| {
        let name = p.rsplit('/').next().unwrap_or(p);
        DEPENDENCY_MANIFESTS.contains(&name)
    })
}

#[async_trait]
impl StageCapability for SecurityStage {
    fn name(&self) -> StageName {
        StageName::Security
    }

    fn precheck(&self, changeset: &ChangeSet, ctx: &RunContext) -> Applicability {
        if !changeset.has_source_files()
            && !changeset.has_kind(FileKind::Docker)
            && !has_dependency_manifest(changeset)
        {
            return Applicability::NotApplicable("no source files or dependency manifests".into());
        }
        if self.applicable(changeset, ctx).is_empty() {
            return Applicability::NotApplicable("no enabled scanner applies".into());
        }
        Applicability::Applicable
    }

    async fn execute(&self, changeset: &ChangeSet, ctx: &RunContext) -> Result<RawToolOutputs> {
        let files = changeset.present_paths();
        let calls = self
            .applicable(changeset, ctx)
            .into_iter()
            .map(|s| (s.name().to_string(), s.scan(&ctx.repo_path, &files)))
            .collect();
        let results = fan_out(
            ctx.run_id.0.as_str(),
            calls,
            ctx.config.tool_timeout(),
            &ctx.cancel,
        )
        .await?;
        Ok(RawToolOutputs::from_calls(StageName::Security, results))
    }

    async fn classify(&self, raw: RawToolOutputs, ctx: &RunContext) -> StageResult {
        let cfg = &ctx.config;
        let run_id = ctx.run_id.0.as_str();
        let mut findings = Vec::new();
        let mut tools_invoked = Vec::new();
        let mut tools_failed = Vec::new();

        for output in &raw.outputs {
            tools_invoked.push(output.tool.clone());
            if let Some(f) = output.failure_finding(cfg.gating.tool_unavailable) {
                tools_failed.push(output.tool.clone());
                findings.push(f);
                continue;
            }
            match serde_json::from_value::<Vec<ScanFinding>>(output.payload.clone()) {
                Ok(scan) => findings.extend(self.triage_all(run_id, scan).await),
                Err(e) => {
                    tools_failed.push(output.tool.clone());
                    findings.push(Finding::tool_unavailable(
                        &output.tool,
                        cfg.gating.tool_unavailable,
                        &format!("unreadable output: {e}"),
                    ));
                }
            }
        }

        let findings = aggregate(findings, &cfg.dedupe);
        let mut verdict = gate_verdict(&findings, cfg.gating.threshold);
        let mut note = None;
        if !tools_invoked.is_empty() && tools_failed.len() == tools_invoked.len() {
            verdict = Verdict::Fail;
            let timed_out = raw
                .outputs
                .iter()
                .all(|o| matches!(o.status, CallStatus::TimedOut { .. }));
            note = Some(if timed_out {
                "every security tool timed out".to_string()
            } else {
                "every security tool was unavailable".to_string()
            });
        }

        let mut result = StageResult::new(StageName::Security, findings, verdict);
        result.tools_invoked = tools_invoked;
        result.tools_failed = tools_failed;
        result.note = note;
        result
    }
}
