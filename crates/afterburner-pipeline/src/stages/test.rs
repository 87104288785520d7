//! Test stage: run every detected framework, merge the tallies.

use std::sync::Arc;

use async_trait::async_trait;

use afterburner_core::capability::RawToolOutputs;
use afterburner_core::domain::{FindingCategory, Location, TestTally};
use afterburner_core::{
    fan_out, Applicability, ChangeSet, Finding, Result, RunContext, Severity, StageCapability,
    StageName, StageResult, TestReport, TestRunner, Verdict,
};

/// Severity of a failing test case.
pub const TEST_FAILURE_SEVERITY: Severity = Severity::High;

pub struct TestStage {
    runners: Vec<Arc<dyn TestRunner>>,
}

impl TestStage {
    pub fn new(runners: Vec<Arc<dyn TestRunner>>) -> Self {
        Self { runners }
    }

    fn detected<'a>(&'a self, ctx: &RunContext) -> Vec<&'a Arc<dyn TestRunner>> {
        self.runners
            .iter()
            .filter(|r| r.detect(&ctx.repo_path))
            .collect()
    }
}

fn case_findings(report: &TestReport) -> Vec<Finding> {
    report
        .failing_cases
        .iter()
        .map(|case| {
            Finding::new(
                &report.framework,
                FindingCategory::TestFailure,
                TEST_FAILURE_SEVERITY,
                case.file.as_ref().map(Location::file),
                format!("{}: {}", case.name, case.message),
            )
            .with_rule(&case.name)
        })
        .collect()
}

#[async_trait]
impl StageCapability for TestStage {
    fn name(&self) -> StageName {
        StageName::Test
    }

    fn precheck(&self, changeset: &ChangeSet, ctx: &RunContext) -> Applicability {
        if !changeset.has_source_files() {
            return Applicability::NotApplicable("no source files changed".into());
        }
        if self.detected(ctx).is_empty() {
            return Applicability::NotApplicable("no test framework detected".into());
        }
        Applicability::Applicable
    }

    async fn execute(&self, changeset: &ChangeSet, ctx: &RunContext) -> Result<RawToolOutputs> {
        let files = changeset.present_paths();
        let calls = self
            .detected(ctx)
            .into_iter()
            .map(|r| (r.name().to_string(), r.run(&ctx.repo_path, &files)))
            .collect();
        let results = fan_out(
            ctx.run_id.0.as_str(),
            calls,
            ctx.config.stage_timeout(StageName::Test),
            &ctx.cancel,
        )
        .await?;
        Ok(RawToolOutputs::from_calls(StageName::Test, results))
    }

    async fn classify(&self, raw: RawToolOutputs, ctx: &RunContext) -> StageResult {
        let severity = ctx.config.gating.tool_unavailable;
        let mut tally = TestTally::default();
        let mut findings = Vec::new();
        let mut tools_invoked = Vec::new();
        let mut tools_failed = Vec::new();

        for output in &raw.outputs {
            tools_invoked.push(output.tool.clone());
            if let Some(f) = output.failure_finding(severity) {
                tools_failed.push(output.tool.clone());
                findings.push(f);
                continue;
            }
            match serde_json::from_value::<TestReport>(output.payload.clone()) {
                Ok(report) => {
                    findings.extend(case_findings(&report));
                    tally.merge(&TestTally {
                        passed: report.passed,
                        failed: report.failed,
                        skipped: report.skipped,
                        failing_cases: report
                            .failing_cases
                            .iter()
                            .map(|c| c.name.clone())
                            .collect(),
                    });
                }
                Err(e) => {
                    tools_failed.push(output.tool.clone());
                    findings.push(Finding::tool_unavailable(
                        &output.tool,
                        severity,
                        &format!("unreadable report: {e}"),
                    ));
                }
            }
        }

        let all_failed = !tools_invoked.is_empty() && tools_failed.len() == tools_invoked.len();
        let verdict = if tally.failed > 0 || all_failed {
            Verdict::Fail
        } else {
            Verdict::Pass
        };
        let note = if all_failed {
            Some("no test runner produced a report".to_string())
        } else if tally.failed > 0 {
            Some(format!("{} failing test(s)", tally.failed))
        } else {
            None
        };

        let mut result = StageResult::new(StageName::Test, findings, verdict);
        result.tally = Some(tally);
        result.tools_invoked = tools_invoked;
        result.tools_failed = tools_failed;
        result.note = note;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afterburner_core::cancellation::CancelSignal;
    use afterburner_core::config::PipelineConfig;
    use afterburner_core::domain::{ChangeStatus, FileChange};
    use afterburner_core::fakes::{test_report, ScriptedTestRunner};
    use afterburner_core::{run_stage, RunId, ToolError};

    fn ctx() -> RunContext {
        RunContext::new(
            RunId("test".into()),
            "/tmp/repo",
            Arc::new(PipelineConfig::default()),
            CancelSignal::never(),
        )
    }

    fn py() -> ChangeSet {
        ChangeSet::new(vec![FileChange::new("app.py", "a", ChangeStatus::Modified)])
    }

    #[tokio::test]
    async fn tallies_merge_across_frameworks() {
        let stage = TestStage::new(vec![
            Arc::new(ScriptedTestRunner::new(
                "pytest",
                vec![Ok(test_report("pytest", 4, &["test_login"]))],
            )),
            Arc::new(ScriptedTestRunner::new(
                "vitest",
                vec![Ok(test_report("vitest", 2, &["renders"]))],
            )),
        ]);
        let result = run_stage(&stage, &py(), &ctx()).await.unwrap();
        let tally = result.tally.unwrap();
        assert_eq!(result.verdict, Verdict::Fail);
        assert_eq!(tally.passed, 6);
        assert_eq!(tally.failed, 2);
        assert_eq!(tally.failing_cases, vec!["renders", "test_login"]);
        assert_eq!(result.findings.len(), 2);
        assert!(result
            .findings
            .iter()
            .all(|f| f.category == FindingCategory::TestFailure));
    }

    #[tokio::test]
    async fn green_run_passes() {
        let stage = TestStage::new(vec![Arc::new(ScriptedTestRunner::new(
            "cargo",
            vec![Ok(test_report("cargo", 12, &[]))],
        ))]);
        let result = run_stage(&stage, &py(), &ctx()).await.unwrap();
        assert_eq!(result.verdict, Verdict::Pass);
        assert!(result.findings.is_empty());
    }

    #[tokio::test]
    async fn unavailable_runner_fails_without_cases() {
        let stage = TestStage::new(vec![Arc::new(ScriptedTestRunner::new(
            "pytest",
            vec![Err(ToolError::NotInstalled {
                tool: "pytest".into(),
            })],
        ))]);
        let result = run_stage(&stage, &py(), &ctx()).await.unwrap();
        assert_eq!(result.verdict, Verdict::Fail);
        assert!(result.all_tools_failed());
        assert!(result.tally.unwrap().failing_cases.is_empty());
    }

    #[test]
    fn config_only_changes_skip_tests() {
        let stage = TestStage::new(vec![Arc::new(ScriptedTestRunner::new("pytest", vec![]))]);
        let cs = ChangeSet::new(vec![FileChange::new("app.yml", "a", ChangeStatus::Modified)]);
        assert!(matches!(
            stage.precheck(&cs, &ctx()),
            Applicability::NotApplicable(_)
        ));
    }
}
