//! Gate evaluation for stage and Run completion.

use serde::{Deserialize, Serialize};

use afterburner_core::aggregator::blocking_findings;
use afterburner_core::{Finding, Run, Severity, StageName};

/// Gate evaluation verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    pub message: String,
}

impl GateVerdict {
    fn from_violations(violations: Vec<String>, ok: &str) -> Self {
        let passed = violations.is_empty();
        let message = if passed {
            ok.to_string()
        } else {
            format!("gate failed with {} violation(s)", violations.len())
        };
        Self {
            passed,
            violations,
            message,
        }
    }
}

/// Severity gate for a single stage.
pub struct StageGate;

impl StageGate {
    /// Fails iff an unresolved canonical finding at or above `threshold` remains.
    pub fn evaluate(findings: &[Finding], threshold: Severity) -> GateVerdict {
        let violations = blocking_findings(findings, threshold)
            .iter()
            .map(|f| {
                let at = f.file().map(|p| format!(" in {p}")).unwrap_or_default();
                format!("{} {} finding{at}: {}", f.severity, f.source_tool, f.message)
            })
            .collect();
        GateVerdict::from_violations(violations, "no blocking findings")
    }
}

/// Completion gate for a Run.
///
/// Rule: every required stage Passed; every stage in `skippable` Passed or
/// Skipped.
pub struct CompletionGate;

impl CompletionGate {
    pub fn evaluate(run: &Run, skippable: &[StageName]) -> GateVerdict {
        GateVerdict::from_violations(run.completion_violations(skippable), "all stages passed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afterburner_core::domain::{FindingCategory, Location, StageState};
    use afterburner_core::{RunId, TriggerEvent};

    #[test]
    fn stage_gate_lists_blocking_findings() {
        let mut low = Finding::new(
            "bandit",
            FindingCategory::CodeVulnerability,
            Severity::Low,
            None,
            "assert used",
        );
        let high = Finding::new(
            "semgrep",
            FindingCategory::Secret,
            Severity::High,
            Some(Location::file("auth.py")),
            "hardcoded password",
        );
        let verdict = StageGate::evaluate(&[low.clone(), high.clone()], Severity::High);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 1);
        assert!(verdict.violations[0].contains("auth.py"));

        low.severity = Severity::Medium;
        let mut fixed = high;
        fixed.resolved = true;
        assert!(StageGate::evaluate(&[low, fixed], Severity::High).passed);
    }

    #[test]
    fn empty_findings_pass() {
        let verdict = StageGate::evaluate(&[], Severity::Info);
        assert!(verdict.passed);
        assert_eq!(verdict.message, "no blocking findings");
    }

    #[test]
    fn completion_requires_git() {
        let mut run = Run::new(RunId("r".into()), TriggerEvent::manual("/tmp/repo"));
        for name in StageName::ALL {
            run.stage_mut(name).skip("nothing to do");
        }
        let skippable = [StageName::Security, StageName::Test, StageName::Launch];
        let verdict = CompletionGate::evaluate(&run, &skippable);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 1);

        run.stage_mut(StageName::Git).state = StageState::Passed;
        assert!(CompletionGate::evaluate(&run, &skippable).passed);
    }
}
