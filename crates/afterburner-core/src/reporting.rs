//! Summary construction and artifact persistence.
//!
//! A [`Summary`] is derived from a terminal (or parked) Run. Artifacts are
//! written to `<state_dir>/summaries/<run_id>.json` with a companion
//! `<run_id>.digest` for integrity checks and a rendered `<run_id>.md`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::domain::{
    AfterburnerError, BaselineCommit, ExitStatus, Finding, Result, Run, RunStatus, Severity,
    StageOutcome, StageState, Summary,
};
use afterburner_state::ContentDigest;

/// Findings at or above this severity are listed as unresolved in a Summary.
pub const SUMMARY_SEVERITY: Severity = Severity::High;

/// Build the Summary for `run`.
///
/// Fails with `InvariantViolation` while the Run is still active.
pub fn build_summary(run: &Run) -> Result<Summary> {
    let overall_status = ExitStatus::from_status(run.status).ok_or_else(|| {
        AfterburnerError::InvariantViolation(format!(
            "run {} is {}; no summary yet",
            run.id,
            run.status.as_str()
        ))
    })?;

    // A Run that found nothing to do never entered a stage.
    let never_staged = run.status == RunStatus::Completed && run.changeset.is_empty();
    let stages = if never_staged {
        Vec::new()
    } else {
        run.stages
            .iter()
            .map(|s| StageOutcome {
                name: s.name,
                state: s.state,
                attempts: s.attempts,
                findings_total: s.findings.len(),
                duplicates: s.findings.iter().filter(|f| f.is_duplicate()).count(),
                unresolved: s.findings.iter().filter(|f| !f.resolved && !f.is_duplicate()).count(),
                note: s.note.clone(),
                tally: s.tally.clone(),
            })
            .collect()
    };

    let mut unresolved_findings: Vec<Finding> = run
        .stages
        .iter()
        .flat_map(|s| s.findings.iter())
        .filter(|f| f.blocks_at(SUMMARY_SEVERITY))
        .cloned()
        .collect();
    unresolved_findings.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.id.cmp(&b.id)));

    let mut artifacts = BTreeMap::new();
    for s in &run.stages {
        artifacts.extend(s.artifacts.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    Ok(Summary {
        run_id: run.id.0.clone(),
        overall_status,
        changed_files: run.changeset.paths(),
        stages,
        unresolved_findings,
        retry_history: run.retry_history.clone(),
        block_reason: run.block_reason.clone(),
        artifacts,
        baseline: run.baseline_commit.clone(),
        duration_ms: run.duration_ms(),
        generated_at: Utc::now(),
    })
}

/// Render a Markdown report, used for the PR body and the `.md` artifact.
pub fn render_summary_md(summary: &Summary) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Afterburner Run `{}`\n\n", summary.run_id));
    out.push_str(&format!(
        "- status: **{}**\n- duration: {} ms\n",
        summary.overall_status, summary.duration_ms
    ));
    match &summary.baseline {
        BaselineCommit::Committed { version, digest } => out.push_str(&format!(
            "- baseline: v{} `{}`\n",
            version,
            digest.get(..12).unwrap_or(digest)
        )),
        BaselineCommit::Stale { detail } => {
            out.push_str(&format!("- baseline: stale ({detail}); start a fresh run\n"))
        }
        BaselineCommit::Failed { detail } => {
            out.push_str(&format!("- baseline: not committed ({detail})\n"))
        }
        BaselineCommit::NotAttempted => {}
    }
    out.push('\n');

    out.push_str(&format!("## Changes\n{} file(s)\n", summary.changed_files.len()));
    for f in &summary.changed_files {
        out.push_str(&format!("- `{f}`\n"));
    }
    out.push('\n');

    out.push_str("## Stages\n\n| stage | state | attempts | findings | unresolved |\n|---|---|---|---|---|\n");
    for s in &summary.stages {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            s.name,
            stage_state_label(s.state),
            s.attempts,
            s.findings_total,
            s.unresolved
        ));
    }
    out.push('\n');

    if !summary.unresolved_findings.is_empty() {
        out.push_str("## Security Findings\n");
        let mut severity = None;
        for f in &summary.unresolved_findings {
            if severity != Some(f.severity) {
                severity = Some(f.severity);
                out.push_str(&format!("### {}\n", f.severity));
            }
            let loc = match &f.location {
                Some(l) => match l.lines {
                    Some(r) => format!("`{}:{}`", l.file, r.start),
                    None => format!("`{}`", l.file),
                },
                None => "-".into(),
            };
            out.push_str(&format!("- [{}] {} {}\n", f.source_tool, loc, f.message));
        }
        out.push('\n');
    }

    if let Some(tally) = summary.stages.iter().find_map(|s| s.tally.as_ref()) {
        out.push_str(&format!(
            "## Tests\n- passed: {}\n- failed: {}\n- skipped: {}\n",
            tally.passed, tally.failed, tally.skipped
        ));
        for case in &tally.failing_cases {
            out.push_str(&format!("  - `{case}`\n"));
        }
        out.push('\n');
    }

    if !summary.retry_history.is_empty() {
        out.push_str("## Retry History\n");
        for c in &summary.retry_history {
            out.push_str(&format!(
                "- {} #{}: {} ({})\n",
                c.kind, c.iteration, c.outcome, c.trigger_reason
            ));
        }
        out.push('\n');
    }

    let git: Vec<_> = ["branch", "commit", "pr_url"]
        .iter()
        .filter_map(|k| summary.artifacts.get(*k).map(|v| (k, v)))
        .collect();
    if !git.is_empty() {
        out.push_str("## Git\n");
        for (k, v) in git {
            out.push_str(&format!("- {k}: {v}\n"));
        }
        out.push('\n');
    }

    let deploy: Vec<_> = ["ci_manifest", "deploy_target", "deploy_url"]
        .iter()
        .filter_map(|k| summary.artifacts.get(*k).map(|v| (k, v)))
        .collect();
    if !deploy.is_empty() {
        out.push_str("## Deployment\n");
        for (k, v) in deploy {
            out.push_str(&format!("- {k}: {v}\n"));
        }
        out.push('\n');
    }

    if let Some(reason) = &summary.block_reason {
        let stage = reason.stage.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
        out.push_str(&format!(
            "## Blocking Reason\n- kind: `{}`\n- stage: {}\n- detail: {}\n",
            reason.kind, stage, reason.detail
        ));
        for f in &reason.findings {
            out.push_str(&format!("- finding: **{}** {}\n", f.severity, f.message));
        }
    }
    out
}

fn stage_state_label(state: StageState) -> &'static str {
    match state {
        StageState::Pending => "pending",
        StageState::Running => "running",
        StageState::Passed => "passed",
        StageState::Failed => "failed",
        StageState::Blocked => "blocked",
        StageState::Skipped => "skipped",
        StageState::AwaitingExternal => "awaiting external",
    }
}

/// Write `<run_id>.json`, `<run_id>.digest` and `<run_id>.md` under `dir`.
///
/// Returns the path to the JSON file.
pub fn write_summary_artifact(summary: &Summary, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let json_path = dir.join(format!("{}.json", summary.run_id));
    let json = serde_json::to_vec_pretty(summary)?;
    std::fs::write(&json_path, &json)?;
    std::fs::write(
        dir.join(format!("{}.digest", summary.run_id)),
        ContentDigest::from_bytes(&json).as_str().as_bytes(),
    )?;
    std::fs::write(
        dir.join(format!("{}.md", summary.run_id)),
        render_summary_md(summary),
    )?;
    Ok(json_path)
}

/// Read and integrity-verify `<dir>/<run_id>.json`.
pub fn read_summary_artifact(run_id: &str, dir: &Path) -> Result<Summary> {
    let json = std::fs::read(dir.join(format!("{run_id}.json")))?;
    let expected = std::fs::read_to_string(dir.join(format!("{run_id}.digest")))?;
    let expected = expected.trim();
    let actual = ContentDigest::from_bytes(&json).as_str().to_string();
    if expected != actual {
        return Err(AfterburnerError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(serde_json::from_slice(&json)?)
}
