//! Git stage: branch, commit, push, open a pull request.
//!
//! With `require_pr_approval` the stage parks on `PendingExternal` and is
//! resumed by polling the PR review state.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use afterburner_core::capability::{RawToolOutput, RawToolOutputs};
use afterburner_core::domain::{FileKind, FindingCategory};
use afterburner_core::fanout::ToolCall;
use afterburner_core::{
    fan_out, obs, Applicability, ChangeSet, CommitInfo, Finding, GitAdapter, PrRequest, Result,
    ReviewState, RunContext, Severity, StageCapability, StageName, StageRecord, StageResult,
    Verdict,
};

pub const PR_LABELS: &[&str] = &["afterburner", "auto-generated"];

const COMMIT_TOOL: &str = "git";
const PR_TOOL: &str = "pull_request";
const REVIEW_TOOL: &str = "pr_review";

pub struct GitStage {
    adapter: Arc<dyn GitAdapter>,
}

impl GitStage {
    pub fn new(adapter: Arc<dyn GitAdapter>) -> Self {
        Self { adapter }
    }
}

/// Conventional-commit type inferred from what changed.
pub fn change_type(changeset: &ChangeSet) -> &'static str {
    let files = changeset.files();
    if files.is_empty() {
        return "chore";
    }
    if files.iter().all(|f| f.kind == FileKind::Docs) {
        return "docs";
    }
    if files.iter().all(|f| is_test_path(&f.path)) {
        return "test";
    }
    if files
        .iter()
        .all(|f| matches!(f.kind, FileKind::Config | FileKind::Docker))
    {
        return "chore";
    }
    if files.iter().any(|f| {
        f.kind.is_source() && f.status == afterburner_core::domain::ChangeStatus::Added
    }) {
        return "feat";
    }
    "fix"
}

fn is_test_path(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    path.starts_with("tests/")
        || path.starts_with("test/")
        || path.contains("/tests/")
        || path.contains("__tests__/")
        || name.starts_with("test_")
        || name.contains(".test.")
        || name.contains(".spec.")
        || name.ends_with("_test.go")
        || name.ends_with("_test.py")
}

/// Lowercase alphanumerics and single dashes, at most 40 chars.
pub fn slugify(raw: &str) -> String {
    let mut slug = String::new();
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "changes".to_string()
    } else {
        slug
    }
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.split('.').next().filter(|s| !s.is_empty()).unwrap_or(name)
}

/// `<prefix>/<type>/<slug>-<timestamp>`.
pub fn branch_name(prefix: &str, changeset: &ChangeSet, at: chrono::DateTime<Utc>) -> String {
    let subject = match changeset.files() {
        [one] => file_stem(&one.path).to_string(),
        files => files
            .iter()
            .take(3)
            .map(|f| file_stem(&f.path))
            .collect::<Vec<_>>()
            .join("-"),
    };
    format!(
        "{}/{}/{}-{}",
        prefix.trim_end_matches('/'),
        change_type(changeset),
        slugify(&subject),
        at.format("%Y%m%d%H%M%S")
    )
}

pub fn fallback_commit_message(changeset: &ChangeSet) -> String {
    format!(
        "chore: afterburner automated commit ({} files changed)",
        changeset.len()
    )
}

/// Conventional-commit subject; the fallback when no scope can be named.
pub fn commit_message(changeset: &ChangeSet) -> String {
    let kind = change_type(changeset);
    let paths = changeset.paths();
    match paths.len() {
        0 => fallback_commit_message(changeset),
        1..=3 => {
            let names: Vec<&str> = paths
                .iter()
                .map(|p| p.rsplit('/').next().unwrap_or(p))
                .collect();
            format!("{kind}: update {}", names.join(", "))
        }
        n => {
            let first_dir = |p: &String| p.split_once('/').map(|(d, _)| d.to_string());
            let scope = first_dir(&paths[0]);
            match scope {
                Some(dir) if paths.iter().all(|p| first_dir(p).as_deref() == Some(dir.as_str())) => {
                    format!("{kind}({dir}): update {n} files")
                }
                _ => fallback_commit_message(changeset),
            }
        }
    }
}

/// Owners named in the first CODEOWNERS file found, without the `@`.
pub fn codeowners(repo: &Path) -> Vec<String> {
    let content = ["CODEOWNERS", ".github/CODEOWNERS", "docs/CODEOWNERS"]
        .iter()
        .find_map(|p| std::fs::read_to_string(repo.join(p)).ok());
    let Some(content) = content else {
        return Vec::new();
    };
    let mut owners: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .flat_map(|l| l.split_whitespace().skip(1))
        .filter_map(|o| o.strip_prefix('@'))
        // Team handles (org/team) cannot be requested as individual reviewers.
        .filter(|o| !o.contains('/'))
        .map(String::from)
        .collect();
    owners.sort();
    owners.dedup();
    owners
}

fn pr_body(changeset: &ChangeSet, ctx: &RunContext) -> String {
    let mut body = format!(
        "Automated changes from Afterburner run `{}`.\n\n## Changes\n",
        ctx.run_id
    );
    for f in changeset.files() {
        body.push_str(&format!("- `{}` ({:?})\n", f.path, f.status));
    }
    body
}

fn output_of<T: serde::Serialize>(calls: Vec<ToolCall<T>>) -> Vec<RawToolOutput> {
    calls.into_iter().map(RawToolOutput::from_call).collect()
}

#[async_trait]
impl StageCapability for GitStage {
    fn name(&self) -> StageName {
        StageName::Git
    }

    fn precheck(&self, changeset: &ChangeSet, _ctx: &RunContext) -> Applicability {
        if changeset.is_empty() {
            return Applicability::NotApplicable("nothing to commit".into());
        }
        Applicability::Applicable
    }

    async fn execute(&self, changeset: &ChangeSet, ctx: &RunContext) -> Result<RawToolOutputs> {
        let run_id = ctx.run_id.0.as_str();
        let cfg = &ctx.config.git;
        let timeout = ctx.config.tool_timeout();
        let branch = branch_name(&cfg.branch_prefix, changeset, Utc::now());
        let message = commit_message(changeset);

        let commit = fan_out(
            run_id,
            vec![(
                COMMIT_TOOL.to_string(),
                self.adapter
                    .commit_and_branch(&ctx.repo_path, changeset, &branch, &message),
            )],
            timeout,
            &ctx.cancel,
        )
        .await?;
        let committed = commit.iter().any(|c| c.result.is_ok());
        let mut raw = RawToolOutputs::new(StageName::Git);
        raw.outputs.extend(output_of(commit));

        if committed && cfg.auto_pr {
            let reviewers = if cfg.reviewers.is_empty() {
                codeowners(&ctx.repo_path)
            } else {
                cfg.reviewers.clone()
            };
            let request = PrRequest {
                branch: branch.clone(),
                base_branch: cfg.base_branch.clone(),
                title: message.clone(),
                body: pr_body(changeset, ctx),
                labels: PR_LABELS.iter().map(|l| l.to_string()).collect(),
                reviewers,
            };
            let pr = fan_out(
                run_id,
                vec![(
                    PR_TOOL.to_string(),
                    self.adapter.open_pr(&ctx.repo_path, &request),
                )],
                timeout,
                &ctx.cancel,
            )
            .await?;
            raw.outputs.extend(output_of(pr));
        }
        Ok(raw)
    }

    async fn classify(&self, raw: RawToolOutputs, ctx: &RunContext) -> StageResult {
        let severity = ctx.config.gating.tool_unavailable;
        let mut result = StageResult::new(StageName::Git, Vec::new(), Verdict::Pass);

        for output in &raw.outputs {
            result.tools_invoked.push(output.tool.clone());
            if let Some(f) = output.failure_finding(severity) {
                result.tools_failed.push(output.tool.clone());
                result.findings.push(f);
                continue;
            }
            match output.tool.as_str() {
                COMMIT_TOOL => {
                    if let Ok(info) = serde_json::from_value::<CommitInfo>(output.payload.clone()) {
                        result.artifacts.insert("branch".into(), info.branch);
                        result.artifacts.insert("commit".into(), info.commit_id);
                    }
                }
                PR_TOOL => {
                    if let Ok(Some(url)) =
                        serde_json::from_value::<Option<String>>(output.payload.clone())
                    {
                        result.artifacts.insert("pr_url".into(), url);
                    }
                }
                _ => {}
            }
        }

        if !result.artifacts.contains_key("commit") {
            result.verdict = Verdict::Fail;
            // Only the commit call ran; mark the stage as wholly unavailable.
            result.tools_failed = result.tools_invoked.clone();
            result.note = Some("commit failed".into());
            return result;
        }

        if ctx.config.git.require_pr_approval {
            if result.artifacts.contains_key("pr_url") {
                result.verdict = Verdict::PendingExternal;
                result.note = Some("awaiting pull request approval".into());
            } else {
                result.verdict = Verdict::Fail;
                result.findings.push(Finding::new(
                    PR_TOOL,
                    FindingCategory::ExternalRejection,
                    Severity::High,
                    None,
                    "pull request approval is required but no pull request was opened",
                ));
                result.note = Some("no pull request to approve".into());
            }
        }
        result
    }

    async fn poll_external(&self, record: &StageRecord, ctx: &RunContext) -> Result<StageResult> {
        let mut result = StageResult::new(StageName::Git, Vec::new(), Verdict::PendingExternal);
        result.artifacts = record.artifacts.clone();
        result.tools_invoked.push(REVIEW_TOOL.to_string());

        let Some(url) = record.artifacts.get("pr_url") else {
            result.verdict = Verdict::Fail;
            result.findings.push(Finding::new(
                REVIEW_TOOL,
                FindingCategory::ExternalRejection,
                Severity::High,
                None,
                "parked without a pull request",
            ));
            return Ok(result);
        };

        let polled = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(afterburner_core::AfterburnerError::Cancelled),
            r = tokio::time::timeout(ctx.config.tool_timeout(), self.adapter.review_state(url)) => r,
        };
        match polled {
            Ok(Ok(ReviewState::Approved)) => {
                result.verdict = Verdict::Pass;
                result.note = Some("pull request approved".into());
            }
            Ok(Ok(ReviewState::Pending)) => {
                result.note = Some("awaiting pull request approval".into());
            }
            Ok(Ok(ReviewState::Rejected { reason })) => {
                result.verdict = Verdict::Fail;
                result.note = Some(format!("pull request rejected: {reason}"));
                result.findings.push(
                    Finding::new(
                        REVIEW_TOOL,
                        FindingCategory::ExternalRejection,
                        Severity::High,
                        None,
                        format!("pull request {url} rejected: {reason}"),
                    ),
                );
            }
            Ok(Err(e)) => {
                obs::emit_tool_failed(ctx.run_id.0.as_str(), REVIEW_TOOL, &e);
                result.note = Some(format!("review state unavailable: {e}"));
            }
            Err(_) => {
                result.note = Some("review state poll timed out".into());
            }
        }
        Ok(result)
    }
}
