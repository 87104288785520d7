//! `git` command line plus GitHub pull requests.

use std::path::Path;

use async_trait::async_trait;
use tracing::{info, warn};

use afterburner_core::{ChangeSet, CommitInfo, GitAdapter, PrRequest, ReviewState, ToolError};

use super::github::GithubClient;
use crate::runner::{run_command, CommandSpec};

const TOOL: &str = "git";

/// Branches the pipeline never commits to directly.
pub const PROTECTED_BRANCHES: &[&str] = &["main", "master", "develop", "dev"];

pub struct GitCli {
    remote: String,
    github: GithubClient,
}

impl GitCli {
    pub fn new(remote: impl Into<String>, github: GithubClient) -> Self {
        Self {
            remote: remote.into(),
            github,
        }
    }

    async fn git<I, S>(&self, repo: &Path, args: I) -> Result<String, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let out = run_command(&CommandSpec::new(TOOL, "git", repo).args(args))
            .await?
            .require_success()?;
        Ok(out.stdout.trim().to_string())
    }

    /// Reuse the current branch unless it is protected.
    async fn checkout(&self, repo: &Path, branch: &str) -> Result<String, ToolError> {
        let current = self.git(repo, ["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        if !current.is_empty() && current != "HEAD" && !PROTECTED_BRANCHES.contains(&current.as_str()) {
            info!(branch = %current, "already on a feature branch; reusing it");
            return Ok(current);
        }
        self.git(repo, ["checkout", "-b", branch]).await?;
        Ok(branch.to_string())
    }
}

#[async_trait]
impl GitAdapter for GitCli {
    async fn commit_and_branch(
        &self,
        repo: &Path,
        changeset: &ChangeSet,
        branch: &str,
        message: &str,
    ) -> Result<CommitInfo, ToolError> {
        if changeset.is_empty() {
            return Err(ToolError::failed(TOOL, "nothing to commit"));
        }
        let branch = self.checkout(repo, branch).await?;

        let mut add = vec!["add".to_string(), "--all".to_string(), "--".to_string()];
        add.extend(changeset.paths());
        self.git(repo, add).await?;
        self.git(repo, ["commit", "-m", message]).await?;
        let commit_id = self.git(repo, ["rev-parse", "HEAD"]).await?;
        let short = &commit_id[..commit_id.len().min(8)];
        info!(branch = %branch, commit = %short, "committed");

        // An unpushed commit is still a commit; the PR step reports the gap.
        if let Err(e) = self
            .git(repo, ["push", "-u", self.remote.as_str(), branch.as_str()])
            .await
        {
            warn!(remote = %self.remote, branch = %branch, error = %e, "push failed");
        }
        Ok(CommitInfo { branch, commit_id })
    }

    async fn open_pr(&self, _repo: &Path, request: &PrRequest) -> Result<Option<String>, ToolError> {
        self.github.open_pr(request).await
    }

    async fn review_state(&self, pr_url: &str) -> Result<ReviewState, ToolError> {
        self.github.review_state(pr_url).await
    }
}
