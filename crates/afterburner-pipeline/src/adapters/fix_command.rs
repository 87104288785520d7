//! Fix proposer backed by an external command.
//!
//! The command runs through `sh -c` in the repository with a JSON request
//! on stdin:
//!
//! ```json
//! {"failing_cases": [{"name": "...", "file": "...", "message": "..."}],
//!  "files": ["src/app.py"]}
//! ```
//!
//! It edits the working tree itself and may print extra touched paths on
//! stdout, one per line. Exit status 0 means a fix was applied.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use afterburner_core::{refresh_changeset, ChangeSet, FailingCase, FixError, FixProposer, ToolError};

use crate::runner::{run_command, CommandSpec};

#[derive(Serialize)]
struct FixRequest<'a> {
    failing_cases: &'a [FailingCase],
    files: Vec<String>,
}

pub struct CommandFixProposer {
    command: Option<String>,
    timeout: Duration,
}

impl CommandFixProposer {
    pub fn new(command: Option<String>, timeout: Duration) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
            timeout,
        }
    }
}

/// Relative paths printed by the fixer; anything else is chatter.
fn touched_paths(stdout: &str, repo: &Path) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('/') && !l.contains(' '))
        .filter(|l| repo.join(l).exists())
        .map(String::from)
        .collect()
}

#[async_trait]
impl FixProposer for CommandFixProposer {
    async fn propose_fix(
        &self,
        repo: &Path,
        failing_cases: &[FailingCase],
        context: &ChangeSet,
    ) -> Result<ChangeSet, FixError> {
        let Some(command) = &self.command else {
            return Err(FixError::NoFixAvailable("no fix command configured".into()));
        };
        let request = serde_json::to_vec(&FixRequest {
            failing_cases,
            files: context.present_paths(),
        })
        .map_err(|e| FixError::Unavailable(e.to_string()))?;

        let spec = CommandSpec::new("fix_command", "sh", repo)
            .args(["-c", command.as_str()])
            .stdin(request)
            .timeout(self.timeout);
        let out = run_command(&spec).await.map_err(|e| match e {
            ToolError::TimedOut { secs, .. } => {
                FixError::Unavailable(format!("fix command timed out after {secs}s"))
            }
            other => FixError::Unavailable(other.to_string()),
        })?;
        if !out.success() {
            let detail = out
                .stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("fix command reported no fix")
                .trim()
                .to_string();
            return Err(FixError::NoFixAvailable(detail));
        }

        let extra = touched_paths(&out.stdout, repo);
        let patched = refresh_changeset(repo, context, &extra)
            .map_err(|e| FixError::Unavailable(format!("re-fingerprint after fix: {e}")))?;
        info!(
            cases = failing_cases.len(),
            extra = extra.len(),
            "fix command applied"
        );
        Ok(patched)
    }
}
