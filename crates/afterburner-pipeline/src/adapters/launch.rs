//! CI manifest generation and command-line deploys (vercel, docker compose).

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use afterburner_core::{DeployOutcome, DeployStatus, LaunchAdapter, ToolError};

use crate::runner::{run_command, CommandOutput, CommandSpec};

pub const WORKFLOW_PATH: &str = ".github/workflows/afterburner.yml";

const COMPOSE_FILES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

const WORKFLOW: &str = r#"name: afterburner

on:
  push:
    branches: [main, master, develop]
  pull_request:
    branches: [main, master]

jobs:
  afterburner:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
      - uses: actions/setup-python@v5
        with:
          python-version: "3.11"
      - name: Install scanners
        run: |
          if [ -f requirements.txt ]; then pip install -r requirements.txt; fi
          pip install bandit semgrep
      - name: bandit
        run: bandit -r . -f json -o bandit-report.json || true
      - name: semgrep
        run: semgrep scan --json --quiet . > semgrep-report.json || true
      - name: tests
        run: python -m pytest --tb=short -q || true
      - uses: actions/upload-artifact@v4
        if: always()
        with:
          name: afterburner-reports
          path: |
            bandit-report.json
            semgrep-report.json
"#;

#[derive(Debug, Default, Clone)]
pub struct CommandLaunch {
    /// Passed as `--token` to vercel.
    pub vercel_token: Option<String>,
}

impl CommandLaunch {
    /// Token from `AFTERBURNER_VERCEL_TOKEN`.
    pub fn from_env() -> Self {
        Self {
            vercel_token: std::env::var("AFTERBURNER_VERCEL_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
        }
    }

    async fn vercel(&self, repo: &Path) -> Result<DeployOutcome, ToolError> {
        let mut spec = CommandSpec::new("vercel", "vercel", repo).args(["--prod", "--yes"]);
        if let Some(token) = &self.vercel_token {
            spec = spec.arg("--token").arg(token.as_str());
        }
        let out = run_command(&spec).await?;
        Ok(outcome(&out, deployment_url(&out.stdout)))
    }

    async fn docker(&self, repo: &Path) -> Result<DeployOutcome, ToolError> {
        let Some(compose) = COMPOSE_FILES.iter().find(|f| repo.join(f).is_file()) else {
            return Ok(DeployOutcome {
                status: DeployStatus::Failed {
                    reason: "no docker compose file in the project root".into(),
                },
                url: None,
            });
        };
        let out = run_command(
            &CommandSpec::new("docker", "docker", repo)
                .args(["compose", "-f", *compose, "up", "-d", "--build"]),
        )
        .await?;
        Ok(outcome(&out, Some("http://localhost".into())))
    }
}

fn outcome(out: &CommandOutput, url: Option<String>) -> DeployOutcome {
    if out.success() {
        info!(tool = %out.tool, url = ?url, "deployed");
        return DeployOutcome {
            status: DeployStatus::Success,
            url,
        };
    }
    let reason = out
        .stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("deploy command failed")
        .trim()
        .to_string();
    warn!(tool = %out.tool, exit = out.exit_code, %reason, "deploy failed");
    DeployOutcome {
        status: DeployStatus::Failed { reason },
        url: None,
    }
}

/// Last URL printed on stdout.
pub fn deployment_url(stdout: &str) -> Option<String> {
    static URL: OnceLock<Regex> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r"https?://[^\s]+").expect("valid url regex"))
        .find_iter(stdout)
        .last()
        .map(|m| m.as_str().to_string())
}

#[async_trait]
impl LaunchAdapter for CommandLaunch {
    async fn generate_ci_manifest(&self, repo: &Path) -> Result<PathBuf, ToolError> {
        let path = repo.join(WORKFLOW_PATH);
        if path.is_file() {
            debug!(path = %path.display(), "CI manifest already present");
            return Ok(path);
        }
        let io = |e: std::io::Error| ToolError::failed("ci_manifest", e.to_string());
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io)?;
        }
        tokio::fs::write(&path, WORKFLOW).await.map_err(io)?;
        info!(path = %path.display(), "generated CI manifest");
        Ok(path)
    }

    async fn deploy(&self, repo: &Path, target: &str) -> Result<DeployOutcome, ToolError> {
        match target {
            "vercel" => self.vercel(repo).await,
            "docker" => self.docker(repo).await,
            other => Err(ToolError::failed(
                "deploy",
                format!("unknown deploy target '{other}'"),
            )),
        }
    }
}
