//! Pipeline configuration.
//!
//! Layering, lowest to highest precedence: built-in defaults, an optional
//! `afterburner.toml`, then `AFTERBURNER_*` environment variables. CLI
//! flags are applied by the binary on top of the loaded value.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Severity, StageName};

/// Name of the per-repository config file.
pub const CONFIG_FILE_NAME: &str = "afterburner.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatingConfig {
    /// Minimum unresolved severity that blocks a stage.
    pub threshold: Severity,
    /// Minimum severity of a *new* reflection finding that blocks the Run.
    pub reflection_block: Severity,
    /// Severity given to synthetic ToolUnavailable/Timeout findings.
    pub tool_unavailable: Severity,
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            threshold: Severity::High,
            reflection_block: Severity::High,
            tool_unavailable: Severity::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_self_debug: u32,
    pub max_reflection: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_self_debug: 4,
            max_reflection: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Budget for a single external call inside a stage.
    pub tool_secs: u64,
    pub security_secs: u64,
    pub test_secs: u64,
    pub git_secs: u64,
    pub launch_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            tool_secs: 120,
            security_secs: 300,
            test_secs: 300,
            git_secs: 120,
            launch_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    /// Minimum line-range overlap (fraction of the shorter range).
    pub min_line_overlap: f64,
    /// Minimum token Jaccard similarity of normalized messages.
    pub min_message_similarity: f64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            min_line_overlap: 0.5,
            min_message_similarity: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Security tools to run: semgrep, bandit, npm_audit, cargo_audit.
    pub security: Vec<String>,
    /// Test frameworks to try: pytest, vitest, jest, cargo, playwright.
    pub tests: Vec<String>,
    /// External command that proposes and applies fixes for failing tests.
    pub fix_command: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            security: vec![
                "semgrep".into(),
                "bandit".into(),
                "npm_audit".into(),
                "cargo_audit".into(),
            ],
            tests: vec![
                "pytest".into(),
                "vitest".into(),
                "jest".into(),
                "cargo".into(),
            ],
            fix_command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub base_branch: String,
    pub remote: String,
    pub branch_prefix: String,
    pub auto_pr: bool,
    /// Park the Run as Pending-external until the PR is approved.
    pub require_pr_approval: bool,
    pub reviewers: Vec<String>,
    /// `owner/name` for the GitHub API.
    pub github_repo: Option<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".into(),
            remote: "origin".into(),
            branch_prefix: "afterburner".into(),
            auto_pr: true,
            require_pr_approval: false,
            reviewers: Vec::new(),
            github_repo: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// `vercel` or `docker`; `None` skips deployment.
    pub target: Option<String>,
    pub skip: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub gating: GatingConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub dedupe: DedupeConfig,
    pub tools: ToolsConfig,
    pub git: GitConfig,
    pub launch: LaunchConfig,
    /// Stages that may end Skipped in a Completed Run.
    pub skippable_stages: Vec<StageName>,
    /// Local state (database, summaries), relative to the repository.
    pub state_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gating: GatingConfig::default(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            dedupe: DedupeConfig::default(),
            tools: ToolsConfig::default(),
            git: GitConfig::default(),
            launch: LaunchConfig::default(),
            skippable_stages: vec![StageName::Security, StageName::Test, StageName::Launch],
            state_dir: PathBuf::from(".afterburner"),
        }
    }
}

impl PipelineConfig {
    /// Load defaults, then `explicit` (or `<repo>/afterburner.toml` when it
    /// exists), then the process environment.
    pub fn load(repo: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let candidate = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo.join(CONFIG_FILE_NAME));

        let mut config = if explicit.is_some() || candidate.exists() {
            Self::from_file(&candidate)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })
    }

    /// Apply `AFTERBURNER_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in [
            "AFTERBURNER_SECURITY_BLOCK_ON",
            "AFTERBURNER_GATING_THRESHOLD",
        ] {
            if let Some(v) = lookup(key) {
                self.gating.threshold = parse_value(key, &v)?;
            }
        }
        if let Some(v) = lookup("AFTERBURNER_MAX_TEST_DEBUG_ITERATIONS") {
            self.retry.max_self_debug = parse_value("AFTERBURNER_MAX_TEST_DEBUG_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("AFTERBURNER_MAX_REFLECTION_RETRIES") {
            self.retry.max_reflection = parse_value("AFTERBURNER_MAX_REFLECTION_RETRIES", &v)?;
        }
        if let Some(v) = lookup("AFTERBURNER_TEST_TIMEOUT_SECONDS") {
            self.timeouts.test_secs = parse_value("AFTERBURNER_TEST_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = lookup("AFTERBURNER_GIT_BASE_BRANCH") {
            self.git.base_branch = v;
        }
        if let Some(v) = lookup("AFTERBURNER_AUTO_PR") {
            self.git.auto_pr = parse_bool("AFTERBURNER_AUTO_PR", &v)?;
        }
        if let Some(v) = lookup("AFTERBURNER_PR_REVIEWERS") {
            self.git.reviewers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("AFTERBURNER_GITHUB_REPO") {
            self.git.github_repo = Some(v);
        }
        if let Some(v) = lookup("AFTERBURNER_DEPLOY_TARGET") {
            self.launch.target = match v.trim().to_ascii_lowercase().as_str() {
                "" | "none" => None,
                other => Some(other.to_string()),
            };
        }
        if let Some(v) = lookup("AFTERBURNER_SKIP_DEPLOY") {
            self.launch.skip = parse_bool("AFTERBURNER_SKIP_DEPLOY", &v)?;
        }
        if let Some(v) = lookup("AFTERBURNER_FIX_COMMAND") {
            self.tools.fix_command = Some(v).filter(|s| !s.trim().is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_self_debug == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_self_debug must be at least 1".into(),
            ));
        }
        if self.retry.max_reflection == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_reflection must be at least 1".into(),
            ));
        }
        for (name, v) in [
            ("dedupe.min_line_overlap", self.dedupe.min_line_overlap),
            (
                "dedupe.min_message_similarity",
                self.dedupe.min_message_similarity,
            ),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1]")));
            }
        }
        if self.skippable_stages.contains(&StageName::Git) && self.git.require_pr_approval {
            return Err(ConfigError::Invalid(
                "git cannot be skippable when PR approval is required".into(),
            ));
        }
        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.tool_secs)
    }

    pub fn stage_timeout(&self, stage: StageName) -> Duration {
        let secs = match stage {
            StageName::Security => self.timeouts.security_secs,
            StageName::Test => self.timeouts.test_secs,
            StageName::Git => self.timeouts.git_secs,
            StageName::Launch => self.timeouts.launch_secs,
        };
        Duration::from_secs(secs)
    }

    /// State directory resolved against the repository root.
    pub fn state_dir_for(&self, repo: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            repo.join(&self.state_dir)
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
