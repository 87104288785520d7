//! Command-line and HTTP backed collaborators.
//!
//! Every adapter shells out through [`crate::runner`] or talks to GitHub
//! over `reqwest`; none of them decides a verdict. `command_stage_set`
//! wires them into the four stages from a [`PipelineConfig`].

pub mod fix_command;
pub mod git_cli;
pub mod github;
pub mod launch;
pub mod scanners;
pub mod test_runners;
pub mod triage;

use std::sync::Arc;

use afterburner_core::{FixProposer, PipelineConfig};

pub use fix_command::CommandFixProposer;
pub use git_cli::GitCli;
pub use github::{GithubClient, GithubConfig};
pub use launch::CommandLaunch;
pub use scanners::{scanners_from_config, Bandit, CargoAudit, NpmAudit, Semgrep};
pub use test_runners::{runners_from_config, CargoTest, JsRunner, Playwright, Pytest};
pub use triage::RuleTriage;

use crate::orchestrator::StageSet;
use crate::stages::{GitStage, LaunchStage, SecurityStage, TestStage};

/// Stages and fix proposer backed by the real tools named in `config`.
pub fn command_stage_set(config: &PipelineConfig) -> (StageSet, Arc<dyn FixProposer>) {
    let github = GithubClient::new(GithubConfig::from_env(config.git.github_repo.clone()));
    let stages = StageSet {
        security: Arc::new(SecurityStage::new(
            scanners_from_config(&config.tools.security),
            Arc::new(RuleTriage),
        )),
        test: Arc::new(TestStage::new(runners_from_config(&config.tools.tests))),
        git: Arc::new(GitStage::new(Arc::new(GitCli::new(
            config.git.remote.clone(),
            github,
        )))),
        launch: Arc::new(LaunchStage::new(Arc::new(CommandLaunch::from_env()))),
    };
    let fixer: Arc<dyn FixProposer> = Arc::new(CommandFixProposer::new(
        config.tools.fix_command.clone(),
        config.tool_timeout(),
    ));
    (stages, fixer)
}
