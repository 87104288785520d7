//! Afterburner CLI
//!
//! The `afterburner` command runs the quality pipeline over freshly written
//! code in a repository.
//!
//! ## Commands
//!
//! - `run`: resolve changes and drive them through every gate
//! - `resume`: re-check a Run parked on pull request approval
//! - `cancel`: cancel a parked Run
//! - `status`: list Runs or show one
//! - `summary`: print the sealed Summary of a Run
//! - `watch`: poll the repository and start a Run per detected change
//!
//! Exit codes: 0 completed, 2 blocked, 3 pending external approval,
//! 130 aborted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn, Level};

use afterburner_core::metrics::METRICS;
use afterburner_core::resolver::fingerprint_repo;
use afterburner_core::telemetry::init_tracing;
use afterburner_core::{
    read_summary_artifact, render_summary_md, PipelineConfig, Run, RunId, RunRepository,
    RunStatus, Summary, TriggerEvent, TriggerKind,
};
use afterburner_pipeline::{command_stage_set, Orchestrator, RunOutcome};
use afterburner_state::{BaselineStore, FingerprintMap, RunStore, SurrealStateStore};

#[derive(Parser)]
#[command(name = "afterburner")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Security, tests, git and deploy gates for freshly written code", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (default: <repo>/afterburner.toml)
    #[arg(long, global = true, env = "AFTERBURNER_CONFIG")]
    config: Option<PathBuf>,

    /// Repository root
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline over the changes since the last baseline
    Run {
        /// Restrict the run to these files (comma separated, repo-relative)
        #[arg(long, value_delimiter = ',')]
        files: Option<Vec<String>>,

        /// What started this run
        #[arg(long, value_enum, default_value_t = TriggerArg::Manual)]
        trigger: TriggerArg,

        /// Skip the Launch stage
        #[arg(long, env = "AFTERBURNER_SKIP_DEPLOY")]
        skip_deploy: bool,

        /// Summary output format
        #[arg(long, value_enum, default_value_t = Format::Md)]
        format: Format,
    },

    /// Re-check a run parked on pull request approval
    Resume {
        /// Run ID
        #[arg(long)]
        run: String,

        #[arg(long, value_enum, default_value_t = Format::Md)]
        format: Format,
    },

    /// Cancel a run awaiting external approval
    Cancel {
        /// Run ID
        #[arg(long)]
        run: String,
    },

    /// Show recorded runs
    Status {
        /// Show a single run
        #[arg(long)]
        run: Option<String>,

        #[arg(long, value_enum, default_value_t = Format::Md)]
        format: Format,
    },

    /// Print the summary of a finished run
    Summary {
        /// Run ID
        #[arg(long)]
        run: String,

        #[arg(long, value_enum, default_value_t = Format::Md)]
        format: Format,
    },

    /// Poll the repository and run the pipeline on every change
    Watch {
        /// Seconds between polls
        #[arg(long, default_value = "5")]
        interval: u64,

        /// Skip the Launch stage
        #[arg(long, env = "AFTERBURNER_SKIP_DEPLOY")]
        skip_deploy: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TriggerArg {
    Manual,
    Hook,
}

impl From<TriggerArg> for TriggerKind {
    fn from(arg: TriggerArg) -> Self {
        match arg {
            TriggerArg::Manual => TriggerKind::Manual,
            TriggerArg::Hook => TriggerKind::Hook,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Md,
    Json,
}

/// Everything a command needs: the repository and a wired orchestrator.
struct App {
    repo: PathBuf,
    summaries_dir: PathBuf,
    orchestrator: Arc<Orchestrator>,
}

impl App {
    async fn open(repo: &Path, config_path: Option<&Path>, skip_deploy: bool) -> Result<Self> {
        let repo = repo
            .canonicalize()
            .with_context(|| format!("Repository not found: {}", repo.display()))?;
        let mut config =
            PipelineConfig::load(&repo, config_path).context("Failed to load configuration")?;
        if skip_deploy {
            config.launch.skip = true;
        }
        let state_dir = config.state_dir_for(&repo);
        let store = Arc::new(
            SurrealStateStore::from_env(&state_dir)
                .await
                .context("Failed to open Afterburner state store")?,
        );
        Ok(Self::with_store(repo, config, store.clone(), store))
    }

    fn with_store(
        repo: PathBuf,
        config: PipelineConfig,
        runs: Arc<dyn RunStore>,
        baselines: Arc<dyn BaselineStore>,
    ) -> Self {
        let summaries_dir = config.state_dir_for(&repo).join("summaries");
        let (stages, fixer) = command_stage_set(&config);
        let orchestrator = Orchestrator::new(
            Arc::new(config),
            stages,
            fixer,
            RunRepository::new(runs),
            baselines,
        )
        .with_summaries_dir(&summaries_dir);
        Self {
            repo,
            summaries_dir,
            orchestrator: Arc::new(orchestrator),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let skip_deploy = match &cli.command {
        Commands::Run { skip_deploy, .. } | Commands::Watch { skip_deploy, .. } => *skip_deploy,
        _ => false,
    };
    let app = App::open(&cli.repo, cli.config.as_deref(), skip_deploy).await?;

    let code = match cli.command {
        Commands::Run {
            files,
            trigger,
            format,
            ..
        } => cmd_run(&app, files, trigger, format).await?,
        Commands::Resume { run, format } => cmd_resume(&app, &run, format).await?,
        Commands::Cancel { run } => cmd_cancel(&app, &run).await?,
        Commands::Status { run, format } => cmd_status(&app, run.as_deref(), format).await?,
        Commands::Summary { run, format } => cmd_summary(&app, &run, format).await?,
        Commands::Watch { interval, .. } => {
            cmd_watch(&app, Duration::from_secs(interval.max(1))).await?
        }
    };

    METRICS.flush();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Run with Ctrl-C wired to cancellation.
async fn run_cancellable(app: &App, trigger: TriggerEvent) -> Result<RunOutcome> {
    let id = RunId::new();
    let orchestrator = app.orchestrator.clone();
    let cancel_id = id.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(run_id = %cancel_id, "interrupt received; cancelling run");
            if let Err(e) = orchestrator.cancel(&cancel_id).await {
                warn!(run_id = %cancel_id, error = %e, "cancel failed");
            }
        }
    });
    let outcome = app.orchestrator.run_with_id(id, trigger).await;
    interrupt.abort();
    outcome.context("Pipeline run failed")
}

async fn cmd_run(
    app: &App,
    files: Option<Vec<String>>,
    trigger: TriggerArg,
    format: Format,
) -> Result<i32> {
    let mut event = TriggerEvent::manual(&app.repo).with_kind(trigger.into());
    if let Some(files) = files.filter(|f| !f.is_empty()) {
        event = event.with_files(files);
    }

    let outcome = run_cancellable(app, event).await?;
    println!("{}", format_summary(&outcome.summary, format)?);
    if outcome.requires_fresh_run {
        eprintln!("The baseline moved during this run; run again to commit these changes.");
    }
    Ok(outcome.exit.exit_code())
}

async fn cmd_resume(app: &App, run: &str, format: Format) -> Result<i32> {
    let outcome = app
        .orchestrator
        .resume(&RunId::from(run))
        .await
        .with_context(|| format!("Failed to resume run {run}"))?;
    println!("{}", format_summary(&outcome.summary, format)?);
    Ok(outcome.exit.exit_code())
}

async fn cmd_cancel(app: &App, run: &str) -> Result<i32> {
    let id = RunId::from(run);
    if app.orchestrator.cancel(&id).await? {
        println!("Run {run} cancelled");
    } else {
        println!("Run {run} is not active; nothing to cancel");
    }
    Ok(0)
}

#[derive(Debug, Serialize)]
struct StatusRow {
    run_id: String,
    status: RunStatus,
    state: String,
    repo_path: String,
    started_at: String,
    detail: Option<String>,
}

impl From<&Run> for StatusRow {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id.0.clone(),
            status: run.status,
            state: run.state.to_string(),
            repo_path: run.repo_path.display().to_string(),
            started_at: run.started_at.to_rfc3339(),
            detail: run.block_reason.as_ref().map(|r| r.detail.clone()),
        }
    }
}

fn format_status(rows: &[StatusRow], format: Format) -> Result<String> {
    if format == Format::Json {
        return Ok(serde_json::to_string_pretty(rows)?);
    }
    if rows.is_empty() {
        return Ok("No runs recorded.".to_string());
    }
    let mut out = String::new();
    for row in rows {
        out.push_str(&format!(
            "{}  {:<16} {:<16} {}",
            row.run_id,
            row.status.as_str(),
            row.state,
            row.started_at
        ));
        if let Some(detail) = &row.detail {
            out.push_str(&format!("  ({detail})"));
        }
        out.push('\n');
    }
    Ok(out.trim_end().to_string())
}

async fn cmd_status(app: &App, run: Option<&str>, format: Format) -> Result<i32> {
    let runs = app.orchestrator.runs();
    let rows: Vec<StatusRow> = match run {
        Some(id) => vec![StatusRow::from(
            &runs
                .load(&RunId::from(id))
                .await
                .with_context(|| format!("Run not found: {id}"))?,
        )],
        None => runs.list(None).await?.iter().map(StatusRow::from).collect(),
    };
    println!("{}", format_status(&rows, format)?);
    Ok(0)
}

async fn cmd_summary(app: &App, run: &str, format: Format) -> Result<i32> {
    let id = RunId::from(run);
    let summary = match app.orchestrator.runs().load(&id).await {
        Ok(Run {
            summary: Some(summary),
            ..
        }) => summary,
        Ok(found) => anyhow::bail!(
            "Run {run} has no summary yet (status: {})",
            found.status.as_str()
        ),
        // The state store may have been reset; the artifact still verifies.
        Err(_) => read_summary_artifact(run, &app.summaries_dir)
            .with_context(|| format!("No summary found for run {run}"))?,
    };
    println!("{}", format_summary(&summary, format)?);
    Ok(summary.overall_status.exit_code())
}

async fn cmd_watch(app: &App, interval: Duration) -> Result<i32> {
    info!(repo = %app.repo.display(), secs = interval.as_secs(), "watching for changes");
    let mut seen: Option<FingerprintMap> = None;
    loop {
        let current = fingerprint_repo(&app.repo).context("Failed to fingerprint repository")?;
        if seen.as_ref() != Some(&current) {
            seen = Some(current);
            let trigger = TriggerEvent::manual(&app.repo).with_kind(TriggerKind::FileSystem);
            let outcome = run_cancellable(app, trigger).await?;
            if outcome.run.status == RunStatus::Aborted {
                println!("{}", watch_line(&outcome));
                return Ok(outcome.exit.exit_code());
            }
            if !outcome.run.changeset.is_empty() {
                println!("{}", watch_line(&outcome));
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; stopping watch");
                return Ok(0);
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

fn watch_line(outcome: &RunOutcome) -> String {
    let mut line = format!(
        "run {}: {} ({} file(s))",
        outcome.run.id,
        outcome.exit,
        outcome.run.changeset.len()
    );
    if let Some(reason) = &outcome.run.block_reason {
        line.push_str(&format!(": {}", reason.detail));
    }
    line
}

fn format_summary(summary: &Summary, format: Format) -> Result<String> {
    match format {
        Format::Md => Ok(render_summary_md(summary)),
        Format::Json => Ok(serde_json::to_string_pretty(summary)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afterburner_state::fakes::{MemoryBaselineStore, MemoryRunStore};

    fn app(repo: &Path) -> App {
        let mut config = PipelineConfig::default();
        config.state_dir = repo.join(".afterburner");
        App::with_store(
            repo.to_path_buf(),
            config,
            Arc::new(MemoryRunStore::new()),
            Arc::new(MemoryBaselineStore::new()),
        )
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "afterburner",
            "--repo",
            "/tmp/app",
            "run",
            "--files",
            "app.py,lib/util.py",
            "--trigger",
            "hook",
            "--skip-deploy",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.repo, PathBuf::from("/tmp/app"));
        match cli.command {
            Commands::Run {
                files,
                trigger,
                skip_deploy,
                format,
            } => {
                assert_eq!(files.unwrap(), vec!["app.py", "lib/util.py"]);
                assert_eq!(trigger, TriggerArg::Hook);
                assert!(skip_deploy);
                assert_eq!(format, Format::Json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn resume_requires_a_run_id() {
        assert!(Cli::try_parse_from(["afterburner", "resume"]).is_err());
        assert!(Cli::try_parse_from(["afterburner", "resume", "--run", "abc"]).is_ok());
    }

    #[test]
    fn trigger_arg_maps_to_kind() {
        assert_eq!(TriggerKind::from(TriggerArg::Manual), TriggerKind::Manual);
        assert_eq!(TriggerKind::from(TriggerArg::Hook), TriggerKind::Hook);
    }

    #[test]
    fn empty_status_is_friendly() {
        assert_eq!(format_status(&[], Format::Md).unwrap(), "No runs recorded.");
        assert_eq!(format_status(&[], Format::Json).unwrap(), "[]");
    }

    #[tokio::test]
    async fn cancelling_an_unknown_run_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let code = cmd_cancel(&app(dir.path()), "does-not-exist").await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn summary_of_an_unknown_run_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cmd_summary(&app(dir.path()), "missing", Format::Md)
            .await
            .is_err());
    }
}
