//! External command execution for command-backed adapters.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use afterburner_core::ToolError;

/// A command to run inside the repository.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Tool name used in errors and findings.
    pub tool: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Written to the child's stdin, then closed.
    pub stdin: Option<Vec<u8>>,
    /// `None` runs until exit; callers normally rely on the fan-out budget.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(tool: impl Into<String>, program: impl Into<String>, cwd: &Path) -> Self {
        Self {
            tool: tool.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.to_path_buf(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: Vec<u8>) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub tool: String,
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into `ToolError::Failed` with the tail of stderr.
    pub fn require_success(self) -> Result<Self, ToolError> {
        if self.success() {
            return Ok(self);
        }
        Err(ToolError::failed(
            &self.tool,
            format!("exit {}: {}", self.exit_code, tail(&self.stderr, 400)),
        ))
    }
}

/// Run `spec` to completion.
///
/// A missing binary maps to `ToolError::NotInstalled`; exceeding the
/// timeout kills the child and maps to `ToolError::TimedOut`. Dropping the
/// returned future also kills the child.
pub async fn run_command(spec: &CommandSpec) -> Result<CommandOutput, ToolError> {
    let start = Instant::now();

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ToolError::NotInstalled {
                tool: spec.tool.clone(),
            },
            _ => ToolError::failed(&spec.tool, format!("spawn {}: {e}", spec.program)),
        })?;

    if let (Some(input), Some(mut pipe)) = (spec.stdin.as_ref(), child.stdin.take()) {
        pipe.write_all(input)
            .await
            .map_err(|e| ToolError::failed(&spec.tool, format!("write stdin: {e}")))?;
        drop(pipe);
    }

    let wait = child.wait_with_output();
    let output = match spec.timeout {
        Some(limit) => tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| ToolError::TimedOut {
                tool: spec.tool.clone(),
                secs: limit.as_secs(),
            })?,
        None => wait.await,
    }
    .map_err(|e| ToolError::failed(&spec.tool, format!("wait: {e}")))?;

    Ok(CommandOutput {
        tool: spec.tool.clone(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Whether `program` resolves on `PATH`.
pub fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

fn tail(s: &str, max: usize) -> &str {
    let s = s.trim();
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
