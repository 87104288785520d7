//! Command-backed test runners: pytest, vitest, jest, cargo, playwright.
//!
//! A runner that exits non-zero without reporting a single failing case
//! crashed rather than failed; that surfaces as `ToolError::Failed` so the
//! stage treats it as unavailable instead of green.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use afterburner_core::{FailingCase, TestReport, TestRunner, ToolError};

use crate::runner::{run_command, CommandOutput, CommandSpec};

fn glob_exists(repo: &Path, prefix: &str) -> bool {
    std::fs::read_dir(repo)
        .map(|entries| {
            entries.flatten().any(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| n.starts_with(prefix))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

fn crashed(out: &CommandOutput, report: &TestReport) -> bool {
    !out.success() && report.failed == 0
}

fn finish(out: CommandOutput, report: TestReport) -> Result<TestReport, ToolError> {
    if crashed(&out, &report) {
        return out.require_success().map(|_| report);
    }
    Ok(report)
}

fn relative(repo: &Path, path: &str) -> String {
    Path::new(path)
        .strip_prefix(repo)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| path.to_string())
}

// ---- pytest ----

pub struct Pytest;

fn count(re: &'static OnceLock<Regex>, pattern: &str, line: &str) -> Option<u32> {
    re.get_or_init(|| Regex::new(pattern).expect("valid pytest summary regex"))
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn parse_pytest(stdout: &str) -> TestReport {
    static PASSED: OnceLock<Regex> = OnceLock::new();
    static FAILED: OnceLock<Regex> = OnceLock::new();
    static SKIPPED: OnceLock<Regex> = OnceLock::new();
    static ERRORS: OnceLock<Regex> = OnceLock::new();

    let mut report = TestReport {
        framework: "pytest".into(),
        ..TestReport::default()
    };
    for line in stdout.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("FAILED ").or_else(|| line.strip_prefix("ERROR ")) {
            let (name, message) = rest.split_once(" - ").unwrap_or((rest, "failed"));
            report.failing_cases.push(FailingCase {
                name: name.trim().to_string(),
                file: name.split("::").next().map(String::from),
                message: message.trim().to_string(),
            });
            continue;
        }
        if !(line.contains("passed") || line.contains("failed") || line.contains("error")) {
            continue;
        }
        if let Some(n) = count(&PASSED, r"(\d+) passed", line) {
            report.passed = n;
        }
        let failed = count(&FAILED, r"(\d+) failed", line);
        let errors = count(&ERRORS, r"(\d+) errors?", line);
        if failed.is_some() || errors.is_some() {
            report.failed = failed.unwrap_or(0) + errors.unwrap_or(0);
        }
        if let Some(n) = count(&SKIPPED, r"(\d+) skipped", line) {
            report.skipped = n;
        }
    }
    report
}

#[async_trait]
impl TestRunner for Pytest {
    fn name(&self) -> &str {
        "pytest"
    }

    fn detect(&self, repo: &Path) -> bool {
        if ["pytest.ini", "setup.cfg", "conftest.py"]
            .iter()
            .any(|f| repo.join(f).is_file())
        {
            return true;
        }
        let pyproject = std::fs::read_to_string(repo.join("pyproject.toml")).unwrap_or_default();
        pyproject.contains("[tool.pytest") || repo.join("tests").is_dir() || repo.join("test").is_dir()
    }

    async fn run(&self, repo: &Path, files: &[String]) -> Result<TestReport, ToolError> {
        let targets: Vec<&String> = files
            .iter()
            .filter(|f| f.ends_with(".py") && f.to_ascii_lowercase().contains("test"))
            .collect();
        let spec = CommandSpec::new("pytest", "python", repo)
            .args(["-m", "pytest", "--tb=short", "-q", "--no-header", "-rfE"])
            .args(targets.into_iter().cloned());
        let out = run_command(&spec).await?;
        let report = parse_pytest(&out.stdout);
        finish(out, report)
    }
}

// ---- cargo ----

pub struct CargoTest;

pub fn parse_cargo_test(output: &str) -> TestReport {
    static RESULT: OnceLock<Regex> = OnceLock::new();
    static CASE: OnceLock<Regex> = OnceLock::new();
    let result = RESULT.get_or_init(|| {
        Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed; (\d+) ignored")
            .expect("valid cargo result regex")
    });
    let case = CASE.get_or_init(|| {
        Regex::new(r"^---- (\S+) stdout ----$").expect("valid cargo case regex")
    });

    let mut report = TestReport {
        framework: "cargo".into(),
        ..TestReport::default()
    };
    let mut current: Option<(String, Vec<String>)> = None;
    let flush = |report: &mut TestReport, current: &mut Option<(String, Vec<String>)>| {
        if let Some((name, lines)) = current.take() {
            let message = lines
                .iter()
                .find(|l| l.contains("panicked") || l.contains("assertion"))
                .or_else(|| lines.first())
                .cloned()
                .unwrap_or_else(|| "failed".into());
            report.failing_cases.push(FailingCase {
                name,
                file: None,
                message,
            });
        }
    };

    for line in output.lines() {
        if let Some(c) = result.captures(line) {
            flush(&mut report, &mut current);
            report.passed += c[1].parse::<u32>().unwrap_or(0);
            report.failed += c[2].parse::<u32>().unwrap_or(0);
            report.skipped += c[3].parse::<u32>().unwrap_or(0);
            continue;
        }
        if let Some(c) = case.captures(line.trim_end()) {
            flush(&mut report, &mut current);
            current = Some((c[1].to_string(), Vec::new()));
            continue;
        }
        if line.trim() == "failures:" {
            flush(&mut report, &mut current);
            continue;
        }
        if let Some((_, lines)) = current.as_mut() {
            if !line.trim().is_empty() {
                lines.push(line.trim().to_string());
            }
        }
    }
    flush(&mut report, &mut current);
    report
}

#[async_trait]
impl TestRunner for CargoTest {
    fn name(&self) -> &str {
        "cargo"
    }

    fn detect(&self, repo: &Path) -> bool {
        repo.join("Cargo.toml").is_file()
    }

    async fn run(&self, repo: &Path, _files: &[String]) -> Result<TestReport, ToolError> {
        let out = run_command(&CommandSpec::new("cargo", "cargo", repo).args(["test", "--no-fail-fast"]))
            .await?;
        let report = parse_cargo_test(&format!("{}\n{}", out.stdout, out.stderr));
        finish(out, report)
    }
}

// ---- vitest / jest ----

/// Both speak the jest JSON reporter format.
pub struct JsRunner {
    framework: &'static str,
    config_prefix: &'static str,
    args: &'static [&'static str],
}

impl JsRunner {
    pub fn vitest() -> Self {
        Self {
            framework: "vitest",
            config_prefix: "vitest.config.",
            args: &["vitest", "run", "--reporter=json"],
        }
    }

    pub fn jest() -> Self {
        Self {
            framework: "jest",
            config_prefix: "jest.config.",
            args: &["jest", "--json"],
        }
    }
}

pub fn parse_jest_json(framework: &str, repo: &Path, value: &Value) -> TestReport {
    let num = |key: &str| value.get(key).and_then(Value::as_u64).unwrap_or(0) as u32;
    let mut report = TestReport {
        framework: framework.to_string(),
        passed: num("numPassedTests"),
        failed: num("numFailedTests"),
        skipped: num("numPendingTests") + num("numTodoTests"),
        failing_cases: Vec::new(),
    };
    for suite in value
        .get("testResults")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let file = suite
            .get("name")
            .and_then(Value::as_str)
            .map(|n| relative(repo, n));
        for test in suite
            .get("assertionResults")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|t| t.get("status").and_then(Value::as_str) == Some("failed"))
        {
            let mut path: Vec<&str> = test
                .get("ancestorTitles")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .collect();
            path.push(test.get("title").and_then(Value::as_str).unwrap_or("unknown"));
            let message = test
                .get("failureMessages")
                .and_then(Value::as_array)
                .and_then(|m| m.first())
                .and_then(Value::as_str)
                .and_then(|m| m.lines().next())
                .unwrap_or("failed");
            report.failing_cases.push(FailingCase {
                name: path.join(" > "),
                file: file.clone(),
                message: message.to_string(),
            });
        }
    }
    report
}

#[async_trait]
impl TestRunner for JsRunner {
    fn name(&self) -> &str {
        self.framework
    }

    fn detect(&self, repo: &Path) -> bool {
        glob_exists(repo, self.config_prefix)
    }

    async fn run(&self, repo: &Path, files: &[String]) -> Result<TestReport, ToolError> {
        let targets = files.iter().filter(|f| {
            let lower = f.to_ascii_lowercase();
            lower.contains("test") || lower.contains("spec")
        });
        let spec = CommandSpec::new(self.framework, "npx", repo)
            .args(self.args.iter().copied())
            .args(targets.cloned());
        let out = run_command(&spec).await?;
        let value: Value = serde_json::from_str(out.stdout.trim()).map_err(|e| ToolError::Parse {
            tool: self.framework.to_string(),
            detail: e.to_string(),
        })?;
        let report = parse_jest_json(self.framework, repo, &value);
        finish(out, report)
    }
}

// ---- playwright ----

pub struct Playwright;

fn walk_playwright(suite: &Value, report: &mut TestReport) {
    for spec in suite
        .get("specs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let title = spec.get("title").and_then(Value::as_str).unwrap_or("unknown");
        let file = spec
            .get("file")
            .or_else(|| suite.get("file"))
            .and_then(Value::as_str)
            .map(String::from);
        let results = spec
            .get("tests")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .flat_map(|t| t.get("results").and_then(Value::as_array).into_iter().flatten());
        for result in results {
            match result.get("status").and_then(Value::as_str) {
                Some("passed") => report.passed += 1,
                Some("skipped") => report.skipped += 1,
                Some("failed") | Some("timedOut") => {
                    report.failed += 1;
                    let message = result
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .and_then(|m| m.lines().next())
                        .unwrap_or("unknown error");
                    report.failing_cases.push(FailingCase {
                        name: title.to_string(),
                        file: file.clone(),
                        message: message.to_string(),
                    });
                }
                _ => {}
            }
        }
    }
    for child in suite
        .get("suites")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        walk_playwright(child, report);
    }
}

pub fn parse_playwright(value: &Value) -> TestReport {
    let mut report = TestReport {
        framework: "playwright".into(),
        ..TestReport::default()
    };
    walk_playwright(value, &mut report);
    report
}

#[async_trait]
impl TestRunner for Playwright {
    fn name(&self) -> &str {
        "playwright"
    }

    fn detect(&self, repo: &Path) -> bool {
        glob_exists(repo, "playwright.config.")
    }

    async fn run(&self, repo: &Path, _files: &[String]) -> Result<TestReport, ToolError> {
        let out = run_command(
            &CommandSpec::new("playwright", "npx", repo).args(["playwright", "test", "--reporter=json"]),
        )
        .await?;
        let value: Value = serde_json::from_str(out.stdout.trim()).map_err(|e| ToolError::Parse {
            tool: "playwright".into(),
            detail: e.to_string(),
        })?;
        let report = parse_playwright(&value);
        finish(out, report)
    }
}

/// Runners named in config; playwright only when listed.
pub fn runners_from_config(names: &[String]) -> Vec<Arc<dyn TestRunner>> {
    names
        .iter()
        .filter_map(|name| -> Option<Arc<dyn TestRunner>> {
            match name.as_str() {
                "pytest" => Some(Arc::new(Pytest)),
                "vitest" => Some(Arc::new(JsRunner::vitest())),
                "jest" => Some(Arc::new(JsRunner::jest())),
                "cargo" => Some(Arc::new(CargoTest)),
                "playwright" => Some(Arc::new(Playwright)),
                other => {
                    tracing::warn!(framework = %other, "unknown test framework in config; ignored");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pytest_summary_and_failed_lines() {
        let stdout = "\
..F.s
=========================== short test summary info ============================
FAILED tests/test_auth.py::test_login - AssertionError: expected 200
ERROR tests/test_db.py::test_conn - ConnectionRefused
2 failed, 3 passed, 1 skipped, 1 error in 0.42s
";
        let report = parse_pytest(stdout);
        assert_eq!(report.passed, 3);
        assert_eq!(report.failed, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failing_cases.len(), 2);
        assert_eq!(report.failing_cases[0].name, "tests/test_auth.py::test_login");
        assert_eq!(report.failing_cases[0].file.as_deref(), Some("tests/test_auth.py"));
        assert_eq!(report.failing_cases[0].message, "AssertionError: expected 200");
    }

    #[test]
    fn pytest_all_green() {
        let report = parse_pytest("....\n4 passed in 0.10s\n");
        assert_eq!(report.passed, 4);
        assert_eq!(report.failed, 0);
        assert!(report.failing_cases.is_empty());
    }

    #[test]
    fn cargo_results_sum_across_binaries() {
        let output = "\
running 3 tests
test a ... ok
test math::adds ... FAILED

failures:

---- math::adds stdout ----
thread 'math::adds' panicked at src/lib.rs:10:5:
assertion `left == right` failed

failures:
    math::adds

test result: FAILED. 2 passed; 1 failed; 0 ignored; 0 measured; 0 filtered out

running 1 test
test result: ok. 1 passed; 0 failed; 1 ignored; 0 measured; 0 filtered out
";
        let report = parse_cargo_test(output);
        assert_eq!(report.passed, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failing_cases.len(), 1);
        assert_eq!(report.failing_cases[0].name, "math::adds");
        assert!(report.failing_cases[0].message.contains("panicked"));
    }

    #[test]
    fn jest_json_failures_carry_titles_and_file() {
        let repo = Path::new("/work/app");
        let report = parse_jest_json(
            "vitest",
            repo,
            &json!({
                "numPassedTests": 5,
                "numFailedTests": 1,
                "numPendingTests": 2,
                "testResults": [{
                    "name": "/work/app/src/button.test.ts",
                    "assertionResults": [
                        {"status": "passed", "title": "renders", "ancestorTitles": ["Button"]},
                        {"status": "failed", "title": "clicks", "ancestorTitles": ["Button"],
                         "failureMessages": ["Expected 1\nReceived 0"]}
                    ]
                }]
            }),
        );
        assert_eq!(report.passed, 5);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failing_cases[0].name, "Button > clicks");
        assert_eq!(report.failing_cases[0].file.as_deref(), Some("src/button.test.ts"));
        assert_eq!(report.failing_cases[0].message, "Expected 1");
    }

    #[test]
    fn playwright_walks_nested_suites() {
        let report = parse_playwright(&json!({
            "suites": [{
                "file": "e2e/login.spec.ts",
                "specs": [{"title": "logs in", "tests": [{"results": [{"status": "passed"}]}]}],
                "suites": [{
                    "specs": [{"title": "rejects bad password", "file": "e2e/login.spec.ts",
                               "tests": [{"results": [{"status": "timedOut",
                                          "error": {"message": "Timeout 30000ms exceeded"}}]}]}]
                }]
            }]
        }));
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failing_cases[0].name, "rejects bad password");
        assert_eq!(report.failing_cases[0].message, "Timeout 30000ms exceeded");
    }

    #[test]
    fn crash_without_cases_is_a_tool_failure() {
        let out = CommandOutput {
            tool: "pytest".into(),
            exit_code: 4,
            stdout: "ERROR: file or directory not found".into(),
            stderr: String::new(),
            duration_ms: 3,
        };
        let report = parse_pytest(&out.stdout);
        assert!(matches!(finish(out, report), Err(ToolError::Failed { .. })));
    }

    #[test]
    fn detection_reads_repo_markers() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!Pytest.detect(dir.path()));
        assert!(!JsRunner::vitest().detect(dir.path()));
        std::fs::write(dir.path().join("vitest.config.ts"), "export default {}").unwrap();
        std::fs::write(
            dir.path().join("pyproject.toml"),
            "[tool.pytest.ini_options]\n",
        )
        .unwrap();
        assert!(JsRunner::vitest().detect(dir.path()));
        assert!(!JsRunner::jest().detect(dir.path()));
        assert!(Pytest.detect(dir.path()));
    }
}
