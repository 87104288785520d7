//! Command-backed security scanners: semgrep, bandit, npm audit, cargo audit.
//!
//! Scanners exit non-zero when they find something, so the exit code alone
//! never means failure. Output that is empty on a non-zero exit does.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use afterburner_core::domain::{FileKind, FindingCategory};
use afterburner_core::{ChangeSet, ScanFinding, SecurityScanner, Severity, ToolError};

use crate::runner::{run_command, CommandOutput, CommandSpec};

fn parse_json(tool: &str, out: &CommandOutput) -> Result<Option<Value>, ToolError> {
    let body = out.stdout.trim();
    if body.is_empty() {
        if out.success() {
            return Ok(None);
        }
        return Err(out.clone().require_success().err().unwrap_or_else(|| {
            ToolError::failed(tool, format!("exit {} with no output", out.exit_code))
        }));
    }
    serde_json::from_str(body)
        .map(Some)
        .map_err(|e| ToolError::Parse {
            tool: tool.to_string(),
            detail: e.to_string(),
        })
}

fn str_at<'a>(v: &'a Value, pointer: &str) -> Option<&'a str> {
    v.pointer(pointer).and_then(Value::as_str)
}

fn u32_at(v: &Value, pointer: &str) -> Option<u32> {
    v.pointer(pointer)
        .and_then(Value::as_u64)
        .map(|n| n as u32)
}

// ---- semgrep ----

pub struct Semgrep;

pub fn semgrep_severity(raw: &str) -> Severity {
    match raw.to_ascii_uppercase().as_str() {
        "ERROR" => Severity::Critical,
        "WARNING" => Severity::Medium,
        _ => Severity::Info,
    }
}

pub fn parse_semgrep(value: &Value) -> Vec<ScanFinding> {
    let Some(results) = value.get("results").and_then(Value::as_array) else {
        return Vec::new();
    };
    results
        .iter()
        .map(|r| {
            let rule = str_at(r, "/check_id").map(String::from);
            let category = match &rule {
                Some(id) if id.contains("secret") || id.contains("hardcoded") => {
                    FindingCategory::Secret
                }
                _ => FindingCategory::CodeVulnerability,
            };
            ScanFinding {
                tool: "semgrep".into(),
                category,
                severity: semgrep_severity(str_at(r, "/extra/severity").unwrap_or("INFO")),
                file: str_at(r, "/path").map(String::from),
                line: u32_at(r, "/start/line"),
                end_line: u32_at(r, "/end/line"),
                message: str_at(r, "/extra/message")
                    .unwrap_or("semgrep finding")
                    .to_string(),
                rule_id: rule,
            }
        })
        .collect()
}

#[async_trait]
impl SecurityScanner for Semgrep {
    fn name(&self) -> &str {
        "semgrep"
    }

    fn applies_to(&self, changeset: &ChangeSet, _repo: &Path) -> bool {
        changeset.has_source_files()
    }

    async fn scan(&self, repo: &Path, files: &[String]) -> Result<Vec<ScanFinding>, ToolError> {
        let mut spec = CommandSpec::new("semgrep", "semgrep", repo).args(["scan", "--json", "--quiet"]);
        for f in files {
            spec = spec.arg("--include").arg(f.as_str());
        }
        let out = run_command(&spec.arg(".")).await?;
        Ok(parse_json("semgrep", &out)?
            .map(|v| parse_semgrep(&v))
            .unwrap_or_default())
    }
}

// ---- bandit ----

pub struct Bandit;

pub fn bandit_severity(raw: &str) -> Severity {
    match raw.to_ascii_uppercase().as_str() {
        "HIGH" => Severity::Critical,
        "MEDIUM" => Severity::Medium,
        _ => Severity::Info,
    }
}

/// Bandit tests that flag hardcoded credentials.
const BANDIT_SECRET_TESTS: &[&str] = &["B105", "B106", "B107"];

pub fn parse_bandit(value: &Value) -> Vec<ScanFinding> {
    let Some(results) = value.get("results").and_then(Value::as_array) else {
        return Vec::new();
    };
    results
        .iter()
        .map(|r| {
            let rule = str_at(r, "/test_id").map(String::from);
            let category = match rule.as_deref() {
                Some(id) if BANDIT_SECRET_TESTS.contains(&id) => FindingCategory::Secret,
                _ => FindingCategory::CodeVulnerability,
            };
            let line = u32_at(r, "/line_number");
            let end_line = r
                .get("line_range")
                .and_then(Value::as_array)
                .and_then(|lines| lines.last())
                .and_then(Value::as_u64)
                .map(|n| n as u32);
            ScanFinding {
                tool: "bandit".into(),
                category,
                severity: bandit_severity(str_at(r, "/issue_severity").unwrap_or("LOW")),
                file: str_at(r, "/filename")
                    .map(|f| f.trim_start_matches("./").to_string()),
                line,
                end_line,
                message: str_at(r, "/issue_text").unwrap_or("bandit finding").to_string(),
                rule_id: rule,
            }
        })
        .collect()
}

#[async_trait]
impl SecurityScanner for Bandit {
    fn name(&self) -> &str {
        "bandit"
    }

    fn applies_to(&self, changeset: &ChangeSet, _repo: &Path) -> bool {
        changeset.has_kind(FileKind::Python)
    }

    async fn scan(&self, repo: &Path, files: &[String]) -> Result<Vec<ScanFinding>, ToolError> {
        let py: Vec<&String> = files.iter().filter(|f| f.ends_with(".py")).collect();
        if py.is_empty() {
            return Ok(Vec::new());
        }
        let spec = CommandSpec::new("bandit", "bandit", repo)
            .args(["-f", "json", "-q"])
            .args(py.into_iter().cloned());
        let out = run_command(&spec).await?;
        Ok(parse_json("bandit", &out)?
            .map(|v| parse_bandit(&v))
            .unwrap_or_default())
    }
}

// ---- npm audit ----

pub struct NpmAudit;

pub fn npm_severity(raw: &str) -> Severity {
    match raw.to_ascii_lowercase().as_str() {
        "critical" | "high" => Severity::Critical,
        "moderate" => Severity::Medium,
        "low" => Severity::Low,
        _ => Severity::Info,
    }
}

pub fn parse_npm_audit(value: &Value) -> Vec<ScanFinding> {
    let Some(vulns) = value.get("vulnerabilities").and_then(Value::as_object) else {
        return Vec::new();
    };
    vulns
        .iter()
        .map(|(name, v)| {
            let title = str_at(v, "/title")
                .or_else(|| {
                    v.get("via")
                        .and_then(Value::as_array)
                        .and_then(|via| via.iter().find_map(|x| str_at(x, "/title")))
                })
                .unwrap_or("known vulnerability");
            ScanFinding {
                tool: "npm_audit".into(),
                category: FindingCategory::DependencyAdvisory,
                severity: npm_severity(str_at(v, "/severity").unwrap_or("low")),
                file: Some("package.json".into()),
                line: None,
                end_line: None,
                message: format!("{name}: {title}"),
                rule_id: Some(name.clone()),
            }
        })
        .collect()
}

#[async_trait]
impl SecurityScanner for NpmAudit {
    fn name(&self) -> &str {
        "npm_audit"
    }

    fn applies_to(&self, _changeset: &ChangeSet, repo: &Path) -> bool {
        repo.join("package.json").is_file()
    }

    async fn scan(&self, repo: &Path, _files: &[String]) -> Result<Vec<ScanFinding>, ToolError> {
        let out = run_command(&CommandSpec::new("npm_audit", "npm", repo).args(["audit", "--json"]))
            .await?;
        Ok(parse_json("npm_audit", &out)?
            .map(|v| parse_npm_audit(&v))
            .unwrap_or_default())
    }
}

// ---- cargo audit ----

pub struct CargoAudit;

pub fn parse_cargo_audit(value: &Value) -> Vec<ScanFinding> {
    let Some(list) = value.pointer("/vulnerabilities/list").and_then(Value::as_array) else {
        return Vec::new();
    };
    list.iter()
        .map(|v| {
            let id = str_at(v, "/advisory/id").unwrap_or("UNKNOWN");
            let title = str_at(v, "/advisory/title").unwrap_or("unknown advisory");
            let krate = str_at(v, "/package/name")
                .map(|n| format!(" in {n}"))
                .unwrap_or_default();
            ScanFinding {
                tool: "cargo_audit".into(),
                category: FindingCategory::DependencyAdvisory,
                severity: Severity::Critical,
                file: Some("Cargo.toml".into()),
                line: None,
                end_line: None,
                message: format!("{id}: {title}{krate}"),
                rule_id: Some(id.to_string()),
            }
        })
        .collect()
}

#[async_trait]
impl SecurityScanner for CargoAudit {
    fn name(&self) -> &str {
        "cargo_audit"
    }

    fn applies_to(&self, _changeset: &ChangeSet, repo: &Path) -> bool {
        repo.join("Cargo.toml").is_file()
    }

    async fn scan(&self, repo: &Path, _files: &[String]) -> Result<Vec<ScanFinding>, ToolError> {
        let out =
            run_command(&CommandSpec::new("cargo_audit", "cargo", repo).args(["audit", "--json"]))
                .await?;
        Ok(parse_json("cargo_audit", &out)?
            .map(|v| parse_cargo_audit(&v))
            .unwrap_or_default())
    }
}

/// Scanners named in config; unknown names are skipped with a warning.
pub fn scanners_from_config(names: &[String]) -> Vec<Arc<dyn SecurityScanner>> {
    names
        .iter()
        .filter_map(|name| -> Option<Arc<dyn SecurityScanner>> {
            match name.as_str() {
                "semgrep" => Some(Arc::new(Semgrep)),
                "bandit" => Some(Arc::new(Bandit)),
                "npm_audit" | "npm" => Some(Arc::new(NpmAudit)),
                "cargo_audit" => Some(Arc::new(CargoAudit)),
                other => {
                    tracing::warn!(tool = %other, "unknown security tool in config; ignored");
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
    fn semgrep_results_map_severity_and_location() {
        let out = parse_semgrep(&json!({
            "results": [
                {
                    "check_id": "python.lang.security.audit.formatted-sql-query",
                    "path": "auth.py",
                    "start": {"line": 12},
                    "end": {"line": 14},
                    "extra": {"message": "SQL built from user input", "severity": "ERROR"}
                },
                {
                    "check_id": "generic.secrets.hardcoded-password",
                    "path": "config.py",
                    "start": {"line": 3},
                    "end": {"line": 3},
                    "extra": {"message": "hardcoded password", "severity": "WARNING"}
                }
            ]
        }));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].severity, Severity::Critical);
        assert_eq!(out[0].line, Some(12));
        assert_eq!(out[0].end_line, Some(14));
        assert_eq!(out[1].severity, Severity::Medium);
        assert_eq!(out[1].category, FindingCategory::Secret);
    }

    #[test]
    fn bandit_results_map_severity() {
        let out = parse_bandit(&json!({
            "results": [
                {"filename": "./app.py", "line_number": 7, "line_range": [7, 8],
                 "issue_severity": "HIGH", "issue_text": "subprocess with shell=True",
                 "test_id": "B602"},
                {"filename": "app.py", "line_number": 2, "issue_severity": "LOW",
                 "issue_text": "Possible hardcoded password", "test_id": "B105"}
            ]
        }));
        assert_eq!(out[0].severity, Severity::Critical);
        assert_eq!(out[0].file.as_deref(), Some("app.py"));
        assert_eq!(out[0].end_line, Some(8));
        assert_eq!(out[1].severity, Severity::Info);
        assert_eq!(out[1].category, FindingCategory::Secret);
    }

    #[test]
    fn npm_audit_vulnerabilities() {
        let out = parse_npm_audit(&json!({
            "vulnerabilities": {
                "lodash": {"severity": "high", "via": [{"title": "Prototype Pollution"}]},
                "minimist": {"severity": "low", "via": ["other"]}
            }
        }));
        assert_eq!(out.len(), 2);
        let lodash = out.iter().find(|f| f.message.starts_with("lodash")).unwrap();
        assert_eq!(lodash.severity, Severity::Critical);
        assert_eq!(lodash.message, "lodash: Prototype Pollution");
        let minimist = out.iter().find(|f| f.message.starts_with("minimist")).unwrap();
        assert_eq!(minimist.severity, Severity::Low);
        assert_eq!(minimist.file.as_deref(), Some("package.json"));
    }

    #[test]
    fn cargo_audit_advisories_are_critical() {
        let out = parse_cargo_audit(&json!({
            "vulnerabilities": {"found": true, "list": [
                {"advisory": {"id": "RUSTSEC-2023-0001", "title": "Use after free"},
                 "package": {"name": "smallvec"}}
            ]}
        }));
        assert_eq!(out[0].severity, Severity::Critical);
        assert_eq!(out[0].message, "RUSTSEC-2023-0001: Use after free in smallvec");
        assert_eq!(out[0].rule_id.as_deref(), Some("RUSTSEC-2023-0001"));
    }

    #[test]
    fn empty_output_on_failure_is_an_error() {
        let failed = CommandOutput {
            tool: "semgrep".into(),
            exit_code: 2,
            stdout: String::new(),
            stderr: "bad config".into(),
            duration_ms: 1,
        };
        assert!(matches!(
            parse_json("semgrep", &failed),
            Err(ToolError::Failed { .. })
        ));
        let garbage = CommandOutput {
            stdout: "not json".into(),
            exit_code: 1,
            ..failed
        };
        assert!(matches!(
            parse_json("semgrep", &garbage),
            Err(ToolError::Parse { .. })
        ));
    }

    #[test]
    fn config_names_select_scanners() {
        let names: Vec<String> = ["semgrep", "bogus", "cargo_audit"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let scanners = scanners_from_config(&names);
        let got: Vec<&str> = scanners.iter().map(|s| s.name()).collect();
        assert_eq!(got, vec!["semgrep", "cargo_audit"]);
    }
}
