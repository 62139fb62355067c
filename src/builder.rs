//! External build tooling adapter.
//!
//! [`NpmBuilder`] shells out to `npm` inside the project directory. Every
//! invocation is bounded by a timeout; an expired timeout kills the child and
//! surfaces as [`BuilderError::Timeout`] so the triggering micro-task fails
//! instead of hanging the task loop.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::config::ToolTimeouts;

static PASSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+(?:passing|passed)").expect("valid regex"));
static FAILED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+(?:failing|failed)").expect("valid regex"));

/// Outcome of a build or dependency install.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub success: bool,
    pub output: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

/// Outcome of a test run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub success: bool,
    pub passed: u32,
    pub failed: u32,
    pub output: String,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    /// The project declares no test script
    #[serde(default)]
    pub skipped: bool,
}

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Failed to spawn `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("package.json not found")]
    MissingManifest,
}

/// Build, test, and dependency installation for a project directory.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, root: &Path) -> Result<BuildReport, BuilderError>;

    async fn test(&self, root: &Path) -> Result<TestReport, BuilderError>;

    async fn install_deps(&self, root: &Path, deps: &[String])
        -> Result<BuildReport, BuilderError>;
}

/// [`Builder`] backed by the `npm` CLI.
#[derive(Debug, Clone)]
pub struct NpmBuilder {
    timeouts: ToolTimeouts,
}

struct CommandRun {
    success: bool,
    output: String,
    duration_ms: u64,
}

impl NpmBuilder {
    pub fn new(timeouts: ToolTimeouts) -> Self {
        Self { timeouts }
    }

    async fn run(
        &self,
        root: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandRun, BuilderError> {
        let command = format!("npm {}", args.join(" "));
        tracing::info!("Executing command in {:?}: {}", root, command);
        let started = Instant::now();

        let output = match tokio::time::timeout(
            timeout,
            Command::new("npm")
                .args(args)
                .current_dir(root)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::error!("Command execution failed: {}", e);
                return Err(BuilderError::Spawn {
                    command,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                tracing::error!("Command timed out after {} seconds", timeout.as_secs());
                return Err(BuilderError::Timeout {
                    command,
                    secs: timeout.as_secs(),
                });
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            "Command completed: exit={:?}, output_len={}, {}ms",
            output.status.code(),
            text.len(),
            duration_ms
        );

        Ok(CommandRun {
            success: output.status.success(),
            output: text,
            duration_ms,
        })
    }

    async fn has_script(root: &Path, name: &str) -> Result<bool, BuilderError> {
        let manifest = tokio::fs::read_to_string(root.join("package.json"))
            .await
            .map_err(|_| BuilderError::MissingManifest)?;
        let parsed: serde_json::Value = match serde_json::from_str(&manifest) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("package.json is not valid JSON: {}", e);
                return Ok(false);
            }
        };
        Ok(parsed["scripts"][name].is_string())
    }
}

#[async_trait]
impl Builder for NpmBuilder {
    async fn build(&self, root: &Path) -> Result<BuildReport, BuilderError> {
        if !Self::has_script(root, "build").await? {
            let message = "package.json has no build script".to_string();
            return Ok(BuildReport {
                success: false,
                output: message.clone(),
                errors: vec![message],
                ..Default::default()
            });
        }
        let run = self.run(root, &["run", "build"], self.timeouts.build).await?;
        let (mut errors, warnings) = analyze_build_output(&run.output);
        if !run.success && errors.is_empty() {
            errors.push("build exited with a non-zero status".to_string());
        }
        Ok(BuildReport {
            success: run.success && errors.is_empty(),
            output: run.output,
            errors,
            warnings,
            duration_ms: run.duration_ms,
        })
    }

    async fn test(&self, root: &Path) -> Result<TestReport, BuilderError> {
        if !Self::has_script(root, "test").await? {
            return Ok(TestReport {
                success: true,
                output: "package.json has no test script".to_string(),
                skipped: true,
                ..Default::default()
            });
        }
        let run = self.run(root, &["test"], self.timeouts.test).await?;
        let (passed, mut failed) = analyze_test_output(&run.output);
        if !run.success && failed == 0 {
            failed = 1;
        }
        let errors = if failed > 0 {
            vec![format!("{} test(s) failed", failed)]
        } else {
            Vec::new()
        };
        Ok(TestReport {
            success: run.success && failed == 0,
            passed,
            failed,
            output: run.output,
            errors,
            duration_ms: run.duration_ms,
            skipped: false,
        })
    }

    async fn install_deps(
        &self,
        root: &Path,
        deps: &[String],
    ) -> Result<BuildReport, BuilderError> {
        if !tokio::fs::try_exists(root.join("package.json"))
            .await
            .unwrap_or(false)
        {
            return Err(BuilderError::MissingManifest);
        }
        let mut args = vec!["install"];
        args.extend(deps.iter().map(String::as_str));
        let run = self.run(root, &args, self.timeouts.install).await?;
        let (errors, warnings) = if run.success {
            (Vec::new(), analyze_build_output(&run.output).1)
        } else {
            analyze_build_output(&run.output)
        };
        Ok(BuildReport {
            success: run.success,
            output: run.output,
            errors,
            warnings,
            duration_ms: run.duration_ms,
        })
    }
}

/// Split tool output into error lines and warning lines.
pub fn analyze_build_output(output: &str) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    for line in output.lines() {
        let lower = line.to_lowercase();
        let is_warning = lower.contains("warning") || lower.contains("deprecated");
        if !is_warning
            && (lower.contains("error") || lower.contains("failed") || lower.contains("cannot"))
        {
            errors.push(line.trim().to_string());
        }
        if is_warning {
            warnings.push(line.trim().to_string());
        }
    }
    (errors, warnings)
}

/// Extract `(passed, failed)` counts from mocha/jest style summaries.
pub fn analyze_test_output(output: &str) -> (u32, u32) {
    let mut passed = 0;
    let mut failed = 0;
    for line in output.lines() {
        if let Some(n) = PASSED_RE.captures(line).and_then(|c| c[1].parse().ok()) {
            passed = n;
        }
        if let Some(n) = FAILED_RE.captures(line).and_then(|c| c[1].parse().ok()) {
            failed = n;
        }
    }
    (passed, failed)
}
