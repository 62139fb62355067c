//! Micro-task executor.
//!
//! Executes one micro-task against a project directory:
//! 1. hash the current content of the target file (the rollback pre-image)
//! 2. dispatch on the micro-task type
//! 3. on success, analyse the result for follow-up micro-tasks
//! 4. on failure, verify the target was not modified behind our back
//!
//! The retry policy is not applied here; the task manager owns it.

mod analysis;

pub use analysis::{follow_ups, offline_summary, LogAnalysis, ProposedFix, ProposedMicroTasks};

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use crate::builder::{BuildReport, Builder, BuilderError, TestReport};
use crate::fs_store::FileStore;
use crate::llm::{decode_json, LlmClient};
use crate::task::{has_conflict_markers, MicroTask, MicroTaskKind};
use crate::util::truncate_chars;

/// Relative path of the completion record written by `project_finish`.
pub const FINISH_LOG: &str = ".forgeloop/log.json";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("Snippet not found in {path}: {snippet}")]
    SnippetNotFound { path: String, snippet: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("{kind} micro-task is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("No dependencies to install")]
    EmptyDependencyList,

    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Build tool error: {0}")]
    Builder(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Could not decode model output: {0}")]
    Decode(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Unresolved conflict markers remain in {0}")]
    UnresolvedConflict(String),
}

impl From<BuilderError> for ExecutionError {
    fn from(e: BuilderError) -> Self {
        match e {
            BuilderError::Timeout { command, secs } => Self::Timeout { command, secs },
            other => Self::Builder(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(e: anyhow::Error) -> Self {
        Self::Io(format!("{:#}", e))
    }
}

/// What a handler produced.
#[derive(Debug, Clone)]
pub enum ExecutionReport {
    Build(BuildReport),
    Test(TestReport),
    Install(BuildReport),
    /// A file was written, replaced or deleted; `checksum` is `None` after a delete.
    File {
        path: String,
        checksum: Option<String>,
    },
    /// Analysis without side effects.
    Note(String),
    Finish { path: String },
}

/// Result of executing one micro-task.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub new_micro_tasks: Vec<MicroTask>,
    pub logs: Vec<String>,
    /// SHA-256 of the target file before execution, if it existed
    pub rollback_hash: Option<String>,
    pub report: Option<ExecutionReport>,
    pub error: Option<ExecutionError>,
}

struct HandlerOutput {
    report: ExecutionReport,
    spawned: Vec<MicroTask>,
    logs: Vec<String>,
}

impl HandlerOutput {
    fn new(report: ExecutionReport) -> Self {
        Self {
            report,
            spawned: Vec::new(),
            logs: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct MicroTaskExecutor {
    file_store: Arc<dyn FileStore>,
    builder: Arc<dyn Builder>,
    llm: Arc<dyn LlmClient>,
}

fn require<'a>(
    value: &'a Option<String>,
    kind: MicroTaskKind,
    field: &'static str,
) -> Result<&'a str, ExecutionError> {
    value.as_deref().ok_or(ExecutionError::MissingField {
        kind: kind.as_str(),
        field,
    })
}

impl MicroTaskExecutor {
    pub fn new(
        file_store: Arc<dyn FileStore>,
        builder: Arc<dyn Builder>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            file_store,
            builder,
            llm,
        }
    }

    /// Execute `micro` inside `project_path`. Never panics; failures are in the outcome.
    pub async fn execute(&self, micro: &MicroTask, project_path: &Path) -> ExecutionOutcome {
        let rollback_hash = match &micro.path {
            Some(path) if micro.kind.touches_file() => {
                match self.file_store.checksum(project_path, path).await {
                    Ok(hash) => hash,
                    Err(e) => {
                        tracing::debug!("No pre-image for {}: {:#}", path, e);
                        None
                    }
                }
            }
            _ => None,
        };

        tracing::debug!(
            micro_task = %micro.id,
            kind = micro.kind.as_str(),
            path = micro.path.as_deref().unwrap_or("-"),
            "Executing micro-task"
        );

        match self.dispatch(micro, project_path).await {
            Ok(output) => {
                let mut new_micro_tasks = output.spawned;
                new_micro_tasks.extend(follow_ups(&output.report));
                let mut logs = output.logs;
                if !new_micro_tasks.is_empty() {
                    logs.push(format!(
                        "{} spawned {} follow-up micro-task(s)",
                        micro.kind.as_str(),
                        new_micro_tasks.len()
                    ));
                }
                ExecutionOutcome {
                    success: true,
                    new_micro_tasks,
                    logs,
                    rollback_hash,
                    report: Some(output.report),
                    error: None,
                }
            }
            Err(error) => {
                let mut logs = vec![format!("{} failed: {}", micro.kind.as_str(), error)];
                if let Some(note) = self
                    .verify_untouched(micro, project_path, rollback_hash.as_deref())
                    .await
                {
                    logs.push(note);
                }
                ExecutionOutcome {
                    success: false,
                    new_micro_tasks: Vec::new(),
                    logs,
                    rollback_hash,
                    report: None,
                    error: Some(error),
                }
            }
        }
    }

    async fn dispatch(
        &self,
        micro: &MicroTask,
        root: &Path,
    ) -> Result<HandlerOutput, ExecutionError> {
        match micro.kind {
            MicroTaskKind::FileCreate => self.file_create(micro, root).await,
            MicroTaskKind::FileReplace => self.file_replace(micro, root).await,
            MicroTaskKind::FileDelete => self.file_delete(micro, root).await,
            MicroTaskKind::PackageInstall => self.package_install(micro, root).await,
            MicroTaskKind::BuildRun => {
                let report = self.builder.build(root).await?;
                Ok(HandlerOutput::new(ExecutionReport::Build(report)))
            }
            MicroTaskKind::TestRun => {
                let report = self.builder.test(root).await?;
                Ok(HandlerOutput::new(ExecutionReport::Test(report)))
            }
            MicroTaskKind::LogParse => self.log_parse(micro).await,
            MicroTaskKind::MergeResolve => self.merge_resolve(micro, root).await,
            MicroTaskKind::ProjectFinish => self.project_finish(micro, root).await,
        }
    }

    async fn written(&self, root: &Path, path: &str) -> Result<HandlerOutput, ExecutionError> {
        let checksum = self.file_store.checksum(root, path).await?;
        Ok(HandlerOutput::new(ExecutionReport::File {
            path: path.to_string(),
            checksum,
        }))
    }

    async fn file_create(&self, micro: &MicroTask, root: &Path) -> Result<HandlerOutput, ExecutionError> {
        let path = require(&micro.path, micro.kind, "path")?;
        let content = require(&micro.new_snippet, micro.kind, "newSnippet")?;
        self.file_store.write(root, path, content).await?;
        self.written(root, path).await
    }

    async fn file_replace(&self, micro: &MicroTask, root: &Path) -> Result<HandlerOutput, ExecutionError> {
        let path = require(&micro.path, micro.kind, "path")?;
        let old = require(&micro.old_snippet, micro.kind, "oldSnippet")?;
        let new = require(&micro.new_snippet, micro.kind, "newSnippet")?;
        if !self.file_store.exists(root, path).await {
            return Err(ExecutionError::FileNotFound(path.to_string()));
        }
        let content = self.file_store.read(root, path).await?;
        if old.is_empty() || !content.contains(old) {
            return Err(ExecutionError::SnippetNotFound {
                path: path.to_string(),
                snippet: truncate_chars(old, 80),
            });
        }
        let updated = content.replacen(old, new, 1);
        self.file_store.write(root, path, &updated).await?;
        self.written(root, path).await
    }

    async fn file_delete(&self, micro: &MicroTask, root: &Path) -> Result<HandlerOutput, ExecutionError> {
        let path = require(&micro.path, micro.kind, "path")?;
        if !self.file_store.exists(root, path).await {
            return Err(ExecutionError::FileNotFound(path.to_string()));
        }
        self.file_store.delete(root, path).await?;
        Ok(HandlerOutput::new(ExecutionReport::File {
            path: path.to_string(),
            checksum: None,
        }))
    }

    async fn package_install(&self, micro: &MicroTask, root: &Path) -> Result<HandlerOutput, ExecutionError> {
        let deps = micro.dependencies();
        if deps.is_empty() {
            return Err(ExecutionError::EmptyDependencyList);
        }
        let report = self.builder.install_deps(root, &deps).await?;
        if !report.success {
            let reason = if report.errors.is_empty() {
                "npm install failed".to_string()
            } else {
                report.errors.join("\n")
            };
            return Err(ExecutionError::Builder(reason));
        }
        let mut output = HandlerOutput::new(ExecutionReport::Install(report));
        output.logs.push(format!("Installed {}", deps.join(", ")));
        Ok(output)
    }

    async fn log_parse(&self, micro: &MicroTask) -> Result<HandlerOutput, ExecutionError> {
        let log = require(&micro.new_snippet, micro.kind, "newSnippet")?;
        if !self.llm.is_connected().await {
            let summary = offline_summary(log);
            let mut output = HandlerOutput::new(ExecutionReport::Note(summary.clone()));
            output.logs.push(format!("Log analysis: {}", summary));
            return Ok(output);
        }

        let prompt = format!(
            "Analyze this build/test output and propose minimal fixes.\n\n{}\n\n\
             Answer with JSON only: {{\"errors\": [string], \"warnings\": [string], \
             \"solutions\": [string], \"fixes\": [{{\"type\": \"file_create\" | \"file_replace\" \
             | \"file_delete\", \"path\": string, \"oldSnippet\": string, \"newSnippet\": string}}]}}",
            truncate_chars(log, 6_000)
        );
        let raw = self
            .llm
            .generate(&prompt)
            .await
            .map_err(|e| ExecutionError::Llm(e.to_string()))?;
        let analysis: LogAnalysis =
            decode_json(&raw).map_err(|e| ExecutionError::Decode(e.to_string()))?;

        let note = format!(
            "{} error(s), {} warning(s), {} solution(s)",
            analysis.errors.len(),
            analysis.warnings.len(),
            analysis.solutions.len()
        );
        let (spawned, dropped) = analysis.into_micro_tasks();
        let mut output = HandlerOutput::new(ExecutionReport::Note(note.clone()));
        output.logs.push(format!("Log analysis: {}", note));
        for fix in dropped {
            output.logs.push(format!("Ignored non-file fix: {}", fix));
        }
        output.spawned = spawned;
        Ok(output)
    }

    async fn merge_resolve(&self, micro: &MicroTask, root: &Path) -> Result<HandlerOutput, ExecutionError> {
        let path = require(&micro.path, micro.kind, "path")?;
        let resolved = require(&micro.new_snippet, micro.kind, "newSnippet")?;
        if has_conflict_markers(resolved) {
            return Err(ExecutionError::UnresolvedConflict(path.to_string()));
        }
        self.file_store.write(root, path, resolved).await?;
        self.written(root, path).await
    }

    async fn project_finish(&self, micro: &MicroTask, root: &Path) -> Result<HandlerOutput, ExecutionError> {
        let summary = micro
            .new_snippet
            .as_deref()
            .map(|raw| serde_json::from_str::<Value>(raw).unwrap_or_else(|_| json!(raw)))
            .unwrap_or(Value::Null);
        let files = self.file_store.list_project_files(root).await?;
        let record = json!({
            "finishedAt": chrono::Utc::now(),
            "summary": summary,
            "files": files.keys().collect::<Vec<_>>(),
        });
        let body = serde_json::to_string_pretty(&record)
            .map_err(|e| ExecutionError::Io(e.to_string()))?;
        self.file_store.write(root, FINISH_LOG, &body).await?;
        let mut output = HandlerOutput::new(ExecutionReport::Finish {
            path: FINISH_LOG.to_string(),
        });
        output
            .logs
            .push(format!("Project finished with {} file(s)", files.len()));
        Ok(output)
    }

    /// Best-effort rollback check after a failed handler.
    ///
    /// Content is never overwritten here: if the target changed since the
    /// pre-image was taken, the change is reported and left in place.
    async fn verify_untouched(
        &self,
        micro: &MicroTask,
        root: &Path,
        rollback_hash: Option<&str>,
    ) -> Option<String> {
        let path = micro.path.as_deref().filter(|_| micro.kind.touches_file())?;
        let current = self.file_store.checksum(root, path).await.ok().flatten();
        if current.as_deref() == rollback_hash {
            return None;
        }
        tracing::warn!(
            micro_task = %micro.id,
            "{} changed since execution started; rollback skipped",
            path
        );
        Some(format!(
            "Rollback skipped: {} was modified externally",
            path
        ))
    }
}
