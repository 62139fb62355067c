//! Task manager: owns every task and drives its orchestration loop.
//!
//! Each task lives in its own slot behind a `tokio::sync::Mutex`, so all
//! mutations of one task are serialized while different tasks progress
//! independently. At most one orchestration loop runs per task; the
//! `running` flag is only cleared while the task lock is held, which lets
//! `iterate` and `retry` append work without racing a loop that is about to
//! finish.

mod process;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::agents::AgentRegistry;
use crate::builder::{Builder, NpmBuilder};
use crate::config::Config;
use crate::executor::{MicroTaskExecutor, ProposedMicroTasks};
use crate::fs_store::{FileStore, LocalFileStore};
use crate::llm::{decode_json, HttpLlmClient, LlmClient, OfflineLlm};
use crate::memory::{ContextOutcome, InMemoryContextMemory, Memory};
use crate::ooda::OodaEngine;
use crate::security::{
    RollbackPoint, RollbackReport, SecurityAudit, SecurityAuditor, SecurityError, SecurityReport,
};
use crate::streaming::{EventStreamer, StreamMessage};
use crate::task::{
    BuildStatus, LogLevel, MicroTask, Task, TaskError, TaskId, TaskLog, TaskStatus, TaskUpdate,
    TestStatus,
};
use crate::util::truncate_chars;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Security audit blocked execution: {0}")]
    SecurityCritical(String),

    #[error("OODA engine error: {0}")]
    Engine(String),

    #[error("Iteration limit of {0} reached")]
    LivenessExceeded(u32),

    #[error("Task was cancelled")]
    Cancelled,

    #[error(transparent)]
    Rollback(#[from] SecurityError),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<TaskError> for OrchestrationError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::InvalidTransition { .. } => Self::InvalidState(e.to_string()),
            TaskError::EmptyPrompt | TaskError::UnknownStatus(_) => Self::Validation(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Query for [`TaskManager::list`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub total: usize,
    pub running: usize,
    pub by_status: BTreeMap<String, usize>,
}

/// Result of [`TaskManager::subscribe`].
pub struct Subscription {
    pub task: Task,
    /// Terminal and idle: nothing more will be published.
    pub finished: bool,
    pub receiver: broadcast::Receiver<StreamMessage>,
}

/// External capabilities the manager is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub file_store: Arc<dyn FileStore>,
    pub builder: Arc<dyn Builder>,
    pub llm: Arc<dyn LlmClient>,
    pub memory: Arc<dyn Memory>,
}

impl Collaborators {
    /// Local disk, npm, and the HTTP model when a key is configured.
    pub fn from_config(config: &Config) -> Self {
        let llm: Arc<dyn LlmClient> = match &config.llm.api_key {
            Some(key) => Arc::new(HttpLlmClient::new(key.clone(), &config.llm)),
            None => {
                tracing::warn!("LLM_API_KEY not set; running with the offline model");
                Arc::new(OfflineLlm)
            }
        };
        Self {
            file_store: Arc::new(LocalFileStore::new()),
            builder: Arc::new(NpmBuilder::new(config.timeouts)),
            llm,
            memory: Arc::new(InMemoryContextMemory::new()),
        }
    }
}

struct TaskSlot {
    task: Mutex<Task>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl TaskSlot {
    fn new(task: Task) -> Self {
        Self {
            task: Mutex::new(task),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }
}

pub struct TaskManager {
    config: Config,
    tasks: RwLock<HashMap<TaskId, Arc<TaskSlot>>>,
    agents: AgentRegistry,
    engine: OodaEngine,
    executor: MicroTaskExecutor,
    auditor: Arc<SecurityAuditor>,
    streamer: Arc<EventStreamer>,
    file_store: Arc<dyn FileStore>,
    memory: Arc<dyn Memory>,
    llm: Arc<dyn LlmClient>,
    shutdown: CancellationToken,
}

impl TaskManager {
    pub fn from_config(config: Config) -> Arc<Self> {
        let collaborators = Collaborators::from_config(&config);
        Self::new(config, collaborators, AgentRegistry::with_defaults())
    }

    pub fn new(config: Config, collaborators: Collaborators, agents: AgentRegistry) -> Arc<Self> {
        let Collaborators {
            file_store,
            builder,
            llm,
            memory,
        } = collaborators;
        Arc::new(Self {
            engine: OodaEngine::new(file_store.clone(), llm.clone(), memory.clone()),
            executor: MicroTaskExecutor::new(file_store.clone(), builder, llm.clone()),
            auditor: Arc::new(SecurityAuditor::new(file_store.clone())),
            streamer: Arc::new(EventStreamer::new(config.streams)),
            tasks: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            config,
            agents,
            file_store,
            memory,
            llm,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn auditor(&self) -> &Arc<SecurityAuditor> {
        &self.auditor
    }

    pub fn streamer(&self) -> &Arc<EventStreamer> {
        &self.streamer
    }

    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    /// Parent token of every task loop; cancelled by [`Self::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn slot(&self, id: &TaskId) -> Result<Arc<TaskSlot>> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestrationError::NotFound(id.clone()))
    }

    /// Append a log entry, mirror it to tracing, and publish it on the task's stream.
    async fn log(&self, task: &mut Task, log: TaskLog) {
        match log.level {
            LogLevel::Error => tracing::error!(task_id = %task.id(), "{}", log.message),
            LogLevel::Warn => tracing::warn!(task_id = %task.id(), "{}", log.message),
            LogLevel::Info | LogLevel::Success => {
                tracing::info!(task_id = %task.id(), "{}", log.message)
            }
        }
        self.streamer
            .publish(task.id(), StreamMessage::log(task.id(), &log))
            .await;
        task.push_log(log);
    }

    async fn publish_status(&self, task: &Task, from: TaskStatus) {
        if from != task.status() {
            self.streamer
                .publish(
                    task.id(),
                    StreamMessage::status_change(task.id(), from, task.status()),
                )
                .await;
        }
    }

    /// Best-effort snapshot of the task next to its project.
    async fn persist(&self, task: &Task) {
        let value = match serde_json::to_value(task) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(task_id = %task.id(), "Failed to serialize task: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .file_store
            .save_task_log(task.project_path(), task.id().as_str(), &value)
            .await
        {
            tracing::warn!(task_id = %task.id(), "Failed to persist task log: {:#}", e);
        }
    }

    /// Create a task, its project tree and its event stream.
    ///
    /// Starts the orchestration loop right away when `auto_start` is set.
    pub async fn create(self: &Arc<Self>, prompt: &str) -> Result<Task> {
        let mut task = Task::new(prompt, &self.config.projects_dir)?;
        self.file_store
            .create_project_structure(task.project_path(), prompt)
            .await
            .map_err(|e| OrchestrationError::Storage(format!("{:#}", e)))?;

        let memory_id = self
            .memory
            .record_context(
                task.id(),
                "task_created",
                ContextOutcome::Neutral,
                json!({ "prompt": truncate_chars(prompt, 500) }),
            )
            .await;
        task.set_memory_id(Some(memory_id));
        self.streamer.create_stream(task.id()).await;
        let created_log = TaskLog::new(LogLevel::Info, "Task created")
            .with_details(json!({ "projectPath": task.project_path() }));
        self.log(&mut task, created_log)
        .await;
        self.persist(&task).await;

        let id = task.id().clone();
        let snapshot = task.clone();
        self.tasks
            .write()
            .await
            .insert(id.clone(), Arc::new(TaskSlot::new(task)));

        if self.config.auto_start {
            self.start(&id).await?;
        }
        Ok(snapshot)
    }

    pub async fn get(&self, id: &TaskId) -> Result<Task> {
        let slot = self.slot(id).await?;
        let task = slot.task.lock().await;
        Ok(task.clone())
    }

    /// Apply a partial update. Setting the status to `cancelled` also stops the loop.
    pub async fn update(&self, id: &TaskId, update: TaskUpdate) -> Result<Task> {
        let slot = self.slot(id).await?;
        let cancelling = update.status == Some(TaskStatus::Cancelled);
        let mut task = slot.task.lock().await;
        let from = task.status();
        task.apply_update(update)?;
        self.log(&mut task, TaskLog::new(LogLevel::Info, "Task updated"))
            .await;
        self.publish_status(&task, from).await;
        self.persist(&task).await;
        if cancelling {
            slot.cancel.lock().await.cancel();
        }
        Ok(task.clone())
    }

    /// Remove a task with its project tree, audits, memory and stream.
    pub async fn delete(&self, id: &TaskId) -> Result<()> {
        let slot = self
            .tasks
            .write()
            .await
            .remove(id)
            .ok_or_else(|| OrchestrationError::NotFound(id.clone()))?;
        slot.cancel.lock().await.cancel();

        let project_path = slot.task.lock().await.project_path().to_path_buf();
        if let Err(e) = self.file_store.remove_project(&project_path).await {
            tracing::warn!(task_id = %id, "Failed to remove project: {:#}", e);
        }
        self.auditor.forget(id).await;
        self.memory.forget(id).await;
        self.streamer.close(id).await;
        tracing::info!(task_id = %id, "Task deleted");
        Ok(())
    }

    /// Tasks newest first, optionally filtered by status and paged.
    pub async fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let slots: Vec<Arc<TaskSlot>> = self.tasks.read().await.values().cloned().collect();
        let mut tasks = Vec::with_capacity(slots.len());
        for slot in slots {
            let task = slot.task.lock().await;
            if filter.status.map_or(true, |s| s == task.status()) {
                tasks.push(task.clone());
            }
        }
        tasks.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        tasks
            .into_iter()
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub async fn logs(&self, id: &TaskId) -> Result<Vec<TaskLog>> {
        let slot = self.slot(id).await?;
        let task = slot.task.lock().await;
        Ok(task.logs().to_vec())
    }

    /// Turn a user message into micro-tasks and queue them.
    ///
    /// Without a connected model the message is logged and nothing is queued.
    /// Model output that does not decode is an error, never an empty result.
    pub async fn iterate(self: &Arc<Self>, id: &TaskId, message: &str) -> Result<Vec<MicroTask>> {
        if message.trim().is_empty() {
            return Err(OrchestrationError::Validation(
                "Iteration message cannot be empty".to_string(),
            ));
        }
        let slot = self.slot(id).await?;
        let snapshot = {
            let mut task = slot.task.lock().await;
            self.log(
                &mut task,
                TaskLog::new(LogLevel::Info, format!("User iteration: {}", message)),
            )
            .await;
            task.clone()
        };

        let proposed = if self.llm.is_connected().await {
            self.propose_micro_tasks(&slot, &snapshot, message).await?
        } else {
            let mut task = slot.task.lock().await;
            self.log(
                &mut task,
                TaskLog::new(
                    LogLevel::Warn,
                    "No language model available; iteration recorded without new micro-tasks",
                ),
            )
            .await;
            Vec::new()
        };
        if proposed.is_empty() {
            return Ok(proposed);
        }

        {
            let mut task = slot.task.lock().await;
            let max_retries = self.config.max_retries;
            task.push_micro_tasks(
                proposed
                    .iter()
                    .cloned()
                    .map(|m| m.with_max_retries(max_retries)),
            );
            self.log(
                &mut task,
                TaskLog::new(
                    LogLevel::Info,
                    format!("Iteration queued {} micro-task(s)", proposed.len()),
                ),
            )
            .await;
        }
        self.start(id).await?;
        Ok(proposed)
    }

    async fn propose_micro_tasks(
        &self,
        slot: &TaskSlot,
        snapshot: &Task,
        message: &str,
    ) -> Result<Vec<MicroTask>> {
        let files = self
            .file_store
            .list_project_files(snapshot.project_path())
            .await
            .map_err(|e| OrchestrationError::Storage(format!("{:#}", e)))?;
        let file_list: Vec<&str> = files.keys().map(String::as_str).collect();
        let prompt = format!(
            "Project request: {}\nFiles: {}\nBuild: {:?}, tests: {:?}\n\n\
             The user asks: {}\n\n\
             Answer with JSON only: {{\"microTasks\": [{{\"type\": \"file_create\" | \
             \"file_replace\" | \"file_delete\" | \"package_install\" | \"build_run\" | \
             \"test_run\", \"path\": string, \"oldSnippet\": string, \"newSnippet\": string}}]}}",
            snapshot.prompt(),
            file_list.join(", "),
            snapshot.build_status(),
            snapshot.test_status(),
            message
        );
        let raw = self
            .llm
            .generate(&prompt)
            .await
            .map_err(|e| OrchestrationError::Execution(e.to_string()))?;
        let parsed: ProposedMicroTasks = decode_json(&raw).map_err(|e| {
            OrchestrationError::Execution(format!("Could not decode proposed micro-tasks: {}", e))
        })?;

        let mut micro_tasks = Vec::new();
        let mut unusable = Vec::new();
        for proposal in parsed.micro_tasks {
            match proposal.into_micro_task() {
                Ok(micro) => micro_tasks.push(micro),
                Err(label) => unusable.push(label),
            }
        }
        if !unusable.is_empty() {
            let mut task = slot.task.lock().await;
            self.log(
                &mut task,
                TaskLog::new(
                    LogLevel::Warn,
                    format!("Ignored {} unusable proposal(s)", unusable.len()),
                )
                .with_details(json!({ "proposals": unusable })),
            )
            .await;
        }
        Ok(micro_tasks)
    }

    /// Reset retryable micro-tasks of a failed task and restart its loop.
    ///
    /// Returns how many micro-tasks were reset.
    pub async fn retry(self: &Arc<Self>, id: &TaskId) -> Result<usize> {
        let slot = self.slot(id).await?;
        let reset = {
            let mut task = slot.task.lock().await;
            if task.status() != TaskStatus::Failed {
                return Err(OrchestrationError::InvalidState(format!(
                    "Only failed tasks can be retried (status is {})",
                    task.status()
                )));
            }
            let reset = task.reset_retryable();
            if task.build_status() == BuildStatus::Error {
                task.set_build_status(BuildStatus::NotStarted);
            }
            if task.test_status() == TestStatus::Error {
                task.set_test_status(TestStatus::NotStarted);
            }
            self.log(
                &mut task,
                TaskLog::new(
                    LogLevel::Info,
                    format!("Retrying task; {} micro-task(s) reset", reset),
                ),
            )
            .await;
            reset
        };
        self.start(id).await?;
        Ok(reset)
    }

    /// Cancel an active task. A running loop stops at its next phase boundary.
    pub async fn cancel(&self, id: &TaskId) -> Result<Task> {
        let slot = self.slot(id).await?;
        let mut task = slot.task.lock().await;
        if !task.status().is_active() {
            return Err(OrchestrationError::InvalidState(format!(
                "Task is already {}",
                task.status()
            )));
        }
        slot.cancel.lock().await.cancel();
        let from = task.status();
        task.transition_to(TaskStatus::Cancelled)?;
        self.log(&mut task, TaskLog::new(LogLevel::Warn, "Task cancelled"))
            .await;
        self.publish_status(&task, from).await;
        self.persist(&task).await;
        Ok(task.clone())
    }

    /// Mark the slot running and install a fresh loop token.
    ///
    /// Holds the task lock like `cancel` does, so a cancel either lands before
    /// the claim (and is seen by `begin`) or cancels the new token.
    async fn claim(&self, slot: &TaskSlot) -> Result<CancellationToken> {
        let task = slot.task.lock().await;
        if slot.running.load(Ordering::SeqCst) {
            return Err(OrchestrationError::InvalidState(
                "Task is already running".to_string(),
            ));
        }
        if task.status() == TaskStatus::Cancelled {
            return Err(OrchestrationError::InvalidState(
                "Task is cancelled".to_string(),
            ));
        }
        let token = self.shutdown.child_token();
        *slot.cancel.lock().await = token.clone();
        slot.running.store(true, Ordering::SeqCst);
        Ok(token)
    }

    /// Spawn the orchestration loop. Returns `false` if one is already
    /// running or the task was cancelled.
    pub async fn start(self: &Arc<Self>, id: &TaskId) -> Result<bool> {
        let slot = self.slot(id).await?;
        let token = match self.claim(&slot).await {
            Ok(token) => token,
            Err(OrchestrationError::InvalidState(reason)) => {
                tracing::debug!(task_id = %id, "Not starting loop: {}", reason);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.drive(&slot, &token).await;
        });
        Ok(true)
    }

    /// Run the orchestration loop to its end on the current task.
    pub async fn run(&self, id: &TaskId) -> Result<Task> {
        let slot = self.slot(id).await?;
        let token = self.claim(&slot).await?;
        self.drive(&slot, &token).await;
        let task = slot.task.lock().await;
        Ok(task.clone())
    }

    /// Snapshot of the task plus a receiver for every message published after it.
    ///
    /// Both are taken under the task lock, so replaying the snapshot's logs and
    /// then reading the receiver yields each log exactly once.
    pub async fn subscribe(&self, id: &TaskId) -> Result<Subscription> {
        let slot = self.slot(id).await?;
        let task = slot.task.lock().await;
        let receiver = self.streamer.create_stream(id).await.subscribe();
        Ok(Subscription {
            finished: task.status().is_terminal() && !slot.running.load(Ordering::SeqCst),
            task: task.clone(),
            receiver,
        })
    }

    pub async fn is_running(&self, id: &TaskId) -> Result<bool> {
        Ok(self.slot(id).await?.running.load(Ordering::SeqCst))
    }

    /// Audit the task's pending micro-tasks without executing anything.
    pub async fn audit(&self, id: &TaskId) -> Result<SecurityAudit> {
        let slot = self.slot(id).await?;
        let (project_path, pending) = {
            let task = slot.task.lock().await;
            let pending: Vec<MicroTask> = task
                .pending_indices()
                .into_iter()
                .filter_map(|i| task.micro_tasks().get(i).cloned())
                .collect();
            (task.project_path().to_path_buf(), pending)
        };
        Ok(self.auditor.audit(id, &project_path, &pending).await)
    }

    pub async fn create_rollback_point(
        &self,
        id: &TaskId,
        description: Option<&str>,
    ) -> Result<RollbackPoint> {
        let slot = self.slot(id).await?;
        let mut task = slot.task.lock().await;
        let description = description.unwrap_or("Manual rollback point");
        let point = self
            .auditor
            .create_rollback_point(id, description, task.project_path())
            .await?;
        self.log(
            &mut task,
            TaskLog::new(
                LogLevel::Info,
                format!("Rollback point {} created", point.id),
            )
            .with_details(json!({ "files": point.file_hashes.len() })),
        )
        .await;
        Ok(point)
    }

    /// Restore the project to a rollback point. Refused while the loop runs.
    pub async fn execute_rollback(&self, id: &TaskId, rollback_id: &str) -> Result<RollbackReport> {
        let slot = self.slot(id).await?;
        let mut task = slot.task.lock().await;
        if slot.running.load(Ordering::SeqCst) {
            return Err(OrchestrationError::InvalidState(
                "Cannot roll back while the task is running".to_string(),
            ));
        }
        let report = self
            .auditor
            .execute_rollback(id, rollback_id, task.project_path())
            .await?;

        let project_path = task.project_path().to_path_buf();
        for path in &report.restored {
            let hash = self
                .file_store
                .checksum(&project_path, path)
                .await
                .unwrap_or_default();
            task.record_checksum(path, hash);
        }
        for path in &report.removed {
            task.record_checksum(path, None);
        }
        task.set_build_status(BuildStatus::NotStarted);
        task.set_test_status(TestStatus::NotStarted);
        let level = if report.mismatches.is_empty() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        self.log(
            &mut task,
            TaskLog::new(
                level,
                format!(
                    "Rolled back to {}: {} restored, {} removed",
                    rollback_id,
                    report.restored.len(),
                    report.removed.len()
                ),
            )
            .with_details(json!({ "mismatches": report.mismatches })),
        )
        .await;
        self.persist(&task).await;
        Ok(report)
    }

    pub async fn rollback_points(&self, id: &TaskId) -> Result<Vec<RollbackPoint>> {
        self.slot(id).await?;
        Ok(self.auditor.rollback_points(id).await)
    }

    pub async fn security_report(&self, id: &TaskId) -> Result<SecurityReport> {
        self.slot(id).await?;
        Ok(self.auditor.report(id).await)
    }

    pub async fn stats(&self) -> ManagerStats {
        let slots: Vec<Arc<TaskSlot>> = self.tasks.read().await.values().cloned().collect();
        let mut stats = ManagerStats {
            total: slots.len(),
            ..Default::default()
        };
        for slot in slots {
            if slot.running.load(Ordering::SeqCst) {
                stats.running += 1;
            }
            let status = slot.task.lock().await.status();
            *stats.by_status.entry(status.to_string()).or_default() += 1;
        }
        stats
    }

    /// Stop every loop and close every stream.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let closed = self.streamer.close_all().await;
        tracing::info!("Task manager shut down; {} stream(s) closed", closed);
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;

    use super::*;
    use crate::agents::{Agent, AgentContext, AgentError, ProjectState};
    use crate::builder::{BuildReport, BuilderError, TestReport};
    use crate::fs_store::META_DIR;
    use crate::llm::LlmError;
    use crate::task::{MicroTaskKind, MicroTaskStatus};

    struct FakeBuilder {
        build_errors: Vec<String>,
    }

    #[async_trait]
    impl Builder for FakeBuilder {
        async fn build(&self, _root: &Path) -> std::result::Result<BuildReport, BuilderError> {
            Ok(BuildReport {
                success: self.build_errors.is_empty(),
                output: self.build_errors.join("\n"),
                errors: self.build_errors.clone(),
                ..Default::default()
            })
        }

        async fn test(&self, _root: &Path) -> std::result::Result<TestReport, BuilderError> {
            Ok(TestReport {
                success: true,
                passed: 1,
                ..Default::default()
            })
        }

        async fn install_deps(
            &self,
            _root: &Path,
            _deps: &[String],
        ) -> std::result::Result<BuildReport, BuilderError> {
            Ok(BuildReport {
                success: true,
                ..Default::default()
            })
        }
    }

    struct ScriptedLlm(String);

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate(&self, _prompt: &str) -> std::result::Result<String, LlmError> {
            Ok(self.0.clone())
        }

        async fn is_connected(&self) -> bool {
            true
        }
    }

    /// Proposes the same micro-task forever, or fails.
    struct Repeater {
        micro: Option<MicroTask>,
    }

    #[async_trait]
    impl Agent for Repeater {
        fn name(&self) -> &str {
            "Repeater"
        }

        fn priority(&self) -> u32 {
            1
        }

        fn can_handle(&self, _task: &Task, _state: &ProjectState) -> bool {
            true
        }

        async fn execute(
            &self,
            _ctx: &AgentContext<'_>,
        ) -> std::result::Result<Vec<MicroTask>, AgentError> {
            match &self.micro {
                Some(micro) => Ok(vec![micro.clone()]),
                None => Err(AgentError::Internal("boom".to_string())),
            }
        }
    }

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::new(dir.to_path_buf());
        config.auto_start = false;
        config
    }

    fn manager_with(
        config: Config,
        build_errors: Vec<String>,
        llm: Arc<dyn LlmClient>,
        agents: AgentRegistry,
    ) -> Arc<TaskManager> {
        TaskManager::new(
            config,
            Collaborators {
                file_store: Arc::new(LocalFileStore::new()),
                builder: Arc::new(FakeBuilder { build_errors }),
                llm,
                memory: Arc::new(InMemoryContextMemory::new()),
            },
            agents,
        )
    }

    fn default_manager(dir: &Path) -> Arc<TaskManager> {
        manager_with(
            config_in(dir),
            Vec::new(),
            Arc::new(OfflineLlm),
            AgentRegistry::with_defaults(),
        )
    }

    fn repeating(micro: Option<MicroTask>) -> AgentRegistry {
        let mut agents = AgentRegistry::new();
        agents.register(Arc::new(Repeater { micro }));
        agents
    }

    fn has_log(task: &Task, needle: &str) -> bool {
        task.logs().iter().any(|l| l.message.contains(needle))
    }

    #[tokio::test]
    async fn default_agents_take_a_project_to_completion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = default_manager(dir.path());
        let task = manager.create("a node greeter").await.expect("create");
        assert!(task.memory_id().is_some());

        let task = manager.run(task.id()).await.expect("run");
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.build_status(), BuildStatus::Success);
        assert_eq!(task.test_status(), TestStatus::Passed);
        assert!(task.completed_at().is_some());
        assert!(task
            .micro_tasks()
            .iter()
            .any(|m| m.kind == MicroTaskKind::ProjectFinish
                && m.status == MicroTaskStatus::Completed));
        assert!(task.checksums().contains_key("package.json"));
        assert!(task
            .project_path()
            .join(META_DIR)
            .join(format!("{}.log.json", task.id()))
            .exists());
        assert!(has_log(&task, "Task completed"));
        assert!(!manager.is_running(task.id()).await.expect("known"));
    }

    #[tokio::test]
    async fn failed_build_is_analysed_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_with(
            config_in(dir.path()),
            vec!["src/index.ts(1,1): error TS2304: Cannot find name 'x'.".to_string()],
            Arc::new(OfflineLlm),
            AgentRegistry::with_defaults(),
        );
        let task = manager.create("a node greeter").await.expect("create");
        let task = manager.run(task.id()).await.expect("run");

        assert_eq!(task.build_status(), BuildStatus::Failed);
        let build = task
            .micro_tasks()
            .iter()
            .find(|m| m.kind == MicroTaskKind::BuildRun)
            .expect("build ran");
        assert_eq!(build.status, MicroTaskStatus::Completed);
        assert!(build.error.as_deref().unwrap_or_default().contains("TS2304"));
        let parses = task
            .micro_tasks()
            .iter()
            .filter(|m| m.kind == MicroTaskKind::LogParse)
            .count();
        assert_eq!(parses, 1);
    }

    #[tokio::test]
    async fn critical_audit_blocks_the_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_with(
            config_in(dir.path()),
            Vec::new(),
            Arc::new(OfflineLlm),
            repeating(Some(MicroTask::file_create("../escape.ts", "x"))),
        );
        let task = manager.create("escape").await.expect("create");
        let task = manager.run(task.id()).await.expect("run");

        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.micro_tasks().len(), 1);
        assert_eq!(task.micro_tasks()[0].status, MicroTaskStatus::Failed);
        assert_eq!(task.micro_tasks()[0].retry_count, 0);
        assert!(!dir.path().join("escape.ts").exists());
        assert!(has_log(&task, "Security audit blocked"));
        assert_eq!(manager.security_report(task.id()).await.expect("report").audit_history.len(), 1);
    }

    #[tokio::test]
    async fn iteration_ceiling_fails_the_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config_in(dir.path());
        config.max_iterations = 3;
        let manager = manager_with(
            config,
            Vec::new(),
            Arc::new(OfflineLlm),
            repeating(Some(MicroTask::file_create("notes.md", "again"))),
        );
        let task = manager.create("loop forever").await.expect("create");
        let task = manager.run(task.id()).await.expect("run");

        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.micro_tasks().len(), 3);
        assert_eq!(task.count_micro_tasks(MicroTaskStatus::Completed), 3);
        assert!(has_log(&task, "Iteration limit of 3 reached"));
    }

    #[tokio::test]
    async fn agent_error_fails_the_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_with(
            config_in(dir.path()),
            Vec::new(),
            Arc::new(OfflineLlm),
            repeating(None),
        );
        let task = manager.create("break").await.expect("create");
        let task = manager.run(task.id()).await.expect("run");
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(has_log(&task, "OODA engine error"));
    }

    #[tokio::test]
    async fn retry_is_only_for_failed_tasks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = default_manager(dir.path());
        let task = manager.create("a node greeter").await.expect("create");
        assert!(matches!(
            manager.retry(task.id()).await,
            Err(OrchestrationError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn blocked_micro_tasks_are_reset_on_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_with(
            config_in(dir.path()),
            Vec::new(),
            Arc::new(OfflineLlm),
            repeating(Some(MicroTask::file_create("../escape.ts", "x"))),
        );
        let task = manager.create("escape").await.expect("create");
        manager.run(task.id()).await.expect("run");

        let reset = manager.retry(task.id()).await.expect("retry");
        assert_eq!(reset, 1);
    }

    #[tokio::test]
    async fn update_list_and_cancel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = default_manager(dir.path());
        let first = manager.create("first").await.expect("create");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = manager.create("second").await.expect("create");

        let updated = manager
            .update(
                first.id(),
                TaskUpdate {
                    prompt: Some("first, renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.prompt(), "first, renamed");
        assert_eq!(updated.status(), TaskStatus::Pending);

        let listed = manager.list(&TaskFilter::default()).await;
        assert_eq!(listed[0].id(), second.id());
        assert_eq!(listed[1].id(), first.id());

        let cancelled = manager.cancel(second.id()).await.expect("cancel");
        assert_eq!(cancelled.status(), TaskStatus::Cancelled);
        assert!(matches!(
            manager.cancel(second.id()).await,
            Err(OrchestrationError::InvalidState(_))
        ));

        let pending = manager
            .list(&TaskFilter {
                status: Some(TaskStatus::Pending),
                ..Default::default()
            })
            .await;
        assert_eq!(pending.len(), 1);
        assert_eq!(manager.stats().await.total, 2);
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = default_manager(dir.path());
        let task = manager.create("short lived").await.expect("create");
        assert!(task.project_path().exists());
        assert!(manager.streamer().subscribe(task.id()).await.is_some());

        manager.delete(task.id()).await.expect("delete");
        assert!(!task.project_path().exists());
        assert!(manager.streamer().subscribe(task.id()).await.is_none());
        assert!(matches!(
            manager.get(task.id()).await,
            Err(OrchestrationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn offline_iteration_queues_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = default_manager(dir.path());
        let task = manager.create("a node greeter").await.expect("create");
        let queued = manager.iterate(task.id(), "add a footer").await.expect("iterate");
        assert!(queued.is_empty());
        let task = manager.get(task.id()).await.expect("get");
        assert!(has_log(&task, "User iteration: add a footer"));
        assert!(task.micro_tasks().is_empty());
    }

    #[tokio::test]
    async fn model_iteration_is_decoded_strictly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_with(
            config_in(dir.path()),
            Vec::new(),
            Arc::new(ScriptedLlm("sure, I will add a footer".to_string())),
            repeating(None),
        );
        let task = manager.create("a node greeter").await.expect("create");
        assert!(matches!(
            manager.iterate(task.id(), "add a footer").await,
            Err(OrchestrationError::Execution(_))
        ));

        let manager = manager_with(
            config_in(dir.path()),
            Vec::new(),
            Arc::new(ScriptedLlm(
                r#"{"microTasks": [{"type": "file_create", "path": "FOOTER.md", "newSnippet": "bye"}]}"#
                    .to_string(),
            )),
            repeating(None),
        );
        let task = manager.create("a node greeter").await.expect("create");
        let queued = manager.iterate(task.id(), "add a footer").await.expect("iterate");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].path.as_deref(), Some("FOOTER.md"));
        let task = manager.get(task.id()).await.expect("get");
        assert!(task.micro_tasks().iter().any(|m| m.id == queued[0].id));
    }

    #[tokio::test]
    async fn rollback_restores_files_and_checksums() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = default_manager(dir.path());
        let task = manager.create("a node greeter").await.expect("create");
        let root = task.project_path().to_path_buf();
        std::fs::write(root.join("README.md"), "v1").expect("seed");

        let point = manager
            .create_rollback_point(task.id(), None)
            .await
            .expect("point");
        std::fs::write(root.join("README.md"), "v2").expect("modify");

        let report = manager
            .execute_rollback(task.id(), &point.id)
            .await
            .expect("rollback");
        assert_eq!(report.restored, vec!["README.md"]);
        assert_eq!(std::fs::read_to_string(root.join("README.md")).expect("read"), "v1");
        let task = manager.get(task.id()).await.expect("get");
        assert!(task.checksums().contains_key("README.md"));

        assert!(matches!(
            manager.execute_rollback(task.id(), "rb-unknown").await,
            Err(OrchestrationError::Rollback(SecurityError::RollbackNotFound(_)))
        ));
    }

    /// Blocks in its first `build` until the caller gives up on it.
    struct StallingBuilder {
        entered: Arc<tokio::sync::Notify>,
        stall: AtomicBool,
    }

    #[async_trait]
    impl Builder for StallingBuilder {
        async fn build(&self, _root: &Path) -> std::result::Result<BuildReport, BuilderError> {
            if self.stall.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                std::future::pending::<()>().await;
            }
            Ok(BuildReport {
                success: true,
                ..Default::default()
            })
        }

        async fn test(&self, _root: &Path) -> std::result::Result<TestReport, BuilderError> {
            Ok(TestReport {
                success: true,
                passed: 1,
                ..Default::default()
            })
        }

        async fn install_deps(
            &self,
            _root: &Path,
            _deps: &[String],
        ) -> std::result::Result<BuildReport, BuilderError> {
            Ok(BuildReport {
                success: true,
                ..Default::default()
            })
        }
    }

    async fn wait_until_idle(manager: &TaskManager, id: &TaskId) {
        for _ in 0..200 {
            if !manager.is_running(id).await.expect("known") {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("loop for {} never stopped", id);
    }

    #[tokio::test]
    async fn cancel_abandons_the_running_micro_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entered = Arc::new(tokio::sync::Notify::new());
        let manager = TaskManager::new(
            config_in(dir.path()),
            Collaborators {
                file_store: Arc::new(LocalFileStore::new()),
                builder: Arc::new(StallingBuilder {
                    entered: Arc::clone(&entered),
                    stall: AtomicBool::new(true),
                }),
                llm: Arc::new(OfflineLlm),
                memory: Arc::new(InMemoryContextMemory::new()),
            },
            AgentRegistry::with_defaults(),
        );
        let task = manager.create("a node greeter").await.expect("create");
        assert!(manager.start(task.id()).await.expect("start"));

        tokio::time::timeout(std::time::Duration::from_secs(5), entered.notified())
            .await
            .expect("build never started");
        assert!(manager.is_running(task.id()).await.expect("known"));

        let cancelled = manager.cancel(task.id()).await.expect("cancel");
        assert_eq!(cancelled.status(), TaskStatus::Cancelled);
        wait_until_idle(&manager, task.id()).await;

        let task = manager.get(task.id()).await.expect("get");
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert_eq!(task.build_status(), BuildStatus::NotStarted);
        let build = task
            .micro_tasks()
            .iter()
            .find(|m| m.kind == MicroTaskKind::BuildRun)
            .expect("build queued");
        assert_eq!(build.status, MicroTaskStatus::Failed);
        assert_eq!(build.error.as_deref(), Some("Cancelled before completion"));
        assert!(has_log(&task, "Processing stopped after cancellation"));

        // A cancelled task is not revived by a plain start.
        assert!(!manager.start(task.id()).await.expect("start"));
        assert_eq!(
            manager.get(task.id()).await.expect("get").status(),
            TaskStatus::Cancelled
        );

        // Reopened explicitly, it runs to completion on a fresh token.
        manager
            .update(task.id(), TaskUpdate::status(TaskStatus::Pending))
            .await
            .expect("reopen");
        let task = manager.run(task.id()).await.expect("run");
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.build_status(), BuildStatus::Success);
        assert!(!manager.is_running(task.id()).await.expect("known"));
    }

    #[tokio::test]
    async fn cancel_before_start_is_not_undone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = default_manager(dir.path());
        let task = manager.create("a node greeter").await.expect("create");
        manager.cancel(task.id()).await.expect("cancel");

        assert!(!manager.start(task.id()).await.expect("start"));
        assert!(matches!(
            manager.run(task.id()).await,
            Err(OrchestrationError::InvalidState(_))
        ));
        let task = manager.get(task.id()).await.expect("get");
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert!(!has_log(&task, "Processing started"));
        assert!(!manager.is_running(task.id()).await.expect("known"));
    }
}
