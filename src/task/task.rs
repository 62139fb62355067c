//! Core Task type: one project-generation request and everything it accumulated.
//!
//! # Invariants
//! - `id` is unique within the process
//! - every micro-task in `micro_tasks` belongs to this task and is never removed
//! - status changes go through `transition_to`, which rejects illegal moves

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::micro::{MicroTask, MicroTaskStatus};

/// Unique identifier for a task.
///
/// # Properties
/// - 16 lowercase hex characters (64 random bits)
/// - Immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new random task ID.
    pub fn new() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(raw[..16].to_string())
    }

    /// Wrap an existing identifier (e.g. from a URL path).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> InProgress -> Completed
///    |           |     \-> Failed
///    |           \-------> Cancelled
///    \-> Cancelled
///
/// Completed | Failed | Cancelled -> InProgress   (iterate / retry re-opens)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// `true` if the task is Completed, Failed, or Cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// `true` if the task is Pending or InProgress.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }

    /// Whether `self -> to` is a legal move. Staying in place is always legal.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if *self == to {
            return true;
        }
        match self {
            Pending => matches!(to, InProgress | Cancelled | Failed),
            InProgress => matches!(to, Completed | Failed | Cancelled | Pending),
            Completed | Failed | Cancelled => matches!(to, InProgress | Pending),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(TaskError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    NotStarted,
    Building,
    Success,
    Failed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    #[default]
    NotStarted,
    Running,
    Passed,
    Failed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

/// One entry of a task's ordered log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    /// Agent that was active when the entry was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Structured payload (build output, audit summary, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TaskLog {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            agent: None,
            details: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Partial update applied through `PATCH /task/:id`.
///
/// Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub prompt: Option<String>,
    pub build_status: Option<BuildStatus>,
    pub test_status: Option<TestStatus>,
    pub current_agent: Option<String>,
    pub memory_id: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// A project-generation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier for this task
    id: TaskId,

    /// What the user asked for
    prompt: String,

    /// Current lifecycle status
    status: TaskStatus,

    created_at: DateTime<Utc>,

    /// Set whenever the task reaches a terminal status
    completed_at: Option<DateTime<Utc>>,

    /// Root directory of the generated project
    project_path: PathBuf,

    /// Ordered, append-only list of micro-tasks
    micro_tasks: Vec<MicroTask>,

    /// Ordered, append-only log
    logs: Vec<TaskLog>,

    /// Last known SHA-256 per relative path
    checksums: BTreeMap<String, String>,

    build_status: BuildStatus,
    test_status: TestStatus,

    /// Agent selected by the most recent orient phase
    current_agent: Option<String>,

    /// Identifier in the external memory subsystem
    memory_id: Option<String>,
}

impl Task {
    /// Create a new task rooted at `projects_dir/proj-<id>`.
    ///
    /// # Errors
    /// Returns `TaskError::EmptyPrompt` if the prompt is blank.
    pub fn new(prompt: impl Into<String>, projects_dir: &Path) -> Result<Self, TaskError> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(TaskError::EmptyPrompt);
        }
        let id = TaskId::new();
        let project_path = projects_dir.join(format!("proj-{}", id));
        Ok(Self {
            id,
            prompt,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            project_path,
            micro_tasks: Vec::new(),
            logs: Vec::new(),
            checksums: BTreeMap::new(),
            build_status: BuildStatus::NotStarted,
            test_status: TestStatus::NotStarted,
            current_agent: None,
            memory_id: None,
        })
    }

    // Getters

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn micro_tasks(&self) -> &[MicroTask] {
        &self.micro_tasks
    }

    pub fn logs(&self) -> &[TaskLog] {
        &self.logs
    }

    pub fn checksums(&self) -> &BTreeMap<String, String> {
        &self.checksums
    }

    pub fn build_status(&self) -> BuildStatus {
        self.build_status
    }

    pub fn test_status(&self) -> TestStatus {
        self.test_status
    }

    pub fn current_agent(&self) -> Option<&str> {
        self.current_agent.as_deref()
    }

    pub fn memory_id(&self) -> Option<&str> {
        self.memory_id.as_deref()
    }

    /// Number of micro-tasks in `status`.
    pub fn count_micro_tasks(&self, status: MicroTaskStatus) -> usize {
        self.micro_tasks.iter().filter(|m| m.status == status).count()
    }

    /// Indices of micro-tasks still waiting to run, in emission order.
    pub fn pending_indices(&self) -> Vec<usize> {
        self.micro_tasks
            .iter()
            .enumerate()
            .filter(|(_, m)| m.status == MicroTaskStatus::Pending)
            .map(|(i, _)| i)
            .collect()
    }

    // Mutators

    /// Move to `to`, stamping `completed_at` on terminal statuses.
    ///
    /// # Errors
    /// `TaskError::InvalidTransition` if the move is not allowed.
    pub fn transition_to(&mut self, to: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition(to) {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.completed_at = if to.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };
        Ok(())
    }

    /// Apply a partial update. Nothing changes if the status move is illegal.
    pub fn apply_update(&mut self, update: TaskUpdate) -> Result<(), TaskError> {
        if let Some(prompt) = &update.prompt {
            if prompt.trim().is_empty() {
                return Err(TaskError::EmptyPrompt);
            }
        }
        if let Some(status) = update.status {
            self.transition_to(status)?;
        }
        if let Some(prompt) = update.prompt {
            self.prompt = prompt;
        }
        if let Some(build_status) = update.build_status {
            self.build_status = build_status;
        }
        if let Some(test_status) = update.test_status {
            self.test_status = test_status;
        }
        if let Some(agent) = update.current_agent {
            self.current_agent = Some(agent);
        }
        if let Some(memory_id) = update.memory_id {
            self.memory_id = Some(memory_id);
        }
        Ok(())
    }

    pub fn push_log(&mut self, log: TaskLog) {
        self.logs.push(log);
    }

    pub fn push_micro_tasks(&mut self, micro_tasks: impl IntoIterator<Item = MicroTask>) {
        self.micro_tasks.extend(micro_tasks);
    }

    pub fn micro_task_mut(&mut self, index: usize) -> Option<&mut MicroTask> {
        self.micro_tasks.get_mut(index)
    }

    pub fn set_build_status(&mut self, status: BuildStatus) {
        self.build_status = status;
    }

    pub fn set_test_status(&mut self, status: TestStatus) {
        self.test_status = status;
    }

    pub fn set_current_agent(&mut self, agent: Option<String>) {
        self.current_agent = agent;
    }

    pub fn set_memory_id(&mut self, memory_id: Option<String>) {
        self.memory_id = memory_id;
    }

    /// Record the latest hash for `path`, or forget it when `hash` is `None`.
    pub fn record_checksum(&mut self, path: &str, hash: Option<String>) {
        match hash {
            Some(hash) => {
                self.checksums.insert(path.to_string(), hash);
            }
            None => {
                self.checksums.remove(path);
            }
        }
    }

    /// Reset every failed micro-task that still has retry budget to pending.
    ///
    /// Returns how many were reset.
    pub fn reset_retryable(&mut self) -> usize {
        let mut reset = 0;
        for micro in self
            .micro_tasks
            .iter_mut()
            .filter(|m| m.status == MicroTaskStatus::Failed)
        {
            if micro.retry_count < micro.max_retries {
                micro.status = MicroTaskStatus::Pending;
                micro.error = None;
                reset += 1;
            }
        }
        reset
    }
}

/// Errors related to task operations.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("Task prompt cannot be empty")]
    EmptyPrompt,

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Unknown task status: {0}")]
    UnknownStatus(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::micro::MicroTaskKind;

    fn sample() -> Task {
        Task::new("Create a React app", Path::new("/tmp/projects")).expect("valid task")
    }

    #[test]
    fn new_task_starts_pending_under_projects_dir() {
        let task = sample();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.id().as_str().len(), 16);
        assert_eq!(
            task.project_path(),
            Path::new("/tmp/projects").join(format!("proj-{}", task.id()))
        );
        assert_eq!(task.build_status(), BuildStatus::NotStarted);
        assert_eq!(task.test_status(), TestStatus::NotStarted);
    }

    #[test]
    fn empty_prompt_is_rejected() {
        assert!(matches!(
            Task::new("   ", Path::new("/tmp")),
            Err(TaskError::EmptyPrompt)
        ));
    }

    /// Updating only the status leaves every other field as it was.
    #[test]
    fn status_update_round_trip_leaves_other_fields() {
        let mut task = sample();
        let before = serde_json::to_value(&task).expect("serialize");

        task.apply_update(TaskUpdate::status(TaskStatus::InProgress))
            .expect("pending -> in_progress");

        let after = serde_json::to_value(&task).expect("serialize");
        assert_eq!(after["status"], "in_progress");
        let mut before_obj = before.as_object().cloned().expect("object");
        let mut after_obj = after.as_object().cloned().expect("object");
        before_obj.remove("status");
        after_obj.remove("status");
        assert_eq!(before_obj, after_obj);
    }

    #[test]
    fn illegal_transition_is_rejected_without_change() {
        let mut task = sample();
        let err = task
            .transition_to(TaskStatus::Completed)
            .expect_err("pending cannot complete directly");
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        assert_eq!(task.status(), TaskStatus::Pending);
    }

    #[test]
    fn terminal_transition_stamps_completed_at() {
        let mut task = sample();
        task.transition_to(TaskStatus::InProgress).unwrap();
        assert!(task.completed_at().is_none());
        task.transition_to(TaskStatus::Failed).unwrap();
        assert!(task.completed_at().is_some());
        task.transition_to(TaskStatus::InProgress).unwrap();
        assert!(task.completed_at().is_none());
    }

    #[test]
    fn reset_retryable_only_touches_failed_with_budget() {
        let mut task = sample();
        let mut exhausted = MicroTask::new(MicroTaskKind::BuildRun);
        exhausted.status = MicroTaskStatus::Failed;
        exhausted.retry_count = 3;
        let mut retryable = MicroTask::new(MicroTaskKind::TestRun);
        retryable.status = MicroTaskStatus::Failed;
        retryable.retry_count = 1;
        retryable.error = Some("boom".into());
        let mut done = MicroTask::new(MicroTaskKind::BuildRun);
        done.status = MicroTaskStatus::Completed;
        task.push_micro_tasks([exhausted, retryable, done]);

        assert_eq!(task.reset_retryable(), 1);
        assert_eq!(task.micro_tasks()[0].status, MicroTaskStatus::Failed);
        assert_eq!(task.micro_tasks()[1].status, MicroTaskStatus::Pending);
        assert!(task.micro_tasks()[1].error.is_none());
        assert_eq!(task.micro_tasks()[2].status, MicroTaskStatus::Completed);
        assert_eq!(task.pending_indices(), vec![1]);
    }

    #[test]
    fn status_parses_from_query_strings() {
        assert_eq!("in_progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert!("running".parse::<TaskStatus>().is_err());
    }
}
