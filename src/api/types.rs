//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manager::ManagerStats;
use crate::memory::MemoryStats;
use crate::streaming::StreamStats;
use crate::task::{
    BuildStatus, MicroTask, MicroTaskStatus, Task, TaskId, TaskStatus, TestStatus,
};

/// Request to create a new task.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    /// What the generated project should do
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroTaskCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl MicroTaskCounts {
    pub fn of(task: &Task) -> Self {
        Self {
            total: task.micro_tasks().len(),
            pending: task.count_micro_tasks(MicroTaskStatus::Pending),
            in_progress: task.count_micro_tasks(MicroTaskStatus::InProgress),
            completed: task.count_micro_tasks(MicroTaskStatus::Completed),
            failed: task.count_micro_tasks(MicroTaskStatus::Failed),
        }
    }
}

/// Full task with micro-task counts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetails {
    #[serde(flatten)]
    pub task: Task,
    pub counts: MicroTaskCounts,
}

impl From<Task> for TaskDetails {
    fn from(task: Task) -> Self {
        let counts = MicroTaskCounts::of(&task);
        Self { task, counts }
    }
}

/// Task as shown in listings (no logs or micro-tasks).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: TaskId,
    pub prompt: String,
    pub status: TaskStatus,
    pub build_status: BuildStatus,
    pub test_status: TestStatus,
    pub current_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counts: MicroTaskCounts,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id().clone(),
            prompt: task.prompt().to_string(),
            status: task.status(),
            build_status: task.build_status(),
            test_status: task.test_status(),
            current_agent: task.current_agent().map(str::to_string),
            created_at: task.created_at(),
            completed_at: task.completed_at(),
            counts: MicroTaskCounts::of(task),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub build_status: BuildStatus,
    pub test_status: TestStatus,
    pub current_agent: Option<String>,
    pub running: bool,
    pub counts: MicroTaskCounts,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IterateRequest {
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterateResponse {
    pub task_id: TaskId,
    pub queued: Vec<MicroTask>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub task_id: TaskId,
    pub reset: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RollbackRequest {
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub llm_connected: bool,
    pub max_iterations: u32,
    pub memory: MemoryStats,
    pub tasks: ManagerStats,
    pub streams: StreamStats,
}
