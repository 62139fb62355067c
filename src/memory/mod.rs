//! Context memory: a record of what happened during each task run.
//!
//! The orchestrator only writes to memory (`record_context`) and reads
//! aggregate counts for `/health`. Learning on top of these records is out of
//! scope; [`InMemoryContextMemory`] keeps a bounded ring in process memory.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::task::TaskId;

/// Default capacity of the in-memory ring.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextOutcome {
    Success,
    Failure,
    Neutral,
}

/// One recorded moment of a task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRecord {
    pub id: String,
    pub task_id: TaskId,
    pub phase: String,
    pub outcome: ContextOutcome,
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_tasks: usize,
    pub total_contexts: usize,
    pub average_contexts_per_task: f64,
    pub success_rate: f64,
}

#[async_trait]
pub trait Memory: Send + Sync {
    /// Record a context entry, returning its id.
    async fn record_context(
        &self,
        task_id: &TaskId,
        phase: &str,
        outcome: ContextOutcome,
        metadata: serde_json::Value,
    ) -> String;

    /// Drop everything recorded for `task_id`.
    async fn forget(&self, task_id: &TaskId);

    async fn stats(&self) -> MemoryStats;
}

#[derive(Clone)]
pub struct InMemoryContextMemory {
    records: Arc<RwLock<VecDeque<ContextRecord>>>,
    capacity: usize,
}

impl InMemoryContextMemory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub async fn records_for(&self, task_id: &TaskId) -> Vec<ContextRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| &r.task_id == task_id)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryContextMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Memory for InMemoryContextMemory {
    async fn record_context(
        &self,
        task_id: &TaskId,
        phase: &str,
        outcome: ContextOutcome,
        metadata: serde_json::Value,
    ) -> String {
        let record = ContextRecord {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.clone(),
            phase: phase.to_string(),
            outcome,
            metadata,
            recorded_at: Utc::now(),
        };
        let id = record.id.clone();
        let mut records = self.records.write().await;
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
        tracing::debug!("Recorded {} context for task {}", phase, task_id);
        id
    }

    async fn forget(&self, task_id: &TaskId) {
        self.records.write().await.retain(|r| &r.task_id != task_id);
    }

    async fn stats(&self) -> MemoryStats {
        let records = self.records.read().await;
        let mut per_task: HashMap<&TaskId, usize> = HashMap::new();
        let mut successes = 0usize;
        let mut judged = 0usize;
        for record in records.iter() {
            *per_task.entry(&record.task_id).or_default() += 1;
            match record.outcome {
                ContextOutcome::Success => {
                    successes += 1;
                    judged += 1;
                }
                ContextOutcome::Failure => judged += 1,
                ContextOutcome::Neutral => {}
            }
        }
        let total_tasks = per_task.len();
        let total_contexts = records.len();
        MemoryStats {
            total_tasks,
            total_contexts,
            average_contexts_per_task: if total_tasks > 0 {
                total_contexts as f64 / total_tasks as f64
            } else {
                0.0
            },
            success_rate: if judged > 0 {
                successes as f64 / judged as f64
            } else {
                0.0
            },
        }
    }
}
