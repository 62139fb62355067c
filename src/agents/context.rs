//! Agent execution context.

use super::types::ProjectState;
use crate::fs_store::FileStore;
use crate::llm::LlmClient;
use crate::memory::Memory;
use crate::task::Task;

/// Everything an agent may use while proposing micro-tasks.
///
/// The context borrows the engine's collaborators for the duration of one
/// `execute` call. Agents never mutate the task; they return micro-tasks and
/// the manager decides what happens to them.
pub struct AgentContext<'a> {
    /// Snapshot of the task being worked on
    pub task: &'a Task,

    /// Observation taken at the start of this iteration
    pub project_state: &'a ProjectState,

    /// Context memory, for agents that want to record what they did
    pub memory: &'a dyn Memory,

    /// Language model (may be offline)
    pub llm: &'a dyn LlmClient,

    /// Read access to the project tree beyond the snapshot
    pub file_store: &'a dyn FileStore,
}
