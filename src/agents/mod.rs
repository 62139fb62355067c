//! Agents module - capability-gated strategies that propose micro-tasks.
//!
//! # Selection
//! Every OODA iteration the engine asks each agent, in ascending priority
//! order, whether it can handle the current project state. The first agent
//! that says yes is executed and returns a list of micro-tasks.
//!
//! # Default agents
//! | Agent              | Priority | Acts when                                        |
//! |--------------------|----------|--------------------------------------------------|
//! | `ScaffolderAgent`  | 1        | no `package.json`                                |
//! | `DepInstallerAgent`| 2        | dependencies declared but not installed          |
//! | `EntryPointAgent`  | 3        | `src/main.*` or `src/index.*` missing            |
//! | `ConfigAgent`      | 4        | `tsconfig.json` missing                          |
//! | `BuildAgent`       | 5        | installed, build not started, < 2 attempts       |
//! | `TestAgent`        | 6        | build succeeded, tests not started               |
//! | `LogParserAgent`   | 7        | failed build/test not yet analysed               |
//! | `MergeAgent`       | 8        | conflict markers, or a recorded hash drifted     |
//! | `FinishAgent`      | 9        | build and tests green, not finished yet          |

pub mod builtin;
mod context;
pub mod registry;
mod types;

pub use context::AgentContext;
pub use registry::{select, AgentRef, AgentRegistry};
pub use types::{extract_dependencies, is_meta_path, AgentError, ProjectState};

use async_trait::async_trait;

use crate::task::{MicroTask, Task};

/// Base trait for all agents.
///
/// # Invariants
/// - `priority()` and `name()` are constant for the lifetime of the agent
/// - `can_handle()` is a pure function of its arguments
/// - `execute()` never panics; all errors are returned as `Err`
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable agent name (shown in logs and `currentAgent`).
    fn name(&self) -> &str;

    /// Lower number = considered earlier.
    fn priority(&self) -> u32;

    /// Whether this agent has something to contribute for `(task, state)`.
    fn can_handle(&self, task: &Task, state: &ProjectState) -> bool;

    /// Propose micro-tasks.
    ///
    /// # Postconditions
    /// - Returned micro-tasks are `Pending` with `retry_count == 0`
    /// - An empty list is allowed and is not a stop signal
    async fn execute(&self, ctx: &AgentContext<'_>) -> Result<Vec<MicroTask>, AgentError>;
}
