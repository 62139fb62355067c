//! Task module - tasks, their logs, and the micro-tasks they accumulate.
//!
//! - All types use algebraic data types with exhaustive matching
//! - Invariants are documented and enforced by the mutating methods
//! - Pure data; all IO lives in the manager and adapters

pub mod micro;
pub mod task;

pub use micro::{
    has_conflict_markers, MicroTask, MicroTaskKind, MicroTaskStatus, CONFLICT_MARKERS,
    DEFAULT_MAX_RETRIES,
};
pub use task::{
    BuildStatus, LogLevel, Task, TaskError, TaskId, TaskLog, TaskStatus, TaskUpdate, TestStatus,
};
