//! Default agent set.
//!
//! Content generation is intentionally shallow: agents emit template
//! micro-tasks and only consult the language model where a structured answer
//! can be strictly decoded.

mod merge;
mod pipeline;
mod repair;
mod scaffolder;

pub use pipeline::{
    BuildAgent, DepInstallerAgent, FinishAgent, LogParserAgent, TestAgent, MAX_BUILD_ATTEMPTS,
};
pub use merge::{keep_ours, MergeAgent, MAX_MERGE_ATTEMPTS};
pub use repair::{ConfigAgent, EntryPointAgent, MAX_REPAIR_ATTEMPTS};
pub use scaffolder::{slugify, ScaffoldPlan, ScaffolderAgent};

use std::sync::Arc;

use super::AgentRef;

/// The nine default agents, in registration order.
pub fn default_agents() -> Vec<AgentRef> {
    vec![
        Arc::new(ScaffolderAgent),
        Arc::new(DepInstallerAgent),
        Arc::new(EntryPointAgent),
        Arc::new(ConfigAgent),
        Arc::new(BuildAgent),
        Arc::new(TestAgent),
        Arc::new(LogParserAgent),
        Arc::new(MergeAgent),
        Arc::new(FinishAgent),
    ]
}
