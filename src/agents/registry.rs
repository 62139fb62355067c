//! Agent registry and the priority-based selection protocol.

use std::sync::Arc;

use super::types::ProjectState;
use super::Agent;
use crate::task::Task;

/// Shared handle to an agent.
pub type AgentRef = Arc<dyn Agent>;

/// Pick the agent that should act next.
///
/// Agents are considered in ascending `priority()` order (lower number wins);
/// ties keep registration order. The first agent whose `can_handle` returns
/// `true` is selected.
///
/// # Postcondition
/// Returns `None` iff no agent can handle `(task, state)`.
pub fn select<'a>(agents: &'a [AgentRef], task: &Task, state: &ProjectState) -> Option<&'a AgentRef> {
    let mut ordered: Vec<&AgentRef> = agents.iter().collect();
    // `sort_by_key` is stable, so equal priorities keep registration order.
    ordered.sort_by_key(|agent| agent.priority());
    ordered
        .into_iter()
        .find(|agent| agent.can_handle(task, state))
}

/// Fixed set of agents available to every task.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<AgentRef>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self { agents: Vec::new() }
    }

    /// Registry holding the default agent set.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for agent in super::builtin::default_agents() {
            registry.register(agent);
        }
        registry
    }

    pub fn register(&mut self, agent: AgentRef) {
        tracing::debug!(
            "Registered agent {} (priority {})",
            agent.name(),
            agent.priority()
        );
        self.agents.push(agent);
    }

    pub fn agents(&self) -> &[AgentRef] {
        &self.agents
    }

    pub fn select(&self, task: &Task, state: &ProjectState) -> Option<&AgentRef> {
        select(&self.agents, task, state)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentContext, AgentError};
    use crate::task::MicroTask;
    use async_trait::async_trait;
    use std::path::Path;

    struct Fixed {
        name: &'static str,
        priority: u32,
        capable: bool,
    }

    #[async_trait]
    impl Agent for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        fn can_handle(&self, _task: &Task, _state: &ProjectState) -> bool {
            self.capable
        }

        async fn execute(&self, _ctx: &AgentContext<'_>) -> Result<Vec<MicroTask>, AgentError> {
            Ok(Vec::new())
        }
    }

    fn agent(name: &'static str, priority: u32, capable: bool) -> AgentRef {
        Arc::new(Fixed {
            name,
            priority,
            capable,
        })
    }

    fn fixtures() -> (Task, ProjectState) {
        (
            Task::new("x", Path::new("/tmp")).expect("task"),
            ProjectState::default(),
        )
    }

    #[test]
    fn lowest_priority_capable_agent_wins() {
        let (task, state) = fixtures();
        let agents = vec![
            agent("late", 9, true),
            agent("incapable-first", 1, false),
            agent("best", 3, true),
            agent("mid", 5, true),
        ];
        let chosen = select(&agents, &task, &state).expect("some agent");
        assert_eq!(chosen.name(), "best");
    }

    #[test]
    fn ties_keep_registration_order() {
        let (task, state) = fixtures();
        let agents = vec![
            agent("first", 2, true),
            agent("second", 2, true),
        ];
        assert_eq!(select(&agents, &task, &state).unwrap().name(), "first");
    }

    #[test]
    fn none_when_nobody_can_handle() {
        let (task, state) = fixtures();
        let agents = vec![agent("a", 1, false), agent("b", 2, false)];
        assert!(select(&agents, &task, &state).is_none());
        assert!(select(&[], &task, &state).is_none());
    }

    #[test]
    fn default_registry_is_populated() {
        let registry = AgentRegistry::with_defaults();
        assert_eq!(registry.len(), 9);
    }
}
