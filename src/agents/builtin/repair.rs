//! Agents that put back project files the build cannot do without.

use async_trait::async_trait;
use serde_json::json;

use super::scaffolder::{node_entry, react_entry, slugify, tsconfig};
use crate::agents::{Agent, AgentContext, AgentError, ProjectState};
use crate::memory::ContextOutcome;
use crate::task::{MicroTask, MicroTaskKind, Task};

/// Creations of the same file an agent may queue before giving up on it.
pub const MAX_REPAIR_ATTEMPTS: usize = 2;

const APP_FILES: [&str; 4] = ["src/App.tsx", "src/App.ts", "src/App.jsx", "src/App.js"];
const MAIN_FILES: [&str; 4] = ["src/main.tsx", "src/main.ts", "src/main.jsx", "src/main.js"];
const INDEX_FILES: [&str; 2] = ["src/index.ts", "src/index.js"];

/// Micro-tasks of `kind` already queued for `path`, whatever their outcome.
pub(super) fn attempts(task: &Task, kind: MicroTaskKind, path: &str) -> usize {
    task.micro_tasks()
        .iter()
        .filter(|m| m.kind == kind && m.path.as_deref() == Some(path))
        .count()
}

fn is_react(state: &ProjectState) -> bool {
    state.dependencies.contains_key("react") || APP_FILES.iter().any(|p| state.has_file(p))
}

/// Recreates a missing `tsconfig.json`.
pub struct ConfigAgent;

impl ConfigAgent {
    const PATH: &'static str = "tsconfig.json";
}

#[async_trait]
impl Agent for ConfigAgent {
    fn name(&self) -> &str {
        "ConfigAgent"
    }

    fn priority(&self) -> u32 {
        4
    }

    fn can_handle(&self, task: &Task, state: &ProjectState) -> bool {
        state.has_package_json()
            && !state.has_file(Self::PATH)
            && attempts(task, MicroTaskKind::FileCreate, Self::PATH) < MAX_REPAIR_ATTEMPTS
    }

    async fn execute(&self, ctx: &AgentContext<'_>) -> Result<Vec<MicroTask>, AgentError> {
        let react = is_react(ctx.project_state);
        ctx.memory
            .record_context(
                ctx.task.id(),
                "restore_config",
                ContextOutcome::Neutral,
                json!({ "file": Self::PATH, "react": react }),
            )
            .await;
        Ok(vec![MicroTask::file_create(Self::PATH, tsconfig(react))])
    }
}

/// Recreates the entry module: `src/main.tsx` next to a React `App`,
/// `src/index.ts` otherwise.
pub struct EntryPointAgent;

impl EntryPointAgent {
    fn missing_entry(state: &ProjectState) -> Option<&'static str> {
        if !state.has_package_json() || MAIN_FILES.iter().any(|p| state.has_file(p)) {
            return None;
        }
        if is_react(state) {
            APP_FILES
                .iter()
                .any(|p| state.has_file(p))
                .then_some("src/main.tsx")
        } else if INDEX_FILES.iter().any(|p| state.has_file(p)) {
            None
        } else {
            Some("src/index.ts")
        }
    }
}

#[async_trait]
impl Agent for EntryPointAgent {
    fn name(&self) -> &str {
        "EntryPointAgent"
    }

    fn priority(&self) -> u32 {
        3
    }

    fn can_handle(&self, task: &Task, state: &ProjectState) -> bool {
        Self::missing_entry(state)
            .is_some_and(|path| attempts(task, MicroTaskKind::FileCreate, path) < MAX_REPAIR_ATTEMPTS)
    }

    async fn execute(&self, ctx: &AgentContext<'_>) -> Result<Vec<MicroTask>, AgentError> {
        let path = Self::missing_entry(ctx.project_state)
            .ok_or_else(|| AgentError::MissingState("a missing entry point".to_string()))?;
        let content = if path == "src/main.tsx" {
            react_entry()
        } else {
            node_entry(&slugify(ctx.task.prompt()))
        };
        ctx.memory
            .record_context(
                ctx.task.id(),
                "restore_entry_point",
                ContextOutcome::Neutral,
                json!({ "file": path }),
            )
            .await;
        Ok(vec![MicroTask::file_create(path, content)])
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use super::*;

    fn task() -> Task {
        Task::new("a react dashboard", Path::new("/tmp/p")).expect("task")
    }

    fn state_with(paths: &[&str]) -> ProjectState {
        let files: BTreeMap<String, String> = paths
            .iter()
            .map(|p| (p.to_string(), String::new()))
            .collect();
        ProjectState {
            files,
            deps_installed: true,
            ..Default::default()
        }
    }

    #[test]
    fn config_agent_restores_tsconfig_twice_at_most() {
        let mut task = task();
        let state = state_with(&["package.json", "src/index.ts"]);
        assert!(ConfigAgent.can_handle(&task, &state));
        assert!(!ConfigAgent.can_handle(&task, &state_with(&["package.json", "tsconfig.json"])));
        assert!(!ConfigAgent.can_handle(&task, &state_with(&[])));

        task.push_micro_tasks([
            MicroTask::file_create("tsconfig.json", "{}"),
            MicroTask::file_create("tsconfig.json", "{}"),
        ]);
        assert!(!ConfigAgent.can_handle(&task, &state));
    }

    #[test]
    fn entry_point_follows_the_project_kind() {
        let react = state_with(&["package.json", "src/App.tsx"]);
        assert_eq!(EntryPointAgent::missing_entry(&react), Some("src/main.tsx"));

        let node = state_with(&["package.json", "tsconfig.json"]);
        assert_eq!(EntryPointAgent::missing_entry(&node), Some("src/index.ts"));

        let complete = state_with(&["package.json", "src/App.tsx", "src/main.tsx"]);
        assert_eq!(EntryPointAgent::missing_entry(&complete), None);
        assert_eq!(
            EntryPointAgent::missing_entry(&state_with(&["package.json", "src/index.ts"])),
            None
        );
    }

    #[test]
    fn react_dependency_without_app_is_left_alone() {
        let mut state = state_with(&["package.json"]);
        state
            .dependencies
            .insert("react".to_string(), "^18.3.0".to_string());
        assert_eq!(EntryPointAgent::missing_entry(&state), None);
        assert!(!EntryPointAgent.can_handle(&task(), &state));
    }
}
