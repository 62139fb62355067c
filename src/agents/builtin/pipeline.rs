//! Agents that drive an existing project through install → build → test → finish.

use async_trait::async_trait;
use serde_json::json;

use crate::agents::{Agent, AgentContext, AgentError, ProjectState};
use crate::memory::ContextOutcome;
use crate::task::{
    BuildStatus, MicroTask, MicroTaskKind, MicroTaskStatus, Task, TestStatus,
};

/// A project gets at most this many builds from [`BuildAgent`].
pub const MAX_BUILD_ATTEMPTS: usize = 2;

fn count_kind(task: &Task, kind: MicroTaskKind) -> usize {
    task.micro_tasks().iter().filter(|m| m.kind == kind).count()
}

/// Installs the dependencies declared in `package.json`.
pub struct DepInstallerAgent;

#[async_trait]
impl Agent for DepInstallerAgent {
    fn name(&self) -> &str {
        "DepInstallerAgent"
    }

    fn priority(&self) -> u32 {
        2
    }

    fn can_handle(&self, _task: &Task, state: &ProjectState) -> bool {
        state.has_package_json() && !state.deps_installed
    }

    async fn execute(&self, ctx: &AgentContext<'_>) -> Result<Vec<MicroTask>, AgentError> {
        let deps: Vec<&String> = ctx.project_state.dependencies.keys().collect();
        if deps.is_empty() {
            return Err(AgentError::MissingState("declared dependencies".to_string()));
        }
        ctx.memory
            .record_context(
                ctx.task.id(),
                "install_dependencies",
                ContextOutcome::Neutral,
                json!({ "dependencies": deps }),
            )
            .await;
        Ok(vec![MicroTask::package_install(&deps)])
    }
}

/// Runs the project build.
pub struct BuildAgent;

#[async_trait]
impl Agent for BuildAgent {
    fn name(&self) -> &str {
        "BuildAgent"
    }

    fn priority(&self) -> u32 {
        5
    }

    fn can_handle(&self, task: &Task, state: &ProjectState) -> bool {
        state.has_package_json()
            && state.deps_installed
            && state.build_status == BuildStatus::NotStarted
            && count_kind(task, MicroTaskKind::BuildRun) < MAX_BUILD_ATTEMPTS
    }

    async fn execute(&self, _ctx: &AgentContext<'_>) -> Result<Vec<MicroTask>, AgentError> {
        Ok(vec![MicroTask::build_run()])
    }
}

/// Runs the test suite once the build is green.
pub struct TestAgent;

#[async_trait]
impl Agent for TestAgent {
    fn name(&self) -> &str {
        "TestAgent"
    }

    fn priority(&self) -> u32 {
        6
    }

    fn can_handle(&self, _task: &Task, state: &ProjectState) -> bool {
        state.build_status == BuildStatus::Success && state.test_status == TestStatus::NotStarted
    }

    async fn execute(&self, _ctx: &AgentContext<'_>) -> Result<Vec<MicroTask>, AgentError> {
        Ok(vec![MicroTask::test_run()])
    }
}

/// Queues analysis of the latest failed build or test run.
pub struct LogParserAgent;

impl LogParserAgent {
    /// `true` if a `log_parse` was already queued after the most recent build/test run.
    fn already_analysed(task: &Task) -> bool {
        let last_run = task
            .micro_tasks()
            .iter()
            .rposition(|m| matches!(m.kind, MicroTaskKind::BuildRun | MicroTaskKind::TestRun));
        let Some(last_run) = last_run else {
            return false;
        };
        task.micro_tasks()[last_run + 1..]
            .iter()
            .any(|m| m.kind == MicroTaskKind::LogParse)
    }
}

#[async_trait]
impl Agent for LogParserAgent {
    fn name(&self) -> &str {
        "LogParserAgent"
    }

    fn priority(&self) -> u32 {
        7
    }

    fn can_handle(&self, task: &Task, state: &ProjectState) -> bool {
        !state.errors.is_empty() && !Self::already_analysed(task)
    }

    async fn execute(&self, ctx: &AgentContext<'_>) -> Result<Vec<MicroTask>, AgentError> {
        Ok(vec![MicroTask::log_parse(ctx.project_state.errors.join("\n"))])
    }
}

/// Writes the completion record once everything is green.
pub struct FinishAgent;

#[async_trait]
impl Agent for FinishAgent {
    fn name(&self) -> &str {
        "FinishAgent"
    }

    fn priority(&self) -> u32 {
        9
    }

    fn can_handle(&self, task: &Task, state: &ProjectState) -> bool {
        let finished = task.micro_tasks().iter().any(|m| {
            m.kind == MicroTaskKind::ProjectFinish && m.status != MicroTaskStatus::Failed
        });
        state.build_status == BuildStatus::Success
            && state.test_status == TestStatus::Passed
            && state.errors.is_empty()
            && !finished
    }

    async fn execute(&self, ctx: &AgentContext<'_>) -> Result<Vec<MicroTask>, AgentError> {
        let summary = json!({
            "taskId": ctx.task.id(),
            "prompt": ctx.task.prompt(),
            "files": ctx.project_state.files.keys().collect::<Vec<_>>(),
            "dependencies": ctx.project_state.dependencies,
            "buildStatus": ctx.project_state.build_status,
            "testStatus": ctx.project_state.test_status,
        });
        ctx.memory
            .record_context(
                ctx.task.id(),
                "project_finish",
                ContextOutcome::Success,
                json!({ "files": ctx.project_state.files.len() }),
            )
            .await;
        Ok(vec![MicroTask::project_finish(summary.to_string())])
    }
}
