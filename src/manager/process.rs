//! The orchestration loop of one task.
//!
//! ```text
//! begin ─► drain pending ─► OODA iterate ─► queue proposals ─┐
//!              ▲                                             │
//!              └──────────────── no stop signal ◄────────────┘
//! ```
//!
//! Every batch of pending micro-tasks passes the security audit before any of
//! it runs. Cancellation is checked between phases and between micro-tasks.

use std::sync::atomic::Ordering;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{OrchestrationError, Result, TaskManager, TaskSlot};
use crate::executor::{ExecutionOutcome, ExecutionReport};
use crate::memory::ContextOutcome;
use crate::ooda::{IterationOutcome, OodaState, StopReason};
use crate::security::Severity;
use crate::streaming::StreamMessage;
use crate::task::{
    BuildStatus, LogLevel, MicroTask, MicroTaskKind, MicroTaskStatus, Task, TaskLog, TaskStatus,
    TestStatus,
};

/// Audit-and-execute rounds per drain; leftovers wait for the next iteration.
const MAX_DRAIN_ROUNDS: usize = 25;

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(OrchestrationError::Cancelled)
    } else {
        Ok(())
    }
}

impl TaskManager {
    /// Run the loop until it stops, then settle the task's final status.
    pub(super) async fn drive(&self, slot: &TaskSlot, cancel: &CancellationToken) {
        let mut state = OodaState::new(self.config.max_iterations);
        loop {
            let result = self.run_loop(slot, cancel, &mut state).await;
            let mut task = slot.task.lock().await;
            if result.is_ok() && !cancel.is_cancelled() && !task.pending_indices().is_empty() {
                // Work was queued while the loop was wrapping up.
                continue;
            }
            self.finish(&mut task, result, cancel).await;
            slot.running.store(false, Ordering::SeqCst);
            break;
        }
    }

    async fn run_loop(
        &self,
        slot: &TaskSlot,
        cancel: &CancellationToken,
        state: &mut OodaState,
    ) -> Result<()> {
        self.begin(slot, cancel).await?;
        loop {
            self.drain_pending(slot, cancel).await?;
            ensure_live(cancel)?;

            let snapshot = slot.task.lock().await.clone();
            let outcome = self
                .engine
                .iterate(&snapshot, self.agents.agents(), state)
                .await;
            let stop = self.absorb(slot, state, outcome).await?;
            ensure_live(cancel)?;

            if let Some(stop) = stop {
                self.drain_pending(slot, cancel).await?;
                return match stop {
                    StopReason::NoCapableAgent => Ok(()),
                    StopReason::IterationLimit => {
                        Err(OrchestrationError::LivenessExceeded(state.max_iterations))
                    }
                    StopReason::Error(message) => Err(OrchestrationError::Engine(message)),
                };
            }
        }
    }

    async fn begin(&self, slot: &TaskSlot, cancel: &CancellationToken) -> Result<()> {
        let mut task = slot.task.lock().await;
        // A cancel that landed after the claim must not be undone.
        ensure_live(cancel)?;
        let from = task.status();
        task.transition_to(TaskStatus::InProgress)?;
        self.publish_status(&task, from).await;
        self.log(&mut task, TaskLog::new(LogLevel::Info, "Processing started"))
            .await;
        Ok(())
    }

    /// Record an iteration and queue what its agent proposed.
    async fn absorb(
        &self,
        slot: &TaskSlot,
        state: &OodaState,
        outcome: IterationOutcome,
    ) -> Result<Option<StopReason>> {
        let mut task = slot.task.lock().await;
        if let Some(StopReason::Error(message)) = &outcome.stop {
            self.log(
                &mut task,
                TaskLog::new(
                    LogLevel::Error,
                    format!("Iteration {} failed: {}", state.iteration, message),
                ),
            )
            .await;
            return Err(OrchestrationError::Engine(message.clone()));
        }

        task.set_current_agent(outcome.agent.clone());
        let proposed = outcome.micro_tasks.len();
        let message = match (&outcome.agent, &outcome.stop) {
            (Some(agent), _) => format!(
                "Iteration {}: {} proposed {} micro-task(s)",
                state.iteration, agent, proposed
            ),
            (None, Some(StopReason::IterationLimit)) => {
                format!("Iteration limit of {} reached", state.max_iterations)
            }
            (None, _) => format!("Iteration {}: no agent has remaining work", state.iteration),
        };
        let mut entry = TaskLog::new(LogLevel::Info, message).with_details(json!({
            "insights": outcome.insights,
            "confidence": outcome.confidence,
            "nextPhase": format!("{:?}", outcome.next_phase),
        }));
        if let Some(agent) = &outcome.agent {
            entry = entry.with_agent(agent.clone());
        }
        self.log(&mut task, entry).await;

        let max_retries = self.config.max_retries;
        task.push_micro_tasks(
            outcome
                .micro_tasks
                .into_iter()
                .map(|m| m.with_max_retries(max_retries)),
        );
        self.streamer
            .publish(
                task.id(),
                StreamMessage::progress(
                    task.id(),
                    json!({
                        "iteration": state.iteration,
                        "maxIterations": state.max_iterations,
                        "agent": outcome.agent,
                        "completed": task.count_micro_tasks(MicroTaskStatus::Completed),
                        "total": task.micro_tasks().len(),
                    }),
                ),
            )
            .await;
        Ok(outcome.stop)
    }

    /// Audit and execute pending micro-tasks, including follow-ups they spawn.
    async fn drain_pending(&self, slot: &TaskSlot, cancel: &CancellationToken) -> Result<()> {
        for _ in 0..MAX_DRAIN_ROUNDS {
            ensure_live(cancel)?;
            let (task_id, project_path, indices, batch) = {
                let task = slot.task.lock().await;
                let indices = task.pending_indices();
                if indices.is_empty() {
                    return Ok(());
                }
                let batch: Vec<MicroTask> = indices
                    .iter()
                    .filter_map(|&i| task.micro_tasks().get(i).cloned())
                    .collect();
                (
                    task.id().clone(),
                    task.project_path().to_path_buf(),
                    indices,
                    batch,
                )
            };

            let audit = self.auditor.audit(&task_id, &project_path, &batch).await;
            if audit.is_critical() {
                let mut task = slot.task.lock().await;
                let reason = format!("Blocked by security audit: {}", audit.vulnerabilities.join("; "));
                for &index in &indices {
                    if let Some(micro) = task.micro_task_mut(index) {
                        micro.mark_blocked(reason.clone());
                    }
                }
                self.log(
                    &mut task,
                    TaskLog::new(
                        LogLevel::Error,
                        format!("Security audit blocked {} micro-task(s)", indices.len()),
                    )
                    .with_details(json!({
                        "vulnerabilities": audit.vulnerabilities,
                        "recommendations": audit.recommendations,
                    })),
                )
                .await;
                return Err(OrchestrationError::SecurityCritical(
                    audit.vulnerabilities.join("; "),
                ));
            }
            if audit.overall_risk >= Severity::Medium {
                let mut task = slot.task.lock().await;
                self.log(
                    &mut task,
                    TaskLog::new(
                        LogLevel::Warn,
                        format!("Security audit risk is {:?}", audit.overall_risk),
                    )
                    .with_details(json!({ "vulnerabilities": audit.vulnerabilities })),
                )
                .await;
            }

            for index in indices {
                ensure_live(cancel)?;
                self.execute_one(slot, index, cancel).await?;
            }
        }
        Ok(())
    }

    async fn execute_one(
        &self,
        slot: &TaskSlot,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (micro, project_path) = {
            let mut task = slot.task.lock().await;
            let Some(micro) = task.micro_task_mut(index) else {
                return Ok(());
            };
            if micro.status != MicroTaskStatus::Pending {
                return Ok(());
            }
            micro.mark_in_progress();
            let micro = micro.clone();
            match micro.kind {
                MicroTaskKind::BuildRun => task.set_build_status(BuildStatus::Building),
                MicroTaskKind::TestRun => task.set_test_status(TestStatus::Running),
                _ => {}
            }
            let target = micro.path.as_deref().unwrap_or_default();
            self.log(
                &mut task,
                TaskLog::new(
                    LogLevel::Info,
                    format!("Executing {} {}", micro.kind.as_str(), target)
                        .trim_end()
                        .to_string(),
                )
                .with_details(json!({ "microTaskId": micro.id })),
            )
            .await;
            (micro, task.project_path().to_path_buf())
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                let mut task = slot.task.lock().await;
                if let Some(m) = task.micro_task_mut(index) {
                    m.mark_blocked("Cancelled before completion");
                }
                match micro.kind {
                    MicroTaskKind::BuildRun => task.set_build_status(BuildStatus::NotStarted),
                    MicroTaskKind::TestRun => task.set_test_status(TestStatus::NotStarted),
                    _ => {}
                }
                return Err(OrchestrationError::Cancelled);
            }
            outcome = self.executor.execute(&micro, &project_path) => outcome,
        };

        let mut task = slot.task.lock().await;
        self.apply_outcome(&mut task, index, &micro, outcome).await;
        Ok(())
    }

    async fn apply_outcome(
        &self,
        task: &mut Task,
        index: usize,
        micro: &MicroTask,
        outcome: ExecutionOutcome,
    ) {
        for line in &outcome.logs {
            self.log(task, TaskLog::new(LogLevel::Info, line.clone()))
                .await;
        }

        if !outcome.success {
            let error = outcome
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown error".to_string());
            let requeued = match task.micro_task_mut(index) {
                Some(m) => {
                    m.rollback_hash = outcome.rollback_hash.clone();
                    m.record_failure(error.clone())
                }
                None => false,
            };
            if requeued {
                match micro.kind {
                    MicroTaskKind::BuildRun => task.set_build_status(BuildStatus::NotStarted),
                    MicroTaskKind::TestRun => task.set_test_status(TestStatus::NotStarted),
                    _ => {}
                }
                self.log(
                    task,
                    TaskLog::new(
                        LogLevel::Warn,
                        format!("{} failed, will retry: {}", micro.kind.as_str(), error),
                    ),
                )
                .await;
            } else {
                match micro.kind {
                    MicroTaskKind::BuildRun => task.set_build_status(BuildStatus::Error),
                    MicroTaskKind::TestRun => task.set_test_status(TestStatus::Error),
                    _ => {}
                }
                self.log(
                    task,
                    TaskLog::new(
                        LogLevel::Error,
                        format!("{} failed: {}", micro.kind.as_str(), error),
                    )
                    .with_details(json!({ "microTaskId": micro.id })),
                )
                .await;
            }
            return;
        }

        let failure_note = match &outcome.report {
            Some(report) => self.apply_report(task, report).await,
            None => None,
        };
        if let Some(m) = task.micro_task_mut(index) {
            m.mark_completed();
            m.rollback_hash = outcome.rollback_hash.clone();
            m.error = failure_note;
        }

        if !outcome.new_micro_tasks.is_empty() {
            let max_retries = self.config.max_retries;
            let count = outcome.new_micro_tasks.len();
            task.push_micro_tasks(
                outcome
                    .new_micro_tasks
                    .into_iter()
                    .map(|m| m.with_max_retries(max_retries)),
            );
            self.log(
                task,
                TaskLog::new(
                    LogLevel::Info,
                    format!("Queued {} follow-up micro-task(s)", count),
                ),
            )
            .await;
        }
    }

    /// Fold a handler report into the task. Returns the error lines of a failed run.
    async fn apply_report(&self, task: &mut Task, report: &ExecutionReport) -> Option<String> {
        match report {
            ExecutionReport::Build(build) => {
                if build.success {
                    task.set_build_status(BuildStatus::Success);
                    self.log(
                        task,
                        TaskLog::new(
                            LogLevel::Success,
                            format!("Build succeeded in {}ms", build.duration_ms),
                        )
                        .with_details(json!({ "warnings": build.warnings })),
                    )
                    .await;
                    None
                } else {
                    task.set_build_status(BuildStatus::Failed);
                    self.log(
                        task,
                        TaskLog::new(
                            LogLevel::Warn,
                            format!("Build failed with {} error(s)", build.errors.len()),
                        )
                        .with_details(json!({
                            "errors": build.errors,
                            "warnings": build.warnings,
                        })),
                    )
                    .await;
                    Some(build.errors.join("\n"))
                }
            }
            ExecutionReport::Test(test) => {
                if test.skipped {
                    task.set_test_status(TestStatus::Passed);
                    self.log(
                        task,
                        TaskLog::new(LogLevel::Info, "No test script; tests skipped"),
                    )
                    .await;
                    None
                } else if test.success {
                    task.set_test_status(TestStatus::Passed);
                    self.log(
                        task,
                        TaskLog::new(
                            LogLevel::Success,
                            format!("Tests passed ({} passed)", test.passed),
                        ),
                    )
                    .await;
                    None
                } else {
                    task.set_test_status(TestStatus::Failed);
                    self.log(
                        task,
                        TaskLog::new(
                            LogLevel::Warn,
                            format!("Tests failed ({} failed, {} passed)", test.failed, test.passed),
                        )
                        .with_details(json!({ "errors": test.errors })),
                    )
                    .await;
                    if test.errors.is_empty() {
                        Some(format!("{} test(s) failed", test.failed))
                    } else {
                        Some(test.errors.join("\n"))
                    }
                }
            }
            ExecutionReport::Install(install) => {
                self.log(
                    task,
                    TaskLog::new(
                        LogLevel::Success,
                        format!("Dependencies installed in {}ms", install.duration_ms),
                    ),
                )
                .await;
                None
            }
            ExecutionReport::File { path, checksum } => {
                task.record_checksum(path, checksum.clone());
                if matches!(
                    task.build_status(),
                    BuildStatus::Failed | BuildStatus::Error
                ) {
                    task.set_build_status(BuildStatus::NotStarted);
                    task.set_test_status(TestStatus::NotStarted);
                    self.log(
                        task,
                        TaskLog::new(
                            LogLevel::Info,
                            format!("{} changed; build will run again", path),
                        ),
                    )
                    .await;
                }
                None
            }
            ExecutionReport::Note(note) => {
                self.log(task, TaskLog::new(LogLevel::Info, note.clone()))
                    .await;
                None
            }
            ExecutionReport::Finish { path } => {
                self.log(
                    task,
                    TaskLog::new(
                        LogLevel::Success,
                        format!("Project finished; summary written to {}", path),
                    ),
                )
                .await;
                None
            }
        }
    }

    /// Settle the final status, then notify memory, the log file and subscribers.
    async fn finish(&self, task: &mut Task, result: Result<()>, cancel: &CancellationToken) {
        let result = if cancel.is_cancelled() {
            Err(OrchestrationError::Cancelled)
        } else {
            result
        };
        let from = task.status();
        let (to, level, message, outcome) = match &result {
            Ok(()) => (
                TaskStatus::Completed,
                LogLevel::Success,
                "Task completed".to_string(),
                ContextOutcome::Success,
            ),
            Err(OrchestrationError::Cancelled) => (
                TaskStatus::Cancelled,
                LogLevel::Warn,
                "Processing stopped after cancellation".to_string(),
                ContextOutcome::Neutral,
            ),
            Err(e) => (
                TaskStatus::Failed,
                LogLevel::Error,
                format!("Task failed: {}", e),
                ContextOutcome::Failure,
            ),
        };
        if let Err(e) = task.transition_to(to) {
            tracing::warn!(task_id = %task.id(), "Could not settle final status: {}", e);
        }
        self.log(task, TaskLog::new(level, message)).await;
        self.publish_status(task, from).await;

        self.memory
            .record_context(
                task.id(),
                "task_finished",
                outcome,
                json!({
                    "status": task.status(),
                    "microTasks": task.micro_tasks().len(),
                    "buildStatus": task.build_status(),
                    "testStatus": task.test_status(),
                }),
            )
            .await;
        self.persist(task).await;
        self.streamer
            .publish(
                task.id(),
                StreamMessage::complete(
                    task.id(),
                    json!({
                        "status": task.status(),
                        "buildStatus": task.build_status(),
                        "testStatus": task.test_status(),
                        "error": result.err().map(|e| e.to_string()),
                    }),
                ),
            )
            .await;
    }
}
