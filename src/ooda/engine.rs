use std::sync::Arc;

use serde_json::{json, Value};

use super::state::{confidence_for, ActionRecord, Decision, IterationOutcome, OodaPhase, OodaState};
use crate::agents::{select, AgentContext, AgentError, AgentRef, ProjectState};
use crate::fs_store::FileStore;
use crate::llm::{LlmClient, LlmError};
use crate::memory::{ContextOutcome, Memory};
use crate::task::Task;
use crate::util::truncate_chars;

#[derive(Debug, thiserror::Error)]
pub enum OodaError {
    #[error("Observation failed: {0}")]
    Observe(String),

    #[error("Orientation insight failed: {0}")]
    Insight(#[from] LlmError),

    #[error("Agent {agent} failed: {source}")]
    Agent {
        agent: String,
        #[source]
        source: AgentError,
    },

    #[error("Phase {0:?} reached without a selected agent")]
    NoDecision(OodaPhase),
}

/// Runs OODA iterations for any number of tasks; all per-run data lives in [`OodaState`].
#[derive(Clone)]
pub struct OodaEngine {
    file_store: Arc<dyn FileStore>,
    llm: Arc<dyn LlmClient>,
    memory: Arc<dyn Memory>,
}

impl OodaEngine {
    pub fn new(
        file_store: Arc<dyn FileStore>,
        llm: Arc<dyn LlmClient>,
        memory: Arc<dyn Memory>,
    ) -> Self {
        Self {
            file_store,
            llm,
            memory,
        }
    }

    /// Run one full observe → orient → decide → act cycle.
    ///
    /// Refuses to start (and leaves `iteration` untouched) once the ceiling is
    /// reached, so `state.iteration` never exceeds `state.max_iterations`.
    pub async fn iterate(
        &self,
        task: &Task,
        agents: &[AgentRef],
        state: &mut OodaState,
    ) -> IterationOutcome {
        if state.at_ceiling() {
            state.phase = OodaPhase::Complete;
            return IterationOutcome::exhausted(state.max_iterations);
        }
        state.iteration += 1;
        tracing::debug!(
            task_id = %task.id(),
            iteration = state.iteration,
            "OODA iteration started"
        );

        match self.run_phases(task, agents, state).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(task_id = %task.id(), phase = ?state.phase, "OODA phase failed: {}", e);
                state.phase = OodaPhase::Complete;
                IterationOutcome::failed(e.to_string())
            }
        }
    }

    async fn run_phases(
        &self,
        task: &Task,
        agents: &[AgentRef],
        state: &mut OodaState,
    ) -> Result<IterationOutcome, OodaError> {
        state.phase = OodaPhase::Observe;
        let observation = self.observe(task).await?;
        state
            .context
            .insert("observation".to_string(), Value::String(observation.summary()));
        state.phase = OodaPhase::Orient;

        let mut insights = self.orient_insights(task, &observation).await?;
        let Some(agent) = select(agents, task, &observation) else {
            insights.push("No agent has remaining work; project is complete".to_string());
            state.last_observation = Some(observation);
            state.last_decision = None;
            state.phase = OodaPhase::Complete;
            return Ok(IterationOutcome::finished(insights));
        };
        state.last_decision = Some(Decision {
            agent: agent.name().to_string(),
            priority: agent.priority(),
            rationale: format!(
                "{} (priority {}) can handle: {}",
                agent.name(),
                agent.priority(),
                observation.summary()
            ),
        });
        state.last_observation = Some(observation);
        state.phase = OodaPhase::Decide;

        // Decide only frames the action; nothing is mutated here.
        let decision = state
            .last_decision
            .as_ref()
            .ok_or(OodaError::NoDecision(OodaPhase::Decide))?;
        state
            .context
            .insert("decision".to_string(), Value::String(decision.rationale.clone()));
        state.phase = OodaPhase::Act;

        let observation = state
            .last_observation
            .as_ref()
            .ok_or_else(|| OodaError::Observe("observation lost before act".to_string()))?;
        let micro_tasks = self.act(task, agent, observation).await?;
        let micro_task_ids: Vec<String> = micro_tasks.iter().map(|m| m.id.clone()).collect();

        self.memory
            .record_context(
                task.id(),
                "act",
                ContextOutcome::Neutral,
                json!({
                    "agent": agent.name(),
                    "iteration": state.iteration,
                    "microTasks": micro_task_ids.len(),
                }),
            )
            .await;
        insights.push(format!(
            "{} proposed {} micro-task(s)",
            agent.name(),
            micro_task_ids.len()
        ));
        state.last_action = Some(ActionRecord {
            agent: agent.name().to_string(),
            micro_task_ids,
        });

        let (next_phase, stop) = if state.at_ceiling() {
            (OodaPhase::Complete, Some(super::StopReason::IterationLimit))
        } else {
            (OodaPhase::Observe, None)
        };
        state.phase = next_phase;

        Ok(IterationOutcome {
            success: true,
            next_phase,
            confidence: confidence_for(micro_tasks.len()),
            micro_tasks,
            insights,
            should_continue: next_phase != OodaPhase::Complete,
            agent: Some(agent.name().to_string()),
            stop,
        })
    }

    async fn observe(&self, task: &Task) -> Result<ProjectState, OodaError> {
        let files = self
            .file_store
            .list_project_files(task.project_path())
            .await
            .map_err(|e| OodaError::Observe(format!("{:#}", e)))?;
        Ok(ProjectState::from_task(task, files))
    }

    /// One line describing the project. Asks the model when it is reachable.
    async fn orient_insights(
        &self,
        task: &Task,
        observation: &ProjectState,
    ) -> Result<Vec<String>, OodaError> {
        let mut insights = vec![format!(
            "Project has {} file(s) and {} declared dependencies",
            observation.files.len(),
            observation.dependencies.len()
        )];
        if !observation.errors.is_empty() {
            insights.push(format!("{} error(s) from the last run", observation.errors.len()));
        }
        if !self.llm.is_connected().await {
            return Ok(insights);
        }

        let prompt = format!(
            "You are reviewing progress on: \"{}\".\nCurrent state: {}.\nErrors:\n{}\n\n\
             In one sentence, what matters most next?",
            task.prompt(),
            observation.summary(),
            observation.errors.join("\n")
        );
        let answer = self.llm.generate(&prompt).await?;
        let answer = answer.trim();
        if !answer.is_empty() {
            insights.push(truncate_chars(answer, 300));
        }
        Ok(insights)
    }

    async fn act(
        &self,
        task: &Task,
        agent: &AgentRef,
        observation: &ProjectState,
    ) -> Result<Vec<crate::task::MicroTask>, OodaError> {
        let ctx = AgentContext {
            task,
            project_state: observation,
            memory: self.memory.as_ref(),
            llm: self.llm.as_ref(),
            file_store: self.file_store.as_ref(),
        };
        agent.execute(&ctx).await.map_err(|source| OodaError::Agent {
            agent: agent.name().to_string(),
            source,
        })
    }
}
