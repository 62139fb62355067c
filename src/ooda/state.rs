use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agents::ProjectState;
use crate::task::MicroTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OodaPhase {
    Observe,
    Orient,
    Decide,
    Act,
    /// Terminal; the run is over.
    Complete,
}

/// Agent chosen by the orient phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub agent: String,
    pub priority: u32,
    pub rationale: String,
}

/// What the act phase produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub agent: String,
    pub micro_task_ids: Vec<String>,
}

/// Per-run engine state. Discarded once the run reaches [`OodaPhase::Complete`].
///
/// # Invariants
/// - `iteration` only grows and never exceeds `max_iterations`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OodaState {
    pub phase: OodaPhase,
    pub iteration: u32,
    pub max_iterations: u32,
    pub last_observation: Option<ProjectState>,
    pub last_decision: Option<Decision>,
    pub last_action: Option<ActionRecord>,
    pub context: Map<String, Value>,
    pub memory: Map<String, Value>,
}

impl OodaState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            phase: OodaPhase::Observe,
            iteration: 0,
            max_iterations,
            last_observation: None,
            last_decision: None,
            last_action: None,
            context: Map::new(),
            memory: Map::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == OodaPhase::Complete
    }

    pub fn at_ceiling(&self) -> bool {
        self.iteration >= self.max_iterations
    }
}

impl Default for OodaState {
    fn default() -> Self {
        Self::new(super::DEFAULT_MAX_ITERATIONS)
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Orient found nobody with work left; the task is done.
    NoCapableAgent,
    /// The iteration ceiling was reached.
    IterationLimit,
    /// A phase failed.
    Error(String),
}

/// Result of one [`super::OodaEngine::iterate`] call.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub success: bool,
    pub next_phase: OodaPhase,
    pub micro_tasks: Vec<MicroTask>,
    pub insights: Vec<String>,
    /// Informational only, in `[0, 1]`.
    pub confidence: f64,
    pub should_continue: bool,
    pub agent: Option<String>,
    pub stop: Option<StopReason>,
}

impl IterationOutcome {
    pub(crate) fn failed(message: String) -> Self {
        Self {
            success: false,
            next_phase: OodaPhase::Complete,
            micro_tasks: Vec::new(),
            insights: vec![message.clone()],
            confidence: 0.0,
            should_continue: false,
            agent: None,
            stop: Some(StopReason::Error(message)),
        }
    }

    pub(crate) fn finished(insights: Vec<String>) -> Self {
        Self {
            success: true,
            next_phase: OodaPhase::Complete,
            micro_tasks: Vec::new(),
            insights,
            confidence: 1.0,
            should_continue: false,
            agent: None,
            stop: Some(StopReason::NoCapableAgent),
        }
    }

    pub(crate) fn exhausted(max_iterations: u32) -> Self {
        Self {
            success: false,
            next_phase: OodaPhase::Complete,
            micro_tasks: Vec::new(),
            insights: vec![format!(
                "Iteration limit of {} reached",
                max_iterations
            )],
            confidence: 0.0,
            should_continue: false,
            agent: None,
            stop: Some(StopReason::IterationLimit),
        }
    }
}

/// Confidence from the size of the produced batch.
pub(crate) fn confidence_for(micro_tasks: usize) -> f64 {
    (micro_tasks as f64 * 0.1).min(0.9).clamp(0.1, 0.95)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_stays_in_range() {
        assert_eq!(confidence_for(0), 0.1);
        assert!((confidence_for(3) - 0.3).abs() < 1e-9);
        assert_eq!(confidence_for(100), 0.9);
    }

    #[test]
    fn fresh_state_starts_observing() {
        let state = OodaState::new(2);
        assert_eq!(state.phase, OodaPhase::Observe);
        assert!(!state.at_ceiling());
        assert!(!state.is_complete());
    }
}
