//! OODA engine - the Observe → Orient → Decide → Act cycle driving one task.
//!
//! One call to [`OodaEngine::iterate`] runs all four phases:
//!
//! ```text
//! observe ──▶ orient ──▶ decide ──▶ act ──▶ observe (next call)
//!    │           │                    │
//!    │ error     │ no capable agent   │ iteration ≥ max
//!    ▼           ▼                    ▼
//!  complete    complete             complete
//!  (failure)   (success)            (liveness)
//! ```
//!
//! Control flow is structural: `confidence` is reported but never consulted.

mod engine;
mod state;

pub use engine::{OodaEngine, OodaError};
pub use state::{ActionRecord, Decision, IterationOutcome, OodaPhase, OodaState, StopReason};

/// Default safety ceiling on iterations per task run.
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;
