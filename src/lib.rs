//! # forgeloop
//!
//! Self-hosted orchestrator that turns a natural-language prompt into a
//! buildable, tested project by running agents in an OODA loop.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (axum) ──► TaskManager ──► OodaEngine ──► Agents (priority order)
//!                       │                              │
//!                       │        micro-tasks ◄─────────┘
//!                       ▼
//!               SecurityAuditor ──► MicroTaskExecutor ──► FileStore / Builder / LLM
//!                       │
//!                       ▼
//!                 EventStreamer ──► SSE subscribers
//! ```
//!
//! ## Task Flow
//! 1. Receive a prompt via the API and create the project directory
//! 2. Observe the project, pick the first capable agent, collect its micro-tasks
//! 3. Audit each batch, then execute it micro-task by micro-task
//! 4. Stream every log entry and stop when no agent has work left
//!
//! ## Modules
//! - `agents`: agent trait, selection and the default agent set
//! - `ooda`: one observe → orient → decide → act iteration
//! - `executor`: micro-task handlers and result analysis
//! - `security`: audits, operation checks and rollback points
//! - `streaming`: per-task event streams
//! - `manager`: task lifecycle and the orchestration loop
//! - `api`: HTTP surface

pub mod agents;
pub mod api;
pub mod builder;
pub mod config;
pub mod executor;
pub mod fs_store;
pub mod llm;
pub mod manager;
pub mod memory;
pub mod ooda;
pub mod security;
pub mod streaming;
pub mod task;
pub mod util;

pub use config::Config;
pub use manager::{OrchestrationError, TaskManager};
