//! HTTP API for forgeloop.
//!
//! ## Endpoints
//!
//! - `POST /task` - Create a task from a prompt
//! - `GET /tasks` - List tasks (`?status=&limit=&offset=`)
//! - `GET|PATCH|DELETE /task/{id}` - Fetch, update or remove a task
//! - `GET /task/{id}/status` - Status, build/test state and counts
//! - `GET /task/{id}/logs` - Full ordered log
//! - `GET /task/{id}/stream` - Stream task logs via SSE
//! - `POST /task/{id}/iterate` - Inject a user-directed correction
//! - `POST /task/{id}/retry` - Retry a failed task
//! - `POST /task/{id}/cancel` - Cancel an active task
//! - `GET|POST /task/{id}/security` - Security report / audit pending work now
//! - `GET|POST /task/{id}/rollback` - List / create rollback points
//! - `POST /task/{id}/rollback/{rollbackId}` - Restore a rollback point
//! - `POST /security/check` - Vet a single operation
//! - `GET /streams/stats` - Event stream statistics
//! - `GET /health` - Health check
//!
//! Errors are JSON `{ "error": "<code>", "message": "..." }`.

mod error;
mod routes;
mod security;
pub mod types;

pub use error::ApiError;
pub use routes::{router, serve, AppState};
pub use types::*;
