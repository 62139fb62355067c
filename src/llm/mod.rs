//! LLM client module.
//!
//! The orchestrator only needs two capabilities from a model: turn a prompt
//! into text, and say whether it is reachable. [`HttpLlmClient`] talks to any
//! OpenAI-compatible endpoint; [`OfflineLlm`] is used when no key is configured.
//!
//! Model output that must be structured goes through [`decode_json`], which
//! either yields the typed value or a `Decode` error. There is no lenient
//! fallback that silently returns an empty value.

mod error;
mod http;

pub use error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
pub use http::HttpLlmClient;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

/// Text generation capability consumed by agents and the OODA engine.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;

    /// Whether the model endpoint is currently usable.
    async fn is_connected(&self) -> bool;
}

/// Client used when no model is configured. Always disconnected.
#[derive(Debug, Default, Clone)]
pub struct OfflineLlm;

#[async_trait]
impl LlmClient for OfflineLlm {
    async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
        Err(LlmError::disconnected())
    }

    async fn is_connected(&self) -> bool {
        false
    }
}

/// Strip one surrounding Markdown code fence (```` ``` ```` or ```` ```json ````), if present.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Decode model output into `T`.
///
/// # Errors
/// `LlmErrorKind::Decode` when the (fence-stripped) text is not valid JSON for `T`.
pub fn decode_json<T: DeserializeOwned>(raw: &str) -> Result<T, LlmError> {
    let body = strip_code_fence(raw);
    serde_json::from_str(body).map_err(|e| {
        LlmError::decode(format!(
            "{} in model output: {}",
            e,
            crate::util::truncate_chars(body, 200)
        ))
    })
}
