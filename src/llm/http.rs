//! OpenAI-compatible chat completions client with automatic retry for transient errors.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
use super::LlmClient;
use crate::config::LlmConfig;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for `{base_url}/chat/completions`.
pub struct HttpLlmClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    retry_config: RetryConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpLlmClient {
    /// Create a client with default retry configuration.
    pub fn new(api_key: String, config: &LlmConfig) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            retry_config: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok().map(Duration::from_secs))
    }

    /// Create an LlmError from HTTP response status and body.
    fn create_error(
        status: reqwest::StatusCode,
        body: &str,
        retry_after: Option<Duration>,
    ) -> LlmError {
        let status_code = status.as_u16();
        match classify_http_status(status_code) {
            LlmErrorKind::RateLimited => LlmError::rate_limited(body.to_string(), retry_after),
            LlmErrorKind::ClientError => LlmError::client_error(status_code, body.to_string()),
            _ => LlmError::server_error(status_code, body.to_string()),
        }
    }

    /// Execute a single request without retry.
    async fn execute_request(&self, prompt: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network_error(format!("Request timeout: {}", e))
                } else if e.is_connect() {
                    LlmError::network_error(format!("Connection failed: {}", e))
                } else {
                    LlmError::network_error(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Self::create_error(status, &body, retry_after));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::parse_error(format!("Failed to parse response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::parse_error("No content in response".to_string()))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            match self.execute_request(prompt).await {
                Ok(content) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Request succeeded after {} retries (total time: {:?})",
                            attempt,
                            start.elapsed()
                        );
                    }
                    return Ok(content);
                }
                Err(error) => {
                    let remaining = self
                        .retry_config
                        .max_retry_duration
                        .saturating_sub(start.elapsed());
                    if !self.retry_config.should_retry(&error, attempt) || remaining.is_zero() {
                        tracing::error!("LLM request failed after {} retries: {}", attempt, error);
                        return Err(error);
                    }

                    let delay = error.suggested_delay(attempt).min(remaining);
                    tracing::warn!(
                        "Retry attempt {} failed with {}, retrying in {:?}: {}",
                        attempt + 1,
                        error.kind,
                        delay,
                        error.message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn is_connected(&self) -> bool {
        let probe = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(PING_TIMEOUT)
            .send()
            .await;
        match probe {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("LLM connectivity probe failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let config = LlmConfig {
            api_key: Some("k".to_string()),
            base_url: "http://localhost:9999/v1/".to_string(),
            model: "m".to_string(),
        };
        let client = HttpLlmClient::new("k".to_string(), &config);
        assert_eq!(client.base_url, "http://localhost:9999/v1");
    }

    #[test]
    fn status_errors_are_classified() {
        let err = HttpLlmClient::create_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "x", None);
        assert_eq!(err.kind, LlmErrorKind::RateLimited);
        let err = HttpLlmClient::create_error(reqwest::StatusCode::UNAUTHORIZED, "x", None);
        assert_eq!(err.kind, LlmErrorKind::ClientError);
        assert!(!err.is_transient());
    }

    /// Nothing listens on port 9; the client must fail with a network error, not hang.
    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        let config = LlmConfig {
            api_key: Some("k".to_string()),
            base_url: "http://127.0.0.1:9".to_string(),
            model: "m".to_string(),
        };
        let client = HttpLlmClient::new("k".to_string(), &config).with_retry_config(RetryConfig {
            max_retries: 0,
            max_retry_duration: Duration::from_secs(1),
        });
        let err = client.generate("hello").await.expect_err("unreachable");
        assert_eq!(err.kind, LlmErrorKind::NetworkError);
        assert!(!client.is_connected().await);
    }
}
