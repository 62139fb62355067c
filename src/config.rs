//! Configuration management for forgeloop.
//!
//! Configuration can be set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `PROJECTS_DIR` - Optional. Root for generated projects. Defaults to `./projects`.
//! - `MAX_ITERATIONS` - Optional. OODA safety ceiling per task run. Defaults to `50`.
//! - `MAX_RETRIES` - Optional. Default micro-task retry budget. Defaults to `3`.
//! - `LLM_API_KEY` - Optional. Enables the HTTP LLM client; unset runs offline.
//! - `LLM_BASE_URL` - Optional. OpenAI-compatible endpoint. Defaults to `https://openrouter.ai/api/v1`.
//! - `LLM_MODEL` - Optional. Model id. Defaults to `openai/gpt-4o-mini`.
//! - `INSTALL_TIMEOUT_SECS` / `BUILD_TIMEOUT_SECS` / `TEST_TIMEOUT_SECS` - Optional.
//!   External tool timeouts. Default to `300` / `60` / `120`.
//! - `STREAM_TIMEOUT_SECS` - Optional. Stream inactivity expiry. Defaults to `1800`.
//! - `MAX_STREAMS` - Optional. Global stream ceiling. Defaults to `100`.
//! - `AUTO_START` - Optional. Start processing on task creation. Defaults to `true`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::util::{env_var_bool, env_var_parse};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Language model connection settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API key; `None` selects the offline client
    pub api_key: Option<String>,

    /// Base URL of an OpenAI-compatible API (without `/chat/completions`)
    pub base_url: String,

    /// Model identifier
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "openai/gpt-4o-mini".to_string(),
        }
    }
}

/// Timeouts applied to external build tooling.
#[derive(Debug, Clone, Copy)]
pub struct ToolTimeouts {
    pub install: Duration,
    pub build: Duration,
    pub test: Duration,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            install: Duration::from_secs(300),
            build: Duration::from_secs(60),
            test: Duration::from_secs(120),
        }
    }
}

/// Event stream limits.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Inactivity window after which a stream expires
    pub timeout: Duration,

    /// Global stream ceiling; oldest streams are evicted beyond it
    pub max_streams: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            max_streams: 100,
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Directory under which `proj-<taskId>` project trees are created
    pub projects_dir: PathBuf,

    /// OODA iteration ceiling for one task run
    pub max_iterations: u32,

    /// Default retry budget for new micro-tasks
    pub max_retries: u32,

    /// Language model settings
    pub llm: LlmConfig,

    /// External tool timeouts
    pub timeouts: ToolTimeouts,

    /// Event stream limits
    pub streams: StreamConfig,

    /// Start the orchestration loop as soon as a task is created
    pub auto_start: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_var_parse("PORT", 3000u16)?;

        let projects_dir = std::env::var("PROJECTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./projects"));

        let max_iterations = env_var_parse("MAX_ITERATIONS", 50u32)?;
        if max_iterations == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_ITERATIONS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let max_retries = env_var_parse("MAX_RETRIES", 3u32)?;

        let defaults = LlmConfig::default();
        let llm = LlmConfig {
            api_key: std::env::var("LLM_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            base_url: std::env::var("LLM_BASE_URL").unwrap_or(defaults.base_url),
            model: std::env::var("LLM_MODEL").unwrap_or(defaults.model),
        };

        let timeouts = ToolTimeouts {
            install: Duration::from_secs(env_var_parse("INSTALL_TIMEOUT_SECS", 300u64)?),
            build: Duration::from_secs(env_var_parse("BUILD_TIMEOUT_SECS", 60u64)?),
            test: Duration::from_secs(env_var_parse("TEST_TIMEOUT_SECS", 120u64)?),
        };

        let streams = StreamConfig {
            timeout: Duration::from_secs(env_var_parse("STREAM_TIMEOUT_SECS", 1800u64)?),
            max_streams: env_var_parse("MAX_STREAMS", 100usize)?,
        };

        Ok(Self {
            host,
            port,
            projects_dir,
            max_iterations,
            max_retries,
            llm,
            timeouts,
            streams,
            auto_start: env_var_bool("AUTO_START", true),
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(projects_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            projects_dir,
            max_iterations: 50,
            max_retries: 3,
            llm: LlmConfig::default(),
            timeouts: ToolTimeouts::default(),
            streams: StreamConfig::default(),
            auto_start: true,
        }
    }
}
