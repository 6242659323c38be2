//! Provider adapters: one transport per LLM backend behind [`LlmProvider`].
//!
//! Adapters only move a prompt to a backend and surface its failures as a
//! uniform [`ProviderError`]. Retrying and failover live in the orchestrator.

pub mod anthropic;
pub mod mock;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use mock::{ScriptStep, ScriptedProvider};
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::models::TokenUsage;

/// Default per-provider timeout when the configuration names none.
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 60;

/// Default completion budget for providers that require one.
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Provider {provider} is not reachable: {message}")]
    Connection { provider: String, message: String },

    #[error("Provider {provider} timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("Provider {provider} returned error (status {status}): {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Provider {provider} returned a malformed payload: {message}")]
    MalformedPayload { provider: String, message: String },

    #[error("Provider {provider} is misconfigured: {message}")]
    Configuration { provider: String, message: String },
}

/// Whether a provider failure is expected to clear on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Fatal,
}

impl ProviderError {
    pub fn provider(&self) -> &str {
        match self {
            Self::Connection { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Http { provider, .. }
            | Self::MalformedPayload { provider, .. }
            | Self::Configuration { provider, .. } => provider,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => FailureClass::Transient,
            Self::Http { status, .. } if is_transient_status(*status) => FailureClass::Transient,
            Self::Http { .. } | Self::MalformedPayload { .. } | Self::Configuration { .. } => {
                FailureClass::Fatal
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

/// Raw text returned by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// Uniform call contract for one LLM backend.
pub trait LlmProvider: Send + Sync {
    /// Configured identifier, e.g. `primary`.
    fn id(&self) -> &str;

    fn model(&self) -> &str;

    /// Submit a fully rendered prompt. No retries.
    fn invoke(&self, prompt: &str) -> Result<ProviderResponse, ProviderError>;
}

// ──────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
}

impl ProviderKind {
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::Ollama => "http://localhost:11434",
        }
    }
}

/// One entry of the ordered provider list supplied at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub id: String,
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_PROVIDER_TIMEOUT_SECS
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

impl ProviderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn endpoint(&self) -> String {
        self.endpoint
            .as_deref()
            .unwrap_or(self.kind.default_endpoint())
            .trim_end_matches('/')
            .to_string()
    }

    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<Zeroizing<String>, ProviderError> {
        let var = self.api_key_env.as_deref().ok_or_else(|| ProviderError::Configuration {
            provider: self.id.clone(),
            message: "api_key_env is not set".into(),
        })?;
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(Zeroizing::new(key)),
            _ => Err(ProviderError::Configuration {
                provider: self.id.clone(),
                message: format!("environment variable {var} is missing or empty"),
            }),
        }
    }
}

/// Build the adapter described by `settings`.
pub fn build_provider(settings: &ProviderSettings) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    let provider: Arc<dyn LlmProvider> = match settings.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::from_settings(settings)?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::from_settings(settings)?),
        ProviderKind::Ollama => Arc::new(OllamaProvider::from_settings(settings)?),
    };
    Ok(provider)
}

// ──────────────────────────────────────────────
// Shared HTTP helpers
// ──────────────────────────────────────────────

pub(crate) fn http_client(
    provider: &str,
    timeout: Duration,
) -> Result<reqwest::blocking::Client, ProviderError> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Configuration {
            provider: provider.to_string(),
            message: format!("failed to create HTTP client: {e}"),
        })
}

pub(crate) fn map_transport_error(
    provider: &str,
    timeout: Duration,
    error: reqwest::Error,
) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout {
            provider: provider.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    } else if error.is_connect() {
        ProviderError::Connection {
            provider: provider.to_string(),
            message: error.to_string(),
        }
    } else {
        ProviderError::Connection {
            provider: provider.to_string(),
            message: format!("request failed: {error}"),
        }
    }
}

/// Turn a non-success status into [`ProviderError::Http`].
pub(crate) fn check_status(
    provider: &str,
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(ProviderError::Http {
        provider: provider.to_string(),
        status: status.as_u16(),
        body: truncate_body(&body),
    })
}

/// Error bodies can echo the prompt back; keep only a short prefix.
fn truncate_body(body: &str) -> String {
    const MAX_BODY_CHARS: usize = 300;
    if body.chars().count() <= MAX_BODY_CHARS {
        body.to_string()
    } else {
        let prefix: String = body.chars().take(MAX_BODY_CHARS).collect();
        format!("{prefix}…")
    }
}

pub(crate) fn malformed(provider: &str, message: impl Into<String>) -> ProviderError {
    ProviderError::MalformedPayload {
        provider: provider.to_string(),
        message: message.into(),
    }
}
