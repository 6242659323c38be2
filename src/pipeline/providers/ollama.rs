use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    check_status, http_client, malformed, map_transport_error, LlmProvider, ProviderError,
    ProviderResponse, ProviderSettings,
};
use crate::models::TokenUsage;

/// Ollama HTTP client for a self-hosted model.
pub struct OllamaProvider {
    id: String,
    model: String,
    base_url: String,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl OllamaProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        Ok(Self {
            id: settings.id.clone(),
            model: settings.model.clone(),
            base_url: settings.endpoint(),
            timeout: settings.timeout(),
            client: http_client(&settings.id, settings.timeout())?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// Response body from Ollama /api/generate
#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

impl LlmProvider for OllamaProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn invoke(&self, prompt: &str) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| map_transport_error(&self.id, self.timeout, e))?;
        let response = check_status(&self.id, response)?;

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| malformed(&self.id, e.to_string()))?;

        if parsed.response.trim().is_empty() {
            return Err(malformed(&self.id, "empty generation"));
        }

        Ok(ProviderResponse {
            content: parsed.response,
            usage: Some(TokenUsage {
                prompt_tokens: parsed.prompt_eval_count,
                completion_tokens: parsed.eval_count,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::providers::ProviderKind;

    fn settings(endpoint: &str, timeout_secs: u64) -> ProviderSettings {
        ProviderSettings {
            id: "local".into(),
            kind: ProviderKind::Ollama,
            model: "medgemma:27b".into(),
            endpoint: Some(endpoint.into()),
            api_key_env: None,
            timeout_secs,
            max_tokens: 1024,
        }
    }

    #[test]
    fn generate_response_parses_counts() {
        let json = r#"{"model":"medgemma:27b","response":"{}","done":true,"prompt_eval_count":42,"eval_count":7}"#;
        let parsed: GenerateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.prompt_eval_count, Some(42));
        assert_eq!(parsed.eval_count, Some(7));
    }

    #[test]
    fn base_url_from_settings() {
        let provider = OllamaProvider::from_settings(&settings("http://127.0.0.1:11434/", 5)).unwrap();
        assert_eq!(provider.base_url(), "http://127.0.0.1:11434");
        assert_eq!(provider.id(), "local");
    }

    #[test]
    fn unreachable_server_is_transient() {
        // Port 9 (discard) is closed on test hosts; connection is refused immediately.
        let provider = OllamaProvider::from_settings(&settings("http://127.0.0.1:9", 2)).unwrap();
        let err = provider.invoke("prompt").unwrap_err();
        assert!(err.is_transient(), "expected transient error, got {err:?}");
        assert_eq!(err.provider(), "local");
    }
}
