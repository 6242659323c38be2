use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{
    check_status, http_client, malformed, map_transport_error, LlmProvider, ProviderError,
    ProviderResponse, ProviderSettings,
};
use crate::models::TokenUsage;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic `/messages` client.
pub struct AnthropicProvider {
    id: String,
    model: String,
    base_url: String,
    api_key: Zeroizing<String>,
    max_tokens: u32,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        Ok(Self {
            id: settings.id.clone(),
            model: settings.model.clone(),
            base_url: settings.endpoint(),
            api_key: settings.api_key()?,
            max_tokens: settings.max_tokens,
            timeout: settings.timeout(),
            client: http_client(&settings.id, settings.timeout())?,
        })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<MessagesUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessagesUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

fn parse_messages_response(
    provider: &str,
    parsed: MessagesResponse,
) -> Result<ProviderResponse, ProviderError> {
    let content: String = parsed
        .content
        .into_iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text)
        .collect::<Vec<_>>()
        .join("");

    if content.trim().is_empty() {
        return Err(malformed(provider, "response has no text content"));
    }

    Ok(ProviderResponse {
        content,
        usage: parsed.usage.map(|u| TokenUsage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
        }),
    })
}

impl LlmProvider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn invoke(&self, prompt: &str) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/messages", self.base_url);
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: [Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.as_str())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .map_err(|e| map_transport_error(&self.id, self.timeout, e))?;
        let response = check_status(&self.id, response)?;

        let parsed: MessagesResponse = response
            .json()
            .map_err(|e| malformed(&self.id, e.to_string()))?;
        parse_messages_response(&self.id, parsed)
    }
}
