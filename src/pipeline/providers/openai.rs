use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{
    check_status, http_client, malformed, map_transport_error, LlmProvider, ProviderError,
    ProviderResponse, ProviderSettings,
};
use crate::models::TokenUsage;

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiProvider {
    id: String,
    model: String,
    base_url: String,
    api_key: Zeroizing<String>,
    max_tokens: u32,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl OpenAiProvider {
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
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

fn parse_chat_response(provider: &str, parsed: ChatResponse) -> Result<ProviderResponse, ProviderError> {
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| malformed(provider, "response has no message content"))?;

    Ok(ProviderResponse {
        content,
        usage: parsed.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }),
    })
}

impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn invoke(&self, prompt: &str) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.max_tokens,
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.as_str())
            .json(&body)
            .send()
            .map_err(|e| map_transport_error(&self.id, self.timeout, e))?;
        let response = check_status(&self.id, response)?;

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| malformed(&self.id, e.to_string()))?;
        parse_chat_response(&self.id, parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_and_usage() {
        let json = r#"{
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "{\"validationStatus\":\"appropriate\"}"}}],
            "usage": {"prompt_tokens": 900, "completion_tokens": 120, "total_tokens": 1020}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(json).unwrap();
        let response = parse_chat_response("primary", parsed).unwrap();
        assert!(response.content.contains("appropriate"));
        assert_eq!(response.usage.unwrap().prompt_tokens, Some(900));
    }

    #[test]
    fn empty_choices_are_malformed() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        let err = parse_chat_response("primary", parsed).unwrap_err();
        assert!(matches!(err, ProviderError::MalformedPayload { .. }));
    }

    #[test]
    fn null_content_is_malformed() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices": [{"message": {"content": null}}]}"#).unwrap();
        assert!(parse_chat_response("primary", parsed).is_err());
    }

    #[test]
    fn request_serializes_single_user_message() {
        let body = ChatRequest {
            model: "gpt-4o",
            messages: [ChatMessage {
                role: "user",
                content: "hello",
            }],
            max_tokens: 100,
            temperature: 0.0,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["content"], "hello");
        assert_eq!(value["max_tokens"], 100);
    }
}
