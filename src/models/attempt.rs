use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::verdict::ValidationVerdict;

/// Token usage reported by a provider, when it reports any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

/// Append-only audit record for one LLM round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationAttempt {
    pub id: Uuid,
    pub session_id: Uuid,
    /// 0 for the initial evaluation, incremented per clarification.
    pub round: u32,
    /// 1-based attempt number within the round (malformed-response retries).
    pub attempt: u32,
    pub template_id: Uuid,
    pub template_version: String,
    /// Provider that actually answered, if any did.
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub prompt: String,
    pub raw_response: Option<String>,
    pub verdict: Option<ValidationVerdict>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub warnings: Vec<String>,
    pub usage: Option<TokenUsage>,
    pub latency_ms: u64,
    pub recorded_at: DateTime<Utc>,
    pub physician_id: Option<String>,
    pub organization_id: Option<String>,
}

impl ValidationAttempt {
    pub fn succeeded(&self) -> bool {
        self.verdict.is_some() && self.error_kind.is_none()
    }
}
