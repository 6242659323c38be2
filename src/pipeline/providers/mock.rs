use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{LlmProvider, ProviderError, ProviderResponse};

/// One scripted reaction of a [`ScriptedProvider`].
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(String),
    Fail(ProviderError),
}

/// In-process provider replaying a fixed script (allows mocking).
///
/// Steps are consumed in order; once the script runs out the last step
/// repeats. Every prompt received is kept for inspection.
pub struct ScriptedProvider {
    id: String,
    model: String,
    steps: Vec<ScriptStep>,
    delay: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            model: format!("{id}-scripted"),
            steps: Vec::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Provider that returns `response` on every call.
    pub fn always(id: &str, response: &str) -> Self {
        Self::new(id).then_respond(response)
    }

    /// Provider whose every call fails with a connection error.
    pub fn unreachable(id: &str) -> Self {
        let error = ProviderError::Connection {
            provider: id.to_string(),
            message: "connection refused".into(),
        };
        Self::new(id).then_fail(error)
    }

    pub fn then_respond(mut self, response: &str) -> Self {
        self.steps.push(ScriptStep::Respond(response.to_string()));
        self
    }

    pub fn then_fail(mut self, error: ProviderError) -> Self {
        self.steps.push(ScriptStep::Fail(error));
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Sleep before answering, to exercise timeouts and cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn invoke(&self, prompt: &str) -> Result<ProviderResponse, ProviderError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let step = self
            .steps
            .get(index)
            .or_else(|| self.steps.last())
            .ok_or_else(|| ProviderError::MalformedPayload {
                provider: self.id.clone(),
                message: "no scripted response".into(),
            })?;

        match step {
            ScriptStep::Respond(content) => Ok(ProviderResponse {
                content: content.clone(),
                usage: None,
            }),
            ScriptStep::Fail(error) => Err(error.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_replay_in_order_then_repeat_last() {
        let provider = ScriptedProvider::new("p")
            .then_fail(ProviderError::Timeout {
                provider: "p".into(),
                timeout_ms: 5,
            })
            .then_respond("first")
            .then_respond("second");

        assert!(provider.invoke("a").is_err());
        assert_eq!(provider.invoke("b").unwrap().content, "first");
        assert_eq!(provider.invoke("c").unwrap().content, "second");
        assert_eq!(provider.invoke("d").unwrap().content, "second");
        assert_eq!(provider.call_count(), 4);
        assert_eq!(provider.prompts(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn empty_script_is_malformed() {
        let provider = ScriptedProvider::new("p");
        assert!(matches!(
            provider.invoke("x"),
            Err(ProviderError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn unreachable_is_transient() {
        let provider = ScriptedProvider::unreachable("p");
        assert!(provider.invoke("x").unwrap_err().is_transient());
    }
}
