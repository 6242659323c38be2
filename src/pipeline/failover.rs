//! Failover orchestrator: provider-to-provider fallback in a fixed order.
//!
//! Each provider call runs on its own thread so the orchestrator can stop
//! waiting after the provider's timeout, or when the caller cancels, without
//! blocking on the in-flight request. A late result is dropped with its
//! channel and never reaches session state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::providers::{build_provider, LlmProvider, ProviderError, ProviderSettings};
use crate::models::TokenUsage;

/// How often a waiting call re-checks the cancel flag.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Error, Debug)]
pub enum FailoverError {
    #[error("No LLM providers configured")]
    NoProvidersConfigured,

    #[error("All providers exhausted ({} failed)", .failures.len())]
    AllProvidersExhausted { failures: Vec<ProviderError> },

    #[error("Validation cancelled by caller")]
    Cancelled,
}

/// Cooperative cancellation flag shared between a caller and a session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A provider plus the time budget for one call to it.
#[derive(Clone)]
pub struct ProviderSlot {
    pub provider: Arc<dyn LlmProvider>,
    pub timeout: Duration,
}

impl ProviderSlot {
    pub fn new(provider: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }
}

/// Successful provider answer, annotated with who actually answered.
#[derive(Debug, Clone)]
pub struct ProviderResult {
    pub content: String,
    pub provider_id: String,
    pub model_id: String,
    pub usage: Option<TokenUsage>,
    pub latency: Duration,
    /// Failures of higher-priority providers skipped on the way.
    pub failures: Vec<ProviderError>,
}

enum CallOutcome {
    Completed(Result<super::providers::ProviderResponse, ProviderError>),
    TimedOut,
    Cancelled,
}

/// Tries providers in configured priority order; first success wins.
#[derive(Clone)]
pub struct FailoverOrchestrator {
    slots: Vec<ProviderSlot>,
}

impl FailoverOrchestrator {
    pub fn new(slots: Vec<ProviderSlot>) -> Self {
        Self { slots }
    }

    /// Build adapters for every configured provider, preserving order.
    pub fn from_settings(settings: &[ProviderSettings]) -> Result<Self, ProviderError> {
        let slots = settings
            .iter()
            .map(|s| Ok(ProviderSlot::new(build_provider(s)?, s.timeout())))
            .collect::<Result<Vec<_>, ProviderError>>()?;
        Ok(Self::new(slots))
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.provider.id().to_string()).collect()
    }

    /// Invoke providers in order until one answers.
    ///
    /// No provider is called twice. Exhausting the list is fatal.
    pub fn invoke_with_fallback(
        &self,
        prompt: &str,
        cancel: &CancelToken,
    ) -> Result<ProviderResult, FailoverError> {
        if self.slots.is_empty() {
            return Err(FailoverError::NoProvidersConfigured);
        }

        let mut failures = Vec::new();

        for slot in &self.slots {
            if cancel.is_cancelled() {
                return Err(FailoverError::Cancelled);
            }

            let provider_id = slot.provider.id().to_string();
            let started = Instant::now();

            match call_with_timeout(slot, prompt, cancel) {
                CallOutcome::Completed(Ok(response)) => {
                    let latency = started.elapsed();
                    tracing::info!(
                        provider = %provider_id,
                        model = slot.provider.model(),
                        latency_ms = latency.as_millis() as u64,
                        skipped = failures.len(),
                        "Provider answered"
                    );
                    return Ok(ProviderResult {
                        content: response.content,
                        provider_id,
                        model_id: slot.provider.model().to_string(),
                        usage: response.usage,
                        latency,
                        failures,
                    });
                }
                CallOutcome::Completed(Err(e)) => {
                    tracing::warn!(
                        provider = %provider_id,
                        transient = e.is_transient(),
                        error = %e,
                        "Provider failed, trying next"
                    );
                    failures.push(e);
                }
                CallOutcome::TimedOut => {
                    let e = ProviderError::Timeout {
                        provider: provider_id.clone(),
                        timeout_ms: slot.timeout.as_millis() as u64,
                    };
                    tracing::warn!(provider = %provider_id, error = %e, "Provider timed out, trying next");
                    failures.push(e);
                }
                CallOutcome::Cancelled => {
                    tracing::info!(
                        provider = %provider_id,
                        "Cancelled while waiting on provider; in-flight result will be discarded"
                    );
                    return Err(FailoverError::Cancelled);
                }
            }
        }

        tracing::error!(failed = failures.len(), "All providers exhausted");
        Err(FailoverError::AllProvidersExhausted { failures })
    }
}

/// Run one provider call on a worker thread and wait up to its timeout.
fn call_with_timeout(slot: &ProviderSlot, prompt: &str, cancel: &CancelToken) -> CallOutcome {
    let (tx, rx) = mpsc::channel();
    let provider = Arc::clone(&slot.provider);
    let owned_prompt = prompt.to_string();

    let spawned = thread::Builder::new()
        .name(format!("provider-{}", slot.provider.id()))
        .spawn(move || {
            let result = provider.invoke(&owned_prompt);
            // Receiver is gone after a timeout or cancellation.
            let _ = tx.send(result);
        });

    if let Err(e) = spawned {
        return CallOutcome::Completed(Err(ProviderError::Connection {
            provider: slot.provider.id().to_string(),
            message: format!("failed to spawn provider thread: {e}"),
        }));
    }

    let deadline = Instant::now() + slot.timeout;
    loop {
        if cancel.is_cancelled() {
            return CallOutcome::Cancelled;
        }
        let now = Instant::now();
        if now >= deadline {
            return CallOutcome::TimedOut;
        }
        match rx.recv_timeout((deadline - now).min(CANCEL_POLL_INTERVAL)) {
            Ok(_) if cancel.is_cancelled() => return CallOutcome::Cancelled,
            Ok(result) => return CallOutcome::Completed(result),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return CallOutcome::Completed(Err(ProviderError::Connection {
                    provider: slot.provider.id().to_string(),
                    message: "provider thread ended without a result".into(),
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::providers::ScriptedProvider;

    fn slot(provider: ScriptedProvider) -> (Arc<ScriptedProvider>, ProviderSlot) {
        let provider = Arc::new(provider);
        let slot = ProviderSlot::new(provider.clone(), Duration::from_secs(2));
        (provider, slot)
    }

    #[test]
    fn third_provider_answers_after_two_failures() {
        let (primary, s1) = slot(ScriptedProvider::unreachable("primary"));
        let (secondary, s2) = slot(ScriptedProvider::new("secondary").then_fail(
            ProviderError::Http {
                provider: "secondary".into(),
                status: 500,
                body: "overloaded".into(),
            },
        ));
        let (tertiary, s3) = slot(ScriptedProvider::always("tertiary", "{\"ok\":true}"));

        let orchestrator = FailoverOrchestrator::new(vec![s1, s2, s3]);
        let result = orchestrator
            .invoke_with_fallback("prompt", &CancelToken::new())
            .unwrap();

        assert_eq!(result.provider_id, "tertiary");
        assert_eq!(result.model_id, "tertiary-scripted");
        assert_eq!(result.content, "{\"ok\":true}");
        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.failures[0].provider(), "primary");
        assert_eq!(result.failures[1].provider(), "secondary");
        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.call_count(), 1);
        assert_eq!(tertiary.call_count(), 1);
    }

    #[test]
    fn first_success_stops_the_chain() {
        let (_, s1) = slot(ScriptedProvider::always("primary", "answer"));
        let (secondary, s2) = slot(ScriptedProvider::always("secondary", "unused"));

        let orchestrator = FailoverOrchestrator::new(vec![s1, s2]);
        let result = orchestrator
            .invoke_with_fallback("prompt", &CancelToken::new())
            .unwrap();

        assert_eq!(result.provider_id, "primary");
        assert!(result.failures.is_empty());
        assert_eq!(secondary.call_count(), 0);
    }

    #[test]
    fn all_failing_is_exhausted_without_retrying_same_provider() {
        let (p1, s1) = slot(ScriptedProvider::unreachable("primary"));
        let (p2, s2) = slot(ScriptedProvider::unreachable("secondary"));

        let orchestrator = FailoverOrchestrator::new(vec![s1, s2]);
        let err = orchestrator
            .invoke_with_fallback("prompt", &CancelToken::new())
            .unwrap_err();

        match err {
            FailoverError::AllProvidersExhausted { failures } => {
                assert_eq!(failures.len(), 2);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(p1.call_count(), 1);
        assert_eq!(p2.call_count(), 1);
    }

    #[test]
    fn empty_order_is_rejected() {
        let orchestrator = FailoverOrchestrator::new(vec![]);
        let err = orchestrator
            .invoke_with_fallback("prompt", &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, FailoverError::NoProvidersConfigured));
    }

    #[test]
    fn slow_provider_times_out_and_chain_advances() {
        let slow = Arc::new(
            ScriptedProvider::always("primary", "late").with_delay(Duration::from_millis(500)),
        );
        let s1 = ProviderSlot::new(slow.clone(), Duration::from_millis(50));
        let (_, s2) = slot(ScriptedProvider::always("secondary", "on time"));

        let orchestrator = FailoverOrchestrator::new(vec![s1, s2]);
        let started = Instant::now();
        let result = orchestrator
            .invoke_with_fallback("prompt", &CancelToken::new())
            .unwrap();

        assert_eq!(result.provider_id, "secondary");
        assert_eq!(result.content, "on time");
        assert!(matches!(result.failures[0], ProviderError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(450));
    }

    #[test]
    fn cancellation_discards_in_flight_call() {
        let slow = Arc::new(
            ScriptedProvider::always("primary", "late").with_delay(Duration::from_millis(400)),
        );
        let orchestrator =
            FailoverOrchestrator::new(vec![ProviderSlot::new(slow.clone(), Duration::from_secs(5))]);

        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let started = Instant::now();
        let err = orchestrator.invoke_with_fallback("prompt", &cancel).unwrap_err();
        handle.join().unwrap();

        assert!(matches!(err, FailoverError::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(350));
        assert_eq!(slow.call_count(), 1);
    }

    #[test]
    fn pre_cancelled_token_calls_nothing() {
        let (provider, s1) = slot(ScriptedProvider::always("primary", "x"));
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = FailoverOrchestrator::new(vec![s1])
            .invoke_with_fallback("prompt", &cancel)
            .unwrap_err();
        assert!(matches!(err, FailoverError::Cancelled));
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn provider_ids_preserve_order() {
        let (_, s1) = slot(ScriptedProvider::new("primary"));
        let (_, s2) = slot(ScriptedProvider::new("secondary"));
        let orchestrator = FailoverOrchestrator::new(vec![s1, s2]);
        assert_eq!(orchestrator.provider_ids(), vec!["primary", "secondary"]);
    }
}
