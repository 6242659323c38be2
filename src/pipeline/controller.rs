//! Validation session controller: the clarification loop.
//!
//! One round: render the pinned template, invoke providers with failover,
//! normalize. Malformed responses are retried within the round; every
//! attempt is recorded. A `needs_clarification` verdict parks the session
//! until the caller supplies more text, up to the clarification cap.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::context::{build_database_context, CodingContextSource};
use super::failover::{CancelToken, FailoverError, FailoverOrchestrator, ProviderResult};
use super::normalizer::{normalize_response, NormalizeError};
use super::prompt_templates::{render_prompt, TemplateError, TemplateResolver};
use super::recorder::AttemptRecorder;
use super::session::{SessionError, SessionRegistry, SessionState, ValidationSession};
use crate::models::{ValidationAttempt, ValidationRequest, ValidationVerdict};

pub const DEFAULT_MAX_CLARIFICATION_ROUNDS: u32 = 2;
pub const DEFAULT_MAX_RESPONSE_RETRIES: u32 = 2;
pub const DEFAULT_SESSION_IDLE_TIMEOUT_SECS: u64 = 30 * 60;

/// Loop bounds for a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    /// Clarification rounds allowed before a `needs_clarification` verdict
    /// is returned as final.
    pub max_clarification_rounds: u32,
    /// Extra provider calls within a round after a malformed response.
    pub max_response_retries: u32,
    pub session_idle_timeout_secs: u64,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_clarification_rounds: DEFAULT_MAX_CLARIFICATION_ROUNDS,
            max_response_retries: DEFAULT_MAX_RESPONSE_RETRIES,
            session_idle_timeout_secs: DEFAULT_SESSION_IDLE_TIMEOUT_SECS,
        }
    }
}

impl SessionPolicy {
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

/// Stable, serializable error category for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    NoActiveTemplate,
    TemplateStore,
    NoProvidersConfigured,
    AllProvidersExhausted,
    UnparsableResponse,
    InvalidStatus,
    IncompleteVerdict,
    UnknownSession,
    NotAwaitingClarification,
    SessionBusy,
    EmptyClarification,
    Cancelled,
    Internal,
}

impl ValidationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoActiveTemplate => "no_active_template",
            Self::TemplateStore => "template_store",
            Self::NoProvidersConfigured => "no_providers_configured",
            Self::AllProvidersExhausted => "all_providers_exhausted",
            Self::UnparsableResponse => "unparsable_response",
            Self::InvalidStatus => "invalid_status",
            Self::IncompleteVerdict => "incomplete_verdict",
            Self::UnknownSession => "unknown_session",
            Self::NotAwaitingClarification => "not_awaiting_clarification",
            Self::SessionBusy => "session_busy",
            Self::EmptyClarification => "empty_clarification",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("No LLM providers configured")]
    NoProvidersConfigured,

    #[error("All LLM providers failed: {}", summarize_failures(.failures))]
    AllProvidersExhausted {
        failures: Vec<super::providers::ProviderError>,
    },

    #[error(transparent)]
    Response(#[from] NormalizeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Validation cancelled by caller")]
    Cancelled,

    #[error("Session registry lock poisoned")]
    LockPoisoned,
}

impl From<FailoverError> for ValidationError {
    fn from(err: FailoverError) -> Self {
        match err {
            FailoverError::NoProvidersConfigured => Self::NoProvidersConfigured,
            FailoverError::AllProvidersExhausted { failures } => {
                Self::AllProvidersExhausted { failures }
            }
            FailoverError::Cancelled => Self::Cancelled,
        }
    }
}

impl ValidationError {
    pub fn kind(&self) -> ValidationErrorKind {
        match self {
            Self::Template(TemplateError::NoActiveTemplate { .. }) => {
                ValidationErrorKind::NoActiveTemplate
            }
            Self::Template(_) => ValidationErrorKind::TemplateStore,
            Self::NoProvidersConfigured => ValidationErrorKind::NoProvidersConfigured,
            Self::AllProvidersExhausted { .. } => ValidationErrorKind::AllProvidersExhausted,
            Self::Response(NormalizeError::UnparsableResponse(_)) => {
                ValidationErrorKind::UnparsableResponse
            }
            Self::Response(NormalizeError::InvalidStatus(_)) => ValidationErrorKind::InvalidStatus,
            Self::Response(NormalizeError::IncompleteVerdict(_)) => {
                ValidationErrorKind::IncompleteVerdict
            }
            Self::Session(SessionError::UnknownSession(_)) => ValidationErrorKind::UnknownSession,
            Self::Session(SessionError::NotAwaitingClarification { .. }) => {
                ValidationErrorKind::NotAwaitingClarification
            }
            Self::Session(SessionError::RoundInProgress(_)) => ValidationErrorKind::SessionBusy,
            Self::Session(SessionError::EmptyClarification) => {
                ValidationErrorKind::EmptyClarification
            }
            Self::Session(SessionError::InvalidTransition { .. }) | Self::LockPoisoned => {
                ValidationErrorKind::Internal
            }
            Self::Cancelled => ValidationErrorKind::Cancelled,
        }
    }
}

fn summarize_failures(failures: &[super::providers::ProviderError]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// ═══════════════════════════════════════════════════════════
// Outcome
// ═══════════════════════════════════════════════════════════

/// Result of one completed round, handed to the caller by value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationOutcome {
    pub session_id: Uuid,
    pub verdict: ValidationVerdict,
    /// `finalized` or `awaiting_clarification`.
    pub state: SessionState,
    pub clarification_rounds_used: u32,
    /// Set when the clarification cap forced a `needs_clarification`
    /// verdict to be final.
    pub requires_human_review: bool,
    pub provider_id: String,
    pub model_id: String,
    pub template_version: String,
    pub warnings: Vec<String>,
}

impl ValidationOutcome {
    pub fn is_final(&self) -> bool {
        self.state == SessionState::Finalized
    }
}

/// Successful round before the session decides what comes next.
struct RoundResult {
    verdict: ValidationVerdict,
    warnings: Vec<String>,
    provider_id: String,
    model_id: String,
}

// ═══════════════════════════════════════════════════════════
// Controller
// ═══════════════════════════════════════════════════════════

pub struct ValidationController {
    resolver: TemplateResolver,
    coding_context: Arc<dyn CodingContextSource>,
    orchestrator: FailoverOrchestrator,
    recorder: Arc<dyn AttemptRecorder>,
    policy: SessionPolicy,
    sessions: Mutex<SessionRegistry>,
}

impl ValidationController {
    pub fn new(
        resolver: TemplateResolver,
        coding_context: Arc<dyn CodingContextSource>,
        orchestrator: FailoverOrchestrator,
        recorder: Arc<dyn AttemptRecorder>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            resolver,
            coding_context,
            orchestrator,
            recorder,
            sessions: Mutex::new(SessionRegistry::new(policy.session_idle_timeout())),
            policy,
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Start a session and run its initial round.
    pub fn validate(&self, request: ValidationRequest) -> Result<ValidationOutcome, ValidationError> {
        self.validate_with_cancel(request, &CancelToken::new())
    }

    pub fn validate_with_cancel(
        &self,
        request: ValidationRequest,
        cancel: &CancelToken,
    ) -> Result<ValidationOutcome, ValidationError> {
        self.evict_idle_sessions();

        let session_id = Uuid::new_v4();
        let _span = tracing::info_span!("validation_session", %session_id).entered();
        tracing::info!(
            dictation_len = request.dictation_text.len(),
            specialty = request.specialty.as_deref().unwrap_or("default"),
            "Validation requested"
        );

        // Resolved once; every round of this session uses the same template.
        let template = self.resolver.resolve(request.specialty.as_deref())?;
        let mut session = ValidationSession::new(session_id, request, template);

        let result = self.run_round(&mut session, cancel)?;
        self.settle(session, result)
    }

    /// Append clarification text to a parked session and run the next round.
    pub fn continue_with_clarification(
        &self,
        session_id: &Uuid,
        supplemental_text: &str,
    ) -> Result<ValidationOutcome, ValidationError> {
        self.continue_with_clarification_with_cancel(session_id, supplemental_text, &CancelToken::new())
    }

    pub fn continue_with_clarification_with_cancel(
        &self,
        session_id: &Uuid,
        supplemental_text: &str,
        cancel: &CancelToken,
    ) -> Result<ValidationOutcome, ValidationError> {
        if supplemental_text.trim().is_empty() {
            return Err(SessionError::EmptyClarification.into());
        }
        self.evict_idle_sessions();

        let _span = tracing::info_span!("validation_session", session_id = %session_id).entered();

        let mut session = self.lock_sessions()?.check_out(session_id)?;
        let snapshot = session.clone();

        if let Err(e) = session.append_clarification(supplemental_text) {
            self.lock_sessions()?.park(snapshot);
            return Err(e.into());
        }
        tracing::info!(
            round = session.round(),
            supplemental_len = supplemental_text.len(),
            "Clarification received"
        );

        match self.run_round(&mut session, cancel) {
            Ok(result) => self.settle(session, result).inspect_err(|_| {
                if let Ok(mut registry) = self.sessions.lock() {
                    registry.release(session_id);
                }
            }),
            Err(ValidationError::Cancelled) => {
                // Nothing from the abandoned round is applied.
                self.lock_sessions()?.park(snapshot);
                Err(ValidationError::Cancelled)
            }
            Err(e) => {
                self.lock_sessions()?.release(session_id);
                Err(e)
            }
        }
    }

    /// Drop parked sessions idle past the policy timeout.
    pub fn evict_idle_sessions(&self) -> usize {
        match self.sessions.lock() {
            Ok(mut registry) => registry.evict_idle(),
            Err(_) => {
                tracing::error!("Session registry lock poisoned; skipping eviction");
                0
            }
        }
    }

    pub fn session_state(&self, session_id: &Uuid) -> Option<SessionState> {
        self.sessions.lock().ok()?.state_of(session_id)
    }

    fn lock_sessions(&self) -> Result<MutexGuard<'_, SessionRegistry>, ValidationError> {
        self.sessions.lock().map_err(|_| ValidationError::LockPoisoned)
    }

    /// Apply a round's verdict to the session and park it.
    fn settle(
        &self,
        mut session: ValidationSession,
        result: RoundResult,
    ) -> Result<ValidationOutcome, ValidationError> {
        let status = result.verdict.status;
        session.record_verdict(result.verdict.clone())?;

        let mut requires_human_review = false;
        if status.is_terminal() {
            session.finalize()?;
        } else if session.clarification_rounds() >= self.policy.max_clarification_rounds {
            tracing::warn!(
                session_id = %session.id(),
                rounds = session.clarification_rounds(),
                "Clarification cap reached; returning needs_clarification as final"
            );
            session.finalize()?;
            requires_human_review = true;
        } else {
            session.await_clarification()?;
        }

        let outcome = ValidationOutcome {
            session_id: session.id(),
            verdict: result.verdict,
            state: session.state(),
            clarification_rounds_used: session.clarification_rounds(),
            requires_human_review,
            provider_id: result.provider_id,
            model_id: result.model_id,
            template_version: session.template().version.to_string(),
            warnings: result.warnings,
        };

        tracing::info!(
            status = %status,
            state = %outcome.state,
            score = outcome.verdict.compliance_score,
            provider = %outcome.provider_id,
            "Validation round complete"
        );

        self.lock_sessions()?.park(session);
        Ok(outcome)
    }

    /// Run one round, retrying malformed responses up to the policy limit.
    fn run_round(
        &self,
        session: &mut ValidationSession,
        cancel: &CancelToken,
    ) -> Result<RoundResult, ValidationError> {
        let _span = tracing::info_span!("validation_round", round = session.round()).entered();

        let snippet = self.coding_context.relevant_context(session.accumulated_dictation());
        let database_context = build_database_context(&session.request().patient, &snippet);
        let prompt = render_prompt(session.template(), session.accumulated_dictation(), &database_context);
        let word_limit = session.template().word_limit;
        let max_attempts = self.policy.max_response_retries + 1;

        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(ValidationError::Cancelled);
            }

            let started = Instant::now();
            let mut record = new_attempt(session, attempt, &prompt);

            let response = match self.orchestrator.invoke_with_fallback(&prompt, cancel) {
                Ok(response) => response,
                Err(e) => {
                    let err = ValidationError::from(e);
                    record.error_kind = Some(err.kind().as_str().to_string());
                    record.error_message = Some(err.to_string());
                    record.latency_ms = elapsed_ms(started);
                    self.record_attempt(&record);
                    return Err(err);
                }
            };

            apply_response(&mut record, &response);

            match normalize_response(&response.content, word_limit) {
                Ok(normalized) => {
                    record.verdict = Some(normalized.verdict.clone());
                    record.warnings = normalized.warnings.clone();
                    record.latency_ms = elapsed_ms(started);
                    self.record_attempt(&record);
                    return Ok(RoundResult {
                        verdict: normalized.verdict,
                        warnings: normalized.warnings,
                        provider_id: response.provider_id,
                        model_id: response.model_id,
                    });
                }
                Err(e) => {
                    record.error_kind = Some(e.kind().to_string());
                    record.error_message = Some(e.to_string());
                    record.latency_ms = elapsed_ms(started);
                    self.record_attempt(&record);

                    if attempt >= max_attempts {
                        tracing::error!(attempt, error = %e, "Malformed response; retries exhausted");
                        return Err(e.into());
                    }
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        provider = %response.provider_id,
                        error = %e,
                        "Malformed response, retrying"
                    );
                }
            }
        }
    }

    fn record_attempt(&self, attempt: &ValidationAttempt) {
        if let Err(e) = self.recorder.record(attempt) {
            tracing::warn!(
                attempt_id = %attempt.id,
                error = %e,
                "Failed to record validation attempt"
            );
        }
    }
}

fn new_attempt(session: &ValidationSession, attempt: u32, prompt: &str) -> ValidationAttempt {
    let request = session.request();
    ValidationAttempt {
        id: Uuid::new_v4(),
        session_id: session.id(),
        round: session.round(),
        attempt,
        template_id: session.template().id,
        template_version: session.template().version.to_string(),
        provider_id: None,
        model_id: None,
        prompt: prompt.to_string(),
        raw_response: None,
        verdict: None,
        error_kind: None,
        error_message: None,
        warnings: Vec::new(),
        usage: None,
        latency_ms: 0,
        recorded_at: Utc::now(),
        physician_id: request.physician_id.clone(),
        organization_id: request.organization_id.clone(),
    }
}

fn apply_response(record: &mut ValidationAttempt, response: &ProviderResult) {
    record.provider_id = Some(response.provider_id.clone());
    record.model_id = Some(response.model_id.clone());
    record.raw_response = Some(response.content.clone());
    record.usage = response.usage;
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
