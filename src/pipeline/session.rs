//! Validation sessions and the per-controller session registry.
//!
//! A session pins the template resolved at its start and accumulates the
//! dictation across clarification rounds. The registry hands a session out
//! for exactly one round at a time.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{PromptTemplate, ValidationRequest, ValidationVerdict};

/// Label placed before caller-supplied clarification text.
pub const CLARIFICATION_LABEL: &str = "Additional clinical information:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Unknown or expired validation session: {0}")]
    UnknownSession(Uuid),

    #[error("Session {id} is {state}, not awaiting clarification")]
    NotAwaitingClarification { id: Uuid, state: SessionState },

    #[error("Session {0} already has a round in progress")]
    RoundInProgress(Uuid),

    #[error("Clarification text is empty")]
    EmptyClarification,

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

// ═══════════════════════════════════════════════════════════
// State machine
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initial,
    Evaluated,
    AwaitingClarification,
    Finalized,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Evaluated => "evaluated",
            Self::AwaitingClarification => "awaiting_clarification",
            Self::Finalized => "finalized",
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Initial, Self::Evaluated)
                | (Self::AwaitingClarification, Self::Evaluated)
                | (Self::Evaluated, Self::Finalized)
                | (Self::Evaluated, Self::AwaitingClarification)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════
// Session
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ValidationSession {
    id: Uuid,
    request: ValidationRequest,
    template: PromptTemplate,
    accumulated_dictation: String,
    state: SessionState,
    round: u32,
    clarification_rounds: u32,
    last_verdict: Option<ValidationVerdict>,
    last_activity: Instant,
}

impl ValidationSession {
    pub fn new(id: Uuid, request: ValidationRequest, template: PromptTemplate) -> Self {
        Self {
            id,
            accumulated_dictation: request.dictation_text.clone(),
            request,
            template,
            state: SessionState::Initial,
            round: 0,
            clarification_rounds: 0,
            last_verdict: None,
            last_activity: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request(&self) -> &ValidationRequest {
        &self.request
    }

    /// Template pinned at session start.
    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    /// Original dictation plus every clarification, in order.
    pub fn accumulated_dictation(&self) -> &str {
        &self.accumulated_dictation
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 0 for the initial evaluation, then one per clarification.
    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn clarification_rounds(&self) -> u32 {
        self.clarification_rounds
    }

    pub fn last_verdict(&self) -> Option<&ValidationVerdict> {
        self.last_verdict.as_ref()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(session_id = %self.id, from = %self.state, to = %next, "Session transition");
        self.state = next;
        Ok(())
    }

    pub fn record_verdict(&mut self, verdict: ValidationVerdict) -> Result<(), SessionError> {
        self.transition(SessionState::Evaluated)?;
        self.last_verdict = Some(verdict);
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Finalized)
    }

    pub fn await_clarification(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::AwaitingClarification)
    }

    /// Append caller-supplied text and open the next round.
    ///
    /// Text is appended, never substituted: the original dictation stays a
    /// prefix of the accumulated dictation.
    pub fn append_clarification(&mut self, supplemental_text: &str) -> Result<(), SessionError> {
        if self.state != SessionState::AwaitingClarification {
            return Err(SessionError::NotAwaitingClarification {
                id: self.id,
                state: self.state,
            });
        }
        let text = supplemental_text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyClarification);
        }

        if self.accumulated_dictation.is_empty() {
            self.accumulated_dictation = format!("{CLARIFICATION_LABEL} {text}");
        } else {
            self.accumulated_dictation
                .push_str(&format!("\n\n{CLARIFICATION_LABEL} {text}"));
        }
        self.clarification_rounds += 1;
        self.round += 1;
        self.touch();
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════

enum Slot {
    Parked(ValidationSession),
    /// Checked out for a round since the given instant.
    InRound(Instant),
}

/// Sessions between rounds, keyed by id.
///
/// `check_out` leaves an in-round marker so a second caller cannot run a
/// concurrent round on the same session. A marker older than the idle
/// timeout belongs to a round that never returned and is evicted.
pub struct SessionRegistry {
    slots: HashMap<Uuid, Slot>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            slots: HashMap::new(),
            idle_timeout,
        }
    }

    /// Store a session between rounds (or after finalization).
    pub fn park(&mut self, mut session: ValidationSession) {
        session.touch();
        self.slots.insert(session.id(), Slot::Parked(session));
    }

    /// Take a session awaiting clarification for one round.
    pub fn check_out(&mut self, id: &Uuid) -> Result<ValidationSession, SessionError> {
        match self.slots.get(id) {
            None => return Err(SessionError::UnknownSession(*id)),
            Some(Slot::InRound(_)) => return Err(SessionError::RoundInProgress(*id)),
            Some(Slot::Parked(session)) if session.state() != SessionState::AwaitingClarification => {
                return Err(SessionError::NotAwaitingClarification {
                    id: *id,
                    state: session.state(),
                });
            }
            Some(Slot::Parked(_)) => {}
        }
        match self.slots.insert(*id, Slot::InRound(Instant::now())) {
            Some(Slot::Parked(session)) => Ok(session),
            _ => Err(SessionError::UnknownSession(*id)),
        }
    }

    /// Drop a checked-out session whose round failed.
    pub fn release(&mut self, id: &Uuid) {
        if matches!(self.slots.get(id), Some(Slot::InRound(_))) {
            self.slots.remove(id);
        }
    }

    /// Remove parked sessions idle longer than the timeout, and in-round
    /// markers checked out longer than the timeout.
    pub fn evict_idle(&mut self) -> usize {
        let now = Instant::now();
        let timeout = self.idle_timeout;
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::Parked(session) => session.idle_for(now) < timeout,
            Slot::InRound(since) => now.duration_since(*since) < timeout,
        });
        let evicted = before - self.slots.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = self.slots.len(), "Evicted idle validation sessions");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state_of(&self, id: &Uuid) -> Option<SessionState> {
        match self.slots.get(id)? {
            Slot::Parked(session) => Some(session.state()),
            Slot::InRound(_) => None,
        }
    }
}
