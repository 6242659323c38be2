//! Attempt recorder: append-only audit of every LLM round trip.

use std::sync::Mutex;

use rusqlite::Connection;
use thiserror::Error;

use crate::db::{repository, DatabaseError};
use crate::models::ValidationAttempt;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Attempt store error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Attempt store lock poisoned")]
    LockPoisoned,
}

pub trait AttemptRecorder: Send + Sync {
    fn record(&self, attempt: &ValidationAttempt) -> Result<(), RecorderError>;
}

/// Writes attempts to the `validation_attempts` table.
pub struct SqliteAttemptRecorder {
    conn: Mutex<Connection>,
}

impl SqliteAttemptRecorder {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn attempts_for_session(
        &self,
        session_id: &uuid::Uuid,
    ) -> Result<Vec<ValidationAttempt>, RecorderError> {
        let conn = self.conn.lock().map_err(|_| RecorderError::LockPoisoned)?;
        Ok(repository::get_attempts_by_session(&conn, session_id)?)
    }
}

impl AttemptRecorder for SqliteAttemptRecorder {
    fn record(&self, attempt: &ValidationAttempt) -> Result<(), RecorderError> {
        let conn = self.conn.lock().map_err(|_| RecorderError::LockPoisoned)?;
        repository::insert_attempt(&conn, attempt)?;
        Ok(())
    }
}

/// Keeps attempts in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct InMemoryAttemptRecorder {
    attempts: Mutex<Vec<ValidationAttempt>>,
}

impl InMemoryAttemptRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> Vec<ValidationAttempt> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl AttemptRecorder for InMemoryAttemptRecorder {
    fn record(&self, attempt: &ValidationAttempt) -> Result<(), RecorderError> {
        self.attempts
            .lock()
            .map_err(|_| RecorderError::LockPoisoned)?
            .push(attempt.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use chrono::Utc;
    use uuid::Uuid;

    fn attempt(session_id: Uuid, attempt: u32) -> ValidationAttempt {
        ValidationAttempt {
            id: Uuid::new_v4(),
            session_id,
            round: 0,
            attempt,
            template_id: Uuid::new_v4(),
            template_version: "1.0.0".into(),
            provider_id: None,
            model_id: None,
            prompt: "prompt".into(),
            raw_response: None,
            verdict: None,
            error_kind: Some("all_providers_exhausted".into()),
            error_message: Some("primary: connection refused".into()),
            warnings: vec![],
            usage: None,
            latency_ms: 3,
            recorded_at: Utc::now(),
            physician_id: None,
            organization_id: None,
        }
    }

    #[test]
    fn sqlite_recorder_appends() {
        let recorder = SqliteAttemptRecorder::new(open_memory_database().unwrap());
        let session = Uuid::new_v4();
        recorder.record(&attempt(session, 1)).unwrap();
        recorder.record(&attempt(session, 2)).unwrap();

        let stored = recorder.attempts_for_session(&session).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].attempt, 2);
        assert!(!stored[0].succeeded());
    }

    #[test]
    fn duplicate_attempt_id_is_rejected() {
        let recorder = SqliteAttemptRecorder::new(open_memory_database().unwrap());
        let a = attempt(Uuid::new_v4(), 1);
        recorder.record(&a).unwrap();
        assert!(matches!(recorder.record(&a), Err(RecorderError::Database(_))));
    }

    #[test]
    fn in_memory_recorder_keeps_order() {
        let recorder = InMemoryAttemptRecorder::new();
        let session = Uuid::new_v4();
        recorder.record(&attempt(session, 1)).unwrap();
        recorder.record(&attempt(session, 2)).unwrap();
        let attempts: Vec<u32> = recorder.attempts().iter().map(|a| a.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
    }
}
