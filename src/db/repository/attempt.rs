use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::{TokenUsage, ValidationAttempt, ValidationVerdict};

pub fn insert_attempt(conn: &Connection, attempt: &ValidationAttempt) -> Result<(), DatabaseError> {
    let verdict_json = attempt
        .verdict
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let warnings_json = serde_json::to_string(&attempt.warnings)?;
    let usage = attempt.usage.unwrap_or_default();

    conn.execute(
        "INSERT INTO validation_attempts (
            id, session_id, round, attempt, template_id, template_version,
            provider_id, model_id, prompt, raw_response, status, verdict_json,
            error_kind, error_message, warnings_json, prompt_tokens, completion_tokens,
            latency_ms, recorded_at, physician_id, organization_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        params![
            attempt.id.to_string(),
            attempt.session_id.to_string(),
            attempt.round,
            attempt.attempt,
            attempt.template_id.to_string(),
            attempt.template_version,
            attempt.provider_id,
            attempt.model_id,
            attempt.prompt,
            attempt.raw_response,
            attempt.verdict.as_ref().map(|v| v.status.as_str()),
            verdict_json,
            attempt.error_kind,
            attempt.error_message,
            warnings_json,
            usage.prompt_tokens,
            usage.completion_tokens,
            i64::try_from(attempt.latency_ms).unwrap_or(i64::MAX),
            attempt.recorded_at.to_rfc3339(),
            attempt.physician_id,
            attempt.organization_id,
        ],
    )?;
    Ok(())
}

/// All attempts for a session, in round/attempt order.
pub fn get_attempts_by_session(
    conn: &Connection,
    session_id: &Uuid,
) -> Result<Vec<ValidationAttempt>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, round, attempt, template_id, template_version,
                provider_id, model_id, prompt, raw_response, verdict_json,
                error_kind, error_message, warnings_json, prompt_tokens, completion_tokens,
                latency_ms, recorded_at, physician_id, organization_id
         FROM validation_attempts WHERE session_id = ?1
         ORDER BY round, attempt",
    )?;

    let rows = stmt.query_map(params![session_id.to_string()], |row| {
        Ok(AttemptRow {
            id: row.get(0)?,
            session_id: row.get(1)?,
            round: row.get(2)?,
            attempt: row.get(3)?,
            template_id: row.get(4)?,
            template_version: row.get(5)?,
            provider_id: row.get(6)?,
            model_id: row.get(7)?,
            prompt: row.get(8)?,
            raw_response: row.get(9)?,
            verdict_json: row.get(10)?,
            error_kind: row.get(11)?,
            error_message: row.get(12)?,
            warnings_json: row.get(13)?,
            prompt_tokens: row.get(14)?,
            completion_tokens: row.get(15)?,
            latency_ms: row.get(16)?,
            recorded_at: row.get(17)?,
            physician_id: row.get(18)?,
            organization_id: row.get(19)?,
        })
    })?;

    let mut attempts = Vec::new();
    for row in rows {
        attempts.push(attempt_from_row(row?)?);
    }
    Ok(attempts)
}

struct AttemptRow {
    id: String,
    session_id: String,
    round: u32,
    attempt: u32,
    template_id: String,
    template_version: String,
    provider_id: Option<String>,
    model_id: Option<String>,
    prompt: String,
    raw_response: Option<String>,
    verdict_json: Option<String>,
    error_kind: Option<String>,
    error_message: Option<String>,
    warnings_json: String,
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    latency_ms: i64,
    recorded_at: String,
    physician_id: Option<String>,
    organization_id: Option<String>,
}

fn parse_uuid(value: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(value).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

fn attempt_from_row(row: AttemptRow) -> Result<ValidationAttempt, DatabaseError> {
    let verdict: Option<ValidationVerdict> = row
        .verdict_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    let usage = match (row.prompt_tokens, row.completion_tokens) {
        (None, None) => None,
        (prompt_tokens, completion_tokens) => Some(TokenUsage {
            prompt_tokens,
            completion_tokens,
        }),
    };
    let recorded_at = DateTime::parse_from_rfc3339(&row.recorded_at)
        .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?
        .with_timezone(&Utc);

    Ok(ValidationAttempt {
        id: parse_uuid(&row.id)?,
        session_id: parse_uuid(&row.session_id)?,
        round: row.round,
        attempt: row.attempt,
        template_id: parse_uuid(&row.template_id)?,
        template_version: row.template_version,
        provider_id: row.provider_id,
        model_id: row.model_id,
        prompt: row.prompt,
        raw_response: row.raw_response,
        verdict,
        error_kind: row.error_kind,
        error_message: row.error_message,
        warnings: serde_json::from_str(&row.warnings_json)?,
        usage,
        latency_ms: u64::try_from(row.latency_ms).unwrap_or(0),
        recorded_at,
        physician_id: row.physician_id,
        organization_id: row.organization_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use crate::models::{DiagnosisCode, ProcedureCode, ValidationStatus};

    fn make_attempt(session_id: Uuid, round: u32, attempt: u32) -> ValidationAttempt {
        ValidationAttempt {
            id: Uuid::new_v4(),
            session_id,
            round,
            attempt,
            template_id: Uuid::new_v4(),
            template_version: "1.0.0".into(),
            provider_id: Some("secondary".into()),
            model_id: Some("gpt-4o-mini".into()),
            prompt: "Evaluate: MRI brain".into(),
            raw_response: Some("{...}".into()),
            verdict: Some(ValidationVerdict {
                status: ValidationStatus::Appropriate,
                compliance_score: 8,
                feedback: "Meets criteria.".into(),
                diagnosis_codes: vec![DiagnosisCode {
                    code: "G43.909".into(),
                    description: "Migraine".into(),
                    is_primary: true,
                }],
                procedure_codes: vec![ProcedureCode {
                    code: "70551".into(),
                    description: "MRI brain without contrast".into(),
                }],
                internal_reasoning: "Red flags present.".into(),
            }),
            error_kind: None,
            error_message: None,
            warnings: vec!["Primary diagnosis repaired".into()],
            usage: Some(TokenUsage {
                prompt_tokens: Some(812),
                completion_tokens: Some(240),
            }),
            latency_ms: 1830,
            recorded_at: Utc::now(),
            physician_id: Some("dr-1".into()),
            organization_id: Some("org-1".into()),
        }
    }

    #[test]
    fn insert_and_read_back_attempt() {
        let conn = open_memory_database().unwrap();
        let session_id = Uuid::new_v4();
        let attempt = make_attempt(session_id, 0, 1);
        insert_attempt(&conn, &attempt).unwrap();

        let stored = get_attempts_by_session(&conn, &session_id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, attempt.id);
        assert_eq!(stored[0].verdict, attempt.verdict);
        assert_eq!(stored[0].warnings, attempt.warnings);
        assert_eq!(stored[0].usage, attempt.usage);
        assert_eq!(stored[0].recorded_at.timestamp(), attempt.recorded_at.timestamp());
    }

    #[test]
    fn failed_attempt_round_trips_without_verdict() {
        let conn = open_memory_database().unwrap();
        let session_id = Uuid::new_v4();
        let mut attempt = make_attempt(session_id, 0, 1);
        attempt.verdict = None;
        attempt.provider_id = None;
        attempt.raw_response = None;
        attempt.usage = None;
        attempt.error_kind = Some("all_providers_exhausted".into());
        attempt.error_message = Some("every provider failed".into());
        insert_attempt(&conn, &attempt).unwrap();

        let stored = get_attempts_by_session(&conn, &session_id).unwrap();
        assert!(!stored[0].succeeded());
        assert!(stored[0].usage.is_none());
        assert_eq!(stored[0].error_kind.as_deref(), Some("all_providers_exhausted"));
    }

    #[test]
    fn attempts_ordered_by_round_then_attempt() {
        let conn = open_memory_database().unwrap();
        let session_id = Uuid::new_v4();
        insert_attempt(&conn, &make_attempt(session_id, 1, 1)).unwrap();
        insert_attempt(&conn, &make_attempt(session_id, 0, 2)).unwrap();
        insert_attempt(&conn, &make_attempt(session_id, 0, 1)).unwrap();
        insert_attempt(&conn, &make_attempt(Uuid::new_v4(), 0, 1)).unwrap();

        let stored = get_attempts_by_session(&conn, &session_id).unwrap();
        let order: Vec<(u32, u32)> = stored.iter().map(|a| (a.round, a.attempt)).collect();
        assert_eq!(order, vec![(0, 1), (0, 2), (1, 1)]);
    }
}
