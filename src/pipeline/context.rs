//! Coding-database context for the `{{DATABASE_CONTEXT}}` placeholder.
//!
//! The snippet is opaque to the pipeline. Lookup failures degrade to an
//! empty snippet: a prompt without reference codes is still answerable.

use std::collections::BTreeSet;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::db::repository::{search_coding_reference, CodeKind, CodingReference};
use crate::models::PatientContext;

/// Maximum reference rows placed in one prompt.
pub const MAX_CONTEXT_ENTRIES: usize = 12;

const MIN_KEYWORD_LEN: usize = 4;

/// Words too common in dictation to narrow a code search.
const STOPWORDS: &[&str] = &[
    "with", "without", "patient", "history", "this", "that", "from", "have", "been", "year",
    "years", "old", "please", "order", "rule", "evaluate", "evaluation", "study", "since", "over",
    "weeks", "days", "months", "left", "right", "male", "female",
];

pub trait CodingContextSource: Send + Sync {
    fn relevant_context(&self, dictation_text: &str) -> String;
}

/// No coding database available.
pub struct NoCodingContext;

impl CodingContextSource for NoCodingContext {
    fn relevant_context(&self, _dictation_text: &str) -> String {
        String::new()
    }
}

/// Returns the same snippet for every dictation.
pub struct StaticCodingContext(pub String);

impl CodingContextSource for StaticCodingContext {
    fn relevant_context(&self, _dictation_text: &str) -> String {
        self.0.clone()
    }
}

/// Keyword lookup over the `coding_reference` table.
pub struct SqliteCodingContext {
    conn: Mutex<Connection>,
    limit: usize,
}

impl SqliteCodingContext {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            limit: MAX_CONTEXT_ENTRIES,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

impl CodingContextSource for SqliteCodingContext {
    fn relevant_context(&self, dictation_text: &str) -> String {
        let keywords = extract_keywords(dictation_text);
        if keywords.is_empty() {
            return String::new();
        }

        let Ok(conn) = self.conn.lock() else {
            tracing::warn!("Coding reference connection lock poisoned; continuing without context");
            return String::new();
        };

        match search_coding_reference(&conn, &keywords, self.limit) {
            Ok(entries) => {
                tracing::debug!(keywords = keywords.len(), matches = entries.len(), "Coding reference lookup");
                format_reference_snippet(&entries)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Coding reference lookup failed; continuing without context");
                String::new()
            }
        }
    }
}

/// Distinct lowercase search terms from dictation text, in first-seen order.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN)
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !STOPWORDS.iter().any(|s| *s == w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

pub fn format_reference_snippet(entries: &[CodingReference]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let mut out = String::from("Relevant coding reference:");
    for entry in entries {
        let system = match entry.kind {
            CodeKind::Icd10 => "ICD-10",
            CodeKind::Cpt => "CPT",
        };
        out.push_str(&format!("\n- {system} {}: {}", entry.code, entry.description));
    }
    out
}

/// Full `{{DATABASE_CONTEXT}}` value: demographics, then reference codes.
pub fn build_database_context(patient: &PatientContext, coding_snippet: &str) -> String {
    let demographics = patient.demographics_line();
    if coding_snippet.trim().is_empty() {
        demographics
    } else {
        format!("{demographics}\n{coding_snippet}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::upsert_coding_reference;
    use crate::db::sqlite::open_memory_database;

    fn seeded_connection() -> Connection {
        let conn = open_memory_database().unwrap();
        for (code, kind, description) in [
            ("M54.5", CodeKind::Icd10, "Low back pain"),
            ("M54.16", CodeKind::Icd10, "Radiculopathy, lumbar region"),
            ("72148", CodeKind::Cpt, "MRI lumbar spine without contrast"),
            ("70450", CodeKind::Cpt, "CT head without contrast"),
        ] {
            upsert_coding_reference(
                &conn,
                &CodingReference {
                    code: code.into(),
                    kind,
                    description: description.into(),
                },
            )
            .unwrap();
        }
        conn
    }

    #[test]
    fn keywords_skip_short_common_and_numeric_words() {
        let keywords = extract_keywords("MRI of the Lumbar spine, patient with back pain x 6 weeks. Lumbar 2024");
        assert_eq!(keywords, vec!["lumbar", "spine", "back", "pain"]);
    }

    #[test]
    fn sqlite_lookup_formats_matches() {
        let source = SqliteCodingContext::new(seeded_connection());
        let snippet = source.relevant_context("Lumbar radiculopathy, request MRI lumbar spine");

        assert!(snippet.starts_with("Relevant coding reference:"));
        assert!(snippet.contains("CPT 72148: MRI lumbar spine without contrast"));
        assert!(snippet.contains("ICD-10 M54.16"));
        assert!(!snippet.contains("70450"));
    }

    #[test]
    fn no_match_yields_empty_snippet() {
        let source = SqliteCodingContext::new(seeded_connection());
        assert_eq!(source.relevant_context("Ankle fracture follow-up"), "");
        assert_eq!(source.relevant_context(""), "");
    }

    #[test]
    fn limit_caps_entries() {
        let source = SqliteCodingContext::new(seeded_connection()).with_limit(1);
        let snippet = source.relevant_context("lumbar spine contrast");
        assert_eq!(snippet.lines().count(), 2);
    }

    #[test]
    fn database_context_prefixes_demographics() {
        let patient = PatientContext::new("p-1").with_demographics(Some(54), Some("female"));
        let context = build_database_context(&patient, "Relevant coding reference:\n- CPT 1: x");
        assert!(context.starts_with("Patient: 54-year-old female\n"));
        assert_eq!(build_database_context(&patient, ""), "Patient: 54-year-old female");
        assert_eq!(StaticCodingContext("fixed".into()).relevant_context("anything"), "fixed");
        assert_eq!(NoCodingContext.relevant_context("anything"), "");
    }
}
