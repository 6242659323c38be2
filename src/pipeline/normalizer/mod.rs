//! Response normalizer: free-form LLM text to a [`ValidationVerdict`].
//!
//! Tolerates format drift (prose around the JSON, aliased keys, status
//! casing, stringly-typed numbers and flags) and enforces the verdict
//! invariants. Defects that can be repaired locally become warnings;
//! anything else fails the attempt with an explicit error.

mod codes;
mod fields;
mod parser;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::ValidationVerdict;

pub use parser::extract_json_object;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Unparsable response: {0}")]
    UnparsableResponse(String),

    #[error("Invalid validation status: '{0}'")]
    InvalidStatus(String),

    #[error("Incomplete verdict: {0}")]
    IncompleteVerdict(String),
}

impl NormalizeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnparsableResponse(_) => "unparsable_response",
            Self::InvalidStatus(_) => "invalid_status",
            Self::IncompleteVerdict(_) => "incomplete_verdict",
        }
    }
}

/// A verdict plus the data-quality repairs made to obtain it.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedVerdict {
    pub verdict: ValidationVerdict,
    pub warnings: Vec<String>,
}

/// Parse raw provider output into a verdict.
pub fn normalize_response(raw: &str, word_limit: u32) -> Result<NormalizedVerdict, NormalizeError> {
    let object = extract_json_object(raw)?;
    normalize_object(&object, word_limit)
}

/// Normalize an already-parsed JSON value.
pub fn normalize_value(value: &Value, word_limit: u32) -> Result<NormalizedVerdict, NormalizeError> {
    match value {
        Value::Object(object) => normalize_object(object, word_limit),
        other => Err(NormalizeError::UnparsableResponse(format!(
            "expected a JSON object, got {}",
            json_type(other)
        ))),
    }
}

fn normalize_object(
    object: &Map<String, Value>,
    word_limit: u32,
) -> Result<NormalizedVerdict, NormalizeError> {
    let mut warnings = Vec::new();
    let fields = fields::canonicalize_keys(object, fields::VERDICT_KEYS, "verdict", &mut warnings);

    let status = fields::parse_status(fields.get("validationStatus"))?;
    let compliance_score = fields::parse_score(fields.get("complianceScore"), &mut warnings)?;
    let diagnosis_codes = codes::normalize_diagnosis_codes(fields.get("diagnosisCodes"), &mut warnings);
    let procedure_codes = codes::normalize_procedure_codes(fields.get("procedureCodes"), &mut warnings);

    if status.is_terminal() {
        if diagnosis_codes.is_empty() {
            return Err(NormalizeError::IncompleteVerdict(format!(
                "{status} verdict has no diagnosis codes"
            )));
        }
        if procedure_codes.is_empty() {
            return Err(NormalizeError::IncompleteVerdict(format!(
                "{status} verdict has no procedure codes"
            )));
        }
    }

    let feedback = fields::parse_feedback(fields.get("feedback"), word_limit, &mut warnings);
    let internal_reasoning = fields
        .get("internalReasoning")
        .and_then(fields::scalar_text)
        .unwrap_or_default();

    if !warnings.is_empty() {
        tracing::debug!(warnings = warnings.len(), status = %status, "Verdict repaired during normalization");
    }

    Ok(NormalizedVerdict {
        verdict: ValidationVerdict {
            status,
            compliance_score,
            feedback,
            diagnosis_codes,
            procedure_codes,
            internal_reasoning,
        },
        warnings,
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
