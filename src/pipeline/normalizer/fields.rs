use serde_json::{Map, Value};

use super::NormalizeError;
use crate::models::{ValidationStatus, MAX_COMPLIANCE_SCORE, MIN_COMPLIANCE_SCORE};

/// Canonical verdict key, followed by the aliases models drift to.
pub(super) type SynonymTable = &'static [(&'static str, &'static [&'static str])];

pub(super) const VERDICT_KEYS: SynonymTable = &[
    ("validationStatus", &["status", "validation_status"]),
    ("complianceScore", &["score", "compliance_score"]),
    ("feedback", &["feedback_text"]),
    (
        "diagnosisCodes",
        &[
            "suggestedICD10Codes",
            "suggestedIcd10Codes",
            "icd10Codes",
            "diagnosis_codes",
        ],
    ),
    (
        "procedureCodes",
        &["suggestedCPTCodes", "cptCodes", "procedure_codes"],
    ),
    ("internalReasoning", &["internal_reasoning", "reasoning"]),
];

pub(super) const CODE_KEYS: SynonymTable = &[("isPrimary", &["is_primary", "primary"])];

/// Rewrite aliased keys to their canonical names.
///
/// A canonical key beats any alias; among aliases the table order decides.
/// Every alias that loses is reported. Keys outside the table pass through.
pub(super) fn canonicalize_keys(
    object: &Map<String, Value>,
    table: SynonymTable,
    scope: &str,
    warnings: &mut Vec<String>,
) -> Map<String, Value> {
    let mut out: Map<String, Value> = object
        .iter()
        .filter(|(key, _)| !table.iter().any(|(_, aliases)| aliases.iter().any(|a| *a == key.as_str())))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (canonical, aliases) in table {
        let mut winner = object.contains_key(*canonical).then_some(*canonical);
        for alias in aliases.iter().filter(|a| object.contains_key(**a)) {
            match winner {
                Some(kept) => warnings.push(format!(
                    "{scope}: ignored '{alias}' because '{kept}' is also present"
                )),
                None => {
                    winner = Some(*alias);
                    if let Some(value) = object.get(*alias) {
                        out.insert((*canonical).to_string(), value.clone());
                    }
                }
            }
        }
    }
    out
}

/// Plain-text rendering of a scalar; `None` for null, arrays and objects.
pub(super) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(super) fn parse_status(value: Option<&Value>) -> Result<ValidationStatus, NormalizeError> {
    let raw = match value {
        None | Some(Value::Null) => {
            return Err(NormalizeError::IncompleteVerdict(
                "missing validationStatus".into(),
            ))
        }
        Some(Value::String(s)) => s.as_str(),
        Some(other) => return Err(NormalizeError::InvalidStatus(other.to_string())),
    };

    let key: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect();

    ValidationStatus::all()
        .iter()
        .copied()
        .find(|status| status.as_str() == key)
        .ok_or_else(|| NormalizeError::InvalidStatus(raw.to_string()))
}

pub(super) fn parse_score(
    value: Option<&Value>,
    warnings: &mut Vec<String>,
) -> Result<u8, NormalizeError> {
    let number = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
    .ok_or_else(|| {
        NormalizeError::IncompleteVerdict(match value {
            None | Some(Value::Null) => "missing complianceScore".to_string(),
            Some(other) => format!("complianceScore is not numeric: {other}"),
        })
    })?;

    let rounded = number.round();
    if rounded != number {
        warnings.push(format!("complianceScore {number} rounded to {rounded}"));
    }

    let (min, max) = (f64::from(MIN_COMPLIANCE_SCORE), f64::from(MAX_COMPLIANCE_SCORE));
    if rounded < min {
        warnings.push(format!("complianceScore {rounded} clamped to {MIN_COMPLIANCE_SCORE}"));
        Ok(MIN_COMPLIANCE_SCORE)
    } else if rounded > max {
        warnings.push(format!("complianceScore {rounded} clamped to {MAX_COMPLIANCE_SCORE}"));
        Ok(MAX_COMPLIANCE_SCORE)
    } else {
        Ok(rounded as u8)
    }
}

pub(super) fn parse_feedback(
    value: Option<&Value>,
    word_limit: u32,
    warnings: &mut Vec<String>,
) -> String {
    let feedback = match value.and_then(scalar_text) {
        Some(text) => text,
        None => {
            warnings.push("feedback missing; left empty".to_string());
            return String::new();
        }
    };

    let words = feedback.split_whitespace().count();
    if word_limit > 0 && words > word_limit as usize {
        warnings.push(format!(
            "feedback has {words} words, over the {word_limit}-word limit"
        ));
    }
    feedback
}
