use serde_json::{Map, Value};

use super::fields::{canonicalize_keys, scalar_text, CODE_KEYS};
use crate::models::{DiagnosisCode, ProcedureCode};

/// Words that read as "not primary" when a model sends `isPrimary` as text.
const FALSE_WORDS: &[&str] = &["", "false", "no", "n", "0", "off", "none", "null"];

/// One code entry before list-level repair.
struct RawCode {
    code: String,
    description: String,
    primary: bool,
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => {
            let lowered = s.trim().to_lowercase();
            !FALSE_WORDS.iter().any(|w| *w == lowered)
        }
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

/// Coerce a code list, dropping entries that carry no code.
fn collect_entries(value: Option<&Value>, field: &str, warnings: &mut Vec<String>) -> Vec<RawCode> {
    let entries: Vec<&Value> = match value {
        None | Some(Value::Null) => return vec![],
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single) if matches!(single, Value::Object(_) | Value::String(_)) => {
            warnings.push(format!("{field} was a single entry, not a list"));
            vec![single]
        }
        Some(other) => {
            warnings.push(format!("{field} ignored: expected a list, got {other}"));
            return vec![];
        }
    };

    let mut codes = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let scope = format!("{field}[{index}]");
        let parsed = match entry {
            Value::Object(map) => object_entry(map, &scope, warnings),
            other => scalar_text(other).map(|code| RawCode {
                code: code.trim().to_string(),
                description: String::new(),
                primary: false,
            }),
        };
        match parsed {
            Some(raw) if !raw.code.is_empty() => codes.push(raw),
            _ => warnings.push(format!("{scope} dropped: no code")),
        }
    }
    codes
}

fn object_entry(map: &Map<String, Value>, scope: &str, warnings: &mut Vec<String>) -> Option<RawCode> {
    let map = canonicalize_keys(map, CODE_KEYS, scope, warnings);
    let code = map.get("code").and_then(scalar_text)?.trim().to_string();
    let description = map
        .get("description")
        .and_then(scalar_text)
        .unwrap_or_default()
        .trim()
        .to_string();
    Some(RawCode {
        code,
        description,
        primary: truthy(map.get("isPrimary")),
    })
}

/// Diagnosis codes with exactly one primary when the list is non-empty.
///
/// The first flagged entry keeps the flag; with none flagged the first entry
/// becomes primary. Either repair is reported.
pub(super) fn normalize_diagnosis_codes(
    value: Option<&Value>,
    warnings: &mut Vec<String>,
) -> Vec<DiagnosisCode> {
    let mut raw = collect_entries(value, "diagnosisCodes", warnings);
    if raw.is_empty() {
        return vec![];
    }

    let flagged = raw.iter().filter(|c| c.primary).count();
    let keep = raw.iter().position(|c| c.primary).unwrap_or(0);
    match flagged {
        1 => {}
        0 => warnings.push(format!(
            "no primary diagnosis flagged; marked {} as primary",
            raw[keep].code
        )),
        n => warnings.push(format!(
            "{n} diagnoses flagged primary; kept {} and demoted the rest",
            raw[keep].code
        )),
    }

    for (index, code) in raw.iter_mut().enumerate() {
        code.primary = index == keep;
    }

    raw.into_iter()
        .map(|c| DiagnosisCode {
            code: c.code,
            description: c.description,
            is_primary: c.primary,
        })
        .collect()
}

pub(super) fn normalize_procedure_codes(
    value: Option<&Value>,
    warnings: &mut Vec<String>,
) -> Vec<ProcedureCode> {
    collect_entries(value, "procedureCodes", warnings)
        .into_iter()
        .map(|c| ProcedureCode {
            code: c.code,
            description: c.description,
        })
        .collect()
}
