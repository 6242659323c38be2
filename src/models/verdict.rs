use std::fmt;

use serde::{Deserialize, Serialize};

/// Lowest compliance score a verdict may carry.
pub const MIN_COMPLIANCE_SCORE: u8 = 1;

/// Highest compliance score a verdict may carry.
pub const MAX_COMPLIANCE_SCORE: u8 = 9;

/// Appropriateness judgment for an imaging order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Appropriate,
    NeedsClarification,
    Inappropriate,
}

impl ValidationStatus {
    pub fn all() -> &'static [ValidationStatus] {
        &[
            Self::Appropriate,
            Self::NeedsClarification,
            Self::Inappropriate,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Appropriate => "appropriate",
            Self::NeedsClarification => "needs_clarification",
            Self::Inappropriate => "inappropriate",
        }
    }

    /// Terminal statuses end a session; `needs_clarification` does not.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NeedsClarification)
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICD-10 diagnosis code attached to a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisCode {
    pub code: String,
    pub description: String,
    pub is_primary: bool,
}

/// CPT procedure code attached to a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureCode {
    pub code: String,
    pub description: String,
}

/// Structured outcome of one validation round.
///
/// Serializes with the canonical wire keys the prompt templates ask for,
/// so a serialized verdict is itself a well-formed LLM response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationVerdict {
    #[serde(rename = "validationStatus")]
    pub status: ValidationStatus,
    pub compliance_score: u8,
    pub feedback: String,
    pub diagnosis_codes: Vec<DiagnosisCode>,
    pub procedure_codes: Vec<ProcedureCode>,
    /// Model reasoning kept for reviewers; never shown to the ordering physician.
    pub internal_reasoning: String,
}

impl ValidationVerdict {
    pub fn primary_diagnosis(&self) -> Option<&DiagnosisCode> {
        self.diagnosis_codes.iter().find(|d| d.is_primary)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
