use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Patient context supplied with an order.
///
/// Opaque to the pipeline beyond the demographic summary placed in the
/// prompt; any additional fields are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientContext {
    pub patient_id: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PatientContext {
    pub fn new(patient_id: &str) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_demographics(mut self, age: Option<u32>, gender: Option<&str>) -> Self {
        self.age = age;
        self.gender = gender.map(str::to_string);
        self
    }

    /// One-line demographic summary for the prompt context block.
    pub fn demographics_line(&self) -> String {
        let gender = self
            .gender
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty());
        match (self.age, gender) {
            (Some(age), Some(gender)) => format!("Patient: {age}-year-old {gender}"),
            (Some(age), None) => format!("Patient: {age} years old"),
            (None, Some(gender)) => format!("Patient: {gender}, age not provided"),
            (None, None) => "Patient demographics: not provided".to_string(),
        }
    }
}

/// Inbound request for a new validation session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    /// Free-text dictation. May be empty or minimal.
    pub dictation_text: String,
    pub patient: PatientContext,
    #[serde(default)]
    pub physician_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    /// Selects a specialty-scoped prompt template when one is active.
    #[serde(default)]
    pub specialty: Option<String>,
}

impl ValidationRequest {
    pub fn new(dictation_text: &str, patient: PatientContext) -> Self {
        Self {
            dictation_text: dictation_text.to_string(),
            patient,
            ..Self::default()
        }
    }

    pub fn with_specialty(mut self, specialty: &str) -> Self {
        self.specialty = Some(specialty.to_string());
        self
    }

    pub fn with_origin(mut self, physician_id: &str, organization_id: &str) -> Self {
        self.physician_id = Some(physician_id.to_string());
        self.organization_id = Some(organization_id.to_string());
        self
    }
}
