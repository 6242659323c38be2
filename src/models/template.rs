use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::DatabaseError;

const SPECIALTY_PREFIX: &str = "specialty:";

/// Scope a prompt template applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TemplateCategory {
    Default,
    Specialty(String),
}

impl TemplateCategory {
    /// Specialty names are matched case-insensitively.
    pub fn specialty(name: &str) -> Self {
        Self::Specialty(name.trim().to_lowercase())
    }

    pub fn as_key(&self) -> String {
        match self {
            Self::Default => "default".to_string(),
            Self::Specialty(name) => format!("{SPECIALTY_PREFIX}{name}"),
        }
    }
}

impl fmt::Display for TemplateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

impl FromStr for TemplateCategory {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "default" {
            return Ok(Self::Default);
        }
        match s.strip_prefix(SPECIALTY_PREFIX) {
            Some(name) if !name.trim().is_empty() => Ok(Self::specialty(name)),
            _ => Err(DatabaseError::InvalidEnum {
                field: "TemplateCategory".into(),
                value: s.into(),
            }),
        }
    }
}

impl From<TemplateCategory> for String {
    fn from(category: TemplateCategory) -> Self {
        category.as_key()
    }
}

impl TryFrom<String> for TemplateCategory {
    type Error = DatabaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Semantic version of a template (`major.minor.patch`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TemplateVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl TemplateVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for TemplateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for TemplateVersion {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DatabaseError::InvalidEnum {
            field: "TemplateVersion".into(),
            value: s.into(),
        };
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl From<TemplateVersion> for String {
    fn from(version: TemplateVersion) -> Self {
        version.to_string()
    }
}

impl TryFrom<String> for TemplateVersion {
    type Error = DatabaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Versioned prompt template. Read-only to the validation pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: Uuid,
    pub name: String,
    pub category: TemplateCategory,
    pub version: TemplateVersion,
    pub body: String,
    pub word_limit: u32,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_key_round_trip() {
        assert_eq!(TemplateCategory::Default.as_key(), "default");
        let cardio = TemplateCategory::specialty("  Cardiology ");
        assert_eq!(cardio.as_key(), "specialty:cardiology");
        assert_eq!("specialty:cardiology".parse::<TemplateCategory>().unwrap(), cardio);
        assert_eq!("default".parse::<TemplateCategory>().unwrap(), TemplateCategory::Default);
    }

    #[test]
    fn category_rejects_unknown_keys() {
        assert!("specialty:".parse::<TemplateCategory>().is_err());
        assert!("radiology".parse::<TemplateCategory>().is_err());
    }

    #[test]
    fn version_parses_and_orders() {
        let v1: TemplateVersion = "1.2.0".parse().unwrap();
        let v2: TemplateVersion = "v1.10.0".parse().unwrap();
        assert_eq!(v1, TemplateVersion::new(1, 2, 0));
        assert!(v2 > v1);
        assert_eq!(v2.to_string(), "1.10.0");
    }

    #[test]
    fn version_rejects_malformed() {
        assert!("1.2".parse::<TemplateVersion>().is_err());
        assert!("1.x.0".parse::<TemplateVersion>().is_err());
        assert!("".parse::<TemplateVersion>().is_err());
    }

    #[test]
    fn template_serializes_category_as_key() {
        let template = PromptTemplate {
            id: Uuid::new_v4(),
            name: "Neuro".into(),
            category: TemplateCategory::specialty("neurology"),
            version: TemplateVersion::new(2, 0, 1),
            body: "{{DICTATION_TEXT}}".into(),
            word_limit: 40,
            active: true,
        };
        let value = serde_json::to_value(&template).unwrap();
        assert_eq!(value["category"], "specialty:neurology");
        assert_eq!(value["version"], "2.0.1");

        let back: PromptTemplate = serde_json::from_value(value).unwrap();
        assert_eq!(back, template);
    }
}
