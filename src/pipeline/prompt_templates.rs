//! Template resolver: active prompt template lookup and rendering.
//!
//! Lookup order is specialty first, then the default category. There is no
//! built-in fallback prompt: the template defines the output contract the
//! normalizer enforces, so a missing template is a configuration defect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;

use crate::db::{repository, DatabaseError};
use crate::models::{PromptTemplate, TemplateCategory};

pub const DICTATION_PLACEHOLDER: &str = "{{DICTATION_TEXT}}";
pub const CONTEXT_PLACEHOLDER: &str = "{{DATABASE_CONTEXT}}";
pub const WORD_LIMIT_PLACEHOLDER: &str = "{{WORD_LIMIT}}";

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("No active prompt template (specialty: {specialty:?}, default: none)")]
    NoActiveTemplate { specialty: Option<String> },

    #[error("Template store error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Template store lock poisoned")]
    LockPoisoned,
}

// ═══════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════

/// Read side of the administrative template store.
pub trait TemplateStore: Send + Sync {
    fn get_active_template(
        &self,
        category: &TemplateCategory,
    ) -> Result<Option<PromptTemplate>, TemplateError>;
}

/// SQLite-backed store over the `prompt_templates` table.
pub struct SqliteTemplateStore {
    conn: Mutex<Connection>,
}

impl SqliteTemplateStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }
}

impl TemplateStore for SqliteTemplateStore {
    fn get_active_template(
        &self,
        category: &TemplateCategory,
    ) -> Result<Option<PromptTemplate>, TemplateError> {
        let conn = self.conn.lock().map_err(|_| TemplateError::LockPoisoned)?;
        Ok(repository::get_active_template(&conn, category)?)
    }
}

/// Fixed set of templates, keyed by category. Used by tests and dry runs.
#[derive(Default)]
pub struct InMemoryTemplateStore {
    templates: Mutex<HashMap<TemplateCategory, PromptTemplate>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active template of the template's category.
    pub fn with_template(self, template: PromptTemplate) -> Self {
        self.put(template);
        self
    }

    pub fn put(&self, template: PromptTemplate) {
        if let Ok(mut map) = self.templates.lock() {
            map.insert(template.category.clone(), template);
        }
    }
}

impl TemplateStore for InMemoryTemplateStore {
    fn get_active_template(
        &self,
        category: &TemplateCategory,
    ) -> Result<Option<PromptTemplate>, TemplateError> {
        let map = self.templates.lock().map_err(|_| TemplateError::LockPoisoned)?;
        Ok(map.get(category).filter(|t| t.active).cloned())
    }
}

// ═══════════════════════════════════════════════════════════
// Resolver
// ═══════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct TemplateResolver {
    store: Arc<dyn TemplateStore>,
}

impl TemplateResolver {
    pub fn new(store: Arc<dyn TemplateStore>) -> Self {
        Self { store }
    }

    /// Active template for `specialty`, else the default active template.
    pub fn resolve(&self, specialty: Option<&str>) -> Result<PromptTemplate, TemplateError> {
        let specialty = specialty.map(str::trim).filter(|s| !s.is_empty());

        if let Some(name) = specialty {
            let category = TemplateCategory::specialty(name);
            if let Some(template) = self.store.get_active_template(&category)? {
                tracing::debug!(category = %category, version = %template.version, "Resolved specialty template");
                return Ok(template);
            }
            tracing::debug!(category = %category, "No specialty template, using default");
        }

        match self.store.get_active_template(&TemplateCategory::Default)? {
            Some(template) => {
                tracing::debug!(version = %template.version, "Resolved default template");
                Ok(template)
            }
            None => {
                tracing::error!(specialty = ?specialty, "No active prompt template");
                Err(TemplateError::NoActiveTemplate {
                    specialty: specialty.map(str::to_string),
                })
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Rendering
// ═══════════════════════════════════════════════════════════

/// Values substituted into a template body.
#[derive(Debug, Clone, Copy)]
pub struct RenderInput<'a> {
    pub dictation_text: &'a str,
    pub database_context: &'a str,
    pub word_limit: u32,
}

/// Substitute the three placeholders in a single left-to-right pass.
///
/// Substituted values are never rescanned, and unknown `{{...}}` tokens are
/// copied through unchanged.
pub fn render_template(body: &str, input: &RenderInput<'_>) -> String {
    let word_limit = input.word_limit.to_string();
    let substitutions: [(&str, &str); 3] = [
        (DICTATION_PLACEHOLDER, input.dictation_text),
        (CONTEXT_PLACEHOLDER, input.database_context),
        (WORD_LIMIT_PLACEHOLDER, word_limit.as_str()),
    ];

    let mut out = String::with_capacity(body.len() + input.dictation_text.len());
    let mut rest = body;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match substitutions.iter().find(|(token, _)| tail.starts_with(token)) {
            Some((token, value)) => {
                out.push_str(value);
                rest = &tail[token.len()..];
            }
            None => {
                out.push_str("{{");
                rest = &tail[2..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render a resolved template with its own word limit.
pub fn render_prompt(template: &PromptTemplate, dictation_text: &str, database_context: &str) -> String {
    render_template(
        &template.body,
        &RenderInput {
            dictation_text,
            database_context,
            word_limit: template.word_limit,
        },
    )
}
