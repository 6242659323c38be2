pub mod repository;
pub mod sqlite;

pub use repository::*;
pub use sqlite::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("Stored JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),
}
