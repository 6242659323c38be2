use std::path::Path;

use rusqlite::Connection;

use super::DatabaseError;

/// Open a SQLite connection to the given path and run migrations
pub fn open_database(path: &Path) -> Result<Connection, DatabaseError> {
    let conn = Connection::open(path)?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing)
pub fn open_memory_database() -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "PRAGMA journal_mode=DELETE;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
    )?;
    Ok(())
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_current_version(conn);

    let migrations: Vec<(i64, &str)> = vec![(
        1,
        include_str!("../../resources/migrations/001_initial.sql"),
    )];

    for (version, sql) in migrations {
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(sql).map_err(|e| DatabaseError::MigrationFailed {
                version,
                reason: e.to_string(),
            })?;
        }
    }

    Ok(())
}

/// Get the current schema version (0 if no schema exists yet)
fn get_current_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, i64>(0)
    })
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn database_initializes_all_tables() {
        let conn = open_memory_database().unwrap();
        assert!(table_exists(&conn, "prompt_templates"));
        assert!(table_exists(&conn, "validation_attempts"));
        assert!(table_exists(&conn, "coding_reference"));
    }

    #[test]
    fn schema_version_is_current() {
        let conn = open_memory_database().unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn migration_idempotent() {
        let conn = open_memory_database().unwrap();
        assert!(run_migrations(&conn).is_ok());
    }

    #[test]
    fn file_database_persists_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ordercheck.db");
        {
            open_database(&path).unwrap();
        }
        let conn = open_database(&path).unwrap();
        assert!(table_exists(&conn, "prompt_templates"));
    }
}
