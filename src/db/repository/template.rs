use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::{PromptTemplate, TemplateCategory, TemplateVersion};

pub fn insert_template(conn: &Connection, template: &PromptTemplate) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO prompt_templates (id, name, category, version, body, word_limit, active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            template.id.to_string(),
            template.name,
            template.category.as_key(),
            template.version.to_string(),
            template.body,
            template.word_limit,
            template.active,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Fetch the single active template for a category, if any.
pub fn get_active_template(
    conn: &Connection,
    category: &TemplateCategory,
) -> Result<Option<PromptTemplate>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, name, category, version, body, word_limit, active
             FROM prompt_templates WHERE category = ?1 AND active = 1",
            params![category.as_key()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            },
        )
        .optional()?;

    row.map(template_from_row).transpose()
}

/// Make `template_id` the only active template in its category.
pub fn activate_template(conn: &mut Connection, template_id: &Uuid) -> Result<(), DatabaseError> {
    let tx = conn.transaction()?;
    let category: String = tx
        .query_row(
            "SELECT category FROM prompt_templates WHERE id = ?1",
            params![template_id.to_string()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| DatabaseError::NotFound {
            entity_type: "PromptTemplate".into(),
            id: template_id.to_string(),
        })?;

    tx.execute(
        "UPDATE prompt_templates SET active = 0 WHERE category = ?1 AND active = 1",
        params![category],
    )?;
    tx.execute(
        "UPDATE prompt_templates SET active = 1 WHERE id = ?1",
        params![template_id.to_string()],
    )?;
    tx.commit()?;
    Ok(())
}

type TemplateRow = (String, String, String, String, String, u32, bool);

fn template_from_row(row: TemplateRow) -> Result<PromptTemplate, DatabaseError> {
    let (id, name, category, version, body, word_limit, active) = row;
    Ok(PromptTemplate {
        id: Uuid::parse_str(&id).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?,
        name,
        category: TemplateCategory::from_str(&category)?,
        version: TemplateVersion::from_str(&version)?,
        body,
        word_limit,
        active,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    fn make_template(category: TemplateCategory, version: &str, active: bool) -> PromptTemplate {
        PromptTemplate {
            id: Uuid::new_v4(),
            name: format!("{category} {version}"),
            category,
            version: version.parse().unwrap(),
            body: "Evaluate: {{DICTATION_TEXT}}".into(),
            word_limit: 30,
            active,
        }
    }

    #[test]
    fn insert_and_fetch_active() {
        let conn = open_memory_database().unwrap();
        let template = make_template(TemplateCategory::Default, "1.0.0", true);
        insert_template(&conn, &template).unwrap();

        let fetched = get_active_template(&conn, &TemplateCategory::Default)
            .unwrap()
            .unwrap();
        assert_eq!(fetched, template);
    }

    #[test]
    fn inactive_template_is_not_returned() {
        let conn = open_memory_database().unwrap();
        insert_template(&conn, &make_template(TemplateCategory::Default, "1.0.0", false)).unwrap();
        assert!(get_active_template(&conn, &TemplateCategory::Default)
            .unwrap()
            .is_none());
    }

    #[test]
    fn second_active_template_in_category_is_rejected() {
        let conn = open_memory_database().unwrap();
        insert_template(&conn, &make_template(TemplateCategory::Default, "1.0.0", true)).unwrap();
        let result = insert_template(&conn, &make_template(TemplateCategory::Default, "1.1.0", true));
        assert!(matches!(result, Err(DatabaseError::Sqlite(_))));
    }

    #[test]
    fn categories_are_independent() {
        let conn = open_memory_database().unwrap();
        let cardio = make_template(TemplateCategory::specialty("cardiology"), "1.0.0", true);
        insert_template(&conn, &make_template(TemplateCategory::Default, "1.0.0", true)).unwrap();
        insert_template(&conn, &cardio).unwrap();

        let fetched = get_active_template(&conn, &TemplateCategory::specialty("Cardiology"))
            .unwrap()
            .unwrap();
        assert_eq!(fetched.id, cardio.id);
    }

    #[test]
    fn activate_switches_active_version() {
        let mut conn = open_memory_database().unwrap();
        let old = make_template(TemplateCategory::Default, "1.0.0", true);
        let new = make_template(TemplateCategory::Default, "2.0.0", false);
        insert_template(&conn, &old).unwrap();
        insert_template(&conn, &new).unwrap();

        activate_template(&mut conn, &new.id).unwrap();

        let active = get_active_template(&conn, &TemplateCategory::Default)
            .unwrap()
            .unwrap();
        assert_eq!(active.id, new.id);
        assert_eq!(active.version, TemplateVersion::new(2, 0, 0));
    }

    #[test]
    fn activate_unknown_template_not_found() {
        let mut conn = open_memory_database().unwrap();
        let result = activate_template(&mut conn, &Uuid::new_v4());
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
    }
}
