use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;

/// Code system of a reference entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
    Icd10,
    Cpt,
}

impl CodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Icd10 => "icd10",
            Self::Cpt => "cpt",
        }
    }
}

impl std::str::FromStr for CodeKind {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "icd10" => Ok(Self::Icd10),
            "cpt" => Ok(Self::Cpt),
            _ => Err(DatabaseError::InvalidEnum {
                field: "CodeKind".into(),
                value: s.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodingReference {
    pub code: String,
    pub kind: CodeKind,
    pub description: String,
}

pub fn upsert_coding_reference(
    conn: &Connection,
    entry: &CodingReference,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO coding_reference (code, kind, description) VALUES (?1, ?2, ?3)
         ON CONFLICT (code, kind) DO UPDATE SET description = excluded.description",
        params![entry.code, entry.kind.as_str(), entry.description],
    )?;
    Ok(())
}

/// Reference entries whose description contains any of the keywords.
///
/// Matching and ranking run in SQLite: each keyword contributes one hit when
/// it occurs in the lowercased description, rows without hits are skipped,
/// and results are ordered by hit count, then code.
pub fn search_coding_reference(
    conn: &Connection,
    keywords: &[String],
    limit: usize,
) -> Result<Vec<CodingReference>, DatabaseError> {
    if keywords.is_empty() || limit == 0 {
        return Ok(vec![]);
    }

    let hit_terms: Vec<String> = (1..=keywords.len())
        .map(|i| format!("(instr(lower(description), ?{i}) > 0)"))
        .collect();
    let sql = format!(
        "SELECT code, kind, description FROM (
             SELECT code, kind, description, {hits} AS hits FROM coding_reference
         )
         WHERE hits > 0
         ORDER BY hits DESC, code
         LIMIT {limit}",
        hits = hit_terms.join(" + "),
    );

    let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(lowered.iter()), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (code, kind, description) = row?;
        entries.push(CodingReference {
            code,
            kind: kind.parse()?,
            description,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    fn seed(conn: &Connection) {
        for (code, kind, description) in [
            ("M54.5", CodeKind::Icd10, "Low back pain"),
            ("M51.26", CodeKind::Icd10, "Intervertebral disc displacement, lumbar region"),
            ("72148", CodeKind::Cpt, "MRI lumbar spine without contrast"),
            ("70551", CodeKind::Cpt, "MRI brain without contrast"),
        ] {
            upsert_coding_reference(
                conn,
                &CodingReference {
                    code: code.into(),
                    kind,
                    description: description.into(),
                },
            )
            .unwrap();
        }
    }

    #[test]
    fn search_ranks_by_keyword_hits() {
        let conn = open_memory_database().unwrap();
        seed(&conn);
        let keywords = vec!["lumbar".to_string(), "mri".to_string()];
        let hits = search_coding_reference(&conn, &keywords, 10).unwrap();
        assert_eq!(hits[0].code, "72148");
        assert!(hits.iter().any(|h| h.code == "M51.26"));
        assert!(hits.iter().all(|h| h.code != "M54.5"));
    }

    #[test]
    fn search_respects_limit_and_empty_keywords() {
        let conn = open_memory_database().unwrap();
        seed(&conn);
        let keywords = vec!["without".to_string()];
        assert_eq!(search_coding_reference(&conn, &keywords, 1).unwrap().len(), 1);
        assert!(search_coding_reference(&conn, &[], 10).unwrap().is_empty());
    }

    #[test]
    fn search_limit_applies_after_ranking() {
        let conn = open_memory_database().unwrap();
        seed(&conn);
        let keywords = vec!["contrast".to_string(), "brain".to_string()];
        let hits = search_coding_reference(&conn, &keywords, 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].code, "70551");
        assert_eq!(hits[0].kind, CodeKind::Cpt);
    }

    #[test]
    fn search_is_case_insensitive_and_literal() {
        let conn = open_memory_database().unwrap();
        seed(&conn);
        assert_eq!(
            search_coding_reference(&conn, &["LUMBAR".to_string()], 10).unwrap().len(),
            2
        );
        assert!(search_coding_reference(&conn, &["%".to_string()], 10).unwrap().is_empty());
    }

    #[test]
    fn upsert_replaces_description() {
        let conn = open_memory_database().unwrap();
        seed(&conn);
        upsert_coding_reference(
            &conn,
            &CodingReference {
                code: "M54.5".into(),
                kind: CodeKind::Icd10,
                description: "Low back pain, unspecified".into(),
            },
        )
        .unwrap();
        let hits = search_coding_reference(&conn, &["unspecified".to_string()], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].code, "M54.5");
    }
}
