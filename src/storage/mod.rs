//! SQLite storage layer -- schema, audit log of answered turns, vector records.

pub mod schema;
pub mod vectors;

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use uuid::Uuid;

use crate::dialogue::AnomalyResponse;

pub use self::vectors::SqliteVectorStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Append an answered turn to the local audit log. Idempotent per response id.
pub fn save_response(pool: &Pool, r: &AnomalyResponse) -> Result<()> {
    let conn = pool.get()?;
    let json = serde_json::to_string(r)?;

    conn.execute(
        "INSERT OR IGNORE INTO anomaly_responses (
            response_id, session_id, product_id, anomaly_date, turn,
            answer_type, confirmed_hypothesis_id, impact_tag, response_json, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            r.response_id.to_string(),
            r.session_ref.to_string(),
            r.anomaly_ref.product_id,
            r.anomaly_ref.date.to_string(),
            r.turn,
            r.answer_type.to_string(),
            r.confirmed_hypothesis_id.map(|id| id.to_string()),
            r.impact_tag.to_string(),
            json,
            r.timestamp.to_rfc3339(),
        ],
    )
    .context("Failed to save anomaly response")?;

    Ok(())
}

/// Answered turns of one session, oldest first.
pub fn list_responses(pool: &Pool, session_id: Uuid) -> Result<Vec<AnomalyResponse>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT response_json FROM anomaly_responses WHERE session_id = ?1 ORDER BY turn",
    )?;
    let rows = stmt.query_map([session_id.to_string()], |row| row.get::<_, String>(0))?;

    let mut out = Vec::new();
    for r in rows {
        out.push(serde_json::from_str(&r?)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::AnomalyKey;
    use crate::dialogue::{AnswerType, ImpactTag};
    use chrono::{NaiveDate, Utc};

    fn response(session: Uuid, turn: u32) -> AnomalyResponse {
        AnomalyResponse {
            response_id: Uuid::new_v4(),
            session_ref: session,
            anomaly_ref: AnomalyKey {
                date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
                product_id: "SKU-1".into(),
            },
            turn,
            hypothesis_id: None,
            question: "What happened?".into(),
            answer_text: "a delivery was late".into(),
            answer_type: AnswerType::FreeText,
            confirmed_hypothesis_id: None,
            impact_tag: ImpactTag::OneTime,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_open_pool_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/db/salesscope.db");
        open_pool(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_save_response_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).unwrap();
        let session = Uuid::new_v4();
        let first = response(session, 1);
        save_response(&pool, &first).unwrap();
        save_response(&pool, &first).unwrap();
        save_response(&pool, &response(session, 2)).unwrap();

        let stored = list_responses(&pool, session).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].response_id, first.response_id);
        assert_eq!(stored[1].turn, 2);
    }
}
