//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS followup_tasks (
            task_id TEXT PRIMARY KEY,
            product_id TEXT NOT NULL,
            anomaly_date TEXT NOT NULL,
            kind TEXT NOT NULL,
            due_at INTEGER NOT NULL,
            anomaly_json TEXT NOT NULL,
            explanation TEXT,
            claimed_at INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS anomaly_responses (
            response_id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            anomaly_date TEXT NOT NULL,
            turn INTEGER NOT NULL,
            answer_type TEXT NOT NULL,
            confirmed_hypothesis_id TEXT,
            impact_tag TEXT NOT NULL,
            response_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS vector_records (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            record_type TEXT NOT NULL,
            record_date TEXT,
            vector_json TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (collection, id)
        );

        CREATE INDEX IF NOT EXISTS idx_followup_due ON followup_tasks(due_at);
        CREATE INDEX IF NOT EXISTS idx_responses_session ON anomaly_responses(session_id);
        CREATE INDEX IF NOT EXISTS idx_vector_type ON vector_records(collection, record_type);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
