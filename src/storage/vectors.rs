//! Local retrieval store: vectors and payloads in SQLite, brute-force cosine
//! search in Rust.

use async_trait::async_trait;
use rusqlite::params;

use super::Pool;
use crate::collab::embed::cosine;
use crate::collab::{KnowledgeRecord, RetrievalStore, SearchFilter, SearchHit, ServiceError};

#[derive(Clone)]
pub struct SqliteVectorStore {
    pool: Pool,
}

impl SqliteVectorStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn store_blocking(
        pool: &Pool,
        collection: &str,
        id: &str,
        vector: &[f32],
        record: &KnowledgeRecord,
    ) -> anyhow::Result<()> {
        let conn = pool.get()?;
        conn.execute(
            "INSERT OR REPLACE INTO vector_records
                (collection, id, record_type, record_date, vector_json, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                collection,
                id,
                record.record_type,
                record.record_date.map(|d| d.to_string()),
                serde_json::to_string(vector)?,
                serde_json::to_string(record)?,
            ],
        )?;
        Ok(())
    }

    fn search_blocking(
        pool: &Pool,
        collection: &str,
        vector: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, vector_json, payload_json FROM vector_records
             WHERE collection = ?1 AND (?2 IS NULL OR record_type = ?2)",
        )?;
        let rows = stmt.query_map(params![collection, filter.record_type], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (id, vector_json, payload_json) = row?;
            let record: KnowledgeRecord = serde_json::from_str(&payload_json)?;
            if !filter.matches(&record) {
                continue;
            }
            let stored: Vec<f32> = serde_json::from_str(&vector_json)?;
            let score = cosine(vector, &stored);
            hits.push(SearchHit { id, score, record });
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }
}

fn storage_err(e: impl std::fmt::Display) -> ServiceError {
    ServiceError::Storage(e.to_string())
}

#[async_trait]
impl RetrievalStore for SqliteVectorStore {
    async fn store(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        record: &KnowledgeRecord,
    ) -> Result<(), ServiceError> {
        let pool = self.pool.clone();
        let (collection, id, vector, record) =
            (collection.to_string(), id.to_string(), vector.to_vec(), record.clone());
        tokio::task::spawn_blocking(move || {
            Self::store_blocking(&pool, &collection, &id, &vector, &record)
        })
        .await
        .map_err(storage_err)?
        .map_err(storage_err)
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>, ServiceError> {
        let pool = self.pool.clone();
        let (collection, vector, filter) = (collection.to_string(), vector.to_vec(), filter.clone());
        tokio::task::spawn_blocking(move || {
            Self::search_blocking(&pool, &collection, &vector, &filter, limit)
        })
        .await
        .map_err(storage_err)?
        .map_err(storage_err)
    }

    async fn delete_by_type(&self, collection: &str, record_type: &str) -> Result<usize, ServiceError> {
        let pool = self.pool.clone();
        let (collection, record_type) = (collection.to_string(), record_type.to_string());
        tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
            let conn = pool.get()?;
            Ok(conn.execute(
                "DELETE FROM vector_records WHERE collection = ?1 AND record_type = ?2",
                params![collection, record_type],
            )?)
        })
        .await
        .map_err(storage_err)?
        .map_err(storage_err)
    }
}
