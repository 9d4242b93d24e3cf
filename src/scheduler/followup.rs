use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{FollowUpKind, FollowUpTask};
use crate::config::FollowUpConfig;
use crate::detect::{Anomaly, AnomalyKey};
use crate::storage::Pool;

/// Persists follow-up tasks in SQLite and hands out due ones.
///
/// Claims are leased: a task returned by `poll_due` is hidden until it is
/// completed, released, or its lease runs out.
#[derive(Clone)]
pub struct FollowUpScheduler {
    pool: Pool,
    config: FollowUpConfig,
}

impl FollowUpScheduler {
    pub fn new(pool: Pool, config: FollowUpConfig) -> Self {
        Self { pool, config }
    }

    pub fn delay_for(&self, kind: FollowUpKind) -> Duration {
        let days = match kind {
            FollowUpKind::ShortTerm => self.config.short_term_days,
            FollowUpKind::MediumTerm => self.config.medium_term_days,
            FollowUpKind::LongTerm => self.config.long_term_days,
            FollowUpKind::Yearly => self.config.yearly_days,
        };
        Duration::days(days)
    }

    /// Register the four follow-ups for a resolved anomaly in one transaction.
    pub async fn schedule(
        &self,
        anomaly: &Anomaly,
        explanation: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<Vec<FollowUpTask>> {
        let tasks: Vec<FollowUpTask> = FollowUpKind::ALL
            .into_iter()
            .map(|kind| FollowUpTask {
                task_id: Uuid::new_v4(),
                anomaly_ref: anomaly.key(),
                anomaly: anomaly.clone(),
                explanation: explanation.map(str::to_string),
                due_at: resolved_at + self.delay_for(kind),
                kind,
            })
            .collect();

        let anomaly_json = serde_json::to_string(anomaly)?;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        for t in &tasks {
            tx.execute(
                "INSERT INTO followup_tasks
                    (task_id, product_id, anomaly_date, kind, due_at, anomaly_json, explanation)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    t.task_id.to_string(),
                    t.anomaly_ref.product_id,
                    t.anomaly_ref.date.to_string(),
                    t.kind.as_str(),
                    t.due_at.timestamp(),
                    anomaly_json,
                    t.explanation,
                ],
            )
            .context("Failed to insert follow-up task")?;
        }
        tx.commit()?;

        info!(anomaly = %anomaly.key(), count = tasks.len(), "follow-ups scheduled");
        Ok(tasks)
    }

    /// Claim every task due at `now`. A second call with the same `now`
    /// returns nothing until the claims lapse.
    pub async fn poll_due(&self, now: DateTime<Utc>) -> Result<Vec<FollowUpTask>> {
        let now_ts = now.timestamp();
        let stale_before = now_ts - self.config.claim_lease_secs;

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidates = {
            let mut stmt = tx.prepare(
                "SELECT task_id, kind, due_at, anomaly_json, explanation, claimed_at
                 FROM followup_tasks
                 WHERE due_at <= ?1 AND (claimed_at IS NULL OR claimed_at <= ?2)
                 ORDER BY due_at, task_id",
            )?;
            let rows = stmt.query_map(params![now_ts, stale_before], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for (task_id, kind, due_at, anomaly_json, explanation, claimed_at) in candidates {
            // Compare-and-mark: only the holder of the observed claim wins.
            let changed = tx.execute(
                "UPDATE followup_tasks SET claimed_at = ?1
                 WHERE task_id = ?2 AND claimed_at IS ?3",
                params![now_ts, task_id, claimed_at],
            )?;
            if changed != 1 {
                continue;
            }
            match decode_task(&task_id, &kind, due_at, &anomaly_json, explanation) {
                Ok(task) => claimed.push(task),
                Err(e) => {
                    warn!(task = %task_id, error = %e, "dropping unreadable follow-up task");
                    tx.execute("DELETE FROM followup_tasks WHERE task_id = ?1", params![task_id])?;
                }
            }
        }
        tx.commit()?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed due follow-ups");
        }
        Ok(claimed)
    }

    /// Consume a handled task.
    pub async fn complete(&self, task_id: Uuid) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "DELETE FROM followup_tasks WHERE task_id = ?1",
            params![task_id.to_string()],
        )?;
        if changed == 0 {
            anyhow::bail!("Follow-up task '{}' not found", task_id);
        }
        Ok(())
    }

    /// Drop a claim so the task is due again on the next poll.
    pub async fn release(&self, task_id: Uuid) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE followup_tasks SET claimed_at = NULL WHERE task_id = ?1",
            params![task_id.to_string()],
        )?;
        Ok(())
    }

    /// All tasks not yet consumed, soonest first.
    pub async fn list_pending(&self) -> Result<Vec<FollowUpTask>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, kind, due_at, anomaly_json, explanation
             FROM followup_tasks ORDER BY due_at, task_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut list = Vec::new();
        for r in rows {
            let (task_id, kind, due_at, anomaly_json, explanation) = r?;
            list.push(decode_task(&task_id, &kind, due_at, &anomaly_json, explanation)?);
        }
        Ok(list)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM followup_tasks", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// The task's claim timestamp, if claimed.
    pub async fn claimed_at(&self, task_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let conn = self.pool.get()?;
        let ts: Option<Option<i64>> = conn
            .query_row(
                "SELECT claimed_at FROM followup_tasks WHERE task_id = ?1",
                params![task_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts.flatten().and_then(|s| Utc.timestamp_opt(s, 0).single()))
    }
}

fn decode_task(
    task_id: &str,
    kind: &str,
    due_at: i64,
    anomaly_json: &str,
    explanation: Option<String>,
) -> Result<FollowUpTask> {
    let anomaly: Anomaly = serde_json::from_str(anomaly_json)?;
    Ok(FollowUpTask {
        task_id: Uuid::parse_str(task_id)?,
        anomaly_ref: AnomalyKey {
            date: anomaly.date,
            product_id: anomaly.product_id.clone(),
        },
        anomaly,
        explanation,
        due_at: Utc
            .timestamp_opt(due_at, 0)
            .single()
            .with_context(|| format!("invalid due_at {due_at}"))?,
        kind: kind.parse().map_err(anyhow::Error::msg)?,
    })
}
