use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dialogue::{DialogueSessionManager, Question, SessionId};
use crate::scheduler::{FollowUpScheduler, FollowUpTask};

/// A session created from a due follow-up.
#[derive(Debug, Clone)]
pub struct ReopenedSession {
    pub task: FollowUpTask,
    pub session_id: SessionId,
    pub question: Question,
}

/// One scheduler pass: expire idle sessions, evict finished ones, claim due
/// follow-ups and re-open a session for each.
///
/// A claimed task stays in the table until its re-opened session ends; the
/// manager completes it then. Tasks whose session could not be opened are
/// released for the next pass.
pub async fn run_once(
    scheduler: &FollowUpScheduler,
    manager: &DialogueSessionManager,
    now: DateTime<Utc>,
) -> Result<Vec<ReopenedSession>> {
    manager.expire_idle(now).await;
    manager.evict_finished().await;

    let mut due = Vec::new();
    for task in scheduler.poll_due(now).await? {
        // Lease lapsed while the interview is still open; the poll renewed it.
        if manager.follow_up_in_progress(task.task_id).await {
            debug!(task = %task.task_id, "follow-up still being answered");
            continue;
        }
        due.push(task);
    }
    if due.is_empty() {
        return Ok(Vec::new());
    }
    info!(count = due.len(), "follow-ups due");

    let attempts = join_all(due.into_iter().map(|task| async move {
        let result = manager.reopen(&task).await;
        (task, result)
    }))
    .await;

    let mut reopened = Vec::new();
    for (task, result) in attempts {
        match result {
            Ok((session_id, question)) => reopened.push(ReopenedSession {
                task,
                session_id,
                question,
            }),
            Err(e) => {
                warn!(task = %task.task_id, kind = %task.kind, error = %e, "re-open failed, releasing task");
                if let Err(e) = scheduler.release(task.task_id).await {
                    error!(task = %task.task_id, "Failed to release follow-up: {}", e);
                }
            }
        }
    }
    Ok(reopened)
}

/// Follow-up loop: polls every `interval` and hands re-opened sessions to
/// `tx`. Returns when the receiver is dropped.
pub async fn run_followup_loop(
    scheduler: FollowUpScheduler,
    manager: Arc<DialogueSessionManager>,
    interval: Duration,
    tx: mpsc::Sender<ReopenedSession>,
) {
    info!(interval_secs = interval.as_secs(), "Follow-up engine started");

    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        match run_once(&scheduler, &manager, Utc::now()).await {
            Ok(sessions) => {
                for s in sessions {
                    if tx.send(s).await.is_err() {
                        info!("Follow-up receiver closed, stopping engine");
                        return;
                    }
                }
            }
            Err(e) => {
                error!("Failed to poll follow-ups: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{HashingEmbedder, OfflineWriter, RetryPolicy};
    use crate::config::Config;
    use crate::detect::{Anomaly, Severity};
    use crate::dialogue::{Answer, Collaborators};
    use crate::hypothesis::TemplateTable;
    use crate::series::Granularity;
    use crate::storage::{open_pool, SqliteVectorStore};
    use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone};

    fn setup(dir: &tempfile::TempDir) -> (FollowUpScheduler, Arc<DialogueSessionManager>) {
        let pool = open_pool(&dir.path().join("e.db")).unwrap();
        let config = Arc::new(Config::default());
        let scheduler = FollowUpScheduler::new(pool.clone(), config.followup.clone());
        let manager = DialogueSessionManager::new(
            config,
            Arc::new(TemplateTable::embedded().unwrap()),
            pool.clone(),
            scheduler.clone(),
            Collaborators {
                writer: Arc::new(OfflineWriter),
                store: Arc::new(SqliteVectorStore::new(pool)),
                embedder: Arc::new(HashingEmbedder::new(32)),
            },
        )
        .with_retry(RetryPolicy::none());
        (scheduler, Arc::new(manager))
    }

    fn anomaly() -> Anomaly {
        Anomaly {
            date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            product_id: "SKU-1".into(),
            actual_value: 1450.0,
            expected_value: 1000.0,
            baseline_std_dev: 110.0,
            baseline_samples: 90,
            z_score: 4.1,
            severity: Severity::Severe,
            granularity: Granularity::Day,
        }
    }

    #[tokio::test]
    async fn test_run_once_keeps_task_until_session_ends() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, manager) = setup(&dir);
        let resolved = Utc.with_ymd_and_hms(2024, 3, 20, 9, 0, 0).unwrap();
        scheduler.schedule(&anomaly(), Some("a heatwave"), resolved).await.unwrap();

        let now = resolved + ChronoDuration::days(8);
        let reopened = run_once(&scheduler, &manager, now).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened[0].question.text.contains("a heatwave"));
        assert_eq!(scheduler.pending_count().await.unwrap(), 4);
        assert_eq!(manager.active_count().await, 1);
        assert!(run_once(&scheduler, &manager, now).await.unwrap().is_empty());

        // Lease lapses while the question is unanswered: no second session.
        let later = now + ChronoDuration::hours(2);
        assert!(run_once(&scheduler, &manager, later).await.unwrap().is_empty());
        assert_eq!(manager.list().await.len(), 1);

        let out = manager
            .answer(reopened[0].session_id, Answer::choice("Yes, it happened again"))
            .await
            .unwrap();
        assert!(out.state.is_terminal());
        assert_eq!(scheduler.pending_count().await.unwrap(), 3);

        // The next pass drops the finished session from the arena.
        assert!(run_once(&scheduler, &manager, later).await.unwrap().is_empty());
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_skipped_follow_up_is_offered_again() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, manager) = setup(&dir);
        let resolved = Utc.with_ymd_and_hms(2024, 3, 20, 9, 0, 0).unwrap();
        scheduler.schedule(&anomaly(), None, resolved).await.unwrap();

        let now = resolved + ChronoDuration::days(8);
        let first = run_once(&scheduler, &manager, now).await.unwrap();
        assert_eq!(first.len(), 1);
        manager.abandon(first[0].session_id).await.unwrap();

        let again = run_once(&scheduler, &manager, now).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].task.task_id, first[0].task.task_id);
        assert_ne!(again[0].session_id, first[0].session_id);
    }

    #[tokio::test]
    async fn test_loop_stops_when_receiver_drops() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, manager) = setup(&dir);
        scheduler
            .schedule(&anomaly(), None, Utc::now() - ChronoDuration::days(400))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_followup_loop(
            scheduler.clone(),
            manager,
            Duration::from_millis(10),
            tx,
        ));
        let mut kinds = Vec::new();
        for _ in 0..4 {
            kinds.push(rx.recv().await.unwrap().task.kind);
        }
        assert_eq!(kinds.len(), 4);
        drop(rx);
        // No tasks left, so the loop only notices the drop on its next send;
        // schedule one more to trigger it.
        scheduler
            .schedule(&anomaly(), None, Utc::now() - ChronoDuration::days(400))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
