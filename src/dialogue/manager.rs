//! Arena of live dialogue sessions and the side effects of each turn.
//!
//! The arena lock is only held to look a session up; every external call
//! runs under the session's own mutex, so different sessions never wait on
//! each other.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::session::{DialogueSession, NextStep};
use super::{
    Answer, AnomalyResponse, Question, SessionError, SessionId, SessionOrigin, SessionState,
};
use crate::collab::{
    retry, Embedder, KnowledgeRecord, PromptHypothesis, QuestionPrompt, QuestionSet,
    QuestionWriter, RetrievalStore, RetryPolicy, SearchFilter, ServiceError,
};
use crate::config::Config;
use crate::detect::{Anomaly, AnomalyKey};
use crate::hypothesis::{Hypothesis, HypothesisGenerator, TemplateTable};
use crate::scheduler::{FollowUpScheduler, FollowUpTask};
use crate::storage::{self, Pool};

/// Retrieval-store record type of an answered turn.
pub const RESPONSE_RECORD: &str = "anomaly_response";
/// Retrieval-store record type of a finished session.
pub const SUMMARY_RECORD: &str = "analysis_summary";

const PRECEDENT_LOOKBACK_DAYS: i64 = 730;

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

/// Result of one answered turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub response: AnomalyResponse,
    pub state: SessionState,
    pub next_question: Option<Question>,
    /// Follow-ups registered because this turn finished the session.
    pub follow_ups: Vec<FollowUpTask>,
}

/// Read-only copy of a session for callers outside the arena.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub anomaly_ref: AnomalyKey,
    pub origin: SessionOrigin,
    pub state: SessionState,
    pub turn_count: u32,
    pub max_turns: u32,
    pub asked_hypotheses: Vec<Uuid>,
    pub accepted: Option<Uuid>,
    pub explanation: Option<String>,
    pub failure: Option<String>,
    pub has_pending_turn: bool,
    pub precedents: Vec<String>,
    pub current_question: Option<Question>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    fn of(s: &DialogueSession) -> Self {
        Self {
            session_id: s.session_id,
            anomaly_ref: s.anomaly.key(),
            origin: s.origin.clone(),
            state: s.state,
            turn_count: s.turn_count,
            max_turns: s.max_turns,
            asked_hypotheses: s.asked_hypotheses.clone(),
            accepted: s.accepted,
            explanation: s.explanation(),
            failure: s.failure.clone(),
            has_pending_turn: s.pending.is_some(),
            precedents: s.precedents.clone(),
            current_question: s.current_question(),
            updated_at: s.updated_at,
        }
    }
}

/// External collaborators the manager talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub writer: Arc<dyn QuestionWriter>,
    pub store: Arc<dyn RetrievalStore>,
    pub embedder: Arc<dyn Embedder>,
}

// ---------------------------------------------------------------------------
// DialogueSessionManager
// ---------------------------------------------------------------------------

pub struct DialogueSessionManager {
    /// Live sessions keyed by id.
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<DialogueSession>>>>,
    config: Arc<Config>,
    templates: Arc<TemplateTable>,
    collab: Collaborators,
    scheduler: FollowUpScheduler,
    /// Local audit log of answered turns.
    pool: Pool,
    retry: RetryPolicy,
}

impl DialogueSessionManager {
    pub fn new(
        config: Arc<Config>,
        templates: Arc<TemplateTable>,
        pool: Pool,
        scheduler: FollowUpScheduler,
        collab: Collaborators,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.services);
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            templates,
            collab,
            scheduler,
            pool,
            retry,
        }
    }

    /// Replace the retry policy for external calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn generator(&self) -> HypothesisGenerator<'_> {
        HypothesisGenerator::new(&self.config.hypothesis, &self.templates)
    }

    fn collection(&self) -> &str {
        &self.config.services.collection
    }

    async fn get(&self, id: SessionId) -> Result<Arc<Mutex<DialogueSession>>, SessionError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    // -- lifecycle ----------------------------------------------------------

    /// Create a session for a freshly detected anomaly.
    pub async fn open(&self, anomaly: Anomaly, hypotheses: Vec<Hypothesis>) -> SessionId {
        self.insert(anomaly, hypotheses, SessionOrigin::Detection, self.config.dialogue.max_turns)
            .await
    }

    async fn insert(
        &self,
        anomaly: Anomaly,
        hypotheses: Vec<Hypothesis>,
        origin: SessionOrigin,
        max_turns: u32,
    ) -> SessionId {
        let escalation = self.generator().escalation_question(&anomaly);
        let session = DialogueSession::new(anomaly, hypotheses, origin, max_turns, escalation, Utc::now());
        let id = session.session_id;
        info!(session = %id, anomaly = %session.anomaly.key(), origin = ?session.origin, "session opened");
        self.sessions
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(session)));
        id
    }

    /// Look up precedents, phrase the questions and ask the first one.
    pub async fn start(&self, id: SessionId) -> Result<Question, SessionError> {
        let handle = self.get(id).await?;
        let mut session = handle.lock().await;
        if session.state != SessionState::AwaitingStart {
            return Err(SessionError::InvalidState {
                id,
                state: session.state,
                action: "start",
            });
        }

        session.precedents = self.precedents(&session.anomaly).await;

        let prompt = QuestionPrompt {
            product_id: session.anomaly.product_id.clone(),
            date: session.anomaly.date,
            anomaly_summary: session.anomaly.summary(),
            hypotheses: session
                .hypotheses
                .iter()
                .map(|h| PromptHypothesis {
                    hypothesis_id: h.hypothesis_id,
                    description: h.description.clone(),
                    template_question: h.primary_question().unwrap_or_default().to_string(),
                })
                .collect(),
            precedents: session.precedents.clone(),
        };
        let writer = &self.collab.writer;
        match retry(&self.retry, "compose questions", || writer.compose(&prompt)).await {
            Ok(set) => apply_phrasing(&mut session, set),
            Err(e) => {
                warn!(session = %id, error = %e, "question writer failed, using template phrasing");
                session.failure = Some(format!("question writer: {e}"));
            }
        }

        let question = session.begin(Utc::now())?;
        debug!(session = %id, turn = question.turn, "first question asked");
        Ok(question)
    }

    /// Record an answer and advance the session.
    ///
    /// If persisting the turn fails the session stays in `Evaluating` with
    /// the turn pending; `resume` retries it.
    pub async fn answer(&self, id: SessionId, answer: Answer) -> Result<TurnOutcome, SessionError> {
        let handle = self.get(id).await?;
        let mut session = handle.lock().await;
        let transition = session.evaluate(&answer, Utc::now())?;
        session.hold(transition, Utc::now());
        self.commit(&mut session).await
    }

    /// Retry persisting a pending turn.
    pub async fn resume(&self, id: SessionId) -> Result<TurnOutcome, SessionError> {
        let handle = self.get(id).await?;
        let mut session = handle.lock().await;
        if session.state != SessionState::Evaluating || session.pending.is_none() {
            return Err(SessionError::InvalidState {
                id,
                state: session.state,
                action: "resume",
            });
        }
        self.commit(&mut session).await
    }

    async fn commit(&self, session: &mut DialogueSession) -> Result<TurnOutcome, SessionError> {
        let id = session.session_id;
        let Some(transition) = session.pending.clone() else {
            return Err(SessionError::InvalidState {
                id,
                state: session.state,
                action: "commit",
            });
        };

        if let Err(e) = self.persist_response(&transition.response).await {
            error!(session = %id, turn = transition.response.turn, error = %e, "turn not persisted");
            session.failure = Some(e.to_string());
            return Err(e);
        }

        let response = transition.response.clone();
        let finishing = transition.next == NextStep::Finish;
        let next_question = session.apply(transition, Utc::now());
        info!(
            session = %id,
            turn = session.turn_count,
            state = %session.state,
            confirmed = response.confirmed_hypothesis_id.is_some(),
            "turn recorded"
        );

        let follow_ups = if finishing {
            self.finish(session).await
        } else {
            Vec::new()
        };

        Ok(TurnOutcome {
            response,
            state: session.state,
            next_question,
            follow_ups,
        })
    }

    async fn persist_response(&self, response: &AnomalyResponse) -> Result<(), SessionError> {
        let pool = self.pool.clone();
        let local = response.clone();
        tokio::task::spawn_blocking(move || storage::save_response(&pool, &local))
            .await
            .map_err(|e| SessionError::Storage(e.into()))??;

        let record = KnowledgeRecord {
            record_type: RESPONSE_RECORD.to_string(),
            record_date: Some(response.anomaly_ref.date),
            product_id: response.anomaly_ref.product_id.clone(),
            text: format!("{} {}", response.question, response.answer_text),
            payload: serde_json::to_value(response).map_err(|e| SessionError::Storage(e.into()))?,
        };
        self.remember(&response.response_id.to_string(), &record)
            .await
            .map_err(|source| SessionError::External {
                id: response.session_ref,
                source,
            })
    }

    /// Terminal bookkeeping: follow-ups for original sessions and a summary
    /// record for future precedent searches. Failures here are logged and
    /// marked on the session; the turn itself already succeeded.
    async fn finish(&self, session: &mut DialogueSession) -> Vec<FollowUpTask> {
        let id = session.session_id;
        let explanation = session.explanation();

        let mut tasks = Vec::new();
        if session.origin == SessionOrigin::Detection {
            match self
                .scheduler
                .schedule(&session.anomaly, explanation.as_deref(), Utc::now())
                .await
            {
                Ok(t) => tasks = t,
                Err(e) => {
                    error!(session = %id, error = %e, "failed to schedule follow-ups");
                    session.failure = Some(format!("follow-up scheduling: {e}"));
                }
            }
        }

        // A follow-up task is consumed only once its interview has ended.
        if let SessionOrigin::FollowUp { task_id, .. } = session.origin {
            if let Err(e) = self.scheduler.complete(task_id).await {
                error!(session = %id, task = %task_id, error = %e, "failed to complete follow-up task");
                session.failure = Some(format!("follow-up completion: {e}"));
            }
        }

        let accepted_template = session
            .accepted
            .and_then(|h| session.hypothesis(h))
            .map(|h| h.template_id.clone());
        let record = KnowledgeRecord {
            record_type: SUMMARY_RECORD.to_string(),
            record_date: Some(session.anomaly.date),
            product_id: session.anomaly.product_id.clone(),
            text: format!(
                "{} Explanation: {}",
                session.anomaly.summary(),
                explanation.as_deref().unwrap_or("unexplained")
            ),
            payload: serde_json::json!({
                "session_id": id,
                "origin": session.origin,
                "state": session.state,
                "turns": session.turn_count,
                "accepted_template": accepted_template,
                "explanation": explanation,
            }),
        };
        if let Err(e) = self.remember(&id.to_string(), &record).await {
            warn!(session = %id, error = %e, "failed to store session summary");
            session.failure = Some(format!("summary: {e}"));
        }

        info!(session = %id, state = %session.state, follow_ups = tasks.len(), "session finished");
        tasks
    }

    async fn remember(&self, id: &str, record: &KnowledgeRecord) -> Result<(), ServiceError> {
        let embedder = &self.collab.embedder;
        let store = &self.collab.store;
        let collection = self.collection();
        let vector = retry(&self.retry, "embed", || embedder.embed(&record.text)).await?;
        retry(&self.retry, "store record", || store.store(collection, id, &vector, record)).await
    }

    /// Past explanations of similar anomalies; empty if the lookup fails.
    async fn precedents(&self, anomaly: &Anomaly) -> Vec<String> {
        let embedder = &self.collab.embedder;
        let store = &self.collab.store;
        let text = anomaly.summary();
        let filter = SearchFilter {
            record_type: Some(SUMMARY_RECORD.to_string()),
            date_from: Some(anomaly.date - Duration::days(PRECEDENT_LOOKBACK_DAYS)),
            date_to: Some(anomaly.date),
        };
        let limit = self.config.dialogue.precedent_limit;

        let search = async {
            let vector = retry(&self.retry, "embed", || embedder.embed(&text)).await?;
            retry(&self.retry, "search precedents", || {
                store.search(self.collection(), &vector, &filter, limit)
            })
            .await
        };
        match search.await {
            Ok(hits) => {
                debug!(anomaly = %anomaly.key(), found = hits.len(), "precedents retrieved");
                hits.into_iter().map(|h| h.record.text).collect()
            }
            Err(e) => {
                warn!(anomaly = %anomaly.key(), error = %e, "precedent search failed");
                Vec::new()
            }
        }
    }

    /// Re-open a resolved anomaly from a due follow-up task.
    pub async fn reopen(&self, task: &FollowUpTask) -> Result<(SessionId, Question), SessionError> {
        let hypothesis = self
            .generator()
            .follow_up(&task.anomaly, task.kind, task.explanation.as_deref());
        let id = self
            .insert(
                task.anomaly.clone(),
                vec![hypothesis],
                SessionOrigin::for_task(task),
                self.config.dialogue.max_turns,
            )
            .await;
        let question = self.start(id).await?;
        info!(session = %id, task = %task.task_id, kind = %task.kind, "session re-opened from follow-up");
        Ok((id, question))
    }

    /// Give up on a session. Abandoned sessions store no summary; a
    /// re-opened one hands its follow-up task back to the scheduler.
    pub async fn abandon(&self, id: SessionId) -> Result<(), SessionError> {
        let handle = self.get(id).await?;
        let mut session = handle.lock().await;
        session.abandon(Utc::now())?;
        self.release_task(&mut session).await;
        info!(session = %id, "session abandoned");
        Ok(())
    }

    async fn release_task(&self, session: &mut DialogueSession) {
        let SessionOrigin::FollowUp { task_id, .. } = session.origin else {
            return;
        };
        if let Err(e) = self.scheduler.release(task_id).await {
            warn!(session = %session.session_id, task = %task_id, error = %e, "failed to release follow-up task");
            session.failure = Some(format!("follow-up release: {e}"));
        }
    }

    /// Whether a session re-opened from `task_id` is still waiting for answers.
    pub async fn follow_up_in_progress(&self, task_id: Uuid) -> bool {
        let handles: Vec<_> = self.sessions.read().await.values().cloned().collect();
        for handle in handles {
            let session = handle.lock().await;
            if !session.state.is_terminal()
                && matches!(session.origin, SessionOrigin::FollowUp { task_id: t, .. } if t == task_id)
            {
                return true;
            }
        }
        false
    }

    /// Terminate sessions idle for longer than `dialogue.idle_expiry_hours`.
    /// Does nothing when expiry is disabled.
    pub async fn expire_idle(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let Some(hours) = self.config.dialogue.idle_expiry_hours else {
            return Vec::new();
        };
        let max_idle = Duration::hours(hours as i64);
        let handles: Vec<_> = self.sessions.read().await.values().cloned().collect();

        let mut expired = Vec::new();
        for handle in handles {
            let mut session = handle.lock().await;
            if session.is_idle(now, max_idle) && session.abandon(now).is_ok() {
                session.failure = Some("expired after inactivity".to_string());
                self.release_task(&mut session).await;
                expired.push(session.session_id);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "idle sessions expired");
        }
        expired
    }

    /// Drop a finished session from the arena.
    pub async fn close(&self, id: SessionId) -> Result<(), SessionError> {
        let handle = self.get(id).await?;
        let state = handle.lock().await.state;
        if !state.is_terminal() {
            return Err(SessionError::InvalidState {
                id,
                state,
                action: "close",
            });
        }
        self.sessions.write().await.remove(&id);
        Ok(())
    }

    /// Drop every resolved or terminated session from the arena.
    pub async fn evict_finished(&self) -> usize {
        let handles: Vec<_> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();
        let mut finished = Vec::new();
        for (id, handle) in handles {
            if handle.lock().await.state.is_terminal() {
                finished.push(id);
            }
        }
        if finished.is_empty() {
            return 0;
        }
        let mut map = self.sessions.write().await;
        for id in &finished {
            map.remove(id);
        }
        debug!(count = finished.len(), remaining = map.len(), "finished sessions evicted");
        finished.len()
    }

    pub async fn snapshot(&self, id: SessionId) -> Result<SessionSnapshot, SessionError> {
        let handle = self.get(id).await?;
        let session = handle.lock().await;
        Ok(SessionSnapshot::of(&session))
    }

    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(SessionSnapshot::of(&*handle.lock().await));
        }
        out.sort_by_key(|s| s.updated_at);
        out
    }

    /// Sessions not yet resolved or terminated.
    pub async fn active_count(&self) -> usize {
        self.list()
            .await
            .iter()
            .filter(|s| !s.state.is_terminal())
            .count()
    }
}

/// Use the writer's phrasing where it gave any; templates fill the rest.
fn apply_phrasing(session: &mut DialogueSession, set: QuestionSet) {
    let first = session.hypotheses.first().map(|h| h.hypothesis_id);
    if let (Some(q), Some(id)) = (set.primary_question, first) {
        if !q.trim().is_empty() {
            session.question_overrides.insert(id, q);
        }
    }
    for phrased in set.hypotheses {
        let Some(id) = phrased.hypothesis_id else { continue };
        if session.hypothesis(id).is_some() && !phrased.verification_question.trim().is_empty() {
            session
                .question_overrides
                .entry(id)
                .or_insert(phrased.verification_question);
        }
    }
    // Relabel only when the writer kept the choice count; the confirming
    // flags stay with their positions.
    if let Some(h) = session.hypotheses.first_mut() {
        if !set.choices.is_empty() && set.choices.len() == h.choices.len() {
            for (choice, label) in h.choices.iter_mut().zip(set.choices) {
                choice.label = label;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::correlation::CorrelationResult;
    use crate::collab::{HashingEmbedder, OfflineWriter, SearchHit};
    use crate::detect::Severity;
    use crate::scheduler::FollowUpKind;
    use crate::series::{FactorKind, Granularity};
    use crate::storage::{open_pool, SqliteVectorStore};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FailingWriter;

    #[async_trait]
    impl QuestionWriter for FailingWriter {
        async fn compose(&self, _prompt: &QuestionPrompt) -> Result<QuestionSet, ServiceError> {
            Err(ServiceError::Status {
                status: 503,
                body: "unavailable".into(),
            })
        }
    }

    struct CannedWriter;

    #[async_trait]
    impl QuestionWriter for CannedWriter {
        async fn compose(&self, _prompt: &QuestionPrompt) -> Result<QuestionSet, ServiceError> {
            Ok(QuestionSet {
                primary_question: Some("Was it the heat?".into()),
                ..QuestionSet::default()
            })
        }
    }

    /// Retrieval store that can be switched off.
    struct FlakyStore {
        inner: SqliteVectorStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl RetrievalStore for FlakyStore {
        async fn store(
            &self,
            collection: &str,
            id: &str,
            vector: &[f32],
            record: &KnowledgeRecord,
        ) -> Result<(), ServiceError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(ServiceError::Storage("down".into()));
            }
            self.inner.store(collection, id, vector, record).await
        }

        async fn search(
            &self,
            collection: &str,
            vector: &[f32],
            filter: &SearchFilter,
            limit: usize,
        ) -> Result<Vec<SearchHit>, ServiceError> {
            self.inner.search(collection, vector, filter, limit).await
        }

        async fn delete_by_type(&self, collection: &str, record_type: &str) -> Result<usize, ServiceError> {
            self.inner.delete_by_type(collection, record_type).await
        }
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

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: DialogueSessionManager,
        scheduler: FollowUpScheduler,
        store: Arc<FlakyStore>,
        pool: Pool,
        config: Arc<Config>,
        templates: Arc<TemplateTable>,
    }

    fn fixture(writer: Arc<dyn QuestionWriter>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("m.db")).unwrap();
        let mut config = Config::default();
        config.dialogue.idle_expiry_hours = Some(24);
        let config = Arc::new(config);
        let templates = Arc::new(TemplateTable::embedded().unwrap());
        let scheduler = FollowUpScheduler::new(pool.clone(), config.followup.clone());
        let store = Arc::new(FlakyStore {
            inner: SqliteVectorStore::new(pool.clone()),
            down: AtomicBool::new(false),
        });
        let collab = Collaborators {
            writer,
            store: store.clone(),
            embedder: Arc::new(HashingEmbedder::new(64)),
        };
        let manager = DialogueSessionManager::new(
            config.clone(),
            templates.clone(),
            pool.clone(),
            scheduler.clone(),
            collab,
        )
        .with_retry(RetryPolicy::none());
        Fixture {
            _dir: dir,
            manager,
            scheduler,
            store,
            pool,
            config,
            templates,
        }
    }

    fn hypotheses(f: &Fixture) -> Vec<Hypothesis> {
        let evidence = CorrelationResult {
            factor_id: "temperature".into(),
            factor_kind: FactorKind::Weather,
            lag_days: 0,
            correlation_coefficient: 0.71,
            p_value: 0.01,
            sample_size: 61,
            rank: 1,
            significant: true,
            interpretation: String::new(),
        };
        HypothesisGenerator::new(&f.config.hypothesis, &f.templates).generate(&anomaly(), &[evidence])
    }

    #[tokio::test]
    async fn test_confirmed_session_schedules_follow_ups() {
        let f = fixture(Arc::new(OfflineWriter));
        let id = f.manager.open(anomaly(), hypotheses(&f)).await;
        let q = f.manager.start(id).await.unwrap();
        assert!(q.text.contains("temperature"));

        let out = f
            .manager
            .answer(id, Answer::choice("Yes, the weather was the main driver"))
            .await
            .unwrap();
        assert_eq!(out.state, SessionState::Resolved);
        assert!(out.next_question.is_none());
        assert_eq!(out.follow_ups.len(), 4);
        assert_eq!(f.scheduler.pending_count().await.unwrap(), 4);
        assert_eq!(storage::list_responses(&f.pool, id).unwrap().len(), 1);

        let err = f.manager.answer(id, Answer::free_text("again")).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_writer_failure_falls_back_to_templates() {
        let f = fixture(Arc::new(FailingWriter));
        let id = f.manager.open(anomaly(), hypotheses(&f)).await;
        let q = f.manager.start(id).await.unwrap();
        assert!(q.text.contains("SKU-1"));
        let snap = f.manager.snapshot(id).await.unwrap();
        assert_eq!(snap.state, SessionState::AwaitingAnswer);
        assert!(snap.failure.unwrap().contains("question writer"));
    }

    #[tokio::test]
    async fn test_writer_phrasing_is_used() {
        let f = fixture(Arc::new(CannedWriter));
        let id = f.manager.open(anomaly(), hypotheses(&f)).await;
        assert_eq!(f.manager.start(id).await.unwrap().text, "Was it the heat?");
    }

    #[tokio::test]
    async fn test_store_failure_leaves_pending_turn() {
        let f = fixture(Arc::new(OfflineWriter));
        let id = f.manager.open(anomaly(), hypotheses(&f)).await;
        f.manager.start(id).await.unwrap();

        f.store.down.store(true, Ordering::SeqCst);
        let err = f.manager.answer(id, Answer::free_text("no idea")).await.unwrap_err();
        assert!(matches!(err, SessionError::External { .. }));
        let snap = f.manager.snapshot(id).await.unwrap();
        assert_eq!(snap.state, SessionState::Evaluating);
        assert!(snap.has_pending_turn);
        assert!(snap.failure.is_some());
        // Local audit log already has it.
        assert_eq!(storage::list_responses(&f.pool, id).unwrap().len(), 1);
        assert!(f.manager.answer(id, Answer::free_text("hello?")).await.is_err());

        f.store.down.store(false, Ordering::SeqCst);
        let out = f.manager.resume(id).await.unwrap();
        assert_eq!(out.response.turn, 1);
        assert_eq!(out.state, SessionState::AwaitingAnswer);
        let snap = f.manager.snapshot(id).await.unwrap();
        assert_eq!(snap.turn_count, 1);
        assert!(snap.failure.is_none());
        assert_eq!(storage::list_responses(&f.pool, id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reopened_session_does_not_schedule_again() {
        let f = fixture(Arc::new(OfflineWriter));
        let id = f.manager.open(anomaly(), hypotheses(&f)).await;
        f.manager.start(id).await.unwrap();
        let out = f.manager.answer(id, Answer::free_text("a heatwave")).await.unwrap();
        let task = out
            .follow_ups
            .iter()
            .find(|t| t.kind == FollowUpKind::LongTerm)
            .unwrap()
            .clone();

        let (reopened, q) = f.manager.reopen(&task).await.unwrap();
        assert!(q.text.contains("Weather conditions"));
        let snap = f.manager.snapshot(reopened).await.unwrap();
        assert_eq!(snap.precedents.len(), 1);
        assert!(f.manager.follow_up_in_progress(task.task_id).await);
        // Still owed until the re-opened interview ends.
        assert_eq!(f.scheduler.pending_count().await.unwrap(), 4);

        let out = f
            .manager
            .answer(reopened, Answer::choice("Yes, it happened again"))
            .await
            .unwrap();
        assert_eq!(out.state, SessionState::Resolved);
        assert!(out.follow_ups.is_empty());
        assert_eq!(f.scheduler.pending_count().await.unwrap(), 3);
        assert!(!f.manager.follow_up_in_progress(task.task_id).await);
    }

    #[tokio::test]
    async fn test_abandoned_follow_up_is_due_again() {
        let f = fixture(Arc::new(OfflineWriter));
        let resolved_at = Utc::now();
        let tasks = f.scheduler.schedule(&anomaly(), Some("a heatwave"), resolved_at).await.unwrap();
        let now = resolved_at + Duration::days(8);
        let due = f.scheduler.poll_due(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].task_id, tasks[0].task_id);

        let (id, _) = f.manager.reopen(&due[0]).await.unwrap();
        assert!(f.scheduler.poll_due(now).await.unwrap().is_empty());
        f.manager.abandon(id).await.unwrap();

        assert_eq!(f.scheduler.pending_count().await.unwrap(), 4);
        assert_eq!(f.scheduler.claimed_at(due[0].task_id).await.unwrap(), None);
        let again = f.scheduler.poll_due(now).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].task_id, due[0].task_id);
    }

    #[tokio::test]
    async fn test_abandon_refused_while_turn_pending() {
        let f = fixture(Arc::new(OfflineWriter));
        let id = f.manager.open(anomaly(), hypotheses(&f)).await;
        f.manager.start(id).await.unwrap();

        f.store.down.store(true, Ordering::SeqCst);
        f.manager.answer(id, Answer::free_text("no idea")).await.unwrap_err();
        let err = f.manager.abandon(id).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                state: SessionState::Evaluating,
                ..
            }
        ));
        // Expiry skips it too.
        assert!(f.manager.expire_idle(Utc::now() + Duration::hours(25)).await.is_empty());
        assert!(f.manager.snapshot(id).await.unwrap().has_pending_turn);

        f.store.down.store(false, Ordering::SeqCst);
        f.manager.resume(id).await.unwrap();
        let ids: Vec<String> = f
            .store
            .inner
            .search(f.manager.collection(), &[0.0; 64], &SearchFilter::default(), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.record.record_type)
            .collect();
        assert_eq!(ids, vec![RESPONSE_RECORD.to_string()]);
        f.manager.abandon(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_answers_record_one_turn() {
        let f = fixture(Arc::new(OfflineWriter));
        let id = f.manager.open(anomaly(), hypotheses(&f)).await;
        f.manager.start(id).await.unwrap();

        let (a, b) = tokio::join!(
            f.manager.answer(id, Answer::choice("Yes, the weather was the main driver")),
            f.manager.answer(id, Answer::choice("Yes, the weather was the main driver")),
        );
        let ok = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(ok, 1);
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(err, SessionError::InvalidState { .. }));

        assert_eq!(storage::list_responses(&f.pool, id).unwrap().len(), 1);
        let snap = f.manager.snapshot(id).await.unwrap();
        assert_eq!(snap.turn_count, 1);
        assert_eq!(snap.state, SessionState::Resolved);
        assert_eq!(f.scheduler.pending_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_evict_finished_keeps_live_sessions() {
        let f = fixture(Arc::new(OfflineWriter));
        let done = f.manager.open(anomaly(), hypotheses(&f)).await;
        f.manager.start(done).await.unwrap();
        f.manager.abandon(done).await.unwrap();
        let live = f.manager.open(anomaly(), hypotheses(&f)).await;
        f.manager.start(live).await.unwrap();

        assert_eq!(f.manager.evict_finished().await, 1);
        assert!(matches!(
            f.manager.snapshot(done).await,
            Err(SessionError::NotFound(_))
        ));
        assert_eq!(f.manager.list().await.len(), 1);
        assert_eq!(f.manager.evict_finished().await, 0);
    }

    #[tokio::test]
    async fn test_expire_idle_and_close() {
        let f = fixture(Arc::new(OfflineWriter));
        let id = f.manager.open(anomaly(), hypotheses(&f)).await;
        f.manager.start(id).await.unwrap();
        assert_eq!(f.manager.active_count().await, 1);
        assert!(f.manager.close(id).await.is_err());

        assert!(f.manager.expire_idle(Utc::now()).await.is_empty());
        let expired = f.manager.expire_idle(Utc::now() + Duration::hours(25)).await;
        assert_eq!(expired, vec![id]);
        assert_eq!(f.manager.active_count().await, 0);

        f.manager.close(id).await.unwrap();
        assert!(matches!(
            f.manager.snapshot(id).await,
            Err(SessionError::NotFound(_))
        ));
    }
}
