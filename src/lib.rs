//! salesscope -- sales anomaly detection, cause ranking and follow-up interviews.
//!
//! This crate provides the core library for bucketing sales, flagging
//! anomalies, ranking lagged external factors, turning them into hypotheses,
//! and verifying those hypotheses through short interviews that are revisited
//! on a follow-up schedule.

pub mod analysis;
pub mod collab;
pub mod config;
pub mod detect;
pub mod dialogue;
pub mod hypothesis;
pub mod scheduler;
pub mod series;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::analysis::{AnalysisReport, AnomalyAnalysis};
use crate::collab::{HashingEmbedder, HttpQuestionWriter, OfflineWriter, QuestionWriter, RetrievalStore};
use crate::config::Config;
use crate::dialogue::{Collaborators, DialogueSessionManager, SessionId};
use crate::hypothesis::TemplateTable;
use crate::scheduler::FollowUpScheduler;
use crate::series::{ExogenousSeries, Granularity, SalesPoint};
use crate::storage::{Pool, SqliteVectorStore};

/// Wired-up components sharing one config, one database and one template
/// table.
pub struct App {
    pub config: Arc<Config>,
    pub pool: Pool,
    pub templates: Arc<TemplateTable>,
    pub scheduler: FollowUpScheduler,
    pub sessions: Arc<DialogueSessionManager>,
    pub store: Arc<SqliteVectorStore>,
}

impl App {
    /// Open storage and build every component from `config`.
    pub fn open(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        // 1. Storage
        tracing::info!(db_path = %config.storage.db_path.display(), "Initializing database");
        let pool = storage::open_pool(&config.storage.db_path)
            .with_context(|| format!("Failed to open {}", config.storage.db_path.display()))?;

        // 2. Templates
        let templates = Arc::new(TemplateTable::load(config.hypothesis.template_path.as_deref())?);

        // 3. Collaborators
        let writer: Arc<dyn QuestionWriter> = match HttpQuestionWriter::from_config(&config.services)? {
            Some(w) => Arc::new(w),
            None => {
                tracing::debug!("no language-generation endpoint configured, using template phrasing");
                Arc::new(OfflineWriter)
            }
        };
        let store = Arc::new(SqliteVectorStore::new(pool.clone()));
        let collab = Collaborators {
            writer,
            store: store.clone(),
            embedder: Arc::new(HashingEmbedder::new(config.services.embedding_dims)),
        };

        // 4. Scheduler + sessions
        let scheduler = FollowUpScheduler::new(pool.clone(), config.followup.clone());
        let sessions = Arc::new(DialogueSessionManager::new(
            config.clone(),
            templates.clone(),
            pool.clone(),
            scheduler.clone(),
            collab,
        ));

        Ok(Self {
            config,
            pool,
            templates,
            scheduler,
            sessions,
            store,
        })
    }

    /// Detect, rank and hypothesize over a batch of sales.
    pub async fn analyze(
        &self,
        points: Vec<SalesPoint>,
        exogenous: Vec<ExogenousSeries>,
        granularity: Granularity,
    ) -> Result<AnalysisReport> {
        analysis::analyze(
            self.config.clone(),
            self.templates.clone(),
            points,
            Arc::new(exogenous),
            granularity,
        )
        .await
    }

    /// Open a detection session for one analysed anomaly.
    pub async fn open_session(&self, analysis: &AnomalyAnalysis) -> SessionId {
        self.sessions
            .open(analysis.anomaly.clone(), analysis.hypotheses.clone())
            .await
    }

    /// Delete every retrieval-store record of `record_type`.
    pub async fn purge(&self, record_type: &str) -> Result<usize> {
        let removed = self
            .store
            .delete_by_type(&self.config.services.collection, record_type)
            .await?;
        tracing::info!(record_type, removed, "retrieval records purged");
        Ok(removed)
    }
}
