//! Seams to the outside world: question phrasing, similarity retrieval and
//! text embedding.

pub mod embed;
pub mod llm;
pub mod retry;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use self::embed::HashingEmbedder;
pub use self::llm::{HttpQuestionWriter, OfflineWriter};
pub use self::retry::{retry, RetryPolicy};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: Box<ServiceError>,
    },
}

impl ServiceError {
    /// Client errors other than rate limiting will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Status { status, .. } => *status == 429 || *status >= 500,
            ServiceError::Exhausted { .. } => false,
            _ => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Language generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptHypothesis {
    pub hypothesis_id: Uuid,
    pub description: String,
    pub template_question: String,
}

/// Everything the writer needs to phrase questions for one anomaly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionPrompt {
    pub product_id: String,
    pub date: NaiveDate,
    pub anomaly_summary: String,
    pub hypotheses: Vec<PromptHypothesis>,
    /// Explanations confirmed for similar past anomalies.
    pub precedents: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhrasedQuestion {
    #[serde(default)]
    pub hypothesis_id: Option<Uuid>,
    pub verification_question: String,
}

/// The writer's answer. Empty fields mean "keep the template phrasing".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestionSet {
    #[serde(default)]
    pub primary_question: Option<String>,
    #[serde(default)]
    pub hypotheses: Vec<PhrasedQuestion>,
    #[serde(default)]
    pub choices: Vec<String>,
}

#[async_trait]
pub trait QuestionWriter: Send + Sync {
    async fn compose(&self, prompt: &QuestionPrompt) -> Result<QuestionSet, ServiceError>;
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// A stored piece of knowledge: an answered turn or a session summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    pub record_type: String,
    pub record_date: Option<NaiveDate>,
    pub product_id: String,
    pub text: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub record_type: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl SearchFilter {
    pub fn matches(&self, record: &KnowledgeRecord) -> bool {
        if let Some(t) = &self.record_type {
            if &record.record_type != t {
                return false;
            }
        }
        if self.date_from.is_none() && self.date_to.is_none() {
            return true;
        }
        let Some(date) = record.record_date else {
            return false;
        };
        self.date_from.map_or(true, |from| date >= from) && self.date_to.map_or(true, |to| date <= to)
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub record: KnowledgeRecord,
}

#[async_trait]
pub trait RetrievalStore: Send + Sync {
    async fn store(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        record: &KnowledgeRecord,
    ) -> Result<(), ServiceError>;

    /// Most similar records first.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>, ServiceError>;

    /// Returns how many records were removed.
    async fn delete_by_type(&self, collection: &str, record_type: &str) -> Result<usize, ServiceError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;
}
