//! Per-anomaly interview sessions: state machine, answer matching and the
//! arena that owns live sessions.

pub mod manager;
pub mod matcher;
pub mod session;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::collab::ServiceError;
use crate::detect::AnomalyKey;
use crate::scheduler::{FollowUpKind, FollowUpTask};

pub use self::manager::{Collaborators, DialogueSessionManager, SessionSnapshot, TurnOutcome};
pub use self::session::DialogueSession;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingStart,
    AwaitingAnswer,
    Evaluating,
    /// Waiting for the final free-text answer.
    Escalated,
    Resolved,
    Terminated,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Resolved | SessionState::Terminated)
    }

    pub fn accepts_answer(&self) -> bool {
        matches!(self, SessionState::AwaitingAnswer | SessionState::Escalated)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::AwaitingStart => "awaiting_start",
            SessionState::AwaitingAnswer => "awaiting_answer",
            SessionState::Evaluating => "evaluating",
            SessionState::Escalated => "escalated",
            SessionState::Resolved => "resolved",
            SessionState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerType {
    Choice,
    FreeText,
}

impl std::fmt::Display for AnswerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnswerType::Choice => write!(f, "choice"),
            AnswerType::FreeText => write!(f, "free_text"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub answer_type: AnswerType,
}

impl Answer {
    pub fn free_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            answer_type: AnswerType::FreeText,
        }
    }

    pub fn choice(label: impl Into<String>) -> Self {
        Self {
            text: label.into(),
            answer_type: AnswerType::Choice,
        }
    }
}

/// How long the answer suggests the effect will last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactTag {
    OneTime,
    Recurring,
    Structural,
    Unknown,
}

impl std::fmt::Display for ImpactTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImpactTag::OneTime => write!(f, "one_time"),
            ImpactTag::Recurring => write!(f, "recurring"),
            ImpactTag::Structural => write!(f, "structural"),
            ImpactTag::Unknown => write!(f, "unknown"),
        }
    }
}

/// One answered turn. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResponse {
    pub response_id: Uuid,
    pub session_ref: SessionId,
    pub anomaly_ref: AnomalyKey,
    pub turn: u32,
    /// Hypothesis the question was about; `None` for the escalation question.
    pub hypothesis_id: Option<Uuid>,
    pub question: String,
    pub answer_text: String,
    pub answer_type: AnswerType,
    pub confirmed_hypothesis_id: Option<Uuid>,
    pub impact_tag: ImpactTag,
    pub timestamp: DateTime<Utc>,
}

/// A question waiting for an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub session_id: SessionId,
    pub hypothesis_id: Option<Uuid>,
    pub text: String,
    pub choices: Vec<String>,
    pub answer_type: AnswerType,
    /// Turn this question's answer will be recorded as.
    pub turn: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "origin")]
pub enum SessionOrigin {
    Detection,
    FollowUp { task_id: Uuid, kind: FollowUpKind },
}

impl SessionOrigin {
    pub fn for_task(task: &FollowUpTask) -> Self {
        SessionOrigin::FollowUp {
            task_id: task.task_id,
            kind: task.kind,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session {id} is {state}; cannot {action}")]
    InvalidState {
        id: SessionId,
        state: SessionState,
        action: &'static str,
    },
    #[error("session {id}: external service failed: {source}")]
    External {
        id: SessionId,
        #[source]
        source: ServiceError,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
