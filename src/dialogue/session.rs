use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::matcher::{self, MatchOutcome};
use super::{
    Answer, AnomalyResponse, AnswerType, Question, SessionError, SessionId, SessionOrigin,
    SessionState,
};
use crate::detect::Anomaly;
use crate::hypothesis::Hypothesis;

/// What the session asks after a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextStep {
    Ask(Uuid),
    Escalate,
    Finish,
}

/// The outcome of evaluating one answer, not yet applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub response: AnomalyResponse,
    pub next_state: SessionState,
    pub next: NextStep,
    pub accepted: Option<Uuid>,
}

/// State of one interview about one anomaly.
#[derive(Debug, Clone)]
pub struct DialogueSession {
    pub session_id: SessionId,
    pub anomaly: Anomaly,
    pub origin: SessionOrigin,
    pub state: SessionState,
    /// Most confident first.
    pub hypotheses: Vec<Hypothesis>,
    pub asked_hypotheses: Vec<Uuid>,
    pub current: Option<Uuid>,
    pub turn_count: u32,
    pub max_turns: u32,
    pub accepted: Option<Uuid>,
    pub final_answer: Option<String>,
    /// Last external failure, kept until the session moves on.
    pub failure: Option<String>,
    pub pending: Option<Transition>,
    pub precedents: Vec<String>,
    pub question_overrides: HashMap<Uuid, String>,
    pub escalation_question: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DialogueSession {
    pub fn new(
        anomaly: Anomaly,
        hypotheses: Vec<Hypothesis>,
        origin: SessionOrigin,
        max_turns: u32,
        escalation_question: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            anomaly,
            origin,
            state: SessionState::AwaitingStart,
            hypotheses,
            asked_hypotheses: Vec::new(),
            current: None,
            turn_count: 0,
            max_turns: max_turns.max(1),
            accepted: None,
            final_answer: None,
            failure: None,
            pending: None,
            precedents: Vec::new(),
            question_overrides: HashMap::new(),
            escalation_question,
            created_at: now,
            updated_at: now,
        }
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidState {
            id: self.session_id,
            state: self.state,
            action,
        }
    }

    pub fn hypothesis(&self, id: Uuid) -> Option<&Hypothesis> {
        self.hypotheses.iter().find(|h| h.hypothesis_id == id)
    }

    /// Ask the first (most confident) hypothesis.
    pub fn begin(&mut self, now: DateTime<Utc>) -> Result<Question, SessionError> {
        if self.state != SessionState::AwaitingStart {
            return Err(self.invalid("start"));
        }
        match self.hypotheses.first().map(|h| h.hypothesis_id) {
            Some(id) => {
                self.current = Some(id);
                self.asked_hypotheses.push(id);
                self.state = SessionState::AwaitingAnswer;
            }
            None => self.state = SessionState::Escalated,
        }
        self.updated_at = now;
        self.current_question().ok_or_else(|| self.invalid("start"))
    }

    /// The question awaiting an answer, if any.
    pub fn current_question(&self) -> Option<Question> {
        let turn = self.turn_count + 1;
        match self.state {
            SessionState::AwaitingAnswer => {
                let h = self.current.and_then(|id| self.hypothesis(id))?;
                let text = self
                    .question_overrides
                    .get(&h.hypothesis_id)
                    .cloned()
                    .or_else(|| h.primary_question().map(str::to_string))
                    .unwrap_or_else(|| h.description.clone());
                Some(Question {
                    session_id: self.session_id,
                    hypothesis_id: Some(h.hypothesis_id),
                    text,
                    choices: h.choice_labels(),
                    answer_type: if h.choices.is_empty() {
                        AnswerType::FreeText
                    } else {
                        AnswerType::Choice
                    },
                    turn,
                })
            }
            SessionState::Escalated => Some(Question {
                session_id: self.session_id,
                hypothesis_id: None,
                text: self.escalation_question.clone(),
                choices: Vec::new(),
                answer_type: AnswerType::FreeText,
                turn,
            }),
            _ => None,
        }
    }

    /// Decide what `answer` does to the session without changing it.
    pub fn evaluate(&self, answer: &Answer, now: DateTime<Utc>) -> Result<Transition, SessionError> {
        if !self.state.accepts_answer() {
            return Err(self.invalid("answer"));
        }
        let question = self.current_question().ok_or_else(|| self.invalid("answer"))?;
        let turn = self.turn_count + 1;
        let mut response = AnomalyResponse {
            response_id: Uuid::new_v4(),
            session_ref: self.session_id,
            anomaly_ref: self.anomaly.key(),
            turn,
            hypothesis_id: question.hypothesis_id,
            question: question.text,
            answer_text: answer.text.clone(),
            answer_type: answer.answer_type,
            confirmed_hypothesis_id: None,
            impact_tag: matcher::classify_impact(&answer.text),
            timestamp: now,
        };

        if self.state == SessionState::Escalated {
            return Ok(Transition {
                response,
                next_state: SessionState::Terminated,
                next: NextStep::Finish,
                accepted: None,
            });
        }

        let asked = self
            .current
            .and_then(|id| self.hypothesis(id))
            .ok_or_else(|| self.invalid("answer"))?;
        let MatchOutcome { confirmed, matched } = matcher::evaluate(answer, asked);
        tracing::debug!(
            session = %self.session_id,
            hypothesis = %asked.template_id,
            confirmed,
            matched = matched.as_deref().unwrap_or(""),
            "answer evaluated"
        );

        if confirmed {
            response.confirmed_hypothesis_id = Some(asked.hypothesis_id);
            return Ok(Transition {
                response,
                next_state: SessionState::Resolved,
                next: NextStep::Finish,
                accepted: Some(asked.hypothesis_id),
            });
        }

        let unasked = self
            .hypotheses
            .iter()
            .find(|h| !self.asked_hypotheses.contains(&h.hypothesis_id));
        let (next_state, next) = match unasked {
            Some(h) if turn < self.max_turns => (SessionState::AwaitingAnswer, NextStep::Ask(h.hypothesis_id)),
            _ => (SessionState::Escalated, NextStep::Escalate),
        };
        Ok(Transition {
            response,
            next_state,
            next,
            accepted: None,
        })
    }

    /// Hold a transition while its response is being persisted.
    pub fn hold(&mut self, transition: Transition, now: DateTime<Utc>) {
        self.state = SessionState::Evaluating;
        self.pending = Some(transition);
        self.updated_at = now;
    }

    /// Commit a persisted transition and return the next question, if any.
    pub fn apply(&mut self, t: Transition, now: DateTime<Utc>) -> Option<Question> {
        self.turn_count = t.response.turn;
        self.state = t.next_state;
        self.accepted = t.accepted.or(self.accepted);
        match t.next {
            NextStep::Ask(id) => {
                self.current = Some(id);
                if !self.asked_hypotheses.contains(&id) {
                    self.asked_hypotheses.push(id);
                }
            }
            NextStep::Escalate => self.current = None,
            NextStep::Finish => {
                if t.next_state == SessionState::Terminated {
                    self.final_answer = Some(t.response.answer_text.clone());
                }
            }
        }
        self.pending = None;
        self.failure = None;
        self.updated_at = now;
        self.current_question()
    }

    /// Give up on the session. Refused while a turn is waiting to be
    /// persisted; `resume` has to land it first.
    pub fn abandon(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        if self.state.is_terminal() || self.pending.is_some() {
            return Err(self.invalid("abandon"));
        }
        self.state = SessionState::Terminated;
        self.updated_at = now;
        Ok(())
    }

    /// The explanation the session settled on.
    pub fn explanation(&self) -> Option<String> {
        self.accepted
            .and_then(|id| self.hypothesis(id))
            .map(|h| h.description.clone())
            .or_else(|| self.final_answer.clone())
    }

    pub fn is_idle(&self, now: DateTime<Utc>, max_idle: Duration) -> bool {
        !self.state.is_terminal() && now - self.updated_at >= max_idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::correlation::CorrelationResult;
    use crate::config::HypothesisConfig;
    use crate::detect::Severity;
    use crate::hypothesis::{HypothesisGenerator, TemplateTable};
    use crate::series::{FactorKind, Granularity};
    use chrono::NaiveDate;

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

    fn corr(id: &str, kind: FactorKind, r: f64, p: f64) -> CorrelationResult {
        CorrelationResult {
            factor_id: id.into(),
            factor_kind: kind,
            lag_days: 0,
            correlation_coefficient: r,
            p_value: p,
            sample_size: 61,
            rank: 1,
            significant: p <= 0.05,
            interpretation: String::new(),
        }
    }

    fn session(max_turns: u32) -> DialogueSession {
        let cfg = HypothesisConfig::default();
        let table = TemplateTable::embedded().unwrap();
        let gen = HypothesisGenerator::new(&cfg, &table);
        let hs = gen.generate(
            &anomaly(),
            &[
                corr("temperature", FactorKind::Weather, 0.71, 0.01),
                corr("cpi", FactorKind::Economic, 0.45, 0.2),
            ],
        );
        DialogueSession::new(
            anomaly(),
            hs,
            SessionOrigin::Detection,
            max_turns,
            gen.escalation_question(&anomaly()),
            Utc::now(),
        )
    }

    fn answer(s: &mut DialogueSession, text: &str) -> Option<Question> {
        let t = s.evaluate(&Answer::free_text(text), Utc::now()).unwrap();
        s.apply(t, Utc::now())
    }

    #[test]
    fn test_begin_asks_most_confident() {
        let mut s = session(2);
        let q = s.begin(Utc::now()).unwrap();
        assert_eq!(s.state, SessionState::AwaitingAnswer);
        assert_eq!(q.hypothesis_id, Some(s.hypotheses[0].hypothesis_id));
        assert_eq!(s.hypotheses[0].template_id, "weather");
        assert_eq!(q.turn, 1);
        assert_eq!(q.answer_type, AnswerType::Choice);
        assert!(s.begin(Utc::now()).is_err());
    }

    #[test]
    fn test_confirmation_resolves() {
        let mut s = session(2);
        s.begin(Utc::now()).unwrap();
        let next = answer(&mut s, "It was a heatwave");
        assert!(next.is_none());
        assert_eq!(s.state, SessionState::Resolved);
        assert_eq!(s.accepted, Some(s.hypotheses[0].hypothesis_id));
        assert!(s.explanation().unwrap().contains("Weather"));
    }

    #[test]
    fn test_unconfirmed_moves_to_next_hypothesis() {
        let mut s = session(2);
        let first = s.begin(Utc::now()).unwrap();
        let next = answer(&mut s, "not weather related, we ran a promotion").unwrap();
        assert_eq!(s.turn_count, 1);
        assert_eq!(s.state, SessionState::AwaitingAnswer);
        assert_ne!(next.hypothesis_id, first.hypothesis_id);
        assert_eq!(s.asked_hypotheses.len(), 2);
    }

    #[test]
    fn test_turn_cap_escalates_then_terminates() {
        let mut s = session(2);
        s.begin(Utc::now()).unwrap();
        answer(&mut s, "no").unwrap();
        let escalation = answer(&mut s, "no").unwrap();
        assert_eq!(s.state, SessionState::Escalated);
        assert_eq!(escalation.hypothesis_id, None);
        assert_eq!(escalation.answer_type, AnswerType::FreeText);
        assert_eq!(escalation.turn, 3);

        assert!(answer(&mut s, "a school trip came through").is_none());
        assert_eq!(s.state, SessionState::Terminated);
        assert_eq!(s.turn_count, s.max_turns + 1);
        assert_eq!(s.explanation().as_deref(), Some("a school trip came through"));

        let err = s.evaluate(&Answer::free_text("more"), Utc::now()).unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { .. }));

        let mut seen = s.asked_hypotheses.clone();
        seen.dedup();
        assert_eq!(seen.len(), s.asked_hypotheses.len());
    }

    #[test]
    fn test_evaluating_rejects_answers() {
        let mut s = session(2);
        s.begin(Utc::now()).unwrap();
        let t = s.evaluate(&Answer::free_text("no"), Utc::now()).unwrap();
        s.hold(t, Utc::now());
        assert_eq!(s.state, SessionState::Evaluating);
        assert!(s.evaluate(&Answer::free_text("no"), Utc::now()).is_err());
        assert!(s.current_question().is_none());
        // The held turn is not thrown away.
        assert!(s.abandon(Utc::now()).is_err());
        assert!(s.pending.is_some());
    }

    #[test]
    fn test_single_turn_session_escalates_immediately() {
        let mut s = session(1);
        s.begin(Utc::now()).unwrap();
        answer(&mut s, "no").unwrap();
        assert_eq!(s.state, SessionState::Escalated);
    }

    #[test]
    fn test_idle_detection() {
        let mut s = session(2);
        let t0 = Utc::now();
        s.begin(t0).unwrap();
        assert!(!s.is_idle(t0 + Duration::hours(1), Duration::hours(2)));
        assert!(s.is_idle(t0 + Duration::hours(3), Duration::hours(2)));
        s.abandon(t0).unwrap();
        assert!(!s.is_idle(t0 + Duration::hours(3), Duration::hours(2)));
        assert!(s.abandon(t0).is_err());
    }
}
