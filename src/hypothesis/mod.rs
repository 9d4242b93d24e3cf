//! Candidate explanations for an anomaly and the templates behind them.

pub mod generator;
pub mod templates;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::correlation::CorrelationResult;
use crate::detect::AnomalyKey;

pub use self::generator::HypothesisGenerator;
pub use self::templates::TemplateTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Internal,
    External,
    Environmental,
    Behavioral,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Internal => write!(f, "internal"),
            Category::External => write!(f, "external"),
            Category::Environmental => write!(f, "environmental"),
            Category::Behavioral => write!(f, "behavioral"),
        }
    }
}

/// A selectable answer and whether picking it confirms the hypothesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub label: String,
    pub confirms: bool,
}

/// A candidate cause, its evidence and how to verify it with a person.
///
/// `confidence` is fixed by the generator from the evidence and has no setter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub hypothesis_id: Uuid,
    pub anomaly_ref: AnomalyKey,
    pub template_id: String,
    pub category: Category,
    pub description: String,
    confidence: f64,
    pub evidence: Vec<CorrelationResult>,
    pub verification_questions: Vec<String>,
    pub choices: Vec<Choice>,
    /// Words in a free-text answer that confirm this hypothesis.
    pub confirm_keywords: Vec<String>,
}

impl Hypothesis {
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn primary_question(&self) -> Option<&str> {
        self.verification_questions.first().map(String::as_str)
    }

    pub fn choice_labels(&self) -> Vec<String> {
        self.choices.iter().map(|c| c.label.clone()).collect()
    }
}
