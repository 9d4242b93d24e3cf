//! Deciding whether an answer confirms the hypothesis it was asked about.
//!
//! Choice answers carry their verdict in the template. Free text is split
//! into clauses; a confirming keyword counts unless a negation sits within
//! `NEGATION_WINDOW` tokens of it in the same clause, or the clause hedges.
//! Keywords match whole tokens only; templates list the inflections they accept.

use super::{Answer, AnswerType, ImpactTag};
use crate::hypothesis::Hypothesis;

const NEGATION_WINDOW: usize = 3;

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "nothing", "none", "neither", "nor", "without", "isn't", "wasn't",
    "weren't", "didn't", "don't", "doesn't", "hardly", "unrelated", "irrelevant",
];
const HEDGES: &[&str] = &["maybe", "perhaps", "possibly", "might", "unsure"];
const AFFIRMATIONS: &[&str] = &["yes", "yeah", "yep", "exactly", "definitely", "absolutely"];
const DENIALS: &[&str] = &["no", "nope", "nah"];

const RECURRING_CUES: &[&str] = &[
    "every", "weekly", "monthly", "annual", "annually", "yearly", "seasonal", "season", "recurring",
    "regularly", "again", "always", "usually",
];
const STRUCTURAL_CUES: &[&str] = &[
    "permanent", "permanently", "closed", "closure", "relocated", "discontinued", "launched",
    "ongoing", "structural", "trend", "competitor", "competitors",
];
const ONE_TIME_CUES: &[&str] = &[
    "once", "single", "isolated", "temporary", "exceptional", "unusual", "bulk", "special",
];

/// What the matcher concluded and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub confirmed: bool,
    /// The choice label or keyword that decided it.
    pub matched: Option<String>,
}

impl MatchOutcome {
    fn no() -> Self {
        Self {
            confirmed: false,
            matched: None,
        }
    }
}

pub fn evaluate(answer: &Answer, hypothesis: &Hypothesis) -> MatchOutcome {
    let text = answer.text.trim();
    if let Some(choice) = hypothesis
        .choices
        .iter()
        .find(|c| c.label.trim().eq_ignore_ascii_case(text))
    {
        return MatchOutcome {
            confirmed: choice.confirms,
            matched: Some(choice.label.clone()),
        };
    }
    if answer.answer_type == AnswerType::Choice {
        tracing::debug!(answer = %text, "choice answer matches no label, reading as free text");
    }

    let clauses = clauses(text);
    if let Some(first) = clauses.first().and_then(|c| c.first()) {
        if DENIALS.contains(&first.as_str()) {
            return MatchOutcome::no();
        }
        // A leading yes only counts if nothing after it takes it back.
        let retracted = clauses
            .iter()
            .flatten()
            .skip(1)
            .any(|t| is_negation(t) || is_hedge(t));
        if AFFIRMATIONS.contains(&first.as_str()) && !retracted {
            return MatchOutcome {
                confirmed: true,
                matched: Some(first.clone()),
            };
        }
    }

    let keywords: Vec<String> = hypothesis
        .confirm_keywords
        .iter()
        .map(|k| k.to_lowercase())
        .collect();
    for clause in &clauses {
        if clause.iter().any(|t| is_hedge(t)) {
            continue;
        }
        for (i, token) in clause.iter().enumerate() {
            let Some(kw) = keywords.iter().find(|kw| token == kw.as_str()) else {
                continue;
            };
            let lo = i.saturating_sub(NEGATION_WINDOW);
            let hi = (i + NEGATION_WINDOW + 1).min(clause.len());
            let negated = clause[lo..hi]
                .iter()
                .enumerate()
                .any(|(j, t)| lo + j != i && is_negation(t));
            if !negated {
                return MatchOutcome {
                    confirmed: true,
                    matched: Some(kw.clone()),
                };
            }
        }
    }
    MatchOutcome::no()
}

/// Tag the answer by the most lasting effect it describes.
pub fn classify_impact(text: &str) -> ImpactTag {
    let lower = normalise(text);
    let tokens: Vec<&str> = lower
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
        .collect();
    let has = |cues: &[&str]| tokens.iter().any(|t| cues.contains(t));

    if has(RECURRING_CUES) {
        ImpactTag::Recurring
    } else if has(STRUCTURAL_CUES) {
        ImpactTag::Structural
    } else if has(ONE_TIME_CUES) || lower.contains("one-off") || lower.contains("one off") {
        ImpactTag::OneTime
    } else {
        ImpactTag::Unknown
    }
}

fn normalise(text: &str) -> String {
    text.to_lowercase().replace('\u{2019}', "'")
}

fn clauses(text: &str) -> Vec<Vec<String>> {
    let lower = normalise(text);
    let mut out = Vec::new();
    for part in lower.split(|c: char| matches!(c, ',' | '.' | ';' | '!' | '?' | ':')) {
        let mut current = Vec::new();
        let tokens = part
            .split(|c: char| !(c.is_alphanumeric() || c == '\''))
            .filter(|t| !t.is_empty());
        for token in tokens {
            if token == "but" {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
                continue;
            }
            current.push(token.to_string());
        }
        if !current.is_empty() {
            out.push(current);
        }
    }
    out
}

fn is_negation(token: &str) -> bool {
    NEGATIONS.contains(&token) || token.ends_with("n't")
}

fn is_hedge(token: &str) -> bool {
    HEDGES.contains(&token)
}
