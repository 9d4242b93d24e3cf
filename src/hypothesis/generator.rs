use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use super::templates::{render, Template, TemplateTable};
use super::{Category, Hypothesis};
use crate::analysis::correlation::CorrelationResult;
use crate::config::HypothesisConfig;
use crate::detect::Anomaly;
use crate::scheduler::FollowUpKind;

/// Turns ranked correlations into hypotheses the dialogue can verify.
pub struct HypothesisGenerator<'a> {
    config: &'a HypothesisConfig,
    templates: &'a TemplateTable,
}

impl<'a> HypothesisGenerator<'a> {
    pub fn new(config: &'a HypothesisConfig, templates: &'a TemplateTable) -> Self {
        Self { config, templates }
    }

    /// Hypotheses for `anomaly`, most confident first. Never empty: the
    /// catch-all internal-action hypothesis is always included.
    pub fn generate(&self, anomaly: &Anomaly, correlations: &[CorrelationResult]) -> Vec<Hypothesis> {
        let mut qualifying: Vec<&CorrelationResult> = correlations
            .iter()
            .filter(|c| c.strength() >= self.config.min_coefficient)
            .collect();
        qualifying.sort_by(|a, b| b.strength().partial_cmp(&a.strength()).unwrap_or(Ordering::Equal));

        let mut out = Vec::with_capacity(qualifying.len() + 2);
        for &c in &qualifying {
            let Some(template) = self.templates.for_factor(c.factor_kind) else {
                warn!(factor = %c.factor_id, kind = ?c.factor_kind, "no template for factor kind");
                continue;
            };
            out.push(build(
                anomaly,
                template,
                template.category,
                evidence_confidence(c),
                vec![c.clone()],
                &vars(anomaly, Some(c), None),
            ));
        }

        let significant: Vec<&CorrelationResult> =
            qualifying.iter().copied().filter(|c| c.significant).collect();
        if let [first, second, ..] = significant[..] {
            let category = self
                .templates
                .for_factor(first.factor_kind)
                .map(|t| t.category)
                .unwrap_or(self.templates.combined.category);
            let mut v = vars(anomaly, Some(first), None);
            v.insert("factor", format!("{} and {}", first.factor_id, second.factor_id));
            out.push(build(
                anomaly,
                &self.templates.combined,
                category,
                (evidence_confidence(first) + evidence_confidence(second)) / 2.0,
                vec![first.clone(), second.clone()],
                &v,
            ));
        }

        out.push(build(
            anomaly,
            &self.templates.fallback,
            self.templates.fallback.category,
            self.config.fallback_confidence.clamp(0.0, 1.0),
            Vec::new(),
            &vars(anomaly, None, None),
        ));

        // Stable: on equal confidence, evidence-backed hypotheses stay first.
        out.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));
        debug!(anomaly = %anomaly.key(), count = out.len(), "hypotheses generated");
        out
    }

    /// The hypothesis a re-opened session asks about.
    pub fn follow_up(&self, anomaly: &Anomaly, kind: FollowUpKind, explanation: Option<&str>) -> Hypothesis {
        let template = self.templates.for_follow_up(kind);
        build(
            anomaly,
            template,
            template.category,
            self.config.fallback_confidence.clamp(0.0, 1.0),
            Vec::new(),
            &vars(anomaly, None, explanation),
        )
    }

    /// The final open-ended question of an escalated session.
    pub fn escalation_question(&self, anomaly: &Anomaly) -> String {
        render(&self.templates.escalation_question, &vars(anomaly, None, None))
    }
}

/// |r| weighted by significance, clipped to [0, 1].
pub fn evidence_confidence(c: &CorrelationResult) -> f64 {
    (c.strength() * (1.0 - c.p_value)).clamp(0.0, 1.0)
}

fn build(
    anomaly: &Anomaly,
    template: &Template,
    category: Category,
    confidence: f64,
    evidence: Vec<CorrelationResult>,
    vars: &HashMap<&str, String>,
) -> Hypothesis {
    Hypothesis {
        hypothesis_id: Uuid::new_v4(),
        anomaly_ref: anomaly.key(),
        template_id: template.id.clone(),
        category,
        description: render(&template.description, vars),
        confidence,
        evidence,
        verification_questions: template.questions.iter().map(|q| render(q, vars)).collect(),
        choices: template.choices.clone(),
        confirm_keywords: template.confirm_keywords.clone(),
    }
}

fn vars<'k>(
    anomaly: &Anomaly,
    evidence: Option<&CorrelationResult>,
    explanation: Option<&str>,
) -> HashMap<&'k str, String> {
    let mut v = HashMap::new();
    v.insert("product", anomaly.product_id.clone());
    v.insert("date", anomaly.date.to_string());
    v.insert("period", anomaly.granularity.to_string());
    v.insert("actual", format!("{:.0}", anomaly.actual_value));
    v.insert("expected", format!("{:.0}", anomaly.expected_value));
    v.insert(
        "direction",
        if anomaly.is_spike() { "spike" } else { "drop" }.to_string(),
    );
    v.insert(
        "explanation",
        explanation.unwrap_or("no confirmed explanation").to_string(),
    );
    if let Some(c) = evidence {
        v.insert("factor", c.factor_id.clone());
        v.insert(
            "relation",
            if c.correlation_coefficient >= 0.0 {
                "in step with sales"
            } else {
                "against sales"
            }
            .to_string(),
        );
        v.insert(
            "lag",
            match c.lag_days {
                0 => "on the same day".to_string(),
                l if l > 0 => format!("{l} day(s) earlier"),
                l => format!("{} day(s) later", -l),
            },
        );
    }
    v
}
