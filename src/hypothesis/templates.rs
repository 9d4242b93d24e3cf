//! Versioned, data-driven hypothesis and question templates.
//!
//! The default table is embedded at build time; a JSON file with the same
//! shape can replace it through `hypothesis.template_path`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Category, Choice};
use crate::scheduler::FollowUpKind;
use crate::series::FactorKind;

const DEFAULT_TEMPLATES_JSON: &str = include_str!("templates.json");

/// One hypothesis template: what it claims and how to check it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub category: Category,
    pub description: String,
    pub questions: Vec<String>,
    pub confirm_keywords: Vec<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    /// Factor kinds this template explains.
    #[serde(default)]
    pub factor_kinds: Vec<FactorKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpTemplates {
    pub effect_persistence: Template,
    pub pattern_confirmation: Template,
    pub yearly_strategy: Template,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateTable {
    pub version: u32,
    pub factor_templates: Vec<Template>,
    pub combined: Template,
    pub fallback: Template,
    pub follow_up: FollowUpTemplates,
    pub escalation_question: String,
}

impl TemplateTable {
    /// The table compiled into the binary.
    pub fn embedded() -> Result<Self> {
        Self::from_json(DEFAULT_TEMPLATES_JSON).context("embedded template table is invalid")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let table: Self = serde_json::from_str(json)?;
        table.check()?;
        Ok(table)
    }

    /// Load from `path`, falling back to the embedded table if it is missing
    /// or invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            match std::fs::read_to_string(path) {
                Ok(content) => match Self::from_json(&content) {
                    Ok(table) => {
                        info!(path = %path.display(), version = table.version, "loaded template table");
                        return Ok(table);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "invalid template table, using embedded default");
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "template table not readable, using embedded default");
                }
            }
        }
        Self::embedded()
    }

    fn check(&self) -> Result<()> {
        let all = self
            .factor_templates
            .iter()
            .chain([
                &self.combined,
                &self.fallback,
                &self.follow_up.effect_persistence,
                &self.follow_up.pattern_confirmation,
                &self.follow_up.yearly_strategy,
            ]);
        for t in all {
            if t.questions.is_empty() {
                anyhow::bail!("template '{}' has no questions", t.id);
            }
        }
        Ok(())
    }

    /// First factor template listing `kind`.
    pub fn for_factor(&self, kind: FactorKind) -> Option<&Template> {
        self.factor_templates
            .iter()
            .find(|t| t.factor_kinds.contains(&kind))
    }

    pub fn for_follow_up(&self, kind: FollowUpKind) -> &Template {
        match kind {
            FollowUpKind::ShortTerm | FollowUpKind::MediumTerm => &self.follow_up.effect_persistence,
            FollowUpKind::LongTerm => &self.follow_up.pattern_confirmation,
            FollowUpKind::Yearly => &self.follow_up.yearly_strategy,
        }
    }
}

/// Replace `{name}` placeholders; unknown placeholders are left as-is.
pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_table_sanity() {
        let table = TemplateTable::embedded().unwrap();
        assert!(table.version >= 1);
        for kind in [
            FactorKind::Weather,
            FactorKind::Economic,
            FactorKind::Promotion,
            FactorKind::Event,
            FactorKind::Other,
        ] {
            assert!(table.for_factor(kind).is_some(), "no template for {kind:?}");
        }
        assert_eq!(
            table.for_factor(FactorKind::Weather).unwrap().category,
            Category::Environmental
        );
        assert_eq!(table.fallback.category, Category::Internal);
    }

    #[test]
    fn test_every_template_has_a_confirming_choice() {
        let table = TemplateTable::embedded().unwrap();
        for t in table.factor_templates.iter().chain([&table.combined, &table.fallback]) {
            assert!(t.choices.iter().any(|c| c.confirms), "{} lacks a confirming choice", t.id);
            assert!(!t.confirm_keywords.is_empty());
        }
    }

    #[test]
    fn test_follow_up_template_selection() {
        let table = TemplateTable::embedded().unwrap();
        assert_eq!(table.for_follow_up(FollowUpKind::ShortTerm).id, "effect_persistence");
        assert_eq!(table.for_follow_up(FollowUpKind::MediumTerm).id, "effect_persistence");
        assert_eq!(table.for_follow_up(FollowUpKind::LongTerm).id, "pattern_confirmation");
        assert_eq!(table.for_follow_up(FollowUpKind::Yearly).id, "yearly_strategy");
    }

    #[test]
    fn test_load_falls_back_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("templates.json");
        std::fs::write(&path, "{ not json").unwrap();
        let table = TemplateTable::load(Some(&path)).unwrap();
        assert_eq!(table.fallback.id, "internal_action");
    }

    #[test]
    fn test_render_placeholders() {
        let mut vars = HashMap::new();
        vars.insert("product", "SKU-1".to_string());
        vars.insert("date", "2024-03-15".to_string());
        assert_eq!(
            render("{product} on {date} ({unknown})", &vars),
            "SKU-1 on 2024-03-15 ({unknown})"
        );
        assert_eq!(render("open { brace", &vars), "open { brace");
    }
}
