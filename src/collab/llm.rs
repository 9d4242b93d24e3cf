//! Question phrasing through an OpenAI-compatible chat-completions endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{QuestionPrompt, QuestionSet, QuestionWriter, ServiceError};
use crate::config::ServicesConfig;

const SYSTEM_PROMPT: &str = "You help a retail analyst interview store staff about unusual sales. \
Rewrite each verification question so it is short, concrete and friendly. Keep the meaning. \
Reply with JSON only: {\"primary_question\": string, \"hypotheses\": \
[{\"hypothesis_id\": string, \"verification_question\": string}], \"choices\": [string]}.";

pub struct HttpQuestionWriter {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpQuestionWriter {
    /// `None` when no endpoint is configured.
    pub fn from_config(cfg: &ServicesConfig) -> Result<Option<Self>> {
        let Some(endpoint) = cfg.llm_endpoint.as_deref() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let url = if endpoint.ends_with("/chat/completions") {
            endpoint.to_string()
        } else {
            format!("{}/chat/completions", endpoint.trim_end_matches('/'))
        };
        Ok(Some(Self {
            client,
            url,
            model: cfg.llm_model.clone(),
            api_key: std::env::var(&cfg.llm_api_key_env).ok(),
        }))
    }
}

#[async_trait]
impl QuestionWriter for HttpQuestionWriter {
    async fn compose(&self, prompt: &QuestionPrompt) -> Result<QuestionSet, ServiceError> {
        let user = serde_json::to_string(prompt).map_err(|e| ServiceError::Decode(e.to_string()))?;
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user },
            ],
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| ServiceError::Decode(e.to_string()))?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ServiceError::Decode("response has no message content".into()))?;
        debug!(chars = content.len(), "question writer replied");
        parse_question_set(content)
    }
}

/// Writer used when no endpoint is configured: template phrasing throughout.
pub struct OfflineWriter;

#[async_trait]
impl QuestionWriter for OfflineWriter {
    async fn compose(&self, _prompt: &QuestionPrompt) -> Result<QuestionSet, ServiceError> {
        Ok(QuestionSet::default())
    }
}

/// Models like to wrap JSON in prose or code fences; take the outermost object.
pub fn parse_question_set(content: &str) -> Result<QuestionSet, ServiceError> {
    let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) else {
        return Err(ServiceError::Decode("no JSON object in reply".into()));
    };
    if end < start {
        return Err(ServiceError::Decode("no JSON object in reply".into()));
    }
    serde_json::from_str(&content[start..=end]).map_err(|e| ServiceError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"primary_question\": \"Was it hot?\", \"choices\": [\"Yes\", \"No\"]}\n```";
        let set = parse_question_set(reply).unwrap();
        assert_eq!(set.primary_question.as_deref(), Some("Was it hot?"));
        assert_eq!(set.choices.len(), 2);
        assert!(set.hypotheses.is_empty());
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(matches!(
            parse_question_set("sorry, I cannot help"),
            Err(ServiceError::Decode(_))
        ));
        assert!(parse_question_set("} backwards {").is_err());
    }

    #[test]
    fn test_unconfigured_writer_is_none() {
        assert!(HttpQuestionWriter::from_config(&ServicesConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_endpoint_gets_completions_path() {
        let cfg = ServicesConfig {
            llm_endpoint: Some("http://localhost:8000/v1/".into()),
            ..ServicesConfig::default()
        };
        let writer = HttpQuestionWriter::from_config(&cfg).unwrap().unwrap();
        assert_eq!(writer.url, "http://localhost:8000/v1/chat/completions");
    }
}
