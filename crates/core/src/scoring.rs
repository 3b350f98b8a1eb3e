use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scores and feedback for one user turn on a 0-100 scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub metrics: BTreeMap<String, f64>,
    pub total_score: f64,
    pub feedback: String,
}

impl Evaluation {
    /// Clamps every score into 0..=100.
    pub fn clamped(mut self) -> Self {
        self.total_score = clamp_score(self.total_score);
        for score in self.metrics.values_mut() {
            *score = clamp_score(*score);
        }
        self
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() { 0.0 } else { score.clamp(0.0, 100.0) }
}

/// Grades a user utterance for a teaching mode. Treated as opaque by the
/// session core; any error means "no evaluation".
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, text: &str, mode_code: &str) -> Result<Evaluation>;
}

/// Used when no scoring backend is configured. Every call fails, so user
/// turns are persisted without an evaluation.
pub struct DisabledScorer;

#[async_trait]
impl Scorer for DisabledScorer {
    async fn score(&self, _text: &str, _mode_code: &str) -> Result<Evaluation> {
        Err(anyhow::anyhow!("scoring is disabled"))
    }
}

#[derive(Debug, Deserialize)]
struct LlmResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: String,
}

/// Scores turns with an OpenAI-compatible chat completion endpoint.
pub struct LlmScorer {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl LlmScorer {
    pub fn new(base_url: impl Into<String>, api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        }
    }

    fn prompt(text: &str, mode_code: &str) -> String {
        format!(
            r#"You grade a language learner's spoken turn in the teaching mode "{mode_code}".
Learner said: "{text}"

Score grammar, vocabulary, fluency and relevance from 0 to 100 and give one or two sentences of encouraging, concrete feedback.
Respond ONLY as JSON: {{"metrics": {{"grammar": <n>, "vocabulary": <n>, "fluency": <n>, "relevance": <n>}}, "total_score": <n>, "feedback": "<text>"}}"#
        )
    }
}

#[async_trait]
impl Scorer for LlmScorer {
    async fn score(&self, text: &str, mode_code: &str) -> Result<Evaluation> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": Self::prompt(text, mode_code) }],
            "response_format": { "type": "json_object" }
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<LlmResponse>()
            .await?;

        let content = &resp
            .choices
            .first()
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?
            .message
            .content;
        parse_evaluation(content)
    }
}

/// Parses the model's JSON answer, tolerating a fenced code block around it.
pub fn parse_evaluation(content: &str) -> Result<Evaluation> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let evaluation: Evaluation = serde_json::from_str(trimmed)?;
    Ok(evaluation.clamped())
}
