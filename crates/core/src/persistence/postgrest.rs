use super::{DurableStore, TurnRow};
use crate::error::{Error, Result};
use crate::scoring::Evaluation;
use crate::session_state::Session;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct InsertedRow {
    id: serde_json::Value,
}

/// `DurableStore` backed by a PostgREST endpoint (`/rest/v1/<table>`).
pub struct PostgrestDurableStore {
    client: Client,
    base_url: String,
    service_key: SecretString,
}

impl PostgrestDurableStore {
    pub fn new(base_url: impl Into<String>, service_key: SecretString) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let key = self.service_key.expose_secret();
        request
            .header("apikey", key)
            .bearer_auth(key)
            .header("Prefer", "return=representation")
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::PersistenceFailure(format!("{status}: {body}")));
        }
        Ok(response)
    }
}

/// Normalises a returned primary key, which may be numeric or a uuid string.
fn id_to_string(id: serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl DurableStore for PostgrestDurableStore {
    async fn insert_turn(&self, turn: &TurnRow) -> Result<String> {
        let request = self.client.post(self.table_url("conversations")).json(turn);
        let rows: Vec<InsertedRow> = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;
        rows.into_iter()
            .next()
            .map(|row| id_to_string(row.id))
            .ok_or_else(|| Error::PersistenceFailure("insert returned no rows".to_string()))
    }

    async fn insert_evaluation(&self, turn_id: &str, evaluation: &Evaluation) -> Result<()> {
        let body = json!({
            "conversation_id": turn_id,
            "metrics": evaluation.metrics,
            "total_score": evaluation.total_score,
            "feedback": evaluation.feedback,
        });
        self.send(self.client.post(self.table_url("evaluations")).json(&body))
            .await?;
        Ok(())
    }

    async fn open_session(&self, session: &Session) -> Result<()> {
        let body = json!({
            "id": session.id,
            "user_id": session.user_id,
            "mode_code": session.mode_code,
            "language_code": session.target_language,
            "status": session.status.as_str(),
            "started_at": session.created_at,
            "metadata": session.metadata,
        });
        self.send(self.client.post(self.table_url("sessions")).json(&body))
            .await?;
        Ok(())
    }

    async fn close_session(&self, session: &Session) -> Result<()> {
        let body = json!({
            "status": "closed",
            "closed_at": Utc::now(),
            "total_turns": session.turn_index,
        });
        let url = format!("{}?id=eq.{}", self.table_url("sessions"), session.id);
        self.send(self.client.patch(url).json(&body)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_urls_ignore_trailing_slash() {
        let store = PostgrestDurableStore::new(
            "https://db.example.com/",
            SecretString::from("key".to_string()),
        );
        assert_eq!(
            store.table_url("conversations"),
            "https://db.example.com/rest/v1/conversations"
        );
    }

    #[test]
    fn returned_ids_are_normalised() {
        assert_eq!(id_to_string(json!(42)), "42");
        assert_eq!(id_to_string(json!("b1c2")), "b1c2");
    }
}
