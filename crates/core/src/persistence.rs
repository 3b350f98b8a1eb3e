//! Durable recording of finalized turns and their evaluations.

use crate::error::{Error, Result};
use crate::generic_types::Role;
use crate::scoring::{Evaluation, Scorer};
use crate::session_state::{Session, SessionId, SessionStateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use std::sync::Arc;

mod postgrest;

pub use postgrest::PostgrestDurableStore;

/// Row written for one finalized turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnRow {
    pub session_id: SessionId,
    pub user_id: String,
    pub role: Role,
    pub turn_index: u64,
    pub text: String,
}

/// Relational store that outlives the ephemeral session entry.
///
/// Turn and evaluation inserts are independent; no transaction spans them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Returns the id of the stored turn.
    async fn insert_turn(&self, turn: &TurnRow) -> Result<String>;

    async fn insert_evaluation(&self, turn_id: &str, evaluation: &Evaluation) -> Result<()>;

    /// Records a freshly started session.
    async fn open_session(&self, session: &Session) -> Result<()>;

    /// Stores the terminal snapshot of a session.
    async fn close_session(&self, session: &Session) -> Result<()>;
}

/// Identity of the session a turn belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnContext {
    pub session_id: SessionId,
    pub user_id: String,
    pub mode_code: String,
}

impl From<&Session> for TurnContext {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            mode_code: session.mode_code.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnRecord {
    pub id: String,
    pub session_id: SessionId,
    pub role: Role,
    pub turn_index: u64,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Only ever set on user turns, and only when scoring succeeded.
    pub evaluation: Option<Evaluation>,
}

/// Outcome of persisting one user/assistant exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedPair {
    pub user: Option<TurnRecord>,
    pub assistant: Option<TurnRecord>,
}

pub struct TurnPersistenceGateway {
    store: Arc<dyn SessionStateStore>,
    durable: Arc<dyn DurableStore>,
    scorer: Arc<dyn Scorer>,
}

impl TurnPersistenceGateway {
    pub fn new(
        store: Arc<dyn SessionStateStore>,
        durable: Arc<dyn DurableStore>,
        scorer: Arc<dyn Scorer>,
    ) -> Self {
        Self {
            store,
            durable,
            scorer,
        }
    }

    /// Allocates the next turn index and writes the turn. Returns `None` when
    /// either step fails; an allocated index is never handed back, so a failed
    /// write leaves a gap in the stored sequence.
    pub async fn persist_turn(
        &self,
        ctx: &TurnContext,
        role: Role,
        text: &str,
    ) -> Option<TurnRecord> {
        let turn_index = match self.store.allocate_turn_index(&ctx.session_id).await {
            Ok(index) => index,
            Err(e) => {
                tracing::error!(session_id = %ctx.session_id, role = role.as_str(), error = %e, "Failed to allocate turn index");
                return None;
            }
        };

        let row = TurnRow {
            session_id: ctx.session_id.clone(),
            user_id: ctx.user_id.clone(),
            role,
            turn_index,
            text: text.to_string(),
        };
        let id = match self.durable.insert_turn(&row).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(session_id = %ctx.session_id, turn_index, role = role.as_str(), error = %e, "Turn was not persisted");
                return None;
            }
        };
        tracing::info!(session_id = %ctx.session_id, turn_index, role = role.as_str(), "Conversation turn added");

        let evaluation = match role {
            Role::User => self.evaluate(ctx, &id, turn_index, text).await,
            Role::Assistant => None,
        };

        Some(TurnRecord {
            id,
            session_id: row.session_id,
            role,
            turn_index,
            text: row.text,
            created_at: Utc::now(),
            evaluation,
        })
    }

    async fn evaluate(
        &self,
        ctx: &TurnContext,
        turn_id: &str,
        turn_index: u64,
        text: &str,
    ) -> Option<Evaluation> {
        let evaluation = match self.scorer.score(text, &ctx.mode_code).await {
            Ok(evaluation) => evaluation,
            Err(e) => {
                let e = Error::ScoringFailure(e.to_string());
                tracing::warn!(session_id = %ctx.session_id, turn_index, error = %e, "Failed to score user turn");
                return None;
            }
        };
        if let Err(e) = self.durable.insert_evaluation(turn_id, &evaluation).await {
            tracing::warn!(session_id = %ctx.session_id, turn_index, error = %e, "Evaluation was not stored");
        }
        tracing::info!(session_id = %ctx.session_id, turn_index, total_score = evaluation.total_score, "Turn scored");
        Some(evaluation)
    }

    /// Persists the user turn, then the assistant turn when it has text.
    /// The two writes fail independently.
    pub async fn persist_turn_pair(
        &self,
        ctx: &TurnContext,
        user_text: &str,
        assistant_text: &str,
    ) -> PersistedPair {
        let user = self.persist_turn(ctx, Role::User, user_text).await;
        let assistant = if assistant_text.is_empty() {
            None
        } else {
            self.persist_turn(ctx, Role::Assistant, assistant_text).await
        };
        PersistedPair { user, assistant }
    }
}
