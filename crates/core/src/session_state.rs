//! Ephemeral registry of live sessions.
//!
//! A `SessionStateStore` owns every active [`Session`] until it is closed or
//! its TTL lapses. It hands out turn indices with a single atomic increment,
//! grants short lock leases for multi-step operations and keeps at most one
//! active session per user. A missing entry means "closed or expired"; the
//! store does not tell the two apart.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

mod memory_store;
mod redis_store;

pub use memory_store::MemorySessionStore;
pub use redis_store::RedisSessionStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "closed" => Some(SessionStatus::Closed),
            "expired" => Some(SessionStatus::Expired),
            _ => None,
        }
    }
}

/// Everything the caller supplies when opening a session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub mother_language: String,
    pub target_language: String,
    pub mode_code: String,
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: String,
    pub mother_language: String,
    pub target_language: String,
    pub mode_code: String,
    pub status: SessionStatus,
    /// Last allocated turn index; 0 until the first turn is persisted.
    pub turn_index: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl Session {
    pub(crate) fn open(id: SessionId, user_id: &str, init: NewSession) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: user_id.to_string(),
            mother_language: init.mother_language,
            target_language: init.target_language,
            mode_code: init.mode_code,
            status: SessionStatus::Active,
            turn_index: 0,
            created_at: now,
            last_activity: now,
            metadata: init.metadata,
        }
    }
}

/// Shared, TTL-backed registry of active sessions.
///
/// Implementations must be safe to use from many coordinators at once,
/// possibly in different processes.
#[async_trait]
pub trait SessionStateStore: Send + Sync {
    /// Opens a session for `user_id`, force-closing any session that user
    /// already has. The new entry starts at turn index 0.
    async fn create(&self, user_id: &str, init: NewSession) -> Result<SessionId>;

    /// Fails with `Error::NotFound` when the entry is closed or expired.
    async fn get(&self, id: &SessionId) -> Result<Session>;

    /// Refreshes the TTL and the last-activity timestamp.
    async fn touch(&self, id: &SessionId) -> Result<()>;

    /// Atomically increments the turn counter and returns the new value.
    async fn allocate_turn_index(&self, id: &SessionId) -> Result<u64>;

    /// Tries to take the session lock for `lease`. Returns `false` if another
    /// holder's lease is still running. The lock is gone once the lease
    /// expires, whether or not it was released.
    async fn acquire_lock(&self, id: &SessionId, lease: Duration) -> Result<bool>;

    async fn release_lock(&self, id: &SessionId) -> Result<()>;

    /// Removes the entry, its lock and the owner's active-session pointer.
    /// Returns the last state of the session if it was still present.
    async fn close(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Cheap reachability check used by the health endpoint.
    async fn ping(&self) -> Result<()>;
}
