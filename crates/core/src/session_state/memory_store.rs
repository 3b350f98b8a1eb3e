use super::{NewSession, Session, SessionId, SessionStateStore, SessionStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    session: Session,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, Entry>,
    locks: HashMap<SessionId, Instant>,
    active_by_user: HashMap<String, SessionId>,
}

impl State {
    fn live_mut(&mut self, id: &SessionId, now: Instant) -> Option<&mut Entry> {
        if self.sessions.get(id).is_some_and(|e| e.expires_at <= now) {
            self.remove(id);
        }
        self.sessions.get_mut(id)
    }

    /// Drops every expired entry along with its lock and user pointer.
    fn sweep(&mut self, now: Instant) {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        let sessions = &self.sessions;
        self.locks
            .retain(|id, held_until| *held_until > now || sessions.contains_key(id));
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Swept expired sessions");
        }
    }

    fn remove(&mut self, id: &SessionId) -> Option<Session> {
        self.locks.remove(id);
        let entry = self.sessions.remove(id)?;
        if self.active_by_user.get(&entry.session.user_id) == Some(id) {
            self.active_by_user.remove(&entry.session.user_id);
        }
        Some(entry.session)
    }
}

/// Single-process session store with the same TTL and lease semantics as
/// the Redis store. Expired entries are dropped when accessed and swept on
/// every `create`.
pub struct MemorySessionStore {
    ttl: Duration,
    state: Mutex<State>,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::StoreUnavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl SessionStateStore for MemorySessionStore {
    async fn create(&self, user_id: &str, init: NewSession) -> Result<SessionId> {
        let mut state = self.state()?;
        state.sweep(Instant::now());
        if let Some(previous) = state.active_by_user.get(user_id).cloned() {
            tracing::info!(user_id, session_id = %previous, "Force-closing previous session for user");
            state.remove(&previous);
        }

        let id = SessionId::generate();
        let session = Session::open(id.clone(), user_id, init);
        state.sessions.insert(
            id.clone(),
            Entry {
                session,
                expires_at: Instant::now() + self.ttl,
            },
        );
        state.active_by_user.insert(user_id.to_string(), id.clone());
        Ok(id)
    }

    async fn get(&self, id: &SessionId) -> Result<Session> {
        let mut state = self.state()?;
        state
            .live_mut(id, Instant::now())
            .map(|e| e.session.clone())
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    async fn touch(&self, id: &SessionId) -> Result<()> {
        let ttl = self.ttl;
        let mut state = self.state()?;
        let now = Instant::now();
        let entry = state
            .live_mut(id, now)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        entry.expires_at = now + ttl;
        entry.session.last_activity = Utc::now();
        Ok(())
    }

    async fn allocate_turn_index(&self, id: &SessionId) -> Result<u64> {
        let ttl = self.ttl;
        let mut state = self.state()?;
        let now = Instant::now();
        let entry = state
            .live_mut(id, now)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        entry.session.turn_index += 1;
        entry.expires_at = now + ttl;
        entry.session.last_activity = Utc::now();
        Ok(entry.session.turn_index)
    }

    async fn acquire_lock(&self, id: &SessionId, lease: Duration) -> Result<bool> {
        let mut state = self.state()?;
        let now = Instant::now();
        match state.locks.get(id) {
            Some(held_until) if *held_until > now => Ok(false),
            _ => {
                state.locks.insert(id.clone(), now + lease);
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, id: &SessionId) -> Result<()> {
        self.state()?.locks.remove(id);
        Ok(())
    }

    async fn close(&self, id: &SessionId) -> Result<Option<Session>> {
        let mut state = self.state()?;
        let now = Instant::now();
        if state.live_mut(id, now).is_none() {
            state.locks.remove(id);
            return Ok(None);
        }
        Ok(state.remove(id).map(|mut snapshot| {
            snapshot.status = SessionStatus::Closed;
            snapshot
        }))
    }

    async fn ping(&self) -> Result<()> {
        self.state().map(|_| ())
    }
}
