use super::{NewSession, Session, SessionId, SessionStateStore, SessionStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::time::Duration;

// Refreshes an existing entry; never recreates one that has expired.
const TOUCH_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], 'last_activity', ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('EXPIRE', KEYS[2], ARGV[2])
return 1
"#;

// Returns -1 when the session is gone so HINCRBY cannot resurrect it.
const ALLOCATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
local index = redis.call('HINCRBY', KEYS[1], 'turn_index', 1)
redis.call('HSET', KEYS[1], 'last_activity', ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('EXPIRE', KEYS[2], ARGV[2])
return index
"#;

// Swaps the user's pointer to the new session and deletes the previous
// session's keys in one step, so concurrent creates for one user cannot
// leave two live sessions. Returns the previous session id, if any.
const CREATE_SCRIPT: &str = r#"
local previous = redis.call('GET', KEYS[1])
if previous then
    redis.call('DEL', 'sess:' .. previous, 'sess:' .. previous .. ':lock')
end
redis.call('HSET', KEYS[2], unpack(ARGV, 3))
redis.call('EXPIRE', KEYS[2], ARGV[2])
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
return previous
"#;

// Drops the user pointer only while it still names this session.
const CLOSE_SCRIPT: &str = r#"
redis.call('DEL', KEYS[1], KEYS[2])
if redis.call('GET', KEYS[3]) == ARGV[1] then
    redis.call('DEL', KEYS[3])
end
return 1
"#;

fn session_key(id: &SessionId) -> String {
    format!("sess:{id}")
}

fn lock_key(id: &SessionId) -> String {
    format!("sess:{id}:lock")
}

fn user_key(user_id: &str) -> String {
    format!("user_active_sess:{user_id}")
}

/// Redis-backed session store, safe to share between server processes.
///
/// Layout: `sess:{id}` is a hash holding the session fields, `sess:{id}:lock`
/// is the lease key and `user_active_sess:{user}` points at the user's live
/// session. All three carry the session TTL.
#[derive(Clone)]
pub struct RedisSessionStore {
    conn: MultiplexedConnection,
    ttl: Duration,
}

impl RedisSessionStore {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!("Connected to Redis session store");
        Ok(Self { conn, ttl })
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }

    async fn load(&self, id: &SessionId) -> Result<Option<Session>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(session_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_session(id, fields).map(Some)
    }
}

fn decode_session(id: &SessionId, mut fields: HashMap<String, String>) -> Result<Session> {
    let corrupt = |field: &str| Error::StoreUnavailable(format!("session {id} has a corrupt '{field}' field"));
    let mut take = |field: &str| fields.remove(field).ok_or_else(|| corrupt(field));

    let user_id = take("user_id")?;
    let mother_language = take("mother_language")?;
    let target_language = take("target_language")?;
    let mode_code = take("mode_code")?;
    let status = take("status")?;
    let turn_index = take("turn_index")?;
    let created_at = take("created_at")?;
    let last_activity = take("last_activity")?;
    let metadata = take("metadata").unwrap_or_else(|_| "{}".to_string());

    let parse_time = |field: &str, value: &str| {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| corrupt(field))
    };

    Ok(Session {
        id: id.clone(),
        user_id,
        mother_language,
        target_language,
        mode_code,
        status: SessionStatus::parse(&status).ok_or_else(|| corrupt("status"))?,
        turn_index: turn_index.parse().map_err(|_| corrupt("turn_index"))?,
        created_at: parse_time("created_at", &created_at)?,
        last_activity: parse_time("last_activity", &last_activity)?,
        metadata: serde_json::from_str(&metadata).map_err(|_| corrupt("metadata"))?,
    })
}

#[async_trait]
impl SessionStateStore for RedisSessionStore {
    async fn create(&self, user_id: &str, init: NewSession) -> Result<SessionId> {
        let id = SessionId::generate();
        let session = Session::open(id.clone(), user_id, init);
        let metadata = serde_json::to_string(&session.metadata)
            .map_err(|e| Error::StoreUnavailable(format!("unserializable session metadata: {e}")))?;
        let fields = [
            ("user_id", session.user_id.clone()),
            ("mother_language", session.mother_language.clone()),
            ("target_language", session.target_language.clone()),
            ("mode_code", session.mode_code.clone()),
            ("status", session.status.as_str().to_string()),
            ("turn_index", session.turn_index.to_string()),
            ("created_at", session.created_at.to_rfc3339()),
            ("last_activity", session.last_activity.to_rfc3339()),
            ("metadata", metadata),
        ];

        let create = redis::Script::new(CREATE_SCRIPT);
        let mut script = create.prepare_invoke();
        script
            .key(user_key(user_id))
            .key(session_key(&id))
            .arg(id.as_str())
            .arg(self.ttl_secs());
        for (field, value) in &fields {
            script.arg(*field).arg(value);
        }
        let mut conn = self.conn.clone();
        let previous: Option<String> = script.invoke_async(&mut conn).await?;
        if let Some(previous) = previous {
            tracing::info!(user_id, session_id = %previous, "Force-closed previous session for user");
        }

        tracing::info!(session_id = %id, user_id, "Session created in Redis");
        Ok(id)
    }

    async fn get(&self, id: &SessionId) -> Result<Session> {
        self.load(id).await?.ok_or_else(|| Error::NotFound(id.clone()))
    }

    async fn touch(&self, id: &SessionId) -> Result<()> {
        let session = self.get(id).await?;
        let mut conn = self.conn.clone();
        let touched: i64 = redis::Script::new(TOUCH_SCRIPT)
            .key(session_key(id))
            .key(user_key(&session.user_id))
            .arg(Utc::now().to_rfc3339())
            .arg(self.ttl_secs())
            .invoke_async(&mut conn)
            .await?;
        if touched == 0 {
            return Err(Error::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn allocate_turn_index(&self, id: &SessionId) -> Result<u64> {
        let session = self.get(id).await?;
        let mut conn = self.conn.clone();
        let index: i64 = redis::Script::new(ALLOCATE_SCRIPT)
            .key(session_key(id))
            .key(user_key(&session.user_id))
            .arg(Utc::now().to_rfc3339())
            .arg(self.ttl_secs())
            .invoke_async(&mut conn)
            .await?;
        u64::try_from(index).map_err(|_| Error::NotFound(id.clone()))
    }

    async fn acquire_lock(&self, id: &SessionId, lease: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key(id))
            .arg("locked")
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        let acquired = reply.is_some();
        tracing::debug!(session_id = %id, acquired, "Session lock requested");
        Ok(acquired)
    }

    async fn release_lock(&self, id: &SessionId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(lock_key(id)).await?;
        Ok(())
    }

    async fn close(&self, id: &SessionId) -> Result<Option<Session>> {
        let snapshot = self.load(id).await?.map(|mut s| {
            s.status = SessionStatus::Closed;
            s
        });
        let owner_key = snapshot
            .as_ref()
            .map(|s| user_key(&s.user_id))
            .unwrap_or_else(|| user_key(""));

        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(CLOSE_SCRIPT)
            .key(session_key(id))
            .key(lock_key(id))
            .key(owner_key)
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await?;

        tracing::info!(session_id = %id, found = snapshot.is_some(), "Session closed in Redis");
        Ok(snapshot)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
