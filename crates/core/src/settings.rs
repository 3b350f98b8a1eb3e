use std::time::Duration;

/// Tunables for one voice session. Defaults match production settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// TTL of the ephemeral session entry, refreshed on every mutation.
    pub session_ttl: Duration,
    /// Lease used when closing a session under its lock.
    pub lock_lease: Duration,
    /// Connection restarts allowed before the session fails.
    pub max_restarts: u32,
    /// Fixed pause between closing a broken connection and reconnecting.
    pub restart_cooldown: Duration,
    /// Most recent audio chunks kept for replay after a reconnect.
    pub replay_capacity: usize,
    pub replay_chunk_delay: Duration,
    /// Sample rate reported to the client with outbound audio.
    pub receive_sample_rate: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(3600),
            lock_lease: Duration::from_secs(10),
            max_restarts: 3,
            restart_cooldown: Duration::from_secs(1),
            replay_capacity: 10,
            replay_chunk_delay: Duration::from_millis(10),
            receive_sample_rate: 24_000,
        }
    }
}
