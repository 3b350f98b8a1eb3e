//! Owns the live connection to the conversational service and recovers it
//! after failures with a bounded number of restarts.

mod replay;

pub use replay::ReplayBuffer;

use crate::generic_types::{GenericServerEvent, GenericSessionConfig};
use crate::realtime_api::{RealtimeApi, RealtimeConnector};
use crate::settings::SessionSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Active,
    Reconnecting,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Active => "active",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

/// A server event tagged with the connection generation that produced it.
/// Consumers drop events whose generation is no longer current.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorEvent {
    pub generation: u64,
    pub event: GenericServerEvent,
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn RealtimeConnector>,
    config: GenericSessionConfig,
    connection: Option<Box<dyn RealtimeApi>>,
    forwarder: Option<JoinHandle<()>>,
    events_tx: mpsc::Sender<SupervisorEvent>,
    replay: ReplayBuffer,
    state: ConnectionState,
    generation: u64,
    restart_count: u32,
    max_restarts: u32,
    restart_cooldown: Duration,
    replay_chunk_delay: Duration,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        config: GenericSessionConfig,
        settings: &SessionSettings,
        events_tx: mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            connector,
            config,
            connection: None,
            forwarder: None,
            events_tx,
            replay: ReplayBuffer::new(settings.replay_capacity),
            state: ConnectionState::Uninitialized,
            generation: 0,
            restart_count: 0,
            max_restarts: settings.max_restarts,
            restart_cooldown: settings.restart_cooldown,
            replay_chunk_delay: settings.replay_chunk_delay,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Identifies the current connection. Bumped on every successful initialize.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn restarts_exhausted(&self) -> bool {
        self.restart_count >= self.max_restarts
    }

    pub fn buffered_chunks(&self) -> usize {
        self.replay.len()
    }

    /// Opens a connection, replays buffered audio into it and starts
    /// forwarding its events. Failures are logged and reported as `false`.
    pub async fn initialize(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            tracing::warn!("Ignoring initialize on a closed supervisor");
            return false;
        }
        self.teardown().await;

        let mut connection = match self.connector.connect(&self.config).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(error = %e, restart_count = self.restart_count, "Failed to connect to conversational service");
                return false;
            }
        };
        let events = match connection.server_events().await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %e, "Connection did not provide an event stream");
                let _ = connection.close().await;
                return false;
            }
        };

        let mut pending = self.replay.take_all().into_iter();
        if pending.len() > 0 {
            tracing::info!(chunks = pending.len(), "Replaying buffered audio");
        }
        let mut replayed = 0usize;
        while let Some(chunk) = pending.next() {
            if replayed > 0 {
                tokio::time::sleep(self.replay_chunk_delay).await;
            }
            if let Err(e) = connection.append_input_audio_buffer(chunk.clone()).await {
                tracing::warn!(error = %e, unsent = pending.len() + 1, "Stopping audio replay after send failure");
                self.replay.push(chunk);
                for rest in pending {
                    self.replay.push(rest);
                }
                break;
            }
            replayed += 1;
        }

        self.generation += 1;
        self.forwarder = Some(spawn_forwarder(events, self.events_tx.clone(), self.generation));
        self.connection = Some(connection);
        self.state = ConnectionState::Active;
        tracing::info!(generation = self.generation, "Conversational service connection active");
        true
    }

    /// Buffers the chunk for replay and sends it when a connection is active.
    /// Returns whether the chunk reached the live connection.
    pub async fn send_audio(&mut self, chunk: Vec<u8>) -> bool {
        self.replay.push(chunk.clone());
        if self.state != ConnectionState::Active {
            return false;
        }
        let Some(connection) = self.connection.as_mut() else {
            return false;
        };
        match connection.append_input_audio_buffer(chunk).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Audio send failed, chunk kept for replay");
                false
            }
        }
    }

    /// Tears down the current connection and spends one restart. Returns the
    /// cooldown to wait before [`initialize`](Self::initialize), or `None`
    /// once the restart budget is spent (the supervisor is then `Failed`).
    pub async fn begin_restart(&mut self) -> Option<Duration> {
        match self.state {
            ConnectionState::Closed | ConnectionState::Failed => return None,
            _ => {}
        }
        self.teardown().await;
        if self.restarts_exhausted() {
            tracing::error!(max_restarts = self.max_restarts, "Restart budget exhausted");
            self.state = ConnectionState::Failed;
            return None;
        }
        self.restart_count += 1;
        self.state = ConnectionState::Reconnecting;
        tracing::warn!(
            attempt = self.restart_count,
            max_restarts = self.max_restarts,
            "Restarting conversational service connection"
        );
        Some(self.restart_cooldown)
    }

    /// Blocking variant of a restart: cooldown then reconnect.
    pub async fn restart(&mut self) -> bool {
        let Some(cooldown) = self.begin_restart().await else {
            return false;
        };
        tokio::time::sleep(cooldown).await;
        self.initialize().await
    }

    /// A turn round-tripped, so the connection is healthy again.
    pub fn turn_completed(&mut self) {
        self.restart_count = 0;
        self.replay.clear();
    }

    /// Releases the connection. Idempotent; the supervisor stays closed.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.teardown().await;
        self.replay.clear();
        self.state = ConnectionState::Closed;
        tracing::info!("Conversational service connection closed");
    }

    async fn teardown(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                tracing::debug!(error = %e, "Error while closing connection");
            }
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

fn spawn_forwarder(
    mut events: mpsc::Receiver<GenericServerEvent>,
    tx: mpsc::Sender<SupervisorEvent>,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let closed = event == GenericServerEvent::Closed;
            if tx.send(SupervisorEvent { generation, event }).await.is_err() || closed {
                return;
            }
        }
        let _ = tx
            .send(SupervisorEvent {
                generation,
                event: GenericServerEvent::Closed,
            })
            .await;
    })
}
