//! Binds one client connection to a session: routes client audio into the
//! supervisor, service events into the aggregator, and completed turns into
//! the persistence gateway.

use crate::aggregator::TurnAggregator;
use crate::error::Error;
use crate::generic_types::{GenericServerEvent, GenericSessionConfig};
use crate::instructions::InstructionSource;
use crate::messages::{ClientMessage, ServerMessage, StartSession, decode_audio};
use crate::persistence::{DurableStore, TurnContext, TurnPersistenceGateway};
use crate::realtime_api::RealtimeConnector;
use crate::scoring::Scorer;
use crate::session_state::{NewSession, SessionId, SessionStateStore};
use crate::settings::SessionSettings;
use crate::supervisor::{ConnectionSupervisor, SupervisorEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    SessionStarting,
    SessionActive,
    SessionEnding,
    Closed,
    Failed,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::SessionStarting => "session_starting",
            CoordinatorState::SessionActive => "session_active",
            CoordinatorState::SessionEnding => "session_ending",
            CoordinatorState::Closed => "closed",
            CoordinatorState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinatorState::Closed | CoordinatorState::Failed)
    }
}

/// Collaborators shared by every coordinator in the process.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<dyn SessionStateStore>,
    pub durable: Arc<dyn DurableStore>,
    pub scorer: Arc<dyn Scorer>,
    pub connector: Arc<dyn RealtimeConnector>,
    pub instructions: Arc<dyn InstructionSource>,
    pub settings: SessionSettings,
    pub voice: Option<String>,
}

struct LiveSession {
    ctx: TurnContext,
    supervisor: ConnectionSupervisor,
    aggregator: TurnAggregator,
}

pub struct SessionCoordinator {
    deps: SessionDeps,
    gateway: TurnPersistenceGateway,
    outbound: mpsc::Sender<ServerMessage>,
    events_tx: mpsc::Sender<SupervisorEvent>,
    events_rx: Option<mpsc::Receiver<SupervisorEvent>>,
    state: CoordinatorState,
    live: Option<LiveSession>,
    reconnect_at: Option<Instant>,
    client_connected: bool,
}

impl SessionCoordinator {
    pub fn new(deps: SessionDeps, outbound: mpsc::Sender<ServerMessage>) -> Self {
        let gateway = TurnPersistenceGateway::new(
            deps.store.clone(),
            deps.durable.clone(),
            deps.scorer.clone(),
        );
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            deps,
            gateway,
            outbound,
            events_tx,
            events_rx: Some(events_rx),
            state: CoordinatorState::Idle,
            live: None,
            reconnect_at: None,
            client_connected: true,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Drives the session until it is closed or failed, or the client goes
    /// away. Returns the final state.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ClientMessage>) -> CoordinatorState {
        let Some(mut events) = self.events_rx.take() else {
            tracing::error!("Coordinator was already run");
            return self.state;
        };

        while !self.state.is_terminal() {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.handle_client_message(message).await,
                    None => self.client_disconnected().await,
                },
                Some(event) = events.recv() => self.handle_supervisor_event(event).await,
                _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.attempt_reconnect().await;
                }
            }
        }
        self.state
    }

    async fn send(&mut self, message: ServerMessage) {
        if !self.client_connected {
            return;
        }
        if self.outbound.send(message).await.is_err() {
            tracing::debug!("Client channel closed, dropping outbound message");
            self.client_connected = false;
        }
    }

    async fn reject(&mut self, expected: &'static str) {
        let e = Error::InvalidSessionState {
            expected,
            actual: self.state.as_str(),
        };
        tracing::warn!(error = %e, "Rejected client message");
        self.send(ServerMessage::info(e.to_string())).await;
    }

    pub async fn handle_client_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::StartSession(start) => {
                if self.state != CoordinatorState::Idle {
                    return self.reject("idle").await;
                }
                self.start_session(start).await;
            }
            ClientMessage::Audio { data } => {
                if self.state != CoordinatorState::SessionActive {
                    return self.reject("session_active").await;
                }
                let chunk = match decode_audio(&data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!(error = %e, "Invalid audio payload");
                        return self.send(ServerMessage::info("Invalid audio payload")).await;
                    }
                };
                if let Some(live) = self.live.as_mut() {
                    live.supervisor.send_audio(chunk).await;
                }
            }
            ClientMessage::EndSession => {
                if self.state != CoordinatorState::SessionActive {
                    return self.reject("session_active").await;
                }
                self.end_session().await;
            }
        }
    }

    async fn client_disconnected(&mut self) {
        tracing::info!(state = self.state.as_str(), "Client disconnected");
        self.client_connected = false;
        match self.state {
            CoordinatorState::SessionActive => self.end_session().await,
            _ => self.state = CoordinatorState::Closed,
        }
    }

    async fn start_session(&mut self, start: StartSession) {
        self.state = CoordinatorState::SessionStarting;
        tracing::info!(
            user_id = %start.user_id,
            target_language = %start.target_language,
            teaching_mode = %start.teaching_mode,
            "Starting voice session"
        );

        let mut metadata = HashMap::new();
        metadata.insert("user_level".to_string(), Value::from(start.user_level.clone()));
        if let Some(scenario) = &start.scenario {
            metadata.insert("scenario".to_string(), Value::from(scenario.clone()));
        }
        let init = NewSession {
            mother_language: start.mother_language.clone(),
            target_language: start.target_language.clone(),
            mode_code: start.teaching_mode.clone(),
            metadata,
        };

        let store = self.deps.store.clone();
        let session = match store.create(&start.user_id, init).await {
            Ok(id) => store.get(&id).await,
            Err(e) => Err(e),
        };
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "Could not register session");
                self.state = CoordinatorState::Idle;
                return self
                    .send(ServerMessage::Error {
                        message: e.to_string(),
                        fatal: e.is_fatal(),
                    })
                    .await;
            }
        };

        let config = GenericSessionConfig {
            instructions: self.deps.instructions.instructions(&start),
            voice: self.deps.voice.clone(),
        };
        let mut supervisor = ConnectionSupervisor::new(
            self.deps.connector.clone(),
            config,
            &self.deps.settings,
            self.events_tx.clone(),
        );
        if !supervisor.initialize().await {
            let e = Error::ConnectionFailure("could not open conversational session".to_string());
            tracing::error!(session_id = %session.id, error = %e, "Session start failed");
            if let Err(e) = store.close(&session.id).await {
                tracing::warn!(session_id = %session.id, error = %e, "Failed to discard session entry");
            }
            self.state = CoordinatorState::Idle;
            return self.send(ServerMessage::info(e.to_string())).await;
        }

        if let Err(e) = self.deps.durable.open_session(&session).await {
            tracing::warn!(session_id = %session.id, error = %e, "Failed to record session start");
        }

        let session_id = session.id.to_string();
        self.live = Some(LiveSession {
            ctx: TurnContext::from(&session),
            supervisor,
            aggregator: TurnAggregator::new(session.target_language.clone()),
        });
        self.state = CoordinatorState::SessionActive;
        tracing::info!(session_id = %session_id, "Voice session active");
        self.send(ServerMessage::SessionStarted { session_id }).await;
    }

    pub async fn handle_supervisor_event(&mut self, event: SupervisorEvent) {
        if self.state != CoordinatorState::SessionActive {
            return;
        }
        let Some(live) = self.live.as_mut() else {
            return;
        };
        if event.generation != live.supervisor.generation() {
            tracing::debug!(generation = event.generation, "Dropping event from a replaced connection");
            return;
        }

        match event.event {
            GenericServerEvent::Audio(pcm) => {
                let message = ServerMessage::audio(&pcm, self.deps.settings.receive_sample_rate);
                self.send(message).await;
            }
            GenericServerEvent::Transcription { role, text } => {
                if let Some(text) = live.aggregator.append_fragment(role, &text) {
                    self.send(ServerMessage::Transcription { source: role, text })
                        .await;
                }
            }
            GenericServerEvent::TurnComplete => self.complete_turn().await,
            GenericServerEvent::Error(message) => {
                tracing::warn!(session_id = %live.ctx.session_id, error = %message, "Conversational service reported an error");
            }
            GenericServerEvent::Closed => self.connection_lost().await,
        }
    }

    async fn complete_turn(&mut self) {
        self.send(ServerMessage::TurnComplete).await;
        let Some(live) = self.live.as_mut() else {
            return;
        };

        let turn = live.aggregator.finalize();
        let ctx = live.ctx.clone();
        if live.aggregator.ready_for_logging() {
            let pair = self
                .gateway
                .persist_turn_pair(&ctx, &turn.user_text, &turn.assistant_text)
                .await;
            match &pair.user {
                Some(record) => {
                    if let Some(evaluation) = &record.evaluation {
                        if !self.state.is_terminal() {
                            let message = ServerMessage::feedback(record, evaluation, &ctx.mode_code);
                            self.send(message).await;
                        }
                    }
                }
                None => {
                    let e = Error::PersistenceFailure("user turn was not saved".to_string());
                    self.send(ServerMessage::info(e.to_string())).await;
                }
            }
            if pair.assistant.is_none() && !turn.assistant_text.is_empty() {
                let e = Error::PersistenceFailure("assistant turn was not saved".to_string());
                self.send(ServerMessage::info(e.to_string())).await;
            }
        } else {
            tracing::debug!(session_id = %ctx.session_id, "Turn had no user speech, nothing to persist");
        }

        if let Some(live) = self.live.as_mut() {
            live.aggregator.reset();
            live.supervisor.turn_completed();
        }
        if let Err(e) = self.deps.store.touch(&ctx.session_id).await {
            tracing::warn!(session_id = %ctx.session_id, error = %e, "Failed to refresh session TTL");
        }
    }

    async fn connection_lost(&mut self) {
        if self.reconnect_at.is_some() {
            return;
        }
        let Some(live) = self.live.as_mut() else {
            return;
        };
        let cooldown = live.supervisor.begin_restart().await;
        match cooldown {
            Some(cooldown) => self.reconnect_at = Some(Instant::now() + cooldown),
            None => self.fail_session().await,
        }
    }

    async fn attempt_reconnect(&mut self) {
        self.reconnect_at = None;
        if self.state != CoordinatorState::SessionActive {
            return;
        }
        let Some(live) = self.live.as_mut() else {
            return;
        };
        if live.supervisor.initialize().await {
            tracing::info!(session_id = %live.ctx.session_id, attempt = live.supervisor.restart_count(), "Reconnected to conversational service");
        } else {
            self.connection_lost().await;
        }
    }

    async fn fail_session(&mut self) {
        self.state = CoordinatorState::Failed;
        self.reconnect_at = None;
        let e = Error::ConnectionFailure("restart limit reached".to_string());
        tracing::error!(error = %e, "Voice session failed");
        self.send(ServerMessage::fatal(e.to_string())).await;

        if let Some(mut live) = self.live.take() {
            live.supervisor.close().await;
            self.discard_session(&live.ctx.session_id).await;
        }
    }

    async fn end_session(&mut self) {
        self.state = CoordinatorState::SessionEnding;
        self.reconnect_at = None;
        let Some(mut live) = self.live.take() else {
            self.state = CoordinatorState::Closed;
            return;
        };
        live.supervisor.close().await;

        let id = live.ctx.session_id.clone();
        let locked = match self
            .deps
            .store
            .acquire_lock(&id, self.deps.settings.lock_lease)
            .await
        {
            Ok(locked) => locked,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Could not take session lock");
                false
            }
        };
        if !locked {
            tracing::warn!(session_id = %id, "Closing session without holding its lock");
        }
        self.discard_session(&id).await;
        if locked {
            if let Err(e) = self.deps.store.release_lock(&id).await {
                tracing::debug!(session_id = %id, error = %e, "Failed to release session lock");
            }
        }

        self.state = CoordinatorState::Closed;
        tracing::info!(session_id = %id, "Voice session closed");
        self.send(ServerMessage::SessionEnded {
            session_id: id.to_string(),
        })
        .await;
    }

    /// Removes the ephemeral entry and hands its final snapshot to the
    /// durable store.
    async fn discard_session(&mut self, id: &SessionId) {
        match self.deps.store.close(id).await {
            Ok(Some(snapshot)) => {
                if let Err(e) = self.deps.durable.close_session(&snapshot).await {
                    tracing::warn!(session_id = %id, error = %e, "Failed to record session close");
                }
            }
            Ok(None) => tracing::debug!(session_id = %id, "Session entry already gone"),
            Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to close session entry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeConnector, FakeService};
    use crate::generic_types::Role;
    use crate::instructions::BuiltinInstructions;
    use crate::persistence::MockDurableStore;
    use crate::scoring::{Evaluation, MockScorer};
    use crate::session_state::MemorySessionStore;
    use base64::Engine;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Harness {
        service: Arc<FakeService>,
        store: Arc<MemorySessionStore>,
        inbound: mpsc::Sender<ClientMessage>,
        outbound: mpsc::Receiver<ServerMessage>,
        task: JoinHandle<CoordinatorState>,
    }

    fn lenient_durable() -> MockDurableStore {
        let mut durable = MockDurableStore::new();
        durable.expect_open_session().returning(|_| Ok(()));
        durable.expect_close_session().returning(|_| Ok(()));
        durable
    }

    fn deps(
        service: &Arc<FakeService>,
        store: &Arc<MemorySessionStore>,
        durable: MockDurableStore,
        scorer: MockScorer,
    ) -> SessionDeps {
        SessionDeps {
            store: store.clone(),
            durable: Arc::new(durable),
            scorer: Arc::new(scorer),
            connector: Arc::new(FakeConnector(service.clone())),
            instructions: Arc::new(BuiltinInstructions),
            settings: SessionSettings::default(),
            voice: None,
        }
    }

    fn harness(durable: MockDurableStore, scorer: MockScorer) -> Harness {
        let service = FakeService::new();
        let store = Arc::new(MemorySessionStore::new(Duration::from_secs(60)));
        let deps = deps(&service, &store, durable, scorer);
        let (out_tx, outbound) = mpsc::channel(64);
        let (inbound, in_rx) = mpsc::channel(64);
        let task = tokio::spawn(SessionCoordinator::new(deps, out_tx).run(in_rx));
        Harness {
            service,
            store,
            inbound,
            outbound,
            task,
        }
    }

    fn start() -> ClientMessage {
        ClientMessage::StartSession(StartSession {
            user_id: "learner-1".to_string(),
            mother_language: "english".to_string(),
            target_language: "spanish".to_string(),
            user_level: "beginner".to_string(),
            teaching_mode: "conversation".to_string(),
            scenario: None,
        })
    }

    async fn started(h: &mut Harness) -> SessionId {
        h.inbound.send(start()).await.unwrap();
        match h.outbound.recv().await.unwrap() {
            ServerMessage::SessionStarted { session_id } => SessionId::from(session_id),
            other => panic!("expected session_started, got {other:?}"),
        }
    }

    fn fragment(role: Role, text: &str) -> GenericServerEvent {
        GenericServerEvent::Transcription {
            role,
            text: text.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completed_turn_is_persisted_and_scored() {
        // --- Arrange ---
        let mut durable = lenient_durable();
        durable
            .expect_insert_turn()
            .withf(|row| row.role == Role::User && row.text == "Hola amigo" && row.turn_index == 1)
            .times(1)
            .returning(|_| Ok("t1".to_string()));
        durable
            .expect_insert_turn()
            .withf(|row| row.role == Role::Assistant && row.text == "¡Hola!" && row.turn_index == 2)
            .times(1)
            .returning(|_| Ok("t2".to_string()));
        durable.expect_insert_evaluation().returning(|_, _| Ok(()));
        let mut scorer = MockScorer::new();
        scorer.expect_score().times(1).returning(|_, _| {
            Ok(Evaluation {
                metrics: BTreeMap::from([("fluency".to_string(), 70.0)]),
                total_score: 72.0,
                feedback: "Bien".to_string(),
            })
        });
        let mut h = harness(durable, scorer);
        let id = started(&mut h).await;

        // --- Act ---
        h.service.emit(fragment(Role::User, " Hola")).await;
        h.service.emit(fragment(Role::User, " amigo")).await;
        h.service.emit(fragment(Role::Assistant, "¡Hola!")).await;
        h.service.emit(GenericServerEvent::TurnComplete).await;

        // --- Assert ---
        let mut messages = Vec::new();
        for _ in 0..5 {
            messages.push(h.outbound.recv().await.unwrap());
        }
        assert_eq!(
            messages[1],
            ServerMessage::Transcription {
                source: Role::User,
                text: "Hola amigo".to_string()
            }
        );
        assert_eq!(messages[3], ServerMessage::TurnComplete);
        assert!(matches!(
            &messages[4],
            ServerMessage::Feedback { turn_index: 1, total_score, teaching_mode, .. }
                if *total_score == 72.0 && teaching_mode == "conversation"
        ));
        assert_eq!(h.store.get(&id).await.unwrap().turn_index, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn assistant_only_turn_is_not_persisted() {
        let mut durable = lenient_durable();
        durable.expect_insert_turn().never();
        let mut h = harness(durable, MockScorer::new());
        let id = started(&mut h).await;

        h.service.emit(fragment(Role::Assistant, "Bienvenido")).await;
        h.service.emit(GenericServerEvent::TurnComplete).await;
        assert!(matches!(h.outbound.recv().await, Some(ServerMessage::Transcription { .. })));
        assert_eq!(h.outbound.recv().await, Some(ServerMessage::TurnComplete));

        // A fresh turn starts from an empty buffer.
        h.service.emit(fragment(Role::Assistant, "Otra")).await;
        assert_eq!(
            h.outbound.recv().await,
            Some(ServerMessage::Transcription {
                source: Role::Assistant,
                text: "Otra".to_string()
            })
        );
        assert_eq!(h.store.get(&id).await.unwrap().turn_index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_in_wrong_state_are_rejected_without_state_change() {
        let mut h = harness(lenient_durable(), MockScorer::new());

        h.inbound
            .send(ClientMessage::Audio {
                data: "AAE=".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(
            h.outbound.recv().await,
            Some(ServerMessage::Error { fatal: false, .. })
        ));

        started(&mut h).await;
        h.inbound.send(start()).await.unwrap();
        let Some(ServerMessage::Error { message, fatal }) = h.outbound.recv().await else {
            panic!("expected error");
        };
        assert!(!fatal);
        assert!(message.contains("session_active"));
        assert_eq!(h.service.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_keeps_coordinator_idle() {
        let mut h = harness(lenient_durable(), MockScorer::new());
        h.service.script_connects(&[false]);

        h.inbound.send(start()).await.unwrap();
        assert!(matches!(
            h.outbound.recv().await,
            Some(ServerMessage::Error { .. })
        ));

        // Retrying the start succeeds.
        started(&mut h).await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connection_is_restored_and_audio_replayed() {
        let mut h = harness(lenient_durable(), MockScorer::new());
        started(&mut h).await;

        let chunk = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        h.service.drop_connection();
        h.inbound
            .send(ClientMessage::Audio { data: chunk })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(h.service.connects(), 2);
        assert!(h.service.audio().contains(&vec![1, 2, 3]));

        h.inbound.send(ClientMessage::EndSession).await.unwrap();
        assert!(matches!(
            h.outbound.recv().await,
            Some(ServerMessage::SessionEnded { .. })
        ));
        assert_eq!(h.task.await.unwrap(), CoordinatorState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_restarts_fail_the_session() {
        let mut h = harness(lenient_durable(), MockScorer::new());
        let id = started(&mut h).await;

        h.service.set_always_fail(true);
        h.service.drop_connection();

        let Some(ServerMessage::Error { fatal, .. }) = h.outbound.recv().await else {
            panic!("expected fatal error");
        };
        assert!(fatal);
        assert_eq!(h.task.await.unwrap(), CoordinatorState::Failed);
        assert_eq!(h.service.connects(), 4);
        assert!(matches!(h.store.get(&id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn end_session_closes_store_entry_and_records_snapshot() {
        let mut durable = MockDurableStore::new();
        durable.expect_open_session().times(1).returning(|_| Ok(()));
        durable
            .expect_close_session()
            .withf(|session| session.user_id == "learner-1")
            .times(1)
            .returning(|_| Ok(()));
        let mut h = harness(durable, MockScorer::new());
        let id = started(&mut h).await;

        h.inbound.send(ClientMessage::EndSession).await.unwrap();

        assert_eq!(
            h.outbound.recv().await,
            Some(ServerMessage::SessionEnded {
                session_id: id.to_string()
            })
        );
        assert_eq!(h.task.await.unwrap(), CoordinatorState::Closed);
        assert!(h.store.get(&id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn client_disconnect_closes_session() {
        let mut h = harness(lenient_durable(), MockScorer::new());
        let id = started(&mut h).await;

        drop(h.inbound);

        assert_eq!(h.task.await.unwrap(), CoordinatorState::Closed);
        assert!(h.store.get(&id).await.is_err());
    }

    #[tokio::test]
    async fn run_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let service = FakeService::new();
        let store = Arc::new(MemorySessionStore::new(Duration::from_secs(60)));
        let (out_tx, _outbound) = mpsc::channel(1);
        let (_inbound, in_rx) = mpsc::channel(1);
        let coordinator =
            SessionCoordinator::new(deps(&service, &store, lenient_durable(), MockScorer::new()), out_tx);

        let session = coordinator.run(in_rx);

        assert_send(&session);
    }
}
