//! Drives a full voice session through the coordinator's channels with the
//! in-memory session store and scripted collaborators.

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use lingua_core::generic_types::{GenericServerEvent, GenericSessionConfig, Role};
use lingua_core::instructions::BuiltinInstructions;
use lingua_core::messages::{ClientMessage, ServerMessage, StartSession};
use lingua_core::persistence::{DurableStore, TurnRow};
use lingua_core::realtime_api::{RealtimeApi, RealtimeConnector};
use lingua_core::scoring::{Evaluation, Scorer};
use lingua_core::session_state::{MemorySessionStore, Session, SessionId, SessionStateStore};
use lingua_core::{CoordinatorState, SessionCoordinator, SessionDeps, SessionSettings};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct RecordingStore {
    turns: Mutex<Vec<TurnRow>>,
    evaluations: Mutex<Vec<String>>,
    closed: Mutex<Vec<Session>>,
}

#[async_trait]
impl DurableStore for RecordingStore {
    async fn insert_turn(&self, turn: &TurnRow) -> lingua_core::Result<String> {
        let mut turns = self.turns.lock().unwrap();
        turns.push(turn.clone());
        Ok(format!("turn-{}", turns.len()))
    }

    async fn insert_evaluation(&self, turn_id: &str, _: &Evaluation) -> lingua_core::Result<()> {
        self.evaluations.lock().unwrap().push(turn_id.to_string());
        Ok(())
    }

    async fn open_session(&self, _: &Session) -> lingua_core::Result<()> {
        Ok(())
    }

    async fn close_session(&self, session: &Session) -> lingua_core::Result<()> {
        self.closed.lock().unwrap().push(session.clone());
        Ok(())
    }
}

/// Scores a turn by its length. Text containing "fail" cannot be scored.
struct LengthScorer;

#[async_trait]
impl Scorer for LengthScorer {
    async fn score(&self, text: &str, _mode_code: &str) -> Result<Evaluation> {
        if text.contains("fail") {
            anyhow::bail!("scoring backend unavailable");
        }
        Ok(Evaluation {
            metrics: BTreeMap::from([("length".to_string(), text.len() as f64)]),
            total_score: text.len() as f64,
            feedback: "keep going".to_string(),
        })
    }
}

#[derive(Default)]
struct Link {
    events: Mutex<Option<mpsc::Sender<GenericServerEvent>>>,
    audio: Mutex<Vec<Vec<u8>>>,
    instructions: Mutex<Vec<String>>,
}

struct ScriptedConnector(Arc<Link>);

struct ScriptedConnection {
    link: Arc<Link>,
    events: Option<mpsc::Receiver<GenericServerEvent>>,
}

#[async_trait]
impl RealtimeConnector for ScriptedConnector {
    async fn connect(&self, config: &GenericSessionConfig) -> Result<Box<dyn RealtimeApi>> {
        let (tx, rx) = mpsc::channel(32);
        *self.0.events.lock().unwrap() = Some(tx);
        self.0.instructions.lock().unwrap().push(config.instructions.clone());
        Ok(Box::new(ScriptedConnection {
            link: self.0.clone(),
            events: Some(rx),
        }))
    }
}

#[async_trait]
impl RealtimeApi for ScriptedConnection {
    async fn append_input_audio_buffer(&mut self, pcm_audio: Vec<u8>) -> Result<()> {
        self.link.audio.lock().unwrap().push(pcm_audio);
        Ok(())
    }

    async fn server_events(&mut self) -> Result<mpsc::Receiver<GenericServerEvent>> {
        self.events
            .take()
            .ok_or_else(|| anyhow::anyhow!("events already taken"))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

async fn emit(link: &Link, event: GenericServerEvent) {
    let tx = link.events.lock().unwrap().clone().unwrap();
    tx.send(event).await.unwrap();
}

fn say(role: Role, text: &str) -> GenericServerEvent {
    GenericServerEvent::Transcription {
        role,
        text: text.to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn full_session_lifecycle() {
    // --- Arrange ---
    let link = Arc::new(Link::default());
    let durable = Arc::new(RecordingStore::default());
    let store = Arc::new(MemorySessionStore::new(Duration::from_secs(3600)));
    let deps = SessionDeps {
        store: store.clone(),
        durable: durable.clone(),
        scorer: Arc::new(LengthScorer),
        connector: Arc::new(ScriptedConnector(link.clone())),
        instructions: Arc::new(BuiltinInstructions),
        settings: SessionSettings::default(),
        voice: Some("Zephyr".to_string()),
    };
    let (out_tx, mut outbound) = mpsc::channel(64);
    let (inbound, in_rx) = mpsc::channel(64);
    let coordinator = tokio::spawn(SessionCoordinator::new(deps, out_tx).run(in_rx));

    // --- Act: start ---
    inbound
        .send(ClientMessage::StartSession(StartSession {
            user_id: "learner-7".to_string(),
            mother_language: "english".to_string(),
            target_language: "french".to_string(),
            user_level: "beginner".to_string(),
            teaching_mode: "conversation".to_string(),
            scenario: Some("Ordering at a café".to_string()),
        }))
        .await
        .unwrap();
    let Some(ServerMessage::SessionStarted { session_id }) = outbound.recv().await else {
        panic!("session did not start");
    };
    let session_id = SessionId::from(session_id);
    assert!(link.instructions.lock().unwrap()[0].contains("Ordering at a café"));

    // --- Act: audio in, audio out ---
    let pcm = base64::engine::general_purpose::STANDARD.encode([9u8, 9]);
    inbound.send(ClientMessage::Audio { data: pcm }).await.unwrap();
    emit(&link, GenericServerEvent::Audio(vec![4, 2])).await;
    let Some(ServerMessage::Audio { sample_rate, .. }) = outbound.recv().await else {
        panic!("expected model audio");
    };
    assert_eq!(sample_rate, 24_000);

    // --- Act: first turn, scored ---
    emit(&link, say(Role::User, " Bon")).await;
    emit(&link, say(Role::User, "jour")).await;
    emit(&link, say(Role::Assistant, " Bonjour !")).await;
    emit(&link, GenericServerEvent::TurnComplete).await;

    let mut seen = Vec::new();
    while seen.last() != Some(&ServerMessage::TurnComplete) {
        seen.push(outbound.recv().await.unwrap());
    }
    let Some(ServerMessage::Feedback { turn_index, total_score, .. }) = outbound.recv().await else {
        panic!("expected feedback");
    };
    assert_eq!(turn_index, 1);
    assert_eq!(total_score, 7.0);

    // --- Act: second turn, scoring fails ---
    emit(&link, say(Role::User, " fail")).await;
    emit(&link, GenericServerEvent::TurnComplete).await;
    outbound.recv().await.unwrap();
    assert_eq!(outbound.recv().await, Some(ServerMessage::TurnComplete));

    // --- Act: end ---
    inbound.send(ClientMessage::EndSession).await.unwrap();
    assert!(matches!(
        outbound.recv().await,
        Some(ServerMessage::SessionEnded { .. })
    ));

    // --- Assert ---
    assert_eq!(coordinator.await.unwrap(), CoordinatorState::Closed);

    let turns = durable.turns.lock().unwrap().clone();
    let summary: Vec<(Role, u64, &str)> = turns
        .iter()
        .map(|t| (t.role, t.turn_index, t.text.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Role::User, 1, "Bonjour"),
            (Role::Assistant, 2, "Bonjour !"),
            (Role::User, 3, "fail"),
        ]
    );
    assert_eq!(link.audio.lock().unwrap().clone(), vec![vec![9, 9]]);
    assert_eq!(durable.evaluations.lock().unwrap().clone(), vec!["turn-1"]);

    let closed = durable.closed.lock().unwrap().clone();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].turn_index, 3);
    assert!(store.get(&session_id).await.is_err());
}
