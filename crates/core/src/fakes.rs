//! In-process stand-ins for the conversational service, shared by unit tests.

use crate::generic_types::{GenericServerEvent, GenericSessionConfig};
use crate::realtime_api::{RealtimeApi, RealtimeConnector};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Shared view of everything the fake service saw.
#[derive(Default)]
pub struct FakeService {
    pub connects: Mutex<usize>,
    /// Queued failures for upcoming connects; empty means succeed.
    pub connect_plan: Mutex<VecDeque<bool>>,
    pub always_fail: Mutex<bool>,
    pub configs: Mutex<Vec<String>>,
    pub audio: Mutex<Vec<Vec<u8>>>,
    /// Audio sends fail once this many chunks have been received.
    pub audio_limit: Mutex<Option<usize>>,
    /// Event sender of the most recent connection.
    pub events: Mutex<Option<mpsc::Sender<GenericServerEvent>>>,
}

impl FakeService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connects(&self) -> usize {
        *self.connects.lock().unwrap()
    }

    pub fn audio(&self) -> Vec<Vec<u8>> {
        self.audio.lock().unwrap().clone()
    }

    /// Queues outcomes for the next connects, `true` meaning success.
    pub fn script_connects(&self, outcomes: &[bool]) {
        self.connect_plan.lock().unwrap().extend(outcomes.iter().map(|ok| !ok));
    }

    pub fn set_always_fail(&self, fail: bool) {
        *self.always_fail.lock().unwrap() = fail;
    }

    pub fn reject_audio_after(&self, received: usize) {
        *self.audio_limit.lock().unwrap() = Some(received);
    }

    pub fn accept_all_audio(&self) {
        self.audio_limit.lock().unwrap().take();
    }

    /// Pushes an event through the current connection.
    pub async fn emit(&self, event: GenericServerEvent) {
        let tx = self.events.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Simulates the service dropping the connection.
    pub fn drop_connection(&self) {
        self.events.lock().unwrap().take();
    }
}

pub struct FakeConnector(pub Arc<FakeService>);

#[async_trait]
impl RealtimeConnector for FakeConnector {
    async fn connect(&self, config: &GenericSessionConfig) -> Result<Box<dyn RealtimeApi>> {
        let service = self.0.clone();
        *service.connects.lock().unwrap() += 1;
        let planned_failure = service.connect_plan.lock().unwrap().pop_front().unwrap_or(false);
        if planned_failure || *service.always_fail.lock().unwrap() {
            return Err(anyhow::anyhow!("connection refused"));
        }
        service.configs.lock().unwrap().push(config.instructions.clone());

        let (tx, rx) = mpsc::channel(64);
        *service.events.lock().unwrap() = Some(tx);
        Ok(Box::new(FakeConnection {
            service,
            events: Some(rx),
        }))
    }
}

struct FakeConnection {
    service: Arc<FakeService>,
    events: Option<mpsc::Receiver<GenericServerEvent>>,
}

#[async_trait]
impl RealtimeApi for FakeConnection {
    async fn append_input_audio_buffer(&mut self, pcm_audio: Vec<u8>) -> Result<()> {
        let limit = *self.service.audio_limit.lock().unwrap();
        let mut audio = self.service.audio.lock().unwrap();
        if limit.is_some_and(|limit| audio.len() >= limit) {
            return Err(anyhow::anyhow!("audio rejected"));
        }
        audio.push(pcm_audio);
        Ok(())
    }

    async fn server_events(&mut self) -> Result<mpsc::Receiver<GenericServerEvent>> {
        self.events
            .take()
            .ok_or_else(|| anyhow::anyhow!("server_events channel has already been taken"))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
