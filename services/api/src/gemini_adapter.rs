use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use gemini_realtime::GeminiClient;
use gemini_realtime::types::{ServerMessage, Setup};
use lingua_core::generic_types::{GenericServerEvent, GenericSessionConfig, Role};
use lingua_core::realtime_api::{RealtimeApi, RealtimeConnector};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;

/// Opens Gemini Live sessions for the connection supervisor.
pub struct GeminiConnector {
    api_key: SecretString,
    model: String,
    send_sample_rate: u32,
}

impl GeminiConnector {
    pub fn new(api_key: SecretString, model: impl Into<String>, send_sample_rate: u32) -> Self {
        Self {
            api_key,
            model: model.into(),
            send_sample_rate,
        }
    }
}

#[async_trait]
impl RealtimeConnector for GeminiConnector {
    async fn connect(&self, config: &GenericSessionConfig) -> Result<Box<dyn RealtimeApi>> {
        let setup = Setup::audio(
            self.model.clone(),
            &config.instructions,
            config.voice.as_deref(),
        );
        let client = gemini_realtime::connect(self.api_key.expose_secret(), setup, self.send_sample_rate)
            .await
            .context("Failed to create GeminiAdapter")?;
        Ok(Box::new(GeminiAdapter {
            client,
            events_taken: false,
        }))
    }
}

/// An adapter that implements the generic `RealtimeApi` trait for the `gemini_realtime::GeminiClient`.
pub struct GeminiAdapter {
    client: GeminiClient,
    events_taken: bool,
}

#[async_trait]
impl RealtimeApi for GeminiAdapter {
    async fn append_input_audio_buffer(&mut self, pcm_audio: Vec<u8>) -> Result<()> {
        self.client.send_audio_chunk(&pcm_audio).await
    }

    async fn server_events(&mut self) -> Result<mpsc::Receiver<GenericServerEvent>> {
        if self.events_taken {
            return Err(anyhow::anyhow!(
                "server_events channel has already been taken"
            ));
        }
        let mut gemini_rx = self
            .client
            .server_events()
            .context("Gemini event stream unavailable")?;
        self.events_taken = true;

        let (tx, rx) = mpsc::channel(128);
        tokio::spawn(async move {
            while let Some(message) = gemini_rx.recv().await {
                for event in translate(message) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            tracing::info!("Gemini event stream ended.");
            let _ = tx.send(GenericServerEvent::Closed).await;
        });
        Ok(rx)
    }

    async fn close(&mut self) -> Result<()> {
        self.client.close().await
    }
}

/// Maps one Gemini server message to provider-neutral events, in the order
/// transcriptions, audio, turn completion.
pub fn translate(message: ServerMessage) -> Vec<GenericServerEvent> {
    let mut events = Vec::new();
    if let Some(go_away) = message.go_away {
        tracing::warn!(time_left = ?go_away.time_left, "Gemini announced connection shutdown");
    }
    let Some(content) = message.server_content else {
        return events;
    };

    if let Some(transcription) = content.input_transcription {
        events.push(GenericServerEvent::Transcription {
            role: Role::User,
            text: transcription.text,
        });
    }
    if let Some(transcription) = content.output_transcription {
        events.push(GenericServerEvent::Transcription {
            role: Role::Assistant,
            text: transcription.text,
        });
    }
    if let Some(model_turn) = content.model_turn {
        for blob in model_turn.parts.into_iter().filter_map(|p| p.inline_data) {
            match general_purpose::STANDARD.decode(blob.data.as_bytes()) {
                Ok(pcm) => events.push(GenericServerEvent::Audio(pcm)),
                Err(e) => tracing::warn!("Dropping undecodable Gemini audio: {}", e),
            }
        }
    }
    if content.turn_complete == Some(true) {
        events.push(GenericServerEvent::TurnComplete);
    }
    events
}
