use crate::generic_types::{GenericServerEvent, GenericSessionConfig};
use anyhow::Result;
use async_trait::async_trait;

/// A trait abstracting one live, bidirectional connection to a real-time AI
/// service. This allows the session core to run against different backends
/// (or test fakes) through a common interface.
#[async_trait]
pub trait RealtimeApi: Send {
    /// Appends a chunk of raw 16-bit PCM audio to the provider's input stream.
    async fn append_input_audio_buffer(&mut self, pcm_audio: Vec<u8>) -> Result<()>;

    /// Returns a channel receiver for listening to server-side events.
    /// The channel closes when the underlying connection ends.
    async fn server_events(&mut self) -> Result<tokio::sync::mpsc::Receiver<GenericServerEvent>>;

    /// Releases the connection. Calling it twice is harmless.
    async fn close(&mut self) -> Result<()>;
}

/// Opens new [`RealtimeApi`] connections. The supervisor calls this on every
/// (re)initialisation; a returned connection has already accepted `config`.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self, config: &GenericSessionConfig) -> Result<Box<dyn RealtimeApi>>;
}
