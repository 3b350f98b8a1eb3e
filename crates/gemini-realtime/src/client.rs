use crate::types::{Blob, RealtimeInput, RealtimeInputMessage, ServerMessage, Setup, SetupMessage};
use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};

type WsWriter =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

/// A client for the Gemini Live WebSocket API.
///
/// The reader half runs in a background task that forwards decoded server
/// messages; the channel closes when the socket does.
pub struct GeminiClient {
    write: WsWriter,
    events: Option<mpsc::Receiver<ServerMessage>>,
    reader: JoinHandle<()>,
    input_mime_type: String,
}

/// Connects, sends `setup` and waits for the server to acknowledge it.
pub async fn connect(api_key: &str, setup: Setup, send_sample_rate: u32) -> Result<GeminiClient> {
    let url = format!("{LIVE_ENDPOINT}?key={api_key}");
    let (ws_stream, _) = connect_async(url)
        .await
        .context("Failed to connect to Gemini WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    let json = serde_json::to_string(&SetupMessage { setup })?;
    write
        .send(Message::Text(json))
        .await
        .context("Failed to send setup message")?;

    tokio::time::timeout(SETUP_TIMEOUT, wait_for_setup(&mut read))
        .await
        .context("Timed out waiting for Gemini setup acknowledgement")??;
    tracing::info!("Gemini Live session set up.");

    let (tx, rx) = mpsc::channel(128);
    let reader = tokio::spawn(read_loop(read, tx));
    Ok(GeminiClient {
        write,
        events: Some(rx),
        reader,
        input_mime_type: format!("audio/pcm;rate={send_sample_rate}"),
    })
}

async fn wait_for_setup(read: &mut WsReader) -> Result<()> {
    while let Some(msg) = read.next().await {
        match decode_frame(msg?) {
            Frame::Message(msg) if msg.setup_complete.is_some() => return Ok(()),
            Frame::Message(_) | Frame::Skip => {}
            Frame::Close(reason) => {
                return Err(anyhow::anyhow!("Gemini closed the socket during setup: {reason}"));
            }
        }
    }
    Err(anyhow::anyhow!("Gemini socket ended during setup"))
}

async fn read_loop(mut read: WsReader, tx: mpsc::Sender<ServerMessage>) {
    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!("Error reading from Gemini WebSocket: {}", e);
                break;
            }
        };
        match decode_frame(msg) {
            Frame::Message(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Frame::Close(reason) => {
                tracing::info!(reason = %reason, "Gemini WebSocket connection closed.");
                break;
            }
            Frame::Skip => {}
        }
    }
}

pub(crate) enum Frame {
    Message(ServerMessage),
    Close(String),
    Skip,
}

/// Server messages arrive as JSON in either text or binary frames.
pub(crate) fn decode_frame(msg: Message) -> Frame {
    let parsed = match &msg {
        Message::Text(text) => serde_json::from_str::<ServerMessage>(text),
        Message::Binary(bytes) => serde_json::from_slice::<ServerMessage>(bytes),
        Message::Close(reason) => {
            return Frame::Close(
                reason
                    .as_ref()
                    .map(|r| r.reason.to_string())
                    .unwrap_or_default(),
            );
        }
        _ => return Frame::Skip,
    };
    match parsed {
        Ok(event) => Frame::Message(event),
        Err(e) => {
            tracing::warn!("Failed to deserialize Gemini server message: {}", e);
            Frame::Skip
        }
    }
}

impl GeminiClient {
    /// Sends a chunk of 16-bit little-endian PCM.
    pub async fn send_audio_chunk(&mut self, pcm_data: &[u8]) -> Result<()> {
        let msg = RealtimeInputMessage {
            realtime_input: RealtimeInput {
                audio: Blob {
                    data: general_purpose::STANDARD.encode(pcm_data),
                    mime_type: self.input_mime_type.clone(),
                },
            },
        };
        let json = serde_json::to_string(&msg)?;
        self.write
            .send(Message::Text(json))
            .await
            .context("Failed to send audio chunk")
    }

    /// Hands out the server message stream. Only the first call succeeds.
    pub fn server_events(&mut self) -> Option<mpsc::Receiver<ServerMessage>> {
        self.events.take()
    }

    pub async fn close(&mut self) -> Result<()> {
        self.reader.abort();
        self.write
            .close()
            .await
            .context("Failed to close Gemini WebSocket")
    }
}

impl Drop for GeminiClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_frames_carry_json() {
        let frame = decode_frame(Message::Binary(br#"{"setupComplete":{}}"#.to_vec()));
        assert!(matches!(frame, Frame::Message(m) if m.setup_complete.is_some()));
    }

    #[test]
    fn garbage_and_control_frames_are_skipped() {
        assert!(matches!(
            decode_frame(Message::Text("not json".to_string())),
            Frame::Skip
        ));
        assert!(matches!(decode_frame(Message::Ping(vec![])), Frame::Skip));
        assert!(matches!(decode_frame(Message::Close(None)), Frame::Close(r) if r.is_empty()));
    }
}
