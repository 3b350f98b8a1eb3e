mod config;
mod gemini_adapter;
mod prompt_loader;

use crate::config::{Config, StoreBackend};
use crate::gemini_adapter::GeminiConnector;
use crate::prompt_loader::PromptLibrary;
use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::Response,
    routing::get,
};
use clap::Parser;
use futures::{SinkExt, Stream, StreamExt};
use lingua_core::messages::{ClientMessage, ServerMessage};
use lingua_core::persistence::{DurableStore, PostgrestDurableStore};
use lingua_core::scoring::{DisabledScorer, LlmScorer, Scorer};
use lingua_core::session_state::{MemorySessionStore, RedisSessionStore, SessionStateStore};
use lingua_core::{CoordinatorState, SessionCoordinator, SessionDeps};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(version, about = "Voice tutoring session server")]
struct Cli {
    /// Overrides BIND_ADDRESS.
    #[arg(long)]
    bind_address: Option<SocketAddr>,
    /// Overrides PROMPTS_DIR.
    #[arg(long)]
    prompts_dir: Option<PathBuf>,
}

/// Handles WebSocket upgrade requests.
async fn ws_handler(ws: WebSocketUpgrade, State(deps): State<SessionDeps>) -> Response {
    info!("WebSocket upgrade request received");
    ws.on_upgrade(move |socket| handle_socket(socket, deps))
}

async fn health_handler(State(deps): State<SessionDeps>) -> StatusCode {
    match deps.store.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!("Health check failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Runs one client connection: a writer task serialising outbound events,
/// the coordinator task, and this reader loop feeding it client messages.
async fn handle_socket(socket: WebSocket, deps: SessionDeps) {
    info!("WebSocket connection established");
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(256);
    let (in_tx, in_rx) = mpsc::channel::<ClientMessage>(256);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialise server message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                tracing::debug!("Client went away while sending");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let coordinator = SessionCoordinator::new(deps, out_tx.clone());
    let mut session = tokio::spawn(coordinator.run(in_rx));

    let finished = read_client_frames(stream, &in_tx, &out_tx, &mut session).await;

    drop(in_tx);
    drop(out_tx);
    let result = match finished {
        Some(result) => result,
        None => session.await,
    };
    match result {
        Ok(state) => info!(state = state.as_str(), "Session task finished"),
        Err(e) => tracing::error!("Session task panicked: {}", e),
    }
    let _ = writer.await;
    info!("WebSocket connection closed");
}

/// Feeds client frames to the coordinator until the client leaves or the
/// session task ends on its own. Returns the task's result in the latter case.
async fn read_client_frames<S>(
    mut stream: S,
    in_tx: &mpsc::Sender<ClientMessage>,
    out_tx: &mpsc::Sender<ServerMessage>,
    session: &mut JoinHandle<CoordinatorState>,
) -> Option<Result<CoordinatorState, JoinError>>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        tokio::select! {
            result = &mut *session => return Some(result),
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match ClientMessage::parse(text.as_str()) {
                    Ok(message) => {
                        if in_tx.send(message).await.is_err() {
                            return None;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Malformed client message: {}", e);
                        let _ = out_tx
                            .send(ServerMessage::info(format!("Malformed message: {}", e)))
                            .await;
                    }
                },
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    info!("WebSocket error: {}", e);
                    return None;
                }
            },
        }
    }
}

async fn build_deps(config: &Config, prompts_dir: &std::path::Path) -> Result<SessionDeps> {
    let settings = config.session_settings();

    let store: Arc<dyn SessionStateStore> = match &config.store {
        StoreBackend::Redis(url) => Arc::new(
            RedisSessionStore::connect(url, settings.session_ttl)
                .await
                .context("Failed to connect to Redis")?,
        ),
        StoreBackend::Memory => {
            tracing::warn!("Using in-process session store; state is lost on restart");
            Arc::new(MemorySessionStore::new(settings.session_ttl))
        }
    };

    let durable: Arc<dyn DurableStore> = Arc::new(PostgrestDurableStore::new(
        config.supabase_url.clone(),
        config.supabase_key.clone(),
    ));

    let scorer: Arc<dyn Scorer> = match &config.scoring_api_key {
        Some(key) => Arc::new(LlmScorer::new(
            config.scoring_base_url.clone(),
            key.clone(),
            config.scoring_model.clone(),
        )),
        None => {
            tracing::warn!("SCORING_API_KEY not set; user turns will be stored unscored");
            Arc::new(DisabledScorer)
        }
    };

    let library = PromptLibrary::load_or_default(prompts_dir).context("Failed to load prompts")?;
    info!("Loaded {} teaching-mode prompts.", library.len());

    Ok(SessionDeps {
        store,
        durable,
        scorer,
        connector: Arc::new(GeminiConnector::new(
            config.gemini_api_key.clone(),
            config.gemini_model.clone(),
            config.send_sample_rate,
        )),
        instructions: Arc::new(library),
        settings,
        voice: Some(config.gemini_voice.clone()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;
    let args = Cli::parse();

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    // --- 3. Wire dependencies ---
    let prompts_dir = args.prompts_dir.unwrap_or_else(|| config.prompts_dir.clone());
    let deps = build_deps(&config, &prompts_dir).await?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(deps);

    // --- 4. Serve ---
    let addr = args.bind_address.unwrap_or(config.bind_address);
    info!("Starting session server, listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
