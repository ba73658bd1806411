//! HTTP/WebSocket front end
//!
//! Thin glue between axum and the session core: the WS handler parses text
//! frames into protocol events and forwards them inbound, and drains the
//! session's outbound queue back onto the socket. TLS termination and static
//! assets live in front of this process.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::adapters::{
    AdapterSet, GuardrailDisabled, Moderation, OpenAiLlm, OpenAiModeration, OpenAiStt, OpenAiTts,
    ProviderClient,
};
use crate::config::Config;
use crate::protocol::{self, Inbound, ServerEvent};
use crate::session::Session;

/// Inbound channel depth between the socket reader and the session demux
const INBOUND_DEPTH: usize = 64;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub adapters: AdapterSet,
}

/// Wire the configured provider endpoints into an adapter set.
pub fn build_adapters(config: &Config) -> Result<AdapterSet> {
    let api_key = config
        .provider
        .api_key
        .clone()
        .context("OPENAI_API_KEY is not set")?;
    let provider = ProviderClient::new(&config.provider.base_url, api_key);

    let moderation: Arc<dyn Moderation> = if config.guardrail.enabled {
        Arc::new(OpenAiModeration::new(provider.clone()))
    } else {
        Arc::new(GuardrailDisabled)
    };

    Ok(AdapterSet {
        stt: Arc::new(OpenAiStt::new(provider.clone(), &config.stt.model)),
        llm: Arc::new(OpenAiLlm::new(provider.clone())),
        tts: Arc::new(OpenAiTts::new(provider, &config.tts.model)),
        moderation,
    })
}

/// Start the service and block until it exits.
pub async fn start(config: Config) -> Result<()> {
    let adapters = build_adapters(&config)?;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid listen address")?;
    let state = ServerState {
        config: Arc::new(config),
        adapters,
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    info!("renovoice listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridge one socket to one session.
async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (session, mut out_rx) = Session::new(state.adapters.clone(), &state.config);
    let session_id = session.id().to_string();
    let close = session.close_token();
    let outbound = session.outbound();
    let (in_tx, in_rx) = mpsc::channel(INBOUND_DEPTH);

    let sender_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(f) => f,
                Err(e) => {
                    warn!("outbound serialization failed: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let session_task = tokio::spawn(session.run(in_rx));

    loop {
        let msg = tokio::select! {
            _ = close.cancelled() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(msg)) => msg,
                _ => break,
            },
        };
        match msg {
            Message::Text(text) => match protocol::parse_client_frame(&text) {
                Ok(Inbound::Event(event)) => {
                    if in_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(Inbound::Ignored { kind, detail }) => {
                    debug!(
                        "session {}: ignoring inbound '{}': {}",
                        session_id, kind, detail
                    );
                }
                Err(e) => {
                    warn!(
                        "session {}: unparseable envelope, closing: {}",
                        session_id, e
                    );
                    outbound.send(ServerEvent::Error {
                        message: "unparseable message envelope".to_string(),
                    });
                    break;
                }
            },
            Message::Close(_) => {
                debug!("session {}: client closed", session_id);
                break;
            }
            Message::Binary(_) => {
                debug!("session {}: binary frames not supported", session_id);
            }
            _ => {}
        }
    }

    drop(in_tx);
    close.cancel();
    let _ = session_task.await;
    // All outbound senders are gone now; let the sender drain the queue
    drop(outbound);
    let _ = sender_task.await;
}
