//! NodeWeave WebSocket Relay Server
//!
//! Relays graph events and presence between the sessions editing the same
//! graph, keeps a replica of each open graph and persists it on request.
//!
//! ## Protocol
//!
//! Messages are JSON, tagged by `type`:
//! ```json
//! { "type": "join", "graph": "graph-id" }
//! { "type": "event", "event": { "event": "node_moved", "payload": { ... }, ... } }
//! { "type": "presence", "presence": { "user_id": "u1", "cursor": { "x": 1, "y": 2 }, ... } }
//! { "type": "save" }
//! ```

mod config;
mod state;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use config::ServerConfig;
use futures_util::{SinkExt, StreamExt};
use nodeweave_core::session::now_ms;
use nodeweave_core::{ClientMessage, EngineConfig, FileStorage, MemoryStorage, ServerMessage, Storage};
use state::{AppState, Envelope};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nodeweave_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env();

    let storage: Arc<dyn Storage> = match &config.data_dir {
        Some(dir) => match FileStorage::new(dir.clone()) {
            Ok(storage) => {
                info!("Storing graphs in {}", dir.display());
                Arc::new(storage)
            }
            Err(e) => {
                error!("Cannot use data directory {}: {}", dir.display(), e);
                return;
            }
        },
        None => {
            info!("NODEWEAVE_DATA_DIR not set, graphs are kept in memory");
            Arc::new(MemoryStorage::new())
        }
    };

    let state = Arc::new(AppState::new(storage, config.engine()));
    tokio::spawn(housekeeping(state.clone(), config.expiry_tick()));

    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("NodeWeave relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://localhost:{}/ws", config.port);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/config", get(engine_config))
        .route("/graphs", get(list_graphs))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Index page
async fn index() -> &'static str {
    "NodeWeave Relay Server - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

/// Engine settings clients should use for their sessions.
async fn engine_config(State(state): State<Arc<AppState>>) -> Json<EngineConfig> {
    Json(state.engine().clone())
}

/// Ids of stored graphs.
async fn list_graphs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.storage().list().await {
        Ok(ids) => Ok(Json(ids)),
        Err(e) => {
            warn!("Failed to list graphs: {}", e);
            Err((axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// Periodically drop presence that stopped heartbeating and retry closing
/// rooms whose last save failed.
async fn housekeeping(state: Arc<AppState>, tick: std::time::Duration) {
    let mut interval = tokio::time::interval(tick);
    loop {
        interval.tick().await;
        let expired = state.expire_presence(now_ms());
        if expired > 0 {
            info!("Expired {} stale presence entr{}", expired, if expired == 1 { "y" } else { "ies" });
        }
        state.close_idle_rooms().await;
    }
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(msg: &ServerMessage) -> Option<Message> {
    match msg.to_json() {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            error!("Failed to encode {:?}: {}", msg, e);
            None
        }
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New connection: {}", peer_id);

    let (mut sender, mut receiver) = socket.split();
    let mut current_graph: Option<String> = None;
    let mut room_rx: Option<broadcast::Receiver<Envelope>> = None;

    loop {
        // Replies to this peer only; relays go through the room channel.
        let mut reply: Option<ServerMessage> = None;

        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Join { graph }) => {
                                if let Some(old) = current_graph.take() {
                                    room_rx = None;
                                    state.leave_room(&old, &peer_id).await;
                                }
                                match state.join_room(&graph, &peer_id).await {
                                    Ok(joined) => {
                                        room_rx = Some(joined.rx);
                                        reply = Some(joined.message);
                                        info!("Peer {} joined graph {}", peer_id, graph);
                                        current_graph = Some(graph);
                                    }
                                    Err(message) => {
                                        warn!("Peer {} could not join {}: {}", peer_id, graph, message);
                                        reply = Some(ServerMessage::Error { message });
                                    }
                                }
                            }
                            Ok(ClientMessage::Leave) => {
                                if let Some(graph) = current_graph.take() {
                                    room_rx = None;
                                    state.leave_room(&graph, &peer_id).await;
                                    info!("Peer {} left graph {}", peer_id, graph);
                                }
                            }
                            Ok(ClientMessage::Event { event }) => {
                                if let Some(ref graph) = current_graph {
                                    // Invalid events are logged and dropped by the room.
                                    let _ = state.relay_event(graph, &peer_id, event);
                                }
                            }
                            Ok(ClientMessage::Presence { presence }) => {
                                if let Some(ref graph) = current_graph {
                                    state.relay_presence(graph, &peer_id, presence);
                                }
                            }
                            Ok(ClientMessage::PresenceLeft { user_id }) => {
                                if let Some(ref graph) = current_graph {
                                    state.relay_presence_left(graph, &peer_id, user_id);
                                }
                            }
                            Ok(ClientMessage::Save) => {
                                reply = Some(match current_graph {
                                    Some(ref graph) => match state.save_room(graph).await {
                                        Ok(version) => ServerMessage::Saved { version },
                                        Err(e) => {
                                            warn!("Save of {} failed: {}", graph, e);
                                            ServerMessage::Error { message: e.to_string() }
                                        }
                                    },
                                    None => ServerMessage::Error {
                                        message: "Join a graph before saving".to_string(),
                                    },
                                });
                            }
                            Err(e) => {
                                warn!("Invalid message from {}: {}", peer_id, e);
                                reply = Some(ServerMessage::Error {
                                    message: format!("Invalid message: {}", e),
                                });
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Ignore binary, ping and pong
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", peer_id, e);
                        break;
                    }
                }
            }

            msg = async {
                match &mut room_rx {
                    Some(rx) => Some(rx.recv().await),
                    None => std::future::pending::<Option<Result<Envelope, RecvError>>>().await,
                }
            } => {
                match msg {
                    Some(Ok((from, server_msg))) => {
                        // Don't echo back to sender
                        if from != peer_id {
                            reply = Some(server_msg);
                        }
                    }
                    Some(Err(RecvError::Lagged(skipped))) => {
                        warn!("Peer {} lagged, {} message(s) skipped", peer_id, skipped);
                    }
                    Some(Err(RecvError::Closed)) | None => room_rx = None,
                }
            }
        }

        if let Some(msg) = reply.as_ref().and_then(encode) {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    }

    if let Some(ref graph) = current_graph {
        state.leave_room(graph, &peer_id).await;
    }
    info!("Connection closed: {}", peer_id);
}
