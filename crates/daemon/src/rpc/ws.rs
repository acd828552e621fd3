// WebSocket surface of the sync protocol.
//
// One connection edits one document, chosen by the upgrade path. Each
// accepted socket runs a single task that multiplexes inbound frames and
// the connection's outbound queue; the release path runs exactly once per
// accept, with a drop guard covering unwinds.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vellum_common::protocol::ws::SyncMessage;
use vellum_common::types::DocumentId;

use crate::config::SyncTuning;
use crate::rpc::{ClientId, ClientInfo, ClientRegistry, SyncEvents};
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy)]
struct WsSettings {
    write_timeout: Duration,
    outbound_queue_len: usize,
}

#[derive(Clone)]
pub struct WsServerState {
    registry: Arc<ClientRegistry>,
    events: Arc<dyn SyncEvents>,
    store: Arc<DocumentStore>,
    settings: WsSettings,
}

impl WsServerState {
    pub fn new(
        registry: Arc<ClientRegistry>,
        events: Arc<dyn SyncEvents>,
        store: Arc<DocumentStore>,
        tuning: &SyncTuning,
    ) -> Self {
        Self {
            registry,
            events,
            store,
            settings: WsSettings {
                write_timeout: Duration::from_millis(tuning.write_timeout_ms),
                outbound_queue_len: tuning.outbound_queue_len.max(1),
            },
        }
    }

    pub fn router(self) -> Router {
        Router::new().route("/ws/{document_id}", get(sync_ws_route)).with_state(self)
    }
}

pub async fn serve(listener: TcpListener, state: WsServerState) -> Result<()> {
    axum::serve(
        listener,
        state.router().into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("document sync websocket server failed")
}

async fn sync_ws_route(
    ws: WebSocketUpgrade,
    Path(document_id): Path<String>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<WsServerState>,
) -> Response {
    let document_id = DocumentId::from(document_id);
    if !state.store.contains_document(&document_id) {
        // Unknown document: refuse before the connection exists.
        return StatusCode::NOT_FOUND.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, document_id, remote_addr))
        .into_response()
}

async fn handle_socket(
    socket: WebSocket,
    state: WsServerState,
    document_id: DocumentId,
    remote_addr: SocketAddr,
) {
    let client = ClientInfo { id: ClientId::new(), remote_addr, document_id };
    let (outbound_tx, outbound_rx) = mpsc::channel(state.settings.outbound_queue_len);
    state.registry.register(&client, outbound_tx);
    info!(client = %client.id, remote = %remote_addr, document = %client.document_id, "client connected");

    let guard = ReleaseGuard::arm(&state, &client);

    match state.events.on_new_client(&client).await {
        Ok(()) => read_loop(socket, &state, &client, outbound_rx).await,
        Err(error) => {
            warn!(client = %client.id, remote = %remote_addr, ?error, "initial handshake failed");
        }
    }

    guard.disarm();
    release(&state, &client).await;
}

/// Tear down one connection: drop the registry entry and notify the
/// handler with the surviving refcount. Safe to race with the drop guard;
/// whoever gets to the registry first wins.
async fn release(state: &WsServerState, client: &ClientInfo) {
    if let Some((document_id, remaining)) = state.registry.release(client.id) {
        info!(
            client = %client.id,
            remote = %client.remote_addr,
            document = %document_id,
            remaining,
            "client disconnected"
        );
        state.events.on_client_disconnected(client, remaining).await;
    }
}

/// Unwind backstop for the release path. Disarmed on the normal exit.
struct ReleaseGuard {
    armed: Option<(WsServerState, ClientInfo)>,
}

impl ReleaseGuard {
    fn arm(state: &WsServerState, client: &ClientInfo) -> Self {
        Self { armed: Some((state.clone(), client.clone())) }
    }

    fn disarm(mut self) {
        self.armed = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some((state, client)) = self.armed.take() {
            tokio::spawn(async move { release(&state, &client).await });
        }
    }
}

async fn read_loop(
    mut socket: WebSocket,
    state: &WsServerState,
    client: &ClientInfo,
    mut outbound_rx: mpsc::Receiver<SyncMessage>,
) {
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                // Read errors and remote closes both end the connection.
                let Some(Ok(frame)) = incoming else {
                    break;
                };

                match frame {
                    WsMessage::Text(payload) => {
                        dispatch_frame(state, client, payload.as_str()).await;
                    }
                    WsMessage::Binary(_) => {
                        debug!(client = %client.id, "ignoring binary frame");
                    }
                    WsMessage::Ping(payload) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => break,
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    break;
                };
                if !write_frame(&mut socket, state, client, &message).await {
                    break;
                }
            }
        }
    }
}

/// Parse one frame by its `type` tag and hand it to the handler. Handler
/// errors are logged and the connection lives on; a single bad patch must
/// not cost the editor its session.
async fn dispatch_frame(state: &WsServerState, client: &ClientInfo, payload: &str) {
    let message: SyncMessage = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(error) => {
            warn!(
                client = %client.id,
                remote = %client.remote_addr,
                %error,
                "dropping unrecognized message"
            );
            return;
        }
    };

    let result = match message {
        SyncMessage::EditRequest(request) => state.events.on_edit_request(client, request).await,
        SyncMessage::SyncRequest(request) => state.events.on_sync_request(client, request).await,
        SyncMessage::InitialContent(_) => {
            debug!(client = %client.id, "ignoring initial-content from client");
            Ok(())
        }
    };

    if let Err(error) = result {
        warn!(
            client = %client.id,
            remote = %client.remote_addr,
            ?error,
            "message handler failed"
        );
    }
}

/// Serialize and send one frame, bounded by the write timeout. Returns
/// false when the connection should be torn down.
async fn write_frame(
    socket: &mut WebSocket,
    state: &WsServerState,
    client: &ClientInfo,
    message: &SyncMessage,
) -> bool {
    let encoded = match serde_json::to_string(message) {
        Ok(encoded) => encoded,
        Err(error) => {
            warn!(client = %client.id, ?error, "failed to serialize outbound message");
            return true;
        }
    };

    match tokio::time::timeout(state.settings.write_timeout, socket.send(WsMessage::Text(encoded.into())))
        .await
    {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            warn!(client = %client.id, remote = %client.remote_addr, %error, "write failed");
            false
        }
        Err(_) => {
            warn!(
                client = %client.id,
                remote = %client.remote_addr,
                timeout_ms = state.settings.write_timeout.as_millis() as u64,
                "write timed out"
            );
            false
        }
    }
}
