// Client-facing transport: the WebSocket upgrade surface and the registry
// of live connections.

pub mod registry;
pub mod ws;

use std::fmt;
use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;
use vellum_common::protocol::ws::{EditRequest, SyncRequest};
use vellum_common::types::DocumentId;

pub use registry::ClientRegistry;
pub use ws::{serve, WsServerState};

/// Identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the sync engine knows about a connection: its identity, its peer
/// address (for logs), and the document it was upgraded against.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ClientId,
    pub remote_addr: SocketAddr,
    pub document_id: DocumentId,
}

/// Handler capability the connection manager drives.
///
/// Wired once at construction; the connection manager owns the client
/// lifecycle and calls in, the implementation talks back only through the
/// registry's send path.
#[async_trait]
pub trait SyncEvents: Send + Sync {
    /// A connection was accepted and registered.
    async fn on_new_client(&self, client: &ClientInfo) -> Result<()>;

    /// An `edit-request` frame arrived.
    async fn on_edit_request(&self, client: &ClientInfo, request: EditRequest) -> Result<()>;

    /// A `sync-request` frame arrived.
    async fn on_sync_request(&self, client: &ClientInfo, request: SyncRequest) -> Result<()>;

    /// The connection was released; `remaining` counts connections still
    /// editing the same document.
    async fn on_client_disconnected(&self, client: &ClientInfo, remaining: u32);
}
