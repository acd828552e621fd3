// Registry of live connections.
//
// Two maps under one lock: connection -> document, and document ->
// connection count. The lock is only ever held for map operations, never
// across callbacks or socket I/O; sending clones the outbound handle out
// first.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use vellum_common::protocol::ws::SyncMessage;
use vellum_common::types::DocumentId;

use super::{ClientId, ClientInfo};

struct ClientEntry {
    document_id: DocumentId,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<SyncMessage>,
}

#[derive(Default)]
struct RegistryInner {
    clients: HashMap<ClientId, ClientEntry>,
    connections_per_document: HashMap<DocumentId, u32>,
}

/// Tracks which connection edits which document.
#[derive(Default)]
pub struct ClientRegistry {
    inner: RwLock<RegistryInner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection and bump its document's refcount.
    pub fn register(&self, client: &ClientInfo, outbound: mpsc::Sender<SyncMessage>) {
        let mut inner = self.write();
        inner.clients.insert(
            client.id,
            ClientEntry {
                document_id: client.document_id.clone(),
                remote_addr: client.remote_addr,
                outbound,
            },
        );
        *inner.connections_per_document.entry(client.document_id.clone()).or_insert(0) += 1;
    }

    /// Remove a connection and decrement its document's refcount.
    ///
    /// Returns the document and the remaining connection count on the
    /// first call; `None` on any repeat, so release paths can stack
    /// without double-counting.
    pub fn release(&self, id: ClientId) -> Option<(DocumentId, u32)> {
        let mut inner = self.write();
        let entry = inner.clients.remove(&id)?;
        let remaining = match inner.connections_per_document.get_mut(&entry.document_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            inner.connections_per_document.remove(&entry.document_id);
        }
        Some((entry.document_id, remaining))
    }

    /// Whether any live connection is editing `document_id`.
    pub fn is_client_connected(&self, document_id: &DocumentId) -> bool {
        self.read().connections_per_document.get(document_id).copied().unwrap_or(0) > 0
    }

    /// Live connections editing `document_id`.
    pub fn connection_count(&self, document_id: &DocumentId) -> u32 {
        self.read().connections_per_document.get(document_id).copied().unwrap_or(0)
    }

    /// Total live connections.
    pub fn client_count(&self) -> usize {
        self.read().clients.len()
    }

    /// First document from `ids` that is currently under edit. Lets the
    /// CRUD layer refuse deletes of sections with active editors.
    pub fn first_connected<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a DocumentId>,
    ) -> Option<DocumentId> {
        let inner = self.read();
        ids.into_iter()
            .find(|id| inner.connections_per_document.get(id).copied().unwrap_or(0) > 0)
            .cloned()
    }

    /// Queue one message for a connection. Blocks only when that
    /// connection's outbound queue is full.
    pub async fn send_to_client(&self, id: ClientId, message: SyncMessage) -> Result<()> {
        let (outbound, remote_addr) = {
            let inner = self.read();
            let entry = inner
                .clients
                .get(&id)
                .ok_or_else(|| anyhow!("connection {id} is no longer registered"))?;
            (entry.outbound.clone(), entry.remote_addr)
        };

        outbound
            .send(message)
            .await
            .map_err(|_| anyhow!("connection {id} ({remote_addr}) closed its outbound queue"))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
