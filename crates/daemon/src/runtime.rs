// Daemon wiring and lifecycle.
//
// Initialization order matters: the tree is scanned first, then the
// registry, then the sync manager (which implements the handler
// capability), and only then does the WebSocket surface start accepting.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::config::DaemonConfig;
use crate::engine::SyncManager;
use crate::rpc::{self, ClientRegistry, SyncEvents, WsServerState};
use crate::store::DocumentStore;

/// Everything a running daemon owns. Kept separate from `run_standalone`
/// so tests can drive a fully wired instance on an ephemeral port.
pub struct Daemon {
    pub store: Arc<DocumentStore>,
    pub registry: Arc<ClientRegistry>,
    pub sync_manager: Arc<SyncManager>,
    state: WsServerState,
    shutdown_tx: watch::Sender<bool>,
    flush_task: tokio::task::JoinHandle<()>,
}

impl Daemon {
    /// Scan the tree and wire the managers together.
    pub fn bootstrap(config: &DaemonConfig) -> Result<Self> {
        let store = Arc::new(
            DocumentStore::scan(&config.docs.root, &config.docs.ignore)
                .context("failed to build the document tree")?,
        );
        info!(
            documents = store.document_count(),
            root = %config.docs.root.display(),
            "document tree loaded"
        );

        let registry = Arc::new(ClientRegistry::new());
        let sync_manager = SyncManager::new(Arc::clone(&store), Arc::clone(&registry), &config.sync);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flush_task = tokio::spawn(Arc::clone(&sync_manager).run_flush_loop(shutdown_rx));

        let events: Arc<dyn SyncEvents> = Arc::clone(&sync_manager) as Arc<dyn SyncEvents>;
        let state =
            WsServerState::new(Arc::clone(&registry), events, Arc::clone(&store), &config.sync);

        Ok(Self { store, registry, sync_manager, state, shutdown_tx, flush_task })
    }

    /// Serve connections on `listener` until the future is dropped.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        rpc::serve(listener, self.state.clone()).await
    }

    /// Stop the flush loop, writing out anything still pending.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.flush_task.await;
    }
}

/// Run the daemon in the foreground until ctrl-c.
pub async fn run_standalone(config: DaemonConfig) -> Result<()> {
    let daemon = Daemon::bootstrap(&config)?;

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind sync server at `{addr}`"))?;
    info!(address = %addr, "sync server listening");

    tokio::select! {
        result = daemon.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    daemon.shutdown().await;
    Ok(())
}
