// The differential-sync core.
//
// For every connection the server keeps a shadow of what that client last
// saw. An inbound edit is validated against the shadow's checksum, applied
// to the shadow (exact) and to the authoritative copy (fuzzy), and the
// response carries whatever the server knows that the client's shadow does
// not. A checksum mismatch discards the client's patches and re-baselines
// the connection with `initial-content`; it never disconnects.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vellum_common::checksum::content_checksum;
use vellum_common::diff::{apply_hunks, create_patch, hunks_from_text, PatchHunk};
use vellum_common::protocol::ws::{EditRequest, InitialContent, SyncMessage, SyncRequest};
use vellum_common::types::DocumentId;

use crate::config::SyncTuning;
use crate::engine::ShadowMap;
use crate::rpc::{ClientInfo, ClientRegistry, SyncEvents};
use crate::store::{files, DocumentStore, FlushConfig, FlushQueue};

/// Longest patch prefix quoted in logs.
const PATCH_LOG_PREFIX: usize = 64;

enum EditOutcome {
    /// Shadow and client disagree; re-baseline the connection.
    Resync,
    /// The request was dropped (malformed or misaddressed); nothing to send.
    Dropped,
    /// Normal round: optionally a delta to return to the sender.
    Respond(Option<SyncMessage>),
}

/// Owns the shadows and drives the edit/patch/persist cycle.
pub struct SyncManager {
    store: Arc<DocumentStore>,
    registry: Arc<ClientRegistry>,
    shadows: ShadowMap,
    /// Serializes the read-modify-write path across connections.
    edit_lock: Mutex<()>,
    flush: Mutex<FlushQueue>,
}

impl SyncManager {
    pub fn new(
        store: Arc<DocumentStore>,
        registry: Arc<ClientRegistry>,
        tuning: &SyncTuning,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            shadows: ShadowMap::new(),
            edit_lock: Mutex::new(()),
            flush: Mutex::new(FlushQueue::new(FlushConfig::with_millis(tuning.flush_debounce_ms))),
        })
    }

    pub fn shadow_count(&self) -> usize {
        self.shadows.len()
    }

    /// Whether any document under `section_id` has a live editor. Lets the
    /// CRUD layer refuse destructive operations on active subtrees.
    pub fn section_under_edit(&self, section_id: &DocumentId) -> Option<DocumentId> {
        let ids = self.store.document_ids_under(section_id)?;
        self.registry.first_connected(ids.iter())
    }

    /// Re-baseline one connection: shadow := authoritative content, then
    /// ship that content as `initial-content`.
    async fn send_initial_content(&self, client: &ClientInfo) -> Result<()> {
        let content = self
            .store
            .content(&client.document_id)
            .ok_or_else(|| anyhow!("document {} is not in the tree", client.document_id))?;

        self.shadows.set(client.id, content.clone());
        self.registry
            .send_to_client(
                client.id,
                SyncMessage::InitialContent(InitialContent {
                    request_id: String::new(),
                    document_id: client.document_id.clone(),
                    content,
                }),
            )
            .await
            .context("failed to send initial content")
    }

    fn handle_edit(&self, client: &ClientInfo, request: &EditRequest) -> EditOutcome {
        let _serial = self.edit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(shadow) = self.shadows.get(client.id) else {
            warn!(client = %client.id, "edit request before handshake, forcing resync");
            return EditOutcome::Resync;
        };

        // Gate on the checksum of the shadow the patches were diffed from.
        let expected = content_checksum(&shadow);
        if expected != request.shadow_checksum {
            info!(
                client = %client.id,
                remote = %client.remote_addr,
                client_checksum = %request.shadow_checksum,
                server_checksum = %expected,
                "shadow out of sync, forcing resync"
            );
            return EditOutcome::Resync;
        }

        let hunks = match hunks_from_text(&request.patches) {
            Ok(hunks) => hunks,
            Err(error) => {
                warn!(
                    client = %client.id,
                    remote = %client.remote_addr,
                    %error,
                    patches = %log_prefix(&request.patches),
                    "malformed patch text, dropping edit"
                );
                return EditOutcome::Dropped;
            }
        };

        // The shadow was the basis of the patch, so this must apply
        // cleanly; anything else means the connection state is broken.
        let (patched_shadow, shadow_results) = apply_hunks(&hunks, &shadow);
        if shadow_results.iter().any(|&ok| !ok) {
            warn!(
                client = %client.id,
                remote = %client.remote_addr,
                "patch failed against its own shadow, forcing resync"
            );
            return EditOutcome::Resync;
        }
        self.shadows.set(client.id, patched_shadow);

        self.apply_to_document(client, &hunks);
        EditOutcome::Respond(self.build_edit_response(client))
    }

    /// Fuzzy-apply the client's hunks to the authoritative copy and queue a
    /// flush when it changed. Failed hunks are dropped silently here; the
    /// shadow round trip reconciles the difference.
    fn apply_to_document(&self, client: &ClientInfo, hunks: &[PatchHunk]) {
        let Some(current) = self.store.content(&client.document_id) else {
            warn!(document = %client.document_id, "document vanished from the tree");
            return;
        };

        let (patched, results) = apply_hunks(hunks, &current);
        if results.iter().any(|&ok| !ok) {
            debug!(
                client = %client.id,
                document = %client.document_id,
                failed = results.iter().filter(|&&ok| !ok).count(),
                total = results.len(),
                "some hunks did not anchor on the server copy"
            );
        }

        if patched != current {
            self.store.set_content(&client.document_id, patched);
            self.flush_lock().push(client.document_id.clone());
        }
    }

    /// Diff the connection's shadow against the authoritative copy. The
    /// shadow advances to the content being shipped before anything is
    /// sent, whether or not the client ever acknowledges it.
    fn build_edit_response(&self, client: &ClientInfo) -> Option<SyncMessage> {
        let shadow = self.shadows.get(client.id)?;
        let current = self.store.content(&client.document_id)?;

        let shadow_checksum = content_checksum(&shadow);
        let patches = create_patch(&shadow, &current);
        self.shadows.set(client.id, current);

        if patches.is_empty() {
            return None;
        }
        Some(SyncMessage::EditRequest(EditRequest {
            request_id: String::new(),
            document_id: client.document_id.clone(),
            patches,
            shadow_checksum,
        }))
    }

    /// Write one document's in-memory content to disk. Failures are logged
    /// and the document is re-queued so a later flush retries.
    pub async fn flush_document(&self, document_id: &DocumentId) {
        let Some((path, bytes)) = self
            .store
            .with_document(document_id, |doc| (doc.meta.path.clone(), doc.content.clone().into_bytes()))
        else {
            warn!(document = %document_id, "cannot flush unknown document");
            return;
        };

        match files::write_atomic(&path, &bytes).await {
            Ok(()) => {
                debug!(document = %document_id, path = %path.display(), "document flushed to disk");
            }
            Err(error) => {
                warn!(
                    document = %document_id,
                    path = %path.display(),
                    ?error,
                    "failed to write document, will retry on next flush"
                );
                self.flush_lock().push(document_id.clone());
            }
        }
    }

    /// Background task draining the debounced flush queue until `shutdown`
    /// flips, then writing out everything still pending.
    pub async fn run_flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let window = self.flush_lock().window();
        let mut ticker = tokio::time::interval(window);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ready = self.flush_lock().drain_ready();
                    for document_id in ready {
                        self.flush_document(&document_id).await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        let remaining = self.flush_lock().drain_all();
        for document_id in remaining {
            self.flush_document(&document_id).await;
        }
    }

    fn flush_lock(&self) -> std::sync::MutexGuard<'_, FlushQueue> {
        self.flush.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SyncEvents for SyncManager {
    async fn on_new_client(&self, client: &ClientInfo) -> Result<()> {
        self.send_initial_content(client).await
    }

    async fn on_edit_request(&self, client: &ClientInfo, request: EditRequest) -> Result<()> {
        if request.document_id != client.document_id {
            // The shadow is bound to the upgrade-time document.
            warn!(
                client = %client.id,
                remote = %client.remote_addr,
                bound = %client.document_id,
                addressed = %request.document_id,
                "ignoring edit request for a different document"
            );
            return Ok(());
        }

        match self.handle_edit(client, &request) {
            EditOutcome::Resync => self.send_initial_content(client).await,
            EditOutcome::Dropped => Ok(()),
            EditOutcome::Respond(None) => Ok(()),
            EditOutcome::Respond(Some(message)) => self
                .registry
                .send_to_client(client.id, message)
                .await
                .context("failed to send edit response"),
        }
    }

    async fn on_sync_request(&self, client: &ClientInfo, request: SyncRequest) -> Result<()> {
        warn!(
            client = %client.id,
            remote = %client.remote_addr,
            document = %request.document_id,
            "sync-request transport is not supported, ignoring"
        );
        Ok(())
    }

    async fn on_client_disconnected(&self, client: &ClientInfo, remaining: u32) {
        self.shadows.remove(client.id);

        if remaining == 0 {
            // Last editor left: write out now, bypassing the debounce
            // window, so the disk copy is settled before anyone returns.
            self.flush_lock().take(&client.document_id);
            self.flush_document(&client.document_id).await;
        }
    }
}

fn log_prefix(patches: &str) -> String {
    patches.chars().take(PATCH_LOG_PREFIX).collect()
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use vellum_common::checksum::content_checksum;
    use vellum_common::diff::{apply_patch, create_patch};
    use vellum_common::protocol::ws::{EditRequest, SyncMessage, SyncRequest};
    use vellum_common::types::DocumentId;

    use super::SyncManager;
    use crate::config::SyncTuning;
    use crate::rpc::{ClientId, ClientInfo, ClientRegistry, SyncEvents};
    use crate::store::DocumentStore;

    struct Fixture {
        _dir: TempDir,
        store: Arc<DocumentStore>,
        registry: Arc<ClientRegistry>,
        manager: Arc<SyncManager>,
        doc: DocumentId,
    }

    fn fixture(initial: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("page.md"), initial).unwrap();
        let store = Arc::new(DocumentStore::scan(dir.path(), &[]).unwrap());
        let registry = Arc::new(ClientRegistry::new());
        let manager = SyncManager::new(Arc::clone(&store), Arc::clone(&registry), &SyncTuning::default());
        let doc = store.document_id_by_rel_path("page.md").unwrap();
        Fixture { _dir: dir, store, registry, manager, doc }
    }

    struct TestClient {
        info: ClientInfo,
        rx: mpsc::Receiver<SyncMessage>,
    }

    fn connect(fix: &Fixture) -> TestClient {
        let info = ClientInfo {
            id: ClientId::new(),
            remote_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50000),
            document_id: fix.doc.clone(),
        };
        let (tx, rx) = mpsc::channel(16);
        fix.registry.register(&info, tx);
        TestClient { info, rx }
    }

    fn edit(doc: &DocumentId, shadow: &str, target: &str) -> EditRequest {
        EditRequest {
            request_id: String::new(),
            document_id: doc.clone(),
            patches: create_patch(shadow, target),
            shadow_checksum: content_checksum(shadow),
        }
    }

    // ── Handshake ──────────────────────────────────────────────────

    #[tokio::test]
    async fn new_client_gets_initial_content_and_a_shadow() {
        let fix = fixture("hello");
        let mut client = connect(&fix);

        fix.manager.on_new_client(&client.info).await.unwrap();

        let SyncMessage::InitialContent(body) = client.rx.recv().await.unwrap() else {
            panic!("expected initial-content");
        };
        assert_eq!(body.content, "hello");
        assert_eq!(body.document_id, fix.doc);
        assert_eq!(fix.manager.shadow_count(), 1);
    }

    // ── Edit round trips ───────────────────────────────────────────

    #[tokio::test]
    async fn clean_edit_updates_document_and_sends_nothing_back() {
        let fix = fixture("hello");
        let mut client = connect(&fix);
        fix.manager.on_new_client(&client.info).await.unwrap();
        client.rx.recv().await.unwrap();

        let request = edit(&fix.doc, "hello", "hello world");
        fix.manager.on_edit_request(&client.info, request).await.unwrap();

        assert_eq!(fix.store.content(&fix.doc).unwrap(), "hello world");
        // Shadow and document already agree; no delta goes out.
        assert!(client.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_client_receives_delta_on_next_round_trip() {
        let fix = fixture("hello");
        let mut alice = connect(&fix);
        let mut bob = connect(&fix);
        fix.manager.on_new_client(&alice.info).await.unwrap();
        fix.manager.on_new_client(&bob.info).await.unwrap();
        alice.rx.recv().await.unwrap();
        bob.rx.recv().await.unwrap();

        // Alice changes the document; Bob's server shadow still says "hello".
        let request = edit(&fix.doc, "hello", "hello world");
        fix.manager.on_edit_request(&alice.info, request).await.unwrap();

        // Bob checks in with no local changes.
        let request = edit(&fix.doc, "hello", "hello");
        fix.manager.on_edit_request(&bob.info, request).await.unwrap();

        let SyncMessage::EditRequest(delta) = bob.rx.recv().await.unwrap() else {
            panic!("expected an edit-request delta");
        };
        assert_eq!(delta.shadow_checksum, content_checksum("hello"));
        let (converged, results) = apply_patch("hello", &delta.patches).unwrap();
        assert_eq!(converged, "hello world");
        assert!(results.iter().all(|&ok| ok));
    }

    #[tokio::test]
    async fn concurrent_edits_merge_through_fuzzy_patching() {
        let fix = fixture("The quick brown fox");
        let mut alice = connect(&fix);
        let mut bob = connect(&fix);
        fix.manager.on_new_client(&alice.info).await.unwrap();
        fix.manager.on_new_client(&bob.info).await.unwrap();
        alice.rx.recv().await.unwrap();
        bob.rx.recv().await.unwrap();

        // Bob lands first.
        let request = edit(&fix.doc, "The quick brown fox", "The slow brown fox");
        fix.manager.on_edit_request(&bob.info, request).await.unwrap();

        // Alice edits a different word against her now-stale shadow.
        let request = edit(&fix.doc, "The quick brown fox", "The quick red fox");
        fix.manager.on_edit_request(&alice.info, request).await.unwrap();

        assert_eq!(fix.store.content(&fix.doc).unwrap(), "The slow red fox");

        // Alice's response folds Bob's edit into her view.
        let SyncMessage::EditRequest(delta) = alice.rx.recv().await.unwrap() else {
            panic!("expected an edit-request delta");
        };
        let (converged, _) = apply_patch("The quick red fox", &delta.patches).unwrap();
        assert_eq!(converged, "The slow red fox");
    }

    // ── Resync paths ───────────────────────────────────────────────

    #[tokio::test]
    async fn checksum_mismatch_forces_resync_and_drops_patches() {
        let fix = fixture("hello");
        let mut client = connect(&fix);
        fix.manager.on_new_client(&client.info).await.unwrap();
        client.rx.recv().await.unwrap();

        let request = EditRequest {
            request_id: String::new(),
            document_id: fix.doc.clone(),
            patches: create_patch("hello", "hijacked"),
            shadow_checksum: "deadbeefdeadbeefdeadbeefdeadbeef".to_owned(),
        };
        fix.manager.on_edit_request(&client.info, request).await.unwrap();

        // The edit is discarded and the baseline is re-sent.
        assert_eq!(fix.store.content(&fix.doc).unwrap(), "hello");
        let SyncMessage::InitialContent(body) = client.rx.recv().await.unwrap() else {
            panic!("expected initial-content resync");
        };
        assert_eq!(body.content, "hello");
    }

    #[tokio::test]
    async fn resync_rebaselines_so_the_next_edit_works() {
        let fix = fixture("hello");
        let mut client = connect(&fix);
        fix.manager.on_new_client(&client.info).await.unwrap();
        client.rx.recv().await.unwrap();

        let request = EditRequest {
            request_id: String::new(),
            document_id: fix.doc.clone(),
            patches: String::new(),
            shadow_checksum: "00000000000000000000000000000000".to_owned(),
        };
        fix.manager.on_edit_request(&client.info, request).await.unwrap();
        client.rx.recv().await.unwrap(); // initial-content

        // After the resync the normal flow resumes.
        let request = edit(&fix.doc, "hello", "hello again");
        fix.manager.on_edit_request(&client.info, request).await.unwrap();
        assert_eq!(fix.store.content(&fix.doc).unwrap(), "hello again");
    }

    // ── Error handling ─────────────────────────────────────────────

    #[tokio::test]
    async fn malformed_patch_is_dropped_without_disconnect() {
        let fix = fixture("hello");
        let mut client = connect(&fix);
        fix.manager.on_new_client(&client.info).await.unwrap();
        client.rx.recv().await.unwrap();

        let request = EditRequest {
            request_id: String::new(),
            document_id: fix.doc.clone(),
            patches: "@@ not a patch @@".to_owned(),
            shadow_checksum: content_checksum("hello"),
        };
        fix.manager.on_edit_request(&client.info, request).await.unwrap();

        assert_eq!(fix.store.content(&fix.doc).unwrap(), "hello");
        assert!(client.rx.try_recv().is_err());

        // The same connection still syncs normally afterwards.
        let request = edit(&fix.doc, "hello", "hello!");
        fix.manager.on_edit_request(&client.info, request).await.unwrap();
        assert_eq!(fix.store.content(&fix.doc).unwrap(), "hello!");
    }

    #[tokio::test]
    async fn cross_document_edit_is_ignored() {
        let fix = fixture("hello");
        let mut client = connect(&fix);
        fix.manager.on_new_client(&client.info).await.unwrap();
        client.rx.recv().await.unwrap();

        let request = edit(&DocumentId::new("somewhere-else"), "hello", "evil");
        fix.manager.on_edit_request(&client.info, request).await.unwrap();

        assert_eq!(fix.store.content(&fix.doc).unwrap(), "hello");
        assert!(client.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sync_request_is_rejected_without_crashing() {
        let fix = fixture("hello");
        let mut client = connect(&fix);
        fix.manager.on_new_client(&client.info).await.unwrap();
        client.rx.recv().await.unwrap();

        let request = SyncRequest {
            request_id: String::new(),
            document_id: fix.doc.clone(),
            document_state: "AAE=".to_owned(),
            sync_message: "AQI=".to_owned(),
        };
        fix.manager.on_sync_request(&client.info, request).await.unwrap();
        assert!(client.rx.try_recv().is_err());
    }

    // ── Disconnect & persistence ───────────────────────────────────

    #[tokio::test]
    async fn last_disconnect_flushes_to_disk() {
        let fix = fixture("hello");
        let mut client = connect(&fix);
        fix.manager.on_new_client(&client.info).await.unwrap();
        client.rx.recv().await.unwrap();

        let request = edit(&fix.doc, "hello", "hello world");
        fix.manager.on_edit_request(&client.info, request).await.unwrap();

        let (_, remaining) = fix.registry.release(client.info.id).unwrap();
        fix.manager.on_client_disconnected(&client.info, remaining).await;

        assert_eq!(fix.manager.shadow_count(), 0);
        let path = fix.store.meta(&fix.doc).unwrap().path;
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello world");
    }

    #[tokio::test]
    async fn disconnect_with_other_editors_does_not_flush() {
        let fix = fixture("hello");
        let mut alice = connect(&fix);
        let bob = connect(&fix);
        fix.manager.on_new_client(&alice.info).await.unwrap();
        fix.manager.on_new_client(&bob.info).await.unwrap();
        alice.rx.recv().await.unwrap();

        let request = edit(&fix.doc, "hello", "hello world");
        fix.manager.on_edit_request(&alice.info, request).await.unwrap();

        let (_, remaining) = fix.registry.release(alice.info.id).unwrap();
        assert_eq!(remaining, 1);
        fix.manager.on_client_disconnected(&alice.info, remaining).await;

        // Bob is still editing; the disk copy stays as it was.
        let path = fix.store.meta(&fix.doc).unwrap().path;
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello");
        assert_eq!(fix.manager.shadow_count(), 1);
    }

    #[tokio::test]
    async fn ghost_disconnect_flushes_unchanged_content_without_error() {
        let fix = fixture("untouched");
        let client = connect(&fix);
        fix.manager.on_new_client(&client.info).await.unwrap();

        let (_, remaining) = fix.registry.release(client.info.id).unwrap();
        fix.manager.on_client_disconnected(&client.info, remaining).await;

        let path = fix.store.meta(&fix.doc).unwrap().path;
        assert_eq!(std::fs::read_to_string(path).unwrap(), "untouched");
    }

    // ── Section queries ────────────────────────────────────────────

    #[tokio::test]
    async fn section_under_edit_reports_active_documents() {
        let fix = fixture("hello");
        let root = crate::store::document_id_for_path("");
        assert!(fix.manager.section_under_edit(&root).is_none());

        let client = connect(&fix);
        fix.manager.on_new_client(&client.info).await.unwrap();
        assert_eq!(fix.manager.section_under_edit(&root), Some(fix.doc.clone()));
    }
}
