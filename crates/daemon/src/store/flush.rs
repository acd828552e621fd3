// Write coalescing for the sync engine.
//
// Mutations to the same document within the debounce window collapse into
// one disk write. The last-disconnect path takes entries out of the queue
// and flushes immediately instead.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use vellum_common::types::DocumentId;

/// Default debounce window.
const DEFAULT_DEBOUNCE_MS: u64 = 100;
/// Minimum allowed debounce window.
const MIN_DEBOUNCE_MS: u64 = 10;
/// Maximum allowed debounce window.
const MAX_DEBOUNCE_MS: u64 = 2_000;

/// Configuration for the flush queue.
#[derive(Debug, Clone)]
pub struct FlushConfig {
    pub window: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self { window: Duration::from_millis(DEFAULT_DEBOUNCE_MS) }
    }
}

impl FlushConfig {
    /// Create a config with the given window in milliseconds, clamped to
    /// [10, 2000].
    pub fn with_millis(ms: u64) -> Self {
        let clamped = ms.clamp(MIN_DEBOUNCE_MS, MAX_DEBOUNCE_MS);
        Self { window: Duration::from_millis(clamped) }
    }
}

/// Tracks documents with unwritten changes and their debounce deadlines.
///
/// Call `push()` after each mutation, then `drain_ready()` periodically to
/// collect documents whose window has elapsed.
pub struct FlushQueue {
    config: FlushConfig,
    pending: HashMap<DocumentId, Instant>,
}

impl FlushQueue {
    pub fn new(config: FlushConfig) -> Self {
        Self { config, pending: HashMap::new() }
    }

    pub fn window(&self) -> Duration {
        self.config.window
    }

    /// Record a mutation. A pending entry for the same document is
    /// coalesced and its timer reset.
    pub fn push(&mut self, document_id: DocumentId) {
        self.push_at(document_id, Instant::now());
    }

    /// Like `push` but with a specific timestamp (for testing).
    fn push_at(&mut self, document_id: DocumentId, now: Instant) {
        self.pending.insert(document_id, now);
    }

    /// Drain all documents whose debounce window has elapsed.
    pub fn drain_ready(&mut self) -> Vec<DocumentId> {
        self.drain_ready_at(Instant::now())
    }

    /// Like `drain_ready` but with a specific timestamp (for testing).
    fn drain_ready_at(&mut self, now: Instant) -> Vec<DocumentId> {
        let window = self.config.window;
        let mut ready = Vec::new();

        self.pending.retain(|document_id, last_seen| {
            if now.duration_since(*last_seen) >= window {
                ready.push(document_id.clone());
                false
            } else {
                true
            }
        });

        ready
    }

    /// Drain every pending document regardless of its window (shutdown).
    pub fn drain_all(&mut self) -> Vec<DocumentId> {
        self.pending.drain().map(|(document_id, _)| document_id).collect()
    }

    /// Remove one document's pending entry, if any. Used when a flush is
    /// about to happen out of band so the queue won't write again.
    pub fn take(&mut self, document_id: &DocumentId) -> bool {
        self.pending.remove(document_id).is_some()
    }

    /// Number of documents still inside the debounce window.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Time when the earliest pending document becomes ready.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|last_seen| *last_seen + self.config.window).min()
    }
}
