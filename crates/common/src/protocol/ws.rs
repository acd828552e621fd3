// WebSocket message types for the vellum document sync protocol.
//
// Every frame is a JSON object tagged by a `type` field; dispatch selects
// on the tag and rejects unknown values instead of probing each variant.

use serde::{Deserialize, Serialize};

use crate::types::DocumentId;

/// All message types exchanged over a document sync connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncMessage {
    /// Server -> Client: the authoritative content, sent as the baseline on
    /// connect and again whenever the server forces a resync.
    InitialContent(InitialContent),

    /// Bidirectional: a diff-match-patch text plus the checksum of the
    /// shadow the patches were computed against.
    EditRequest(EditRequest),

    /// Reserved for a CRDT state transport. Parsed so it can be dispatched
    /// and rejected cleanly; servers speaking only differential sync do not
    /// act on it.
    SyncRequest(SyncRequest),
}

impl SyncMessage {
    /// The document this message addresses.
    pub fn document_id(&self) -> &DocumentId {
        match self {
            SyncMessage::InitialContent(body) => &body.document_id,
            SyncMessage::EditRequest(body) => &body.document_id,
            SyncMessage::SyncRequest(body) => &body.document_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitialContent {
    #[serde(default)]
    pub request_id: String,
    pub document_id: DocumentId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EditRequest {
    #[serde(default)]
    pub request_id: String,
    pub document_id: DocumentId,
    /// Patch text in the diff-match-patch format (see `crate::diff`).
    pub patches: String,
    /// Checksum of the sender's shadow before the patches were applied.
    pub shadow_checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub request_id: String,
    pub document_id: DocumentId,
    /// Base64-encoded document state vector.
    pub document_state: String,
    /// Base64-encoded sync payload.
    pub sync_message: String,
}
