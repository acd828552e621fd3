use vellum_common::checksum::content_checksum;
use vellum_common::protocol::ws::{EditRequest, InitialContent, SyncMessage};
use vellum_common::types::DocumentId;

// The wire format is shared with editor clients; these names are load
// bearing and must never drift.

#[test]
fn message_type_tags_match_the_wire_contract() {
    let initial = SyncMessage::InitialContent(InitialContent {
        request_id: String::new(),
        document_id: DocumentId::new("d"),
        content: String::new(),
    });
    let edit = SyncMessage::EditRequest(EditRequest {
        request_id: String::new(),
        document_id: DocumentId::new("d"),
        patches: String::new(),
        shadow_checksum: String::new(),
    });

    let initial = serde_json::to_value(&initial).unwrap();
    let edit = serde_json::to_value(&edit).unwrap();
    assert_eq!(initial["type"], "initial-content");
    assert_eq!(edit["type"], "edit-request");
}

#[test]
fn edit_request_field_names_match_the_wire_contract() {
    let edit = SyncMessage::EditRequest(EditRequest {
        request_id: "r".to_owned(),
        document_id: DocumentId::new("d"),
        patches: "@@ -1 +1 @@\n-a\n+b\n".to_owned(),
        shadow_checksum: content_checksum("a"),
    });

    let value = serde_json::to_value(&edit).unwrap();
    let object = value.as_object().unwrap();
    let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["documentId", "patches", "requestId", "shadowChecksum", "type"]);
}

#[test]
fn checksum_format_matches_the_wire_contract() {
    // 32 lowercase hex chars, UTF-16LE + MD5.
    assert_eq!(content_checksum("hello"), "fd186dd49a16b1bf2bd2f44e495e14c9");
}
