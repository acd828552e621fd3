// Shadow fingerprinting for the differential-sync protocol.
//
// Server and clients must produce bit-identical fingerprints: the text is
// encoded as UTF-16LE without a byte-order mark and hashed with MD5,
// rendered as 32 lowercase hex characters with leading zeros preserved.
// MD5 is an interop requirement of the wire protocol, not a security
// property; a deviation here sends every connection into a resync loop.

use md5::{Digest, Md5};

/// Compute the wire checksum of a document or shadow text.
pub fn content_checksum(text: &str) -> String {
    let mut bytes = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }

    let digest = Md5::digest(&bytes);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
