//! BLAKE3-based hash utilities
//!
//! - Deterministic message IDs
//! - Content-addressing for attachments
//!
//! Hash-chain linking lives in `hash_chain` — this module is the
//! general-purpose primitive layer underneath it.

pub fn hash(data: &[u8]) -> [u8; 32] {
    blake3::hash(data).into()
}

/// Keyed hash — used for MACs where a key context differentiates domains.
pub fn keyed_hash(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    blake3::keyed_hash(key, data).into()
}

/// Derive a deterministic 32-byte message ID from content.
pub fn message_id(sender_id: &str, recipient_id: &str, plaintext: &[u8], ts_nanos: i64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"e2ee-msg-id-v1\x00");
    hasher.update(sender_id.as_bytes());
    hasher.update(b"\x00");
    hasher.update(recipient_id.as_bytes());
    hasher.update(b"\x00");
    hasher.update(&ts_nanos.to_le_bytes());
    hasher.update(b"\x00");
    hasher.update(plaintext);
    hex::encode(hasher.finalize().as_bytes())
}

/// Content hash for an attachment (used as dedup key / integrity check).
pub fn attachment_hash(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}
