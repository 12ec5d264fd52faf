//! Database row models — these map to/from SQL rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccountRow {
    pub id: String,
    pub user_id: String,       // server-assigned user ID
    pub username: String,
    pub email: String,
    /// Base64 Ed25519 identity public key
    pub identity_pubkey: String,
    /// Encrypted (vault) Ed25519 identity secret key
    pub identity_secret_enc: String,
    /// Encrypted (vault) X25519 DH secret key
    pub dh_secret_enc: String,
    /// Base64 ML-KEM identity public key, if this account declared PQ support
    pub quantum_identity_pubkey: Option<String>,
    /// Encrypted (vault) ML-KEM identity secret key
    pub quantum_identity_secret_enc: Option<String>,
    /// Hex-encoded 16-byte Argon2id salt for vault key derivation
    pub vault_salt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContactRow {
    pub id: String,
    pub owner_user_id: String,
    pub contact_user_id: String,
    pub display_name: Option<String>,
    /// Base64 Ed25519 identity public key — MUST NOT change silently.
    pub identity_pubkey: String,
    /// User-confirmed key fingerprint hash (null until verified).
    pub verified_fingerprint: Option<String>,
    /// If true, a key change was detected and not yet re-verified.
    pub key_change_pending: bool,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub local_user_id: String,
    pub peer_user_id: String,
    pub peer_device_id: String,
    /// Encrypted session state (RatchetSession struct, serialized + vault-encrypted)
    pub session_state_enc: String,
    /// Wire name of the algorithm negotiated for this session's handshake.
    pub negotiated_algorithm: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last chain-link hash (hex)
    pub chain_head: String,
    /// Number of links appended to this session's local hash chain.
    pub chain_length: i64,
    /// Hex-encoded X3DH transcript hash, needed to reconstruct the AEAD AAD
    /// on restore (not part of the serialized `RatchetSession` blob).
    pub transcript_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,            // message_id from PlaintextPayload
    pub session_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub sent_at: DateTime<Utc>,
    pub received_at: Option<DateTime<Utc>>,
    pub delivery_state: String, // DeliveryState as string
    pub message_type: String,  // "text" / "attachment" / etc.
    /// Encrypted message body (JSON of MessageContent, vault-encrypted)
    pub body_enc: String,
    pub chain_link: String,
    pub message_n: i64,
    pub is_outgoing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AttachmentRow {
    pub id: String,
    pub message_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub storage_ref: String,
    /// Encrypted attachment key (vault-encrypted)
    pub attachment_key_enc: String,
    pub local_path: Option<String>,
    pub downloaded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceRow {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
    /// Base64 Ed25519 device public key
    pub device_pubkey: String,
    /// DeviceCert JSON (for display/verification)
    pub device_cert: String,
    pub enrolled_at: DateTime<Utc>,
    pub is_current_device: bool,
}

/// A signed prekey this device has published (possibly several, during the
/// rotation overlap window — see prekey lifecycle policy).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SignedPrekeyRow {
    pub id: String,
    pub key_id: String,
    /// Encrypted (vault) X25519 secret key
    pub secret_key_enc: String,
    pub public_key: String,
    pub signature: String,
    pub quantum_public_key: Option<String>,
    /// Encrypted (vault) ML-KEM secret key
    pub quantum_secret_key_enc: Option<String>,
    pub quantum_algorithm: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set once a newer signed prekey has superseded this one; retained
    /// briefly so in-flight X3DH handshakes against the old key still land.
    pub retired_at: Option<DateTime<Utc>>,
}

/// A batch-uploaded one-time prekey. Deleted locally once the directory
/// confirms it was consumed (the directory is the source of truth on use).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OneTimePrekeyRow {
    pub id: String,
    pub key_id: String,
    /// Encrypted (vault) X25519 secret key
    pub secret_key_enc: String,
    pub public_key: String,
    pub consumed: bool,
    pub created_at: DateTime<Utc>,
}

/// An outbound item waiting to fan out to one of our own other devices
/// (account-sync: contacts, read state, sent messages) or a peer's device
/// not yet reachable.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncQueueRow {
    pub id: String,
    pub target_device_id: String,
    /// Encrypted (vault) payload — its own session carries the wire key.
    pub payload_enc: String,
    pub status: String, // "pending" | "in_flight" | "failed" | "delivered"
    pub attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
