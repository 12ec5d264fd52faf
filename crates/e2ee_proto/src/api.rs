//! API request/response types shared between clients and services.
//! These map directly to JSON bodies on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

// ── Identity / auth ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    /// Base64 Ed25519 identity public key
    pub identity_pubkey: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username_or_email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub username: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Signals whether the server thinks the client should re-verify keys.
    pub key_change_detected: bool,
    /// Role tag assigned to this user (e.g. "owner", "admin", "moderator").
    #[serde(default)]
    pub system_role: Option<String>,
}

// ── Device enrollment & key upload ───────────────────────────────────────────

/// What this device can negotiate, advertised at enrollment and re-sent
/// whenever capabilities change (e.g. a PQ library becomes available).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCapabilitiesWire {
    /// Wire names in priority order, e.g. ["ML-KEM-1024", "ML-KEM-768", "Curve25519"].
    pub supported_algorithms: Vec<String>,
    pub quantum_capable: bool,
    /// Algorithms this device will accept if the peer can't do better.
    pub fallback_algorithms: Vec<String>,
    pub protocol_version: u32,
    pub device_type: String,
}

/// One signed prekey entry, with an optional PQ co-key riding alongside the
/// classical X25519 key so the directory can serve either path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrekeyWire {
    pub key_id: String,
    pub public_key: String,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantum_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantum_algorithm: Option<String>,
}

/// One one-time prekey entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyWire {
    pub key_id: String,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantum_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantum_algorithm: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceEnrollRequest {
    /// Base64 Ed25519 device public key
    pub device_pubkey: String,
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
    /// DeviceCert JSON, signed by identity key
    pub device_cert: serde_json::Value,
    /// Registration id the directory uses to key this device's prekey bundle.
    pub registration_id: u32,
    pub signed_pre_key: SignedPrekeyWire,
    /// One-time prekeys (batch upload)
    pub one_time_prekeys: Vec<OneTimePrekeyWire>,
    /// ML-KEM identity public key, if this device declared PQ support.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantum_identity_key: Option<String>,
    pub device_capabilities: DeviceCapabilitiesWire,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceEnrollResponse {
    pub device_id: String,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyUploadRequest {
    /// New batch of one-time prekeys
    pub one_time_prekeys: Vec<OneTimePrekeyWire>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserKeysResponse {
    pub user_id: String,
    pub username: String,
    /// Base64 Ed25519 identity public key
    pub identity_pubkey: String,
    /// Key version counter — if this increases unexpectedly, WARN user.
    pub key_version: u64,
    pub prekey_bundle: PrekeyBundleResponse,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrekeyBundleResponse {
    pub registration_id: u32,
    pub ik_pub: String,
    pub signed_pre_key: SignedPrekeyWire,
    pub one_time_prekey: Option<OneTimePrekeyWire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantum_identity_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserDevicesResponse {
    pub user_id: String,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub platform: String,
    pub device_pubkey: String,
    pub enrolled_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

// ── Relay ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct SendRequest {
    pub envelope: Envelope,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendResponse {
    pub envelope_id: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollRequest {
    /// Long-poll timeout in seconds (max 30)
    pub timeout_secs: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub envelopes: Vec<Envelope>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckRequest {
    pub envelope_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub acked: Vec<String>,
}

// ── Common ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
}
