//! Explicit session policy. No implicit environment reads: every knob here
//! is set by the embedding application at construction time, with defaults
//! matching the reference policy below.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often a signed prekey is rotated.
    pub rotation_interval: Duration,
    /// Generate more one-time prekeys once the local pool drops below this.
    pub prekey_low_water: usize,
    /// Target pool size when topping up one-time prekeys.
    pub prekey_top_up_target: usize,
    /// Maximum retained skipped-message keys per session.
    pub max_skip: u64,
    /// Force a proactive sending-side DH ratchet step every N messages.
    pub safety_window: u64,
    /// Wall-clock interval between quantum-epoch rotations.
    pub quantum_epoch_duration: Duration,
    /// Messages older than this are refused before decryption.
    pub max_message_age: Duration,
    /// Bound on the out-of-order pending-envelope queue, per session.
    pub message_queue_size: usize,
    /// Handshake must complete within this window or it times out.
    pub handshake_timeout: Duration,
    /// A session idle this long is transitioned to `Expired`.
    pub max_session_duration: Duration,
    /// Bound on the replay-guard's retained message-hash history.
    pub replay_guard_capacity: usize,
    /// If true, classical-only negotiated algorithms are rejected outright.
    pub quantum_only: bool,
    /// If true, a PQ co-secret is required to contribute to every handshake
    /// it can reach, but failure degrades to classical rather than aborting.
    pub hybrid: bool,
    /// Retry budget for key-mismatch recovery before escalating to a full
    /// device reset.
    pub max_recovery_retries: u32,
    /// Backoff unit for cross-device sync retries (`backoff * attempt`).
    pub sync_retry_backoff: Duration,
    /// Sync entries are dropped (and failure-reported) after this many
    /// retries.
    pub max_sync_retries: u32,
    /// Bucket-padding applied to plaintext before AEAD encryption.
    pub padding_mode: e2ee_proto::codec::PaddingMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rotation_interval: Duration::from_secs(7 * 24 * 3600),
            prekey_low_water: 10,
            prekey_top_up_target: 50,
            max_skip: 1000,
            safety_window: 100,
            quantum_epoch_duration: Duration::from_secs(24 * 3600),
            max_message_age: Duration::from_secs(3600),
            message_queue_size: 1000,
            handshake_timeout: Duration::from_secs(30),
            max_session_duration: Duration::from_secs(30 * 24 * 3600),
            replay_guard_capacity: 4096,
            quantum_only: false,
            hybrid: true,
            max_recovery_retries: 5,
            sync_retry_backoff: Duration::from_secs(5),
            max_sync_retries: 3,
            padding_mode: e2ee_proto::codec::PaddingMode::default(),
        }
    }
}

impl SessionConfig {
    /// Translate this application-level policy into the ratchet crate's
    /// own (narrower) runtime configuration.
    pub fn to_ratchet_config(&self) -> e2ee_crypto::ratchet::RatchetConfig {
        e2ee_crypto::ratchet::RatchetConfig {
            max_skip: self.max_skip,
            max_message_age: chrono::Duration::from_std(self.max_message_age)
                .unwrap_or(chrono::Duration::hours(1)),
            quantum_epoch_duration: chrono::Duration::from_std(self.quantum_epoch_duration)
                .unwrap_or(chrono::Duration::hours(24)),
            safety_window: self.safety_window,
            replay_guard_capacity: self.replay_guard_capacity,
        }
    }

    pub fn pq_mode(&self) -> e2ee_crypto::x3dh::PqMode {
        match (self.quantum_only, self.hybrid) {
            (true, _) => e2ee_crypto::x3dh::PqMode::QuantumOnly,
            (false, true) => e2ee_crypto::x3dh::PqMode::Hybrid,
            (false, false) => e2ee_crypto::x3dh::PqMode::Classical,
        }
    }

    /// A looser age gate for deployments that need to tolerate store-and-
    /// forward transports; still bounded, never unlimited.
    pub fn with_relaxed_message_age(mut self) -> Self {
        self.max_message_age = Duration::from_secs(24 * 3600);
        self
    }
}
