//! Telemetry hook.
//!
//! The legacy "quantum HSM / QKD / threat-detection" subsystems this stack
//! descends from are hash-based stubs with no security meaning — they are
//! not reproduced here as cryptographic primitives. What they're good for
//! is observability: an audit trail of negotiation and recovery events.
//! `TelemetryHook` is that seam, not a security contract.

use chrono::{DateTime, Utc};

use e2ee_crypto::pq::PqAlgorithm;

#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// Algorithm negotiator picked a wire algorithm for a handshake.
    AlgorithmNegotiated {
        session_id: String,
        algorithm: String,
        quantum: bool,
        hybrid_active: bool,
        fallback_used: bool,
    },
    /// A PQ co-secret failed to contribute in hybrid mode; handshake
    /// continued on classical outputs only.
    PqDegraded {
        session_id: String,
        algorithm: Option<PqAlgorithm>,
    },
    /// Ratchet completed a proactive or peer-driven DH step.
    RatchetStepped { session_id: String, epoch: u32 },
    /// Key-mismatch recovery ran for a conversation.
    RecoveryAttempted {
        conversation_id: String,
        device_id: String,
        step: u32,
        succeeded: bool,
    },
    /// A session transitioned state (e.g. Established -> Expired).
    SessionStateChanged {
        session_id: String,
        from: String,
        to: String,
        at: DateTime<Utc>,
    },
    /// A receive-path rejection worth auditing (replay, too-old, skip bound).
    ReceiveRejected { session_id: String, reason: String },
}

/// Sink for `TelemetryEvent`s. Default implementation is a no-op so
/// embedding this crate never requires wiring telemetry up front.
pub trait TelemetryHook: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

#[derive(Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {
    fn record(&self, _event: TelemetryEvent) {}
}
