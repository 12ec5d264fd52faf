//! Cross-device sync transport — the signalling channel that carries a
//! sync envelope to one of the sender's *own* other devices. Deliberately
//! external: implementations live next to whatever push/relay transport
//! the embedding application already has.

use async_trait::async_trait;
use e2ee_proto::Envelope;

use crate::error::SessionError;

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Best-effort delivery of a sync envelope to one target device.
    /// Transient failures should be returned as `Err` so the caller's
    /// backoff policy (see `SessionConfig::sync_retry_backoff`) can retry;
    /// do not retry internally.
    async fn send_sync_envelope(
        &self,
        target_device_id: &str,
        envelope: &Envelope,
    ) -> Result<(), SessionError>;
}

/// No-op transport: records what would have been sent. Useful for tests
/// and for embeddings that haven't wired up multi-device sync yet.
#[derive(Default)]
pub struct NullSyncTransport;

#[async_trait]
impl SyncTransport for NullSyncTransport {
    async fn send_sync_envelope(
        &self,
        _target_device_id: &str,
        _envelope: &Envelope,
    ) -> Result<(), SessionError> {
        Ok(())
    }
}
