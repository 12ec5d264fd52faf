//! Multi-device fan-out and key-mismatch recovery.
//!
//! A conversation with a remote user who has N devices needs N independent
//! ratchet sessions, one per `(conversation_id, device_id)` pair — there is
//! no group key, each device gets its own Double Ratchet chain. This module
//! owns that binding table plus the recovery path for when a send discovers
//! the binding no longer matches what the remote actually has (device
//! re-registered, lost its state, or was swapped).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::RwLock;

use e2ee_crypto::identity::PublicKeyBytes;
use e2ee_crypto::pq::PqKeyPair;
use e2ee_proto::Envelope;

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::directory::DirectoryClient;
use crate::error::SessionError;
use crate::manager::SessionManager;
use crate::sync_transport::SyncTransport;
use crate::telemetry::{TelemetryEvent, TelemetryHook};

/// One device's ratchet session within a conversation.
#[derive(Debug, Clone)]
pub struct DeviceBinding {
    pub device_id: String,
    pub session_id: String,
    /// Generation of this `(conversation_id, device_id)` binding. Survives
    /// binding clears during recovery, so a rebuilt binding is identifiably
    /// a later generation rather than generation zero again.
    pub key_version: u64,
    /// Fingerprint of the remote identity key this binding was established
    /// against. Re-checked against the directory's current value every time
    /// an already-bound device is passed to `setup_conversation_encryption`.
    pub device_fingerprint: String,
}

pub struct FanoutCoordinator {
    store: e2ee_store::Store,
    manager: Arc<SessionManager>,
    directory: Arc<dyn DirectoryClient>,
    sync_transport: Arc<dyn SyncTransport>,
    config: SessionConfig,
    telemetry: Arc<dyn TelemetryHook>,
    clock: Arc<dyn Clock>,
    bindings: RwLock<HashMap<String, Vec<DeviceBinding>>>,
    /// `(conversation_id, device_id) -> generation counter`, kept separate
    /// from `bindings` so a recovery rebuild's `clear_bindings_sync` doesn't
    /// reset it back to zero.
    key_versions: StdMutex<HashMap<(String, String), u64>>,
}

impl FanoutCoordinator {
    pub fn new(
        store: e2ee_store::Store,
        manager: Arc<SessionManager>,
        directory: Arc<dyn DirectoryClient>,
        sync_transport: Arc<dyn SyncTransport>,
        config: SessionConfig,
        telemetry: Arc<dyn TelemetryHook>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            manager,
            directory,
            sync_transport,
            config,
            telemetry,
            clock,
            bindings: RwLock::new(HashMap::new()),
            key_versions: StdMutex::new(HashMap::new()),
        }
    }

    /// Fetch the remote user's currently published identity key and reduce
    /// it to the fingerprint used for binding comparisons.
    async fn fetch_device_fingerprint(&self, remote_user_id: &str) -> Result<String, SessionError> {
        let ik_pub = self.directory.fetch_identity_pubkey(remote_user_id).await?;
        let key = PublicKeyBytes::from_b64(&ik_pub).map_err(SessionError::Crypto)?;
        Ok(key.fingerprint())
    }

    fn next_key_version(&self, conversation_id: &str, device_id: &str) -> u64 {
        let mut versions = self.key_versions.lock().unwrap();
        let counter = versions
            .entry((conversation_id.to_string(), device_id.to_string()))
            .or_insert(0);
        *counter += 1;
        *counter
    }

    /// Establish a ratchet session with every device of `remote_user_id`
    /// participating in `conversation_id`. A device that already has a
    /// binding is re-verified against the directory's current identity key
    /// for the remote user rather than left alone outright: if the
    /// fingerprint has changed since the binding was made, the remote's
    /// identity rotated (or was swapped) without us rebuilding, and this
    /// call fails with `KeyMismatch` instead of silently sending against a
    /// stale key. Callers that want a clean rebuild after that should clear
    /// the conversation's bindings first (see `recover_from_key_mismatch`).
    pub async fn setup_conversation_encryption(
        &self,
        conversation_id: &str,
        remote_user_id: &str,
        device_ids: &[String],
    ) -> Result<Vec<DeviceBinding>, SessionError> {
        let mut bindings = self.bindings.write().await;
        let entry = bindings.entry(conversation_id.to_string()).or_default();

        for device_id in device_ids {
            let current_fingerprint = self.fetch_device_fingerprint(remote_user_id).await?;

            if let Some(existing) = entry.iter().find(|b| &b.device_id == device_id) {
                if existing.device_fingerprint != current_fingerprint {
                    return Err(SessionError::KeyMismatch);
                }
                continue;
            }

            // One X3DH handshake per device; each gets its own session_id
            // and ratchet chain. The directory bundle fetch is keyed by
            // user, not device, in this model — a per-device prekey
            // namespace is an application-level extension left to the
            // directory implementation.
            let session_id = self.manager.start_session(remote_user_id).await?;
            entry.push(DeviceBinding {
                device_id: device_id.clone(),
                session_id,
                key_version: self.next_key_version(conversation_id, device_id),
                device_fingerprint: current_fingerprint,
            });
        }

        Ok(entry.clone())
    }

    pub async fn session_for_device(&self, conversation_id: &str, device_id: &str) -> Option<String> {
        let bindings = self.bindings.read().await;
        bindings
            .get(conversation_id)
            .and_then(|devs| devs.iter().find(|b| &b.device_id == device_id))
            .map(|b| b.session_id.clone())
    }

    fn clear_bindings_sync(bindings: &mut HashMap<String, Vec<DeviceBinding>>, conversation_id: &str) {
        bindings.remove(conversation_id);
    }

    /// Key-mismatch recovery: the binding for `failing_device_id` stopped
    /// working (ratchet desync, unknown session on the remote, or a
    /// rejected send). Walks:
    ///   clear cached bindings → confirm device still registered →
    ///   force re-registration if not → rebuild the conversation's sessions
    ///   → retry `resend` against the rebuilt binding, up to
    ///   `max_recovery_retries` → escalate to a full device reset.
    pub async fn recover_from_key_mismatch<F, Fut>(
        &self,
        conversation_id: &str,
        remote_user_id: &str,
        device_ids: &[String],
        failing_device_id: &str,
        mut resend: F,
    ) -> Result<(), SessionError>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<(), SessionError>>,
    {
        {
            let mut bindings = self.bindings.write().await;
            Self::clear_bindings_sync(&mut bindings, conversation_id);
        }

        let known = self
            .directory
            .confirm_device(remote_user_id, failing_device_id)
            .await?;
        if !known {
            self.force_device_reregistration(remote_user_id, failing_device_id).await?;
        }

        for attempt in 1..=self.config.max_recovery_retries {
            let rebuild = self
                .setup_conversation_encryption(conversation_id, remote_user_id, device_ids)
                .await;

            let succeeded = match rebuild {
                Ok(bindings) => {
                    let Some(binding) = bindings.iter().find(|b| b.device_id == failing_device_id) else {
                        self.telemetry.record(TelemetryEvent::RecoveryAttempted {
                            conversation_id: conversation_id.to_string(),
                            device_id: failing_device_id.to_string(),
                            step: attempt,
                            succeeded: false,
                        });
                        continue;
                    };
                    resend(binding.session_id.clone()).await.is_ok()
                }
                Err(_) => false,
            };

            self.telemetry.record(TelemetryEvent::RecoveryAttempted {
                conversation_id: conversation_id.to_string(),
                device_id: failing_device_id.to_string(),
                step: attempt,
                succeeded,
            });

            if succeeded {
                return Ok(());
            }
        }

        self.complete_device_reset(conversation_id, remote_user_id, failing_device_id)
            .await?;
        Err(SessionError::RecoveryExhausted)
    }

    async fn force_device_reregistration(
        &self,
        remote_user_id: &str,
        device_id: &str,
    ) -> Result<(), SessionError> {
        // The remote's identity key is unknown to us at this layer (only the
        // directory can re-derive it); a real re-registration is driven by
        // the remote device itself re-publishing. Here we just clear any
        // stale registration record so the next `confirm_device` reflects
        // the new state once the remote re-publishes.
        self.directory.register_device(remote_user_id, device_id, "").await
    }

    /// Last resort: give up on this device entirely for this conversation.
    /// The caller surfaces this to the user as "conversation needs manual
    /// re-verification" rather than silently dropping messages.
    async fn complete_device_reset(
        &self,
        conversation_id: &str,
        _remote_user_id: &str,
        failing_device_id: &str,
    ) -> Result<(), SessionError> {
        let mut bindings = self.bindings.write().await;
        if let Some(devices) = bindings.get_mut(conversation_id) {
            devices.retain(|b| b.device_id != failing_device_id);
        }
        tracing::warn!(conversation_id, failing_device_id, "device reset: recovery exhausted");
        Ok(())
    }

    // ── Cross-device sync queue ─────────────────────────────────────────

    /// Queue a sync envelope for one of the local account's other devices
    /// (contacts, read state, sent-message echo). Delivery is attempted by
    /// `drain_sync_queue`, not inline, so a slow/offline device never blocks
    /// the caller.
    pub async fn enqueue_sync(&self, target_device_id: &str, envelope: &Envelope) -> Result<(), SessionError> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|e| SessionError::Crypto(e2ee_crypto::CryptoError::Serialisation(e)))?;
        let payload_enc = self.store.encrypt_value(&payload).await?;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO sync_queue (id, target_device_id, payload_enc, status, attempts, next_attempt_at, created_at) \
             VALUES (?, ?, ?, 'pending', 0, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(target_device_id)
        .bind(&payload_enc)
        .bind(now)
        .bind(now)
        .execute(&self.store.pool)
        .await
        .map_err(e2ee_store::StoreError::Database)?;

        Ok(())
    }

    /// Attempt delivery of every due sync-queue entry. Failures back off
    /// exponentially (`sync_retry_backoff * attempts`) and are dropped
    /// (marked `failed`) after `max_sync_retries`. Returns the number of
    /// entries successfully delivered.
    pub async fn drain_sync_queue(&self) -> Result<usize, SessionError> {
        let now = self.clock.now_wall();
        let rows = sqlx::query_as::<_, e2ee_store::models::SyncQueueRow>(
            "SELECT * FROM sync_queue WHERE status = 'pending' AND next_attempt_at <= ?",
        )
        .bind(now)
        .fetch_all(&self.store.pool)
        .await
        .map_err(e2ee_store::StoreError::Database)?;

        let mut delivered = 0;
        for row in rows {
            let payload = self.store.decrypt_value(&row.payload_enc).await?;
            let envelope: Envelope = serde_json::from_slice(&payload)
                .map_err(|e| SessionError::Crypto(e2ee_crypto::CryptoError::Serialisation(e)))?;

            match self
                .sync_transport
                .send_sync_envelope(&row.target_device_id, &envelope)
                .await
            {
                Ok(()) => {
                    sqlx::query("UPDATE sync_queue SET status = 'delivered' WHERE id = ?")
                        .bind(&row.id)
                        .execute(&self.store.pool)
                        .await
                        .map_err(e2ee_store::StoreError::Database)?;
                    delivered += 1;
                }
                Err(_) => {
                    let attempts = row.attempts + 1;
                    if attempts as u32 >= self.config.max_sync_retries {
                        sqlx::query("UPDATE sync_queue SET status = 'failed', attempts = ? WHERE id = ?")
                            .bind(attempts)
                            .bind(&row.id)
                            .execute(&self.store.pool)
                            .await
                            .map_err(e2ee_store::StoreError::Database)?;
                    } else {
                        let backoff = self.config.sync_retry_backoff * attempts as u32;
                        let next_attempt = now
                            + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(5));
                        sqlx::query(
                            "UPDATE sync_queue SET attempts = ?, next_attempt_at = ? WHERE id = ?",
                        )
                        .bind(attempts)
                        .bind(next_attempt)
                        .bind(&row.id)
                        .execute(&self.store.pool)
                        .await
                        .map_err(e2ee_store::StoreError::Database)?;
                    }
                }
            }
        }

        Ok(delivered)
    }

    /// PQ-aware variant of `setup_conversation_encryption` when any new
    /// sessions must be receiver-side (`accept_prekey_message`) rather than
    /// initiator-side — kept separate so callers that only ever initiate
    /// don't need to thread a PQ keypair through.
    pub async fn bind_responder_session(
        &self,
        conversation_id: &str,
        device_id: &str,
        envelope: &Envelope,
        pq_keypair: Option<&PqKeyPair>,
    ) -> Result<(String, Vec<u8>), SessionError> {
        let sender_ik_pub = envelope
            .x3dh_header
            .as_ref()
            .map(|h| h.ik_pub.clone())
            .ok_or_else(|| {
                SessionError::Crypto(e2ee_crypto::CryptoError::InvalidHeader(
                    "envelope missing X3DH header".into(),
                ))
            })?;
        let device_fingerprint = PublicKeyBytes::from_b64(&sender_ik_pub)
            .map_err(SessionError::Crypto)?
            .fingerprint();

        let (session_id, plaintext) = self.manager.accept_prekey_message(envelope, pq_keypair).await?;
        let mut bindings = self.bindings.write().await;
        let entry = bindings.entry(conversation_id.to_string()).or_default();
        if !entry.iter().any(|b| b.device_id == device_id) {
            entry.push(DeviceBinding {
                device_id: device_id.to_string(),
                session_id: session_id.clone(),
                key_version: self.next_key_version(conversation_id, device_id),
                device_fingerprint,
            });
        }
        Ok((session_id, plaintext))
    }
}
