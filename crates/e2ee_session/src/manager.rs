//! Session Manager: owns the per-peer state machine, persists ratchet
//! state, and exposes `encrypt`/`decrypt` at message granularity.
//!
//! ```text
//! NONE ──start──▶ HandshakePending ──X3DH ok──▶ Established
//!                    │                              │
//!                    └──abort/error──▶ Failed       ├─ rotate_keys ──▶ Established
//!                                                   ├─ idle > TTL ───▶ Expired
//!                                                   ├─ peer re-key ──▶ Established
//!                                                   └─ unrecoverable ▶ Failed
//! ```
//! `Failed` and `Expired` are terminal; a higher level must start a new
//! session under a fresh `session_id`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use e2ee_crypto::pq::PqKeyPair;
use e2ee_crypto::ratchet::RatchetSession;
use e2ee_proto::Envelope;

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::handshake;
use crate::prekey_store::PrekeyStore;
use crate::telemetry::{TelemetryEvent, TelemetryHook};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Established,
    Expired,
    Failed,
}

struct SessionEntry {
    state: StdRwLock<SessionState>,
    ratchet: Mutex<RatchetSession>,
    peer_user_id: String,
    transcript_hash: [u8; 32],
    negotiated_algorithm: String,
    /// X3DH header to attach to the next outgoing envelope, if this side
    /// hasn't sent the pre-key message yet.
    pending_x3dh_header: Mutex<Option<e2ee_crypto::x3dh::X3DHHeader>>,
    /// Local tamper-evident chain over this session's outgoing messages.
    chain: StdMutex<e2ee_crypto::hash_chain::HashChain>,
    created_at: chrono::DateTime<Utc>,
    last_activity: StdRwLock<chrono::DateTime<Utc>>,
}

pub struct SessionManager {
    store: e2ee_store::Store,
    prekeys: Arc<PrekeyStore>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetryHook>,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionManager {
    pub fn new(
        store: e2ee_store::Store,
        prekeys: Arc<PrekeyStore>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetryHook>,
    ) -> Self {
        Self {
            store,
            prekeys,
            config,
            clock,
            telemetry,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Local device capability list, advertised to every peer we negotiate
    /// with. Classical support is universal; the PQ entry is only claimed
    /// if this device actually holds generated ML-KEM key material to back
    /// it — see `PrekeyStore::quantum_capable`.
    async fn local_capabilities(&self) -> Result<Vec<String>, SessionError> {
        let mut caps = vec!["Curve25519".to_string()];
        if self.prekeys.quantum_capable().await? {
            caps.push(e2ee_crypto::pq::PqAlgorithm::MlKem768.wire_name().to_string());
        }
        Ok(caps)
    }

    /// Start a session with `remote_user_id` as initiator. Returns the new
    /// session id; the first call to `encrypt` on it carries the pre-key
    /// handshake header.
    pub async fn start_session(&self, remote_user_id: &str) -> Result<String, SessionError> {
        let local_capabilities = self.local_capabilities().await?;
        let outcome =
            handshake::run_initiator(&self.prekeys, &self.config, remote_user_id, &local_capabilities)
                .await?;

        let session_id = outcome.header.session_id.clone();
        let now = self.clock.now_wall();

        let remote_spk_pub_b64 = outcome.remote_spk_pub.as_ref().ok_or_else(|| {
            SessionError::Crypto(e2ee_crypto::CryptoError::InvalidHeader(
                "initiator handshake missing remote SPK".into(),
            ))
        })?;
        let remote_spk_bytes = URL_SAFE_NO_PAD
            .decode(remote_spk_pub_b64)
            .map_err(e2ee_crypto::CryptoError::Base64Decode)?;
        let remote_spk_pub = x25519_dalek::PublicKey::from(
            <[u8; 32]>::try_from(remote_spk_bytes.as_slice())
                .map_err(|_| e2ee_crypto::CryptoError::InvalidKey("bad remote SPK pub".into()))?,
        );

        let ratchet = RatchetSession::init_alice(
            session_id.clone(),
            remote_user_id.to_string(),
            outcome.shared_key,
            &remote_spk_pub,
            now,
        )?;

        self.telemetry.record(TelemetryEvent::AlgorithmNegotiated {
            session_id: session_id.clone(),
            algorithm: outcome.negotiated.algorithm.clone(),
            quantum: outcome.negotiated.category == crate::negotiator::AlgorithmCategory::Quantum,
            hybrid_active: outcome.hybrid_active,
            fallback_used: outcome.negotiated.fallback_used,
        });

        let entry = Arc::new(SessionEntry {
            state: StdRwLock::new(SessionState::Established),
            ratchet: Mutex::new(ratchet),
            peer_user_id: remote_user_id.to_string(),
            transcript_hash: outcome.transcript_hash,
            negotiated_algorithm: outcome.negotiated.algorithm,
            pending_x3dh_header: Mutex::new(Some(outcome.header)),
            chain: StdMutex::new(e2ee_crypto::hash_chain::HashChain::new()),
            created_at: now,
            last_activity: StdRwLock::new(now),
        });

        self.persist(&session_id, &entry).await?;
        self.sessions.write().await.insert(session_id.clone(), entry);
        tracing::info!(
            target: "e2ee_session",
            event = "start_session",
            session_id = %session_id,
            peer_user_id = %remote_user_id,
        );
        Ok(session_id)
    }

    /// Accept an incoming pre-key message as responder, installing ratchet
    /// state and decrypting the first ciphertext in one step.
    pub async fn accept_prekey_message(
        &self,
        envelope: &Envelope,
        pq_keypair: Option<&PqKeyPair>,
    ) -> Result<(String, Vec<u8>), SessionError> {
        let header = envelope.x3dh_header.clone().ok_or_else(|| {
            SessionError::Crypto(e2ee_crypto::CryptoError::InvalidHeader(
                "envelope missing X3DH header".into(),
            ))
        })?;

        let sender_ik_bytes = URL_SAFE_NO_PAD
            .decode(&header.ik_pub)
            .map_err(e2ee_crypto::CryptoError::Base64Decode)?;
        let sender_ik: [u8; 32] = sender_ik_bytes
            .try_into()
            .map_err(|_| e2ee_crypto::CryptoError::InvalidKey("bad sender IK".into()))?;

        let local_capabilities = self.local_capabilities().await?;
        let outcome = handshake::run_responder(
            &self.prekeys,
            &self.config,
            &header,
            &sender_ik,
            pq_keypair,
            &local_capabilities,
        )
        .await?;

        let now = self.clock.now_wall();
        let my_spk_secret = self.prekeys.active_signed_prekey_secret().await?;
        let my_spk_pub = self.prekeys.active_signed_prekey_public().await?;

        let ratchet = RatchetSession::init_bob(
            header.session_id.clone(),
            header.sender_user_id.clone(),
            outcome.shared_key,
            &my_spk_secret,
            &my_spk_pub,
            now,
        )?;

        self.telemetry.record(TelemetryEvent::AlgorithmNegotiated {
            session_id: header.session_id.clone(),
            algorithm: outcome.negotiated.algorithm.clone(),
            quantum: outcome.negotiated.category == crate::negotiator::AlgorithmCategory::Quantum,
            hybrid_active: outcome.hybrid_active,
            fallback_used: outcome.negotiated.fallback_used,
        });

        let entry = Arc::new(SessionEntry {
            state: StdRwLock::new(SessionState::Established),
            ratchet: Mutex::new(ratchet),
            peer_user_id: header.sender_user_id.clone(),
            transcript_hash: outcome.transcript_hash,
            negotiated_algorithm: outcome.negotiated.algorithm,
            pending_x3dh_header: Mutex::new(None),
            chain: StdMutex::new(e2ee_crypto::hash_chain::HashChain::new()),
            created_at: now,
            last_activity: StdRwLock::new(now),
        });

        let session_id = header.session_id.clone();
        self.persist(&session_id, &entry).await?;
        self.sessions.write().await.insert(session_id.clone(), entry.clone());
        tracing::info!(
            target: "e2ee_session",
            event = "accept_prekey_message",
            session_id = %session_id,
            peer_user_id = %entry.peer_user_id,
        );

        let plaintext = self.decrypt_with_entry(&entry, envelope).await?;
        Ok((session_id, plaintext))
    }

    pub async fn encrypt(&self, session_id: &str, plaintext: &[u8]) -> Result<Envelope, SessionError> {
        let entry = self.get_established(session_id).await?;
        let now = self.clock.now_wall();
        let ratchet_config = self.config.to_ratchet_config();

        let (header, msg_key) = {
            let mut ratchet = entry.ratchet.lock().await;
            ratchet.encrypt_step(&ratchet_config, now)?
        };

        let padded = e2ee_proto::codec::encode_for_wire(plaintext, self.config.padding_mode);
        let aad = aad_for(&entry.transcript_hash, &header);
        let ciphertext = e2ee_crypto::aead::encrypt_with_epoch(&msg_key, &padded, &aad, header.epoch)?;

        let x3dh_header = entry.pending_x3dh_header.lock().await.take();
        let sender_id = self.prekeys.user_id().to_string();

        let ts_nanos = now.timestamp_nanos_opt().unwrap_or(0);
        let msg_id = e2ee_crypto::hash::message_id(&sender_id, &entry.peer_user_id, plaintext, ts_nanos);
        let timestamp_bucket = e2ee_crypto::hash_chain::timestamp_bucket(now.timestamp());
        let chain_link = {
            let mut chain = entry.chain.lock().unwrap();
            chain.append(&msg_id, &ciphertext, timestamp_bucket)
        };

        let envelope = Envelope {
            envelope_id: uuid::Uuid::new_v4().to_string(),
            version: 3,
            sender_id,
            recipient_id: entry.peer_user_id.clone(),
            sent_at: now,
            session_id: session_id.to_string(),
            ratchet_header: header,
            ciphertext: URL_SAFE_NO_PAD.encode(&ciphertext),
            x3dh_header,
            negotiated_algorithm: Some(entry.negotiated_algorithm.clone()),
            chain_link: hex::encode(chain_link),
        };

        *entry.last_activity.write().unwrap() = now;
        self.persist(session_id, &entry).await?;
        tracing::debug!(
            target: "e2ee_session",
            event = "encrypt",
            session_id = %session_id,
            message_id = %msg_id,
            chain_link = %envelope.chain_link,
        );
        Ok(envelope)
    }

    pub async fn decrypt(&self, session_id: &str, envelope: &Envelope) -> Result<Vec<u8>, SessionError> {
        let entry = self.get_established(session_id).await?;
        self.decrypt_with_entry(&entry, envelope).await
    }

    /// Decrypt a batch of envelopes delivered out of order by the
    /// transport. Each is processed independently (the ratchet itself
    /// tolerates arbitrary arrival order via its skipped-key map, bounded
    /// by `max_skip`); results are returned sorted by `N` so callers see
    /// them in send order. Bounded by `message_queue_size`.
    pub async fn decrypt_batch(
        &self,
        session_id: &str,
        envelopes: &[Envelope],
    ) -> Result<Vec<(u64, Result<Vec<u8>, SessionError>)>, SessionError> {
        if envelopes.len() > self.config.message_queue_size {
            return Err(SessionError::QueueFull);
        }
        let entry = self.get_established(session_id).await?;
        let mut results = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let n = envelope.ratchet_header.n;
            let outcome = self.decrypt_with_entry(&entry, envelope).await;
            results.push((n, outcome));
        }
        results.sort_by_key(|(n, _)| *n);
        Ok(results)
    }

    async fn decrypt_with_entry(
        &self,
        entry: &Arc<SessionEntry>,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, SessionError> {
        let now = self.clock.now_wall();
        let ratchet_config = self.config.to_ratchet_config();
        let header = &envelope.ratchet_header;

        // `decrypt_step` only computes the proposed ratchet transition; it
        // does not mutate the session. We must not commit it (advance Nr,
        // record the replay guard, move the DH ratchet) until the AEAD call
        // below actually authenticates the ciphertext — otherwise a single
        // tampered byte would desync the ratchet and burn the replay guard
        // against a message that was never really accepted.
        let (pending, msg_key) = {
            let ratchet = entry.ratchet.lock().await;
            match ratchet.decrypt_step(&ratchet_config, header, now) {
                Ok(v) => v,
                Err(e) => {
                    self.telemetry.record(TelemetryEvent::ReceiveRejected {
                        session_id: envelope.session_id.clone(),
                        reason: e.to_string(),
                    });
                    return Err(match e {
                        e2ee_crypto::CryptoError::TooManySkipped(_) => SessionError::TooManySkipped,
                        other => SessionError::Crypto(other),
                    });
                }
            }
        };

        let aad = aad_for(&entry.transcript_hash, header);
        let ct_bytes = URL_SAFE_NO_PAD
            .decode(&envelope.ciphertext)
            .map_err(e2ee_crypto::CryptoError::Base64Decode)?;
        let padded = e2ee_crypto::aead::decrypt(&msg_key, &ct_bytes, &aad)?;
        let plaintext = e2ee_proto::codec::decode_from_wire(&padded)?;

        {
            let mut ratchet = entry.ratchet.lock().await;
            ratchet.commit_decrypt(pending);
        }

        *entry.last_activity.write().unwrap() = now;
        self.persist(&envelope.session_id, entry).await?;
        tracing::debug!(
            target: "e2ee_session",
            event = "decrypt",
            session_id = %envelope.session_id,
            envelope_id = %envelope.envelope_id,
        );
        Ok(plaintext)
    }

    /// Explicit DH-ratchet step, e.g. after an operator-initiated key
    /// rotation request. A session that hasn't sent a message yet (no
    /// established sending chain turn) cannot be force-rotated; the next
    /// regular send will pick up the safety-window trigger instead.
    pub async fn rotate_session(&self, session_id: &str, reason: &str) -> Result<(), SessionError> {
        let entry = self.get_established(session_id).await?;
        let forced = e2ee_crypto::ratchet::RatchetConfig {
            safety_window: 1,
            ..self.config.to_ratchet_config()
        };
        let now = self.clock.now_wall();
        let epoch = {
            let mut ratchet = entry.ratchet.lock().await;
            let _ = ratchet.encrypt_step(&forced, now)?;
            ratchet.current_epoch()
        };
        self.telemetry.record(TelemetryEvent::RatchetStepped {
            session_id: session_id.to_string(),
            epoch,
        });
        tracing::debug!(session_id, reason, "explicit ratchet rotation requested");
        self.persist(session_id, &entry).await?;
        Ok(())
    }

    pub async fn close_session(&self, session_id: &str) -> Result<(), SessionError> {
        if let Some(entry) = self.sessions.write().await.remove(session_id) {
            *entry.state.write().unwrap() = SessionState::Failed;
        }
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.store.pool)
            .await
            .map_err(e2ee_store::StoreError::Database)?;
        tracing::info!(target: "e2ee_session", event = "close_session", session_id);
        Ok(())
    }

    /// Sweep sessions idle longer than `max_session_duration`, transitioning
    /// them to `Expired` (terminal — a new session must be started fresh).
    pub async fn expire_idle_sessions(&self) -> Vec<String> {
        let now = self.clock.now_wall();
        let max_idle = chrono::Duration::from_std(self.config.max_session_duration)
            .unwrap_or(chrono::Duration::days(30));
        let sessions = self.sessions.read().await;
        let mut expired = Vec::new();
        for (id, entry) in sessions.iter() {
            let last_activity = *entry.last_activity.read().unwrap();
            if now.signed_duration_since(last_activity) > max_idle {
                *entry.state.write().unwrap() = SessionState::Expired;
                expired.push(id.clone());
            }
        }
        if !expired.is_empty() {
            tracing::info!(target: "e2ee_session", event = "expire_idle_sessions", count = expired.len());
        }
        expired
    }

    pub async fn session_state(&self, session_id: &str) -> Option<SessionState> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|e| *e.state.read().unwrap())
    }

    async fn get_established(&self, session_id: &str) -> Result<Arc<SessionEntry>, SessionError> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?
            .clone();
        match *entry.state.read().unwrap() {
            SessionState::Established => Ok(entry),
            SessionState::Expired | SessionState::Failed => {
                Err(SessionError::SessionNotFound(session_id.to_string()))
            }
        }
    }

    async fn persist(&self, session_id: &str, entry: &Arc<SessionEntry>) -> Result<(), SessionError> {
        let serialized = {
            let ratchet = entry.ratchet.lock().await;
            serde_json::to_vec(&*ratchet)
                .map_err(|e| SessionError::Crypto(e2ee_crypto::CryptoError::Serialisation(e)))?
        };
        let state_enc = self.store.encrypt_value(&serialized).await?;
        let now = Utc::now();
        let (chain_head_hex, chain_length) = {
            let chain = entry.chain.lock().unwrap();
            (hex::encode(chain.head), chain.length as i64)
        };
        let transcript_hash_hex = hex::encode(entry.transcript_hash);

        sqlx::query(
            "INSERT INTO sessions (id, local_user_id, peer_user_id, peer_device_id, session_state_enc, \
             negotiated_algorithm, created_at, updated_at, chain_head, chain_length, transcript_hash) \
             VALUES (?, ?, ?, '', ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET session_state_enc = excluded.session_state_enc, \
             negotiated_algorithm = excluded.negotiated_algorithm, updated_at = excluded.updated_at, \
             chain_head = excluded.chain_head, chain_length = excluded.chain_length",
        )
        .bind(session_id)
        .bind(self.prekeys.user_id())
        .bind(&entry.peer_user_id)
        .bind(&state_enc)
        .bind(&entry.negotiated_algorithm)
        .bind(entry.created_at)
        .bind(now)
        .bind(&chain_head_hex)
        .bind(chain_length)
        .bind(&transcript_hash_hex)
        .execute(&self.store.pool)
        .await
        .map_err(e2ee_store::StoreError::Database)?;

        Ok(())
    }

    /// Rehydrate every persisted session for this device into the in-memory
    /// table. Call once after constructing a `SessionManager` over a store
    /// that already has rows in `sessions` (e.g. process restart) — a fresh
    /// store with no rows is a no-op. Sessions whose blob fails to decrypt
    /// or deserialize are skipped rather than aborting the whole restore,
    /// since one corrupt row shouldn't take down every other session.
    pub async fn restore_sessions(&self) -> Result<usize, SessionError> {
        let rows = sqlx::query_as::<_, e2ee_store::models::SessionRow>(
            "SELECT * FROM sessions WHERE local_user_id = ?",
        )
        .bind(self.prekeys.user_id())
        .fetch_all(&self.store.pool)
        .await
        .map_err(e2ee_store::StoreError::Database)?;

        let mut restored = 0;
        for row in rows {
            match self.restore_one(&row).await {
                Ok(()) => restored += 1,
                Err(e) => tracing::warn!(
                    target: "e2ee_session",
                    event = "restore_session_failed",
                    session_id = %row.id,
                    error = %e,
                ),
            }
        }
        tracing::info!(target: "e2ee_session", event = "restore_sessions", count = restored);
        Ok(restored)
    }

    async fn restore_one(&self, row: &e2ee_store::models::SessionRow) -> Result<(), SessionError> {
        let decrypted = self.store.decrypt_value(&row.session_state_enc).await?;
        let ratchet: RatchetSession = serde_json::from_slice(&decrypted)
            .map_err(|e| SessionError::Crypto(e2ee_crypto::CryptoError::Serialisation(e)))?;

        let chain_head_bytes: [u8; 32] = hex::decode(&row.chain_head)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                SessionError::Crypto(e2ee_crypto::CryptoError::InvalidKey("bad stored chain_head".into()))
            })?;
        let transcript_hash: [u8; 32] = hex::decode(&row.transcript_hash)
            .ok()
            .and_then(|b| b.try_into().ok())
            .unwrap_or([0u8; 32]);

        let entry = Arc::new(SessionEntry {
            state: StdRwLock::new(SessionState::Established),
            ratchet: Mutex::new(ratchet),
            peer_user_id: row.peer_user_id.clone(),
            transcript_hash,
            negotiated_algorithm: row.negotiated_algorithm.clone(),
            pending_x3dh_header: Mutex::new(None),
            chain: StdMutex::new(e2ee_crypto::hash_chain::HashChain::from_head(
                chain_head_bytes,
                row.chain_length as u64,
            )),
            created_at: row.created_at,
            last_activity: StdRwLock::new(row.updated_at),
        });

        self.sessions.write().await.insert(row.id.clone(), entry);
        Ok(())
    }
}

fn aad_for(transcript_hash: &[u8; 32], header: &e2ee_crypto::ratchet::RatchetHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + header.dh_pub.len() + 24);
    buf.extend_from_slice(transcript_hash);
    buf.extend_from_slice(header.dh_pub.as_bytes());
    buf.extend_from_slice(&header.n.to_be_bytes());
    buf.extend_from_slice(&header.pn.to_be_bytes());
    buf.extend_from_slice(&header.epoch.to_be_bytes());
    buf
}
