//! Pre-key store (identity key, signed pre-keys, one-time pre-keys):
//! generation, rotation, consumption, and bundle publication/fetch.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use e2ee_crypto::identity::{DeviceCapabilities, DeviceCert, IdentityKeyPair};
use e2ee_crypto::pq::{self, PqAlgorithm, PqKeyPair};
use e2ee_crypto::x3dh::{self, PrekeyBundle};
use e2ee_store::models::{DeviceRow, OneTimePrekeyRow, SignedPrekeyRow};
use e2ee_store::Store;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::config::SessionConfig;
use crate::directory::DirectoryClient;
use crate::error::SessionError;

/// A loaded one-time prekey ready to be consumed into a responder handshake.
pub struct LoadedOneTimePrekey {
    pub key_id: String,
    pub secret: StaticSecret,
}

pub struct PrekeyStore {
    store: Store,
    directory: Arc<dyn DirectoryClient>,
    identity: IdentityKeyPair,
    user_id: String,
    registration_id: u32,
}

impl PrekeyStore {
    pub fn new(
        store: Store,
        directory: Arc<dyn DirectoryClient>,
        identity: IdentityKeyPair,
        user_id: String,
        registration_id: u32,
    ) -> Self {
        Self { store, directory, identity, user_id, registration_id }
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    /// Idempotent setup: generate a signed prekey and an initial batch of
    /// one-time prekeys if none exist yet, then publish the bundle.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        let active = self.active_signed_prekey_row().await?;
        if active.is_none() {
            self.rotate_signed_prekey().await?;
        }
        self.top_up_one_time_prekeys(20, 50).await?;
        self.publish_bundle().await?;
        Ok(())
    }

    async fn active_signed_prekey_row(&self) -> Result<Option<SignedPrekeyRow>, SessionError> {
        let row = sqlx::query_as::<_, SignedPrekeyRow>(
            "SELECT * FROM signed_prekeys WHERE retired_at IS NULL ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.store.pool)
        .await
        .map_err(e2ee_store::StoreError::Database)?;
        Ok(row)
    }

    /// Generate a new signed prekey, sign it, retire the previously active
    /// one (kept briefly so in-flight handshakes against it still land),
    /// and prune anything older than the three most recent.
    pub async fn rotate_signed_prekey(&self) -> Result<(), SessionError> {
        let (secret, public, sig) = x3dh::generate_signed_prekey(&self.identity)?;
        let secret_enc = self.store.encrypt_value(&secret.to_bytes()).await?;
        let key_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        // Every signed prekey rotation mints a fresh ML-KEM keypair
        // alongside it, so the bundle this device publishes always has real
        // PQ material to back a quantum or hybrid handshake, not just the
        // capability string claiming one.
        let quantum_keypair = pq::generate_keypair(PqAlgorithm::MlKem768);
        let quantum_secret_enc = self.store.encrypt_value(quantum_keypair.secret_bytes()).await?;
        let quantum_public_key = URL_SAFE_NO_PAD.encode(&quantum_keypair.public_key);
        let quantum_algorithm = quantum_keypair.algorithm.wire_name().to_string();

        sqlx::query(
            "UPDATE signed_prekeys SET retired_at = ? WHERE retired_at IS NULL",
        )
        .bind(now)
        .execute(&self.store.pool)
        .await
        .map_err(e2ee_store::StoreError::Database)?;

        sqlx::query(
            "INSERT INTO signed_prekeys (id, key_id, secret_key_enc, public_key, signature, \
             quantum_public_key, quantum_secret_key_enc, quantum_algorithm, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&key_id)
        .bind(&secret_enc)
        .bind(URL_SAFE_NO_PAD.encode(public.as_bytes()))
        .bind(URL_SAFE_NO_PAD.encode(&sig))
        .bind(&quantum_public_key)
        .bind(&quantum_secret_enc)
        .bind(&quantum_algorithm)
        .bind(now)
        .execute(&self.store.pool)
        .await
        .map_err(e2ee_store::StoreError::Database)?;

        sqlx::query(
            "DELETE FROM signed_prekeys WHERE id NOT IN \
             (SELECT id FROM signed_prekeys ORDER BY created_at DESC LIMIT 3)",
        )
        .execute(&self.store.pool)
        .await
        .map_err(e2ee_store::StoreError::Database)?;

        tracing::info!(
            target: "e2ee_session",
            event = "rotate_signed_prekey",
            user_id = %self.user_id,
            key_id = %key_id,
        );

        Ok(())
    }

    pub async fn rotate_if_due(&self, rotation_interval: Duration) -> Result<(), SessionError> {
        let Some(active) = self.active_signed_prekey_row().await? else {
            return self.rotate_signed_prekey().await;
        };
        let age = Utc::now().signed_duration_since(active.created_at);
        let interval = chrono::Duration::from_std(rotation_interval).unwrap_or(chrono::Duration::days(7));
        if age >= interval {
            self.rotate_signed_prekey().await?;
        }
        Ok(())
    }

    async fn one_time_prekey_count(&self) -> Result<i64, SessionError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM one_time_prekeys WHERE consumed = 0",
        )
        .fetch_one(&self.store.pool)
        .await
        .map_err(e2ee_store::StoreError::Database)?;
        Ok(count)
    }

    /// Top up the one-time prekey pool to `target` entries if the unconsumed
    /// count is below `low_water`.
    pub async fn top_up_one_time_prekeys(&self, low_water: usize, target: usize) -> Result<usize, SessionError> {
        let current = self.one_time_prekey_count().await? as usize;
        if current >= low_water {
            return Ok(0);
        }
        let to_generate = target.saturating_sub(current);
        let batch = x3dh::generate_one_time_prekeys(to_generate);
        for (secret, public) in &batch {
            let secret_enc = self.store.encrypt_value(&secret.to_bytes()).await?;
            sqlx::query(
                "INSERT INTO one_time_prekeys (id, key_id, secret_key_enc, public_key, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&secret_enc)
            .bind(URL_SAFE_NO_PAD.encode(public.as_bytes()))
            .bind(Utc::now())
            .execute(&self.store.pool)
            .await
            .map_err(e2ee_store::StoreError::Database)?;
        }
        Ok(batch.len())
    }

    /// Consume and return a one-time prekey by its `key_id`. A missing id is
    /// a non-error "ran out" signal — callers fall back to three-DH mode.
    pub async fn consume_one_time_prekey(
        &self,
        key_id: &str,
    ) -> Result<Option<LoadedOneTimePrekey>, SessionError> {
        let row = sqlx::query_as::<_, OneTimePrekeyRow>(
            "SELECT * FROM one_time_prekeys WHERE key_id = ? AND consumed = 0",
        )
        .bind(key_id)
        .fetch_optional(&self.store.pool)
        .await
        .map_err(e2ee_store::StoreError::Database)?;

        let Some(row) = row else { return Ok(None) };

        sqlx::query("UPDATE one_time_prekeys SET consumed = 1 WHERE id = ?")
            .bind(&row.id)
            .execute(&self.store.pool)
            .await
            .map_err(e2ee_store::StoreError::Database)?;

        let secret_bytes = self.store.decrypt_value(&row.secret_key_enc).await?;
        let arr: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| e2ee_crypto::CryptoError::InvalidKey("bad OPK secret length".into()))?;

        Ok(Some(LoadedOneTimePrekey {
            key_id: row.key_id,
            secret: StaticSecret::from(arr),
        }))
    }

    /// Load the currently active signed prekey secret, for responding to a
    /// handshake.
    pub async fn active_signed_prekey_secret(&self) -> Result<StaticSecret, SessionError> {
        let row = self
            .active_signed_prekey_row()
            .await?
            .ok_or(SessionError::DeviceNotInitialized)?;
        let secret_bytes = self.store.decrypt_value(&row.secret_key_enc).await?;
        let arr: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| e2ee_crypto::CryptoError::InvalidKey("bad SPK secret length".into()))?;
        Ok(StaticSecret::from(arr))
    }

    pub async fn active_signed_prekey_public(&self) -> Result<X25519Public, SessionError> {
        let row = self
            .active_signed_prekey_row()
            .await?
            .ok_or(SessionError::DeviceNotInitialized)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(&row.public_key)
            .map_err(e2ee_crypto::CryptoError::Base64Decode)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| e2ee_crypto::CryptoError::InvalidKey("bad SPK public length".into()))?;
        Ok(X25519Public::from(arr))
    }

    /// Whether this device currently has generated PQ key material, i.e.
    /// whether its capability claims about quantum/hybrid support are
    /// actually backed by a keypair it can decapsulate with.
    pub async fn quantum_capable(&self) -> Result<bool, SessionError> {
        let row = self.active_signed_prekey_row().await?;
        Ok(row.is_some_and(|r| r.quantum_public_key.is_some()))
    }

    /// Load this device's active ML-KEM keypair, for responding to a quantum
    /// or hybrid handshake. `Ok(None)` if the active signed prekey predates
    /// PQ generation or carries no quantum material.
    pub async fn active_quantum_keypair(&self) -> Result<Option<PqKeyPair>, SessionError> {
        let Some(row) = self.active_signed_prekey_row().await? else {
            return Ok(None);
        };
        let (Some(public_b64), Some(secret_enc), Some(alg_name)) =
            (row.quantum_public_key, row.quantum_secret_key_enc, row.quantum_algorithm)
        else {
            return Ok(None);
        };

        let algorithm = PqAlgorithm::from_wire_name(&alg_name)
            .ok_or_else(|| e2ee_crypto::CryptoError::PQUnavailable(format!("unknown algorithm {alg_name}")))?;
        let public_key = URL_SAFE_NO_PAD
            .decode(&public_b64)
            .map_err(e2ee_crypto::CryptoError::Base64Decode)?;
        let secret_key = self.store.decrypt_value(&secret_enc).await?;

        Ok(Some(PqKeyPair::from_parts(algorithm, public_key, secret_key)))
    }

    /// Publish identity pub, current signed prekey, and a snapshot of the
    /// one-time prekey pool (without removing them — publication is not
    /// consumption).
    pub async fn publish_bundle(&self) -> Result<(), SessionError> {
        let spk = self
            .active_signed_prekey_row()
            .await?
            .ok_or(SessionError::DeviceNotInitialized)?;

        let otps = sqlx::query_as::<_, OneTimePrekeyRow>(
            "SELECT * FROM one_time_prekeys WHERE consumed = 0",
        )
        .fetch_all(&self.store.pool)
        .await
        .map_err(e2ee_store::StoreError::Database)?;

        let wire_otps: Vec<e2ee_proto::api::OneTimePrekeyWire> = otps
            .into_iter()
            .map(|r| e2ee_proto::api::OneTimePrekeyWire {
                key_id: r.key_id,
                public_key: r.public_key,
                quantum_public_key: None,
                quantum_algorithm: None,
            })
            .collect();

        let mut supported_algorithms = vec!["Curve25519".to_string()];
        if let Some(alg) = spk.quantum_algorithm.as_deref() {
            supported_algorithms.push(alg.to_string());
        }

        let capabilities = e2ee_proto::api::DeviceCapabilitiesWire {
            quantum_capable: spk.quantum_public_key.is_some(),
            supported_algorithms,
            fallback_algorithms: vec!["RSA-2048-OAEP".to_string()],
            protocol_version: 3,
            device_type: "native".to_string(),
        };

        let wire_spk = e2ee_proto::api::SignedPrekeyWire {
            key_id: spk.key_id,
            public_key: spk.public_key,
            signature: spk.signature,
            quantum_public_key: spk.quantum_public_key,
            quantum_algorithm: spk.quantum_algorithm,
        };

        self.directory
            .publish_bundle(
                &self.user_id,
                self.registration_id,
                &self.identity.public_b64(),
                wire_spk,
                wire_otps,
                None,
                capabilities,
            )
            .await
    }

    /// Issue a self-signed `DeviceCert` binding this device's identity public
    /// key to `device_id` and persist it, so a peer who has cached the cert
    /// can re-verify this device offline instead of round-tripping to the
    /// directory on every send (see `DirectoryClient::confirm_device`).
    pub async fn enroll_local_device(
        &self,
        device_id: &str,
        device_name: &str,
        platform: &str,
        capabilities: DeviceCapabilities,
        valid_days: i64,
    ) -> Result<DeviceCert, SessionError> {
        let cert = DeviceCert::issue(
            &self.identity,
            &self.identity.public,
            device_id,
            &self.user_id,
            valid_days,
            capabilities,
        )
        .map_err(SessionError::Crypto)?;

        let cert_json = serde_json::to_string(&cert)
            .map_err(|e| SessionError::Crypto(e2ee_crypto::CryptoError::Serialisation(e)))?;

        sqlx::query(
            "INSERT INTO devices (id, user_id, device_id, device_name, platform, device_pubkey, \
             device_cert, enrolled_at, is_current_device) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1) \
             ON CONFLICT(user_id, device_id) DO UPDATE SET device_cert = excluded.device_cert, \
             device_name = excluded.device_name, platform = excluded.platform",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&self.user_id)
        .bind(device_id)
        .bind(device_name)
        .bind(platform)
        .bind(self.identity.public.to_b64())
        .bind(&cert_json)
        .bind(Utc::now())
        .execute(&self.store.pool)
        .await
        .map_err(e2ee_store::StoreError::Database)?;

        tracing::info!(
            target: "e2ee_session",
            event = "enroll_local_device",
            user_id = %self.user_id,
            device_id = %device_id,
        );

        Ok(cert)
    }

    /// Look up and verify a previously enrolled device's certificate against
    /// this identity's public key. Returns `Ok(None)` if no cert is cached
    /// (caller should fall back to a directory round-trip).
    pub async fn cached_device_cert(&self, device_id: &str) -> Result<Option<DeviceCert>, SessionError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            "SELECT * FROM devices WHERE user_id = ? AND device_id = ?",
        )
        .bind(&self.user_id)
        .bind(device_id)
        .fetch_optional(&self.store.pool)
        .await
        .map_err(e2ee_store::StoreError::Database)?;

        let Some(row) = row else { return Ok(None) };
        let cert: DeviceCert = serde_json::from_str(&row.device_cert)
            .map_err(|e| SessionError::Crypto(e2ee_crypto::CryptoError::Serialisation(e)))?;
        cert.verify(&self.identity.public).map_err(SessionError::Crypto)?;
        Ok(Some(cert))
    }

    pub async fn fetch_bundle(&self, remote_user_id: &str) -> Result<PrekeyBundle, SessionError> {
        let bundle = self.directory.fetch_bundle(remote_user_id).await?;

        let ik_bytes = URL_SAFE_NO_PAD
            .decode(&bundle.ik_pub)
            .map_err(e2ee_crypto::CryptoError::Base64Decode)?;
        let spk_bytes = URL_SAFE_NO_PAD
            .decode(&bundle.spk_pub)
            .map_err(e2ee_crypto::CryptoError::Base64Decode)?;
        let sig_bytes = URL_SAFE_NO_PAD
            .decode(&bundle.spk_sig)
            .map_err(e2ee_crypto::CryptoError::Base64Decode)?;

        IdentityKeyPair::verify(&ik_bytes, &spk_bytes, &sig_bytes)
            .map_err(|_| e2ee_crypto::CryptoError::BadBundle("signed prekey signature invalid".into()))?;

        Ok(bundle)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MockDirectory;
    use e2ee_store::Vault;
    use std::path::PathBuf;

    async fn new_store() -> (Store, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/e2ee-prekey-test-{}.db", uuid::Uuid::new_v4()));
        let vault = Vault::new();
        vault.unlock_with_key([7u8; 32]).await.unwrap();
        let store = Store::open(&db_path, vault).await.unwrap();
        (store, db_path)
    }

    #[tokio::test]
    async fn initialize_publishes_a_fetchable_bundle() {
        let (store, db_path) = new_store().await;
        let directory = Arc::new(MockDirectory::new());
        let identity = IdentityKeyPair::generate().unwrap();
        let prekeys = PrekeyStore::new(store, directory.clone(), identity, "alice".into(), 1);

        prekeys.initialize().await.unwrap();
        let bundle = prekeys.fetch_bundle("alice").await.unwrap();
        assert_eq!(bundle.user_id, "alice");
        assert!(bundle.opk_pub.is_some());

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn one_time_prekey_is_consumed_exactly_once() {
        let (store, db_path) = new_store().await;
        let directory = Arc::new(MockDirectory::new());
        let identity = IdentityKeyPair::generate().unwrap();
        let prekeys = PrekeyStore::new(store, directory, identity, "bob".into(), 1);
        prekeys.top_up_one_time_prekeys(0, 1).await.unwrap();

        let row = sqlx::query_as::<_, OneTimePrekeyRow>("SELECT * FROM one_time_prekeys")
            .fetch_one(&prekeys.store.pool)
            .await
            .unwrap();

        let first = prekeys.consume_one_time_prekey(&row.key_id).await.unwrap();
        assert!(first.is_some());
        let second = prekeys.consume_one_time_prekey(&row.key_id).await.unwrap();
        assert!(second.is_none());

        let _ = std::fs::remove_file(&db_path);
    }
}
