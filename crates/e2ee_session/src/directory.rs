//! Directory collaborator — the bearer-HTTPS client to the key-server is
//! deliberately out of scope; this trait is the seam a real transport
//! plugs into. `MockDirectory` is the in-memory test double used by the
//! integration suite.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use e2ee_crypto::x3dh::PrekeyBundle;
use e2ee_proto::api::{DeviceCapabilitiesWire, OneTimePrekeyWire, SignedPrekeyWire};

use crate::error::SessionError;

#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Publish this device's current bundle, replacing whatever was there.
    async fn publish_bundle(
        &self,
        user_id: &str,
        registration_id: u32,
        ik_pub: &str,
        signed_prekey: SignedPrekeyWire,
        one_time_prekeys: Vec<OneTimePrekeyWire>,
        quantum_identity_key: Option<String>,
        capabilities: DeviceCapabilitiesWire,
    ) -> Result<(), SessionError>;

    /// Fetch a remote user's bundle, consuming one one-time prekey
    /// server-side if one was available.
    async fn fetch_bundle(&self, remote_user_id: &str) -> Result<PrekeyBundle, SessionError>;

    /// Fetch just the currently published identity public key (base64),
    /// without touching the one-time prekey pool. Used to re-verify an
    /// existing device binding still points at the same identity, which a
    /// `fetch_bundle` call cannot do for free since it consumes an OPK.
    async fn fetch_identity_pubkey(&self, user_id: &str) -> Result<String, SessionError>;

    /// Confirm this device is known to the directory (used during key-
    /// mismatch recovery before falling back to full re-registration).
    async fn confirm_device(&self, user_id: &str, device_id: &str) -> Result<bool, SessionError>;

    /// Register (or re-register) a device, replacing any prior registration
    /// for this `(user_id, device_id)` pair.
    async fn register_device(
        &self,
        user_id: &str,
        device_id: &str,
        ik_pub: &str,
    ) -> Result<(), SessionError>;
}

#[derive(Default)]
struct MockUser {
    ik_pub: String,
    registration_id: u32,
    signed_prekey: Option<SignedPrekeyWire>,
    one_time_prekeys: Vec<OneTimePrekeyWire>,
    quantum_identity_key: Option<String>,
    devices: Vec<String>,
}

/// In-memory `DirectoryClient` for tests. Not a production transport:
/// no auth, no TLS, no persistence across process restarts.
#[derive(Default)]
pub struct MockDirectory {
    users: Mutex<HashMap<String, MockUser>>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DirectoryClient for MockDirectory {
    async fn publish_bundle(
        &self,
        user_id: &str,
        registration_id: u32,
        ik_pub: &str,
        signed_prekey: SignedPrekeyWire,
        one_time_prekeys: Vec<OneTimePrekeyWire>,
        quantum_identity_key: Option<String>,
        _capabilities: DeviceCapabilitiesWire,
    ) -> Result<(), SessionError> {
        let mut users = self.users.lock().unwrap();
        let entry = users.entry(user_id.to_string()).or_default();
        entry.ik_pub = ik_pub.to_string();
        entry.registration_id = registration_id;
        entry.signed_prekey = Some(signed_prekey);
        entry.one_time_prekeys = one_time_prekeys;
        entry.quantum_identity_key = quantum_identity_key;
        Ok(())
    }

    async fn fetch_bundle(&self, remote_user_id: &str) -> Result<PrekeyBundle, SessionError> {
        let mut users = self.users.lock().unwrap();
        let entry = users
            .get_mut(remote_user_id)
            .ok_or_else(|| SessionError::Directory(format!("unknown user {remote_user_id}")))?;

        let spk = entry
            .signed_prekey
            .clone()
            .ok_or_else(|| SessionError::Directory("no signed prekey published".into()))?;

        // Running out of one-time prekeys is not fatal; the bundle simply
        // comes back without one, and the handshake proceeds in 3-DH mode.
        let opk = if entry.one_time_prekeys.is_empty() {
            None
        } else {
            Some(entry.one_time_prekeys.remove(0))
        };

        let quantum_algorithm = spk
            .quantum_algorithm
            .as_deref()
            .and_then(e2ee_crypto::pq::PqAlgorithm::from_wire_name);

        Ok(PrekeyBundle {
            user_id: remote_user_id.to_string(),
            ik_pub: entry.ik_pub.clone(),
            spk_pub: spk.public_key,
            spk_sig: spk.signature,
            opk_pub: opk.as_ref().map(|k| k.public_key.clone()),
            opk_id: opk.as_ref().map(|k| k.key_id.clone()),
            quantum_identity_key: entry.quantum_identity_key.clone(),
            quantum_algorithm,
        })
    }

    async fn fetch_identity_pubkey(&self, user_id: &str) -> Result<String, SessionError> {
        let users = self.users.lock().unwrap();
        let entry = users
            .get(user_id)
            .ok_or_else(|| SessionError::Directory(format!("unknown user {user_id}")))?;
        Ok(entry.ik_pub.clone())
    }

    async fn confirm_device(&self, user_id: &str, device_id: &str) -> Result<bool, SessionError> {
        let users = self.users.lock().unwrap();
        Ok(users
            .get(user_id)
            .map(|u| u.devices.iter().any(|d| d == device_id))
            .unwrap_or(false))
    }

    async fn register_device(
        &self,
        user_id: &str,
        device_id: &str,
        ik_pub: &str,
    ) -> Result<(), SessionError> {
        let mut users = self.users.lock().unwrap();
        let entry = users.entry(user_id.to_string()).or_default();
        entry.ik_pub = ik_pub.to_string();
        if !entry.devices.iter().any(|d| d == device_id) {
            entry.devices.push(device_id.to_string());
        }
        Ok(())
    }
}
