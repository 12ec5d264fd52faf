//! Handshake engine: orchestrates algorithm negotiation plus X3DH (classical
//! + optional PQ co-agreement) behind a single timeout, for both roles.

use e2ee_crypto::identity::IdentityKeyPair;
use e2ee_crypto::pq::PqKeyPair;
use e2ee_crypto::x3dh::{self, PqMode, X3DHHeader};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::negotiator::{self, AlgorithmCategory, NegotiationRecord};
use crate::prekey_store::PrekeyStore;

pub struct HandshakeOutcome {
    pub shared_key: [u8; 32],
    pub transcript_hash: [u8; 32],
    pub header: X3DHHeader,
    pub negotiated: NegotiationRecord,
    pub hybrid_active: bool,
    /// The remote's signed-prekey public key (base64), carried through from
    /// the fetched bundle so the initiator doesn't need a second directory
    /// round trip (and a second one-time-prekey consumption) just to learn
    /// the value it already negotiated against. `None` on the responder
    /// side, where the local signed prekey is used instead.
    pub remote_spk_pub: Option<String>,
}

/// Capabilities the remote bundle implies, for negotiation purposes: a PQ
/// identity key implies the matching ML-KEM variant; X25519 is always the
/// classical baseline every device in this system supports.
fn capabilities_from_bundle(bundle: &x3dh::PrekeyBundle) -> Vec<String> {
    let mut caps = vec!["Curve25519".to_string()];
    if let Some(alg) = bundle.quantum_algorithm {
        caps.push(alg.wire_name().to_string());
    }
    caps
}

fn pq_mode_for_category(category: AlgorithmCategory, config: &SessionConfig) -> PqMode {
    match category {
        AlgorithmCategory::Classical => PqMode::Classical,
        AlgorithmCategory::Quantum | AlgorithmCategory::Hybrid => config.pq_mode(),
    }
}

/// Alice's side: fetch the remote bundle, negotiate, run X3DH.
pub async fn run_initiator(
    prekeys: &PrekeyStore,
    config: &SessionConfig,
    remote_user_id: &str,
    local_capabilities: &[String],
) -> Result<HandshakeOutcome, SessionError> {
    let work = async {
        let bundle = prekeys.fetch_bundle(remote_user_id).await?;
        let remote_capabilities = capabilities_from_bundle(&bundle);
        let negotiated = negotiator::negotiate(local_capabilities, &remote_capabilities, config.quantum_only)?;
        let pq_mode = pq_mode_for_category(negotiated.category, config);

        let result = x3dh::initiate(prekeys.user_id(), prekeys.identity(), &bundle, pq_mode)?;

        Ok(HandshakeOutcome {
            shared_key: result.shared_key,
            transcript_hash: result.transcript_hash,
            header: result.header,
            hybrid_active: result.hybrid_active,
            negotiated,
            remote_spk_pub: Some(bundle.spk_pub),
        })
    };

    with_timeout(config, work).await
}

/// Bob's side: reconstruct SK from Alice's init header.
pub async fn run_responder(
    prekeys: &PrekeyStore,
    config: &SessionConfig,
    header: &X3DHHeader,
    sender_ik_ed_pub: &[u8; 32],
    pq_keypair: Option<&PqKeyPair>,
    local_capabilities: &[String],
) -> Result<HandshakeOutcome, SessionError> {
    let work = async {
        let spk_secret = prekeys.active_signed_prekey_secret().await?;
        let opk_secret = match &header.opk_id {
            Some(id) => prekeys.consume_one_time_prekey(id).await?.map(|o| o.secret),
            None => None,
        };

        let declared_category = if header.quantum_ciphertext.is_some() {
            AlgorithmCategory::Quantum
        } else {
            AlgorithmCategory::Classical
        };
        let remote_capabilities = if let Some(alg) = header.quantum_algorithm {
            vec!["Curve25519".to_string(), alg.wire_name().to_string()]
        } else {
            vec!["Curve25519".to_string()]
        };
        let negotiated = negotiator::negotiate(local_capabilities, &remote_capabilities, config.quantum_only)?;
        let pq_mode = pq_mode_for_category(declared_category.max(negotiated.category), config);

        let (shared_key, transcript_hash, hybrid_active) = x3dh::respond(
            prekeys.identity(),
            &spk_secret,
            opk_secret.as_ref(),
            pq_keypair,
            sender_ik_ed_pub,
            header,
            pq_mode,
        )?;

        Ok(HandshakeOutcome {
            shared_key,
            transcript_hash,
            header: header.clone(),
            hybrid_active,
            negotiated,
            remote_spk_pub: None,
        })
    };

    with_timeout(config, work).await
}

async fn with_timeout<F, T>(config: &SessionConfig, fut: F) -> Result<T, SessionError>
where
    F: std::future::Future<Output = Result<T, SessionError>>,
{
    match tokio::time::timeout(config.handshake_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::HandshakeTimeout),
    }
}

impl PartialOrd for AlgorithmCategory {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AlgorithmCategory {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(c: &AlgorithmCategory) -> u8 {
            match c {
                AlgorithmCategory::Classical => 0,
                AlgorithmCategory::Hybrid => 1,
                AlgorithmCategory::Quantum => 2,
            }
        }
        rank(self).cmp(&rank(other))
    }
}
