//! X3DH asynchronous key agreement, with optional post-quantum KEM
//! co-agreement.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 5869 (HKDF):  <https://datatracker.ietf.org/doc/html/rfc5869>
//!
//! Protocol:
//!   Alice (initiator) fetches Bob's published key bundle from the directory:
//!     IK_B  (identity, Ed25519 public → converted to X25519)
//!     SPK_B (signed prekey, X25519) + IK_B signature over SPK_B
//!     OPK_B (optional one-time prekey, X25519)
//!     PQ_B  (optional ML-KEM identity public key)
//!
//!   Alice generates ONE ephemeral keypair EK_A (X25519).
//!
//!   DH calculations (using a single EK_A throughout, fixed order 1..4):
//!     DH1 = DH(IK_A_x25519, SPK_B)     — mutual authentication
//!     DH2 = DH(EK_A,         IK_B_x25519) — forward secrecy
//!     DH3 = DH(EK_A,         SPK_B)     — replay protection
//!     DH4 = DH(EK_A,         OPK_B)     — one-time forward secrecy [optional]
//!
//!   If PQ mode is active, Alice additionally encapsulates against PQ_B,
//!   producing (ct_PQ, ss_PQ); ss_PQ is appended to the DH concatenation and
//!   ct_PQ travels in the handshake header.
//!
//!   SK = HKDF(salt=0, ikm = 0xFF*32 || DH1 || DH2 || DH3 [|| DH4] [|| ss_PQ], info)
//!   info is "Signal_X3DH_20191031" normally, or "Signal_X3DH_Quantum_20241231"
//!   when running quantum-only (no classical fallback accepted).
//!
//!   The associated data bound into every subsequent AEAD call is
//!   H(IK_initiator_pub || IK_responder_pub), fixed in that order regardless
//!   of which side derives it.
//!
//! Non-negotiable:
//!   - Alice MUST verify SPK_B signature before computing any DH.
//!   - Alice sends (IK_A_pub, EK_A_pub, opk_id?) as the init header.
//!   - Bob reconstructs the same DH set and derives SK.
//!   - The SK feeds into the Double Ratchet as the initial root key.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    hash,
    identity::IdentityKeyPair,
    kdf,
    pq::{self, PqAlgorithm, PqKeyPair},
};

/// Whether and how a post-quantum KEM co-secret participates in this handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PqMode {
    /// No PQ co-agreement; classical X3DH only.
    Classical,
    /// PQ co-agreement attempted; on failure, fall back silently to classical
    /// outputs and report `hybrid_active = false` in the result.
    Hybrid,
    /// PQ co-agreement required; on failure the handshake aborts with
    /// `PQUnavailable` rather than downgrading.
    QuantumOnly,
}

const INFO_CLASSICAL: &[u8] = b"Signal_X3DH_20191031";
const INFO_QUANTUM: &[u8] = b"Signal_X3DH_Quantum_20241231";

// ── Helpers ──────────────────────────────────────────────────────────────────

fn b64d(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD.decode(s).map_err(CryptoError::Base64Decode)
}

fn to_32(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte key".into()))
}

/// Convert an Ed25519 signing key (32 bytes) to an X25519 static secret.
/// Uses the clamped SHA-512 expansion ed25519-dalek uses internally,
/// mirroring libsignal's approach to IK → X25519 conversion.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut h = Sha512::digest(ed_secret);
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key (public, 32 bytes) to an X25519 public key.
/// Uses the birational map from the Ed25519 curve to Curve25519.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("Ed25519 public key decompression failed".into()))?;
    let montgomery = point.to_montgomery();
    Ok(X25519Public::from(montgomery.to_bytes()))
}

/// `H(IK_initiator_pub || IK_responder_pub)`, fixed ordering regardless of
/// which party computes it.
pub fn transcript_hash(initiator_ik_pub: &[u8], responder_ik_pub: &[u8]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(initiator_ik_pub.len() + responder_ik_pub.len());
    buf.extend_from_slice(initiator_ik_pub);
    buf.extend_from_slice(responder_ik_pub);
    hash::hash(&buf)
}

// ── Prekey bundle ────────────────────────────────────────────────────────────

/// Published by each device via the directory, consumed by session initiators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    pub user_id: String,
    /// Ed25519 identity public key (base64)
    pub ik_pub: String,
    /// X25519 signed prekey (base64)
    pub spk_pub: String,
    /// Ed25519 signature over raw SPK_pub bytes (base64)
    pub spk_sig: String,
    /// X25519 one-time prekey (consumed once; base64)
    pub opk_pub: Option<String>,
    /// Opaque OPK identifier so the directory can delete the used one
    pub opk_id: Option<String>,
    /// ML-KEM identity public key (base64), if this device declared PQ support
    pub quantum_identity_key: Option<String>,
    pub quantum_algorithm: Option<PqAlgorithm>,
}

/// Generate a signed prekey: an X25519 keypair with the public half signed
/// by the user's Ed25519 identity key.
pub fn generate_signed_prekey(
    identity: &IdentityKeyPair,
) -> Result<(StaticSecret, X25519Public, Vec<u8>), CryptoError> {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    let sig = identity.sign(public.as_bytes());
    Ok((secret, public, sig))
}

/// Generate a batch of one-time prekeys (X25519).
pub fn generate_one_time_prekeys(count: usize) -> Vec<(StaticSecret, X25519Public)> {
    (0..count)
        .map(|_| {
            let s = StaticSecret::random_from_rng(OsRng);
            let p = X25519Public::from(&s);
            (s, p)
        })
        .collect()
}

// ── Init message header ──────────────────────────────────────────────────────

/// Sent alongside the first ciphertext so the responder can derive SK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X3DHHeader {
    pub session_id: String,
    pub sender_user_id: String,
    /// Alice's Ed25519 identity public key (base64) — responder looks this up
    pub ik_pub: String,
    /// Alice's ephemeral X25519 public key (base64)
    pub ek_pub: String,
    /// Which OPK was consumed (opaque id; `None` if bundle had none)
    pub opk_id: Option<String>,
    /// ML-KEM ciphertext encapsulated against the responder's PQ identity key
    pub quantum_ciphertext: Option<String>,
    pub quantum_algorithm: Option<PqAlgorithm>,
}

// ── Output ───────────────────────────────────────────────────────────────────

pub struct X3DHResult {
    /// 32-byte shared key → feeds into Double Ratchet as initial root key
    pub shared_key: [u8; 32],
    pub header: X3DHHeader,
    /// Session transcript hash, bound as AEAD associated data for every
    /// subsequent ratchet step.
    pub transcript_hash: [u8; 32],
    /// Whether a PQ co-secret actually contributed to `shared_key`.
    pub hybrid_active: bool,
}

// ── Initiator (Alice) ────────────────────────────────────────────────────────

/// Alice initiates a session with Bob.
pub fn initiate(
    my_user_id: &str,
    my_ik: &IdentityKeyPair,
    bundle: &PrekeyBundle,
    pq_mode: PqMode,
) -> Result<X3DHResult, CryptoError> {
    // ── 1. Verify SPK signature ──────────────────────────────────────────
    let ik_b_ed_bytes = b64d(&bundle.ik_pub)?;
    let ik_b_ed = to_32(&ik_b_ed_bytes)?;
    let spk_b_bytes = b64d(&bundle.spk_pub)?;
    let spk_b_raw = to_32(&spk_b_bytes)?;
    let spk_sig_bytes = b64d(&bundle.spk_sig)?;
    IdentityKeyPair::verify(&ik_b_ed, &spk_b_raw, &spk_sig_bytes)
        .map_err(|_| CryptoError::BadBundle("signed prekey signature invalid".into()))?;

    // ── 2. Convert identity keys to X25519 ───────────────────────────────
    let ik_a_x = ed25519_secret_to_x25519(my_ik.secret_bytes());
    let ik_b_x = ed25519_pub_to_x25519(&ik_b_ed)?;
    let spk_b = X25519Public::from(spk_b_raw);

    // ── 3. Generate ephemeral key ────────────────────────────────────────
    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    // ── 4. DH calculations (single EK for all), fixed order 1,2,3,[4] ────
    let dh1 = ik_a_x.diffie_hellman(&spk_b);
    let dh2 = ek_a.diffie_hellman(&ik_b_x);
    let dh3 = ek_a.diffie_hellman(&spk_b);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let mut opk_id_out = None;
    if let Some(ref opk_b64) = bundle.opk_pub {
        let opk_raw = to_32(&b64d(opk_b64)?)?;
        let opk_b = X25519Public::from(opk_raw);
        let dh4 = ek_a.diffie_hellman(&opk_b);
        ikm.extend_from_slice(dh4.as_bytes());
        opk_id_out = bundle.opk_id.clone();
    }

    // ── 5. Optional PQ co-agreement ───────────────────────────────────────
    let mut quantum_ciphertext = None;
    let mut quantum_algorithm = None;
    let mut hybrid_active = false;

    if pq_mode != PqMode::Classical {
        match (&bundle.quantum_identity_key, bundle.quantum_algorithm) {
            (Some(pq_pub_b64), Some(alg)) => {
                let pq_pub = b64d(pq_pub_b64)?;
                match pq::encapsulate(alg, &pq_pub) {
                    Ok((ct, ss)) => {
                        ikm.extend_from_slice(&ss);
                        quantum_ciphertext = Some(URL_SAFE_NO_PAD.encode(&ct));
                        quantum_algorithm = Some(alg);
                        hybrid_active = true;
                    }
                    Err(e) if pq_mode == PqMode::QuantumOnly => {
                        ikm.zeroize();
                        return Err(e);
                    }
                    Err(_) => { /* hybrid mode: degrade to classical-only */ }
                }
            }
            _ if pq_mode == PqMode::QuantumOnly => {
                ikm.zeroize();
                return Err(CryptoError::PQUnavailable(
                    "remote bundle declares no quantum identity key".into(),
                ));
            }
            _ => {}
        }
    }

    // ── 6. Derive SK ─────────────────────────────────────────────────────
    let info = if pq_mode == PqMode::QuantumOnly { INFO_QUANTUM } else { INFO_CLASSICAL };
    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), info, &mut sk)?;
    ikm.zeroize();

    let session_id = uuid::Uuid::new_v4().to_string();
    let transcript_hash = transcript_hash(&my_ik.public.0, &ik_b_ed);

    Ok(X3DHResult {
        shared_key: sk,
        transcript_hash,
        hybrid_active,
        header: X3DHHeader {
            session_id,
            sender_user_id: my_user_id.to_string(),
            ik_pub: URL_SAFE_NO_PAD.encode(&my_ik.public.0),
            ek_pub: URL_SAFE_NO_PAD.encode(ek_a_pub.as_bytes()),
            opk_id: opk_id_out,
            quantum_ciphertext,
            quantum_algorithm,
        },
    })
}

// ── Responder (Bob) ──────────────────────────────────────────────────────────

/// Bob receives an X3DH init header and reconstructs SK.
///
/// `my_ik` — Bob's Ed25519 identity keypair
/// `my_spk_secret` — Bob's signed prekey X25519 secret
/// `my_opk_secret` — The consumed OPK secret (if the init used one)
/// `my_pq_keypair` — Bob's ML-KEM identity keypair, if PQ was declared
/// `sender_ik_ed_pub` — Alice's Ed25519 identity public key (fetched from directory)
pub fn respond(
    my_ik: &IdentityKeyPair,
    my_spk_secret: &StaticSecret,
    my_opk_secret: Option<&StaticSecret>,
    my_pq_keypair: Option<&PqKeyPair>,
    sender_ik_ed_pub: &[u8; 32],
    header: &X3DHHeader,
    pq_mode: PqMode,
) -> Result<([u8; 32], [u8; 32], bool), CryptoError> {
    let ek_a_bytes = b64d(&header.ek_pub)?;
    let ek_a = X25519Public::from(to_32(&ek_a_bytes)?);

    let sender_ik_x = ed25519_pub_to_x25519(sender_ik_ed_pub)?;
    let ik_b_x = ed25519_secret_to_x25519(my_ik.secret_bytes());

    // Mirror Alice's DH order exactly (DH is commutative):
    //   DH1 = IK_A × SPK_B   →  Bob: SPK_B × IK_A
    //   DH2 = EK_A × IK_B    →  Bob: IK_B × EK_A
    //   DH3 = EK_A × SPK_B   →  Bob: SPK_B × EK_A
    let dh1 = my_spk_secret.diffie_hellman(&sender_ik_x);
    let dh2 = ik_b_x.diffie_hellman(&ek_a);
    let dh3 = my_spk_secret.diffie_hellman(&ek_a);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(opk_sec) = my_opk_secret {
        let dh4 = opk_sec.diffie_hellman(&ek_a);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let mut hybrid_active = false;
    if pq_mode != PqMode::Classical {
        match (header.quantum_ciphertext.as_ref(), my_pq_keypair) {
            (Some(ct_b64), Some(keypair)) => {
                let ct = b64d(ct_b64)?;
                match pq::decapsulate(keypair, &ct) {
                    Ok(ss) => {
                        ikm.extend_from_slice(&ss);
                        hybrid_active = true;
                    }
                    Err(e) if pq_mode == PqMode::QuantumOnly => {
                        ikm.zeroize();
                        return Err(e);
                    }
                    Err(_) => {}
                }
            }
            _ if pq_mode == PqMode::QuantumOnly => {
                ikm.zeroize();
                return Err(CryptoError::PQUnavailable(
                    "no quantum ciphertext/keypair available to decapsulate".into(),
                ));
            }
            _ => {}
        }
    }

    let info = if pq_mode == PqMode::QuantumOnly { INFO_QUANTUM } else { INFO_CLASSICAL };
    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), info, &mut sk)?;
    ikm.zeroize();

    let transcript_hash = transcript_hash(sender_ik_ed_pub, &my_ik.public.0);

    Ok((sk, transcript_hash, hybrid_active))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x3dh_roundtrip_without_opk() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();

        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_ik).unwrap();

        let bundle = PrekeyBundle {
            user_id: "bob".into(),
            ik_pub: URL_SAFE_NO_PAD.encode(&bob_ik.public.0),
            spk_pub: URL_SAFE_NO_PAD.encode(bob_spk_pub.as_bytes()),
            spk_sig: URL_SAFE_NO_PAD.encode(&bob_spk_sig),
            opk_pub: None,
            opk_id: None,
            quantum_identity_key: None,
            quantum_algorithm: None,
        };

        let result = initiate("alice", &alice_ik, &bundle, PqMode::Classical).unwrap();

        let alice_ik_ed: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
        let (bob_sk, bob_transcript, bob_hybrid) = respond(
            &bob_ik,
            &bob_spk_secret,
            None,
            None,
            &alice_ik_ed,
            &result.header,
            PqMode::Classical,
        )
        .unwrap();

        assert_eq!(result.shared_key, bob_sk, "Alice and Bob must derive the same SK");
        assert_eq!(result.transcript_hash, bob_transcript);
        assert!(!bob_hybrid);
        assert!(!result.hybrid_active);
    }

    #[test]
    fn x3dh_roundtrip_with_opk() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();

        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_ik).unwrap();
        let opks = generate_one_time_prekeys(1);
        let (ref bob_opk_secret, ref bob_opk_pub) = opks[0];

        let bundle = PrekeyBundle {
            user_id: "bob".into(),
            ik_pub: URL_SAFE_NO_PAD.encode(&bob_ik.public.0),
            spk_pub: URL_SAFE_NO_PAD.encode(bob_spk_pub.as_bytes()),
            spk_sig: URL_SAFE_NO_PAD.encode(&bob_spk_sig),
            opk_pub: Some(URL_SAFE_NO_PAD.encode(bob_opk_pub.as_bytes())),
            opk_id: Some("opk-0".into()),
            quantum_identity_key: None,
            quantum_algorithm: None,
        };

        let result = initiate("alice", &alice_ik, &bundle, PqMode::Classical).unwrap();

        let alice_ik_ed: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
        let (bob_sk, _, _) = respond(
            &bob_ik,
            &bob_spk_secret,
            Some(bob_opk_secret),
            None,
            &alice_ik_ed,
            &result.header,
            PqMode::Classical,
        )
        .unwrap();

        assert_eq!(result.shared_key, bob_sk);
        assert_eq!(result.header.opk_id.as_deref(), Some("opk-0"));
    }

    #[test]
    fn x3dh_hybrid_roundtrip_with_pq() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();

        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_ik).unwrap();
        let bob_pq_kp = pq::generate_keypair(PqAlgorithm::MlKem768);

        let bundle = PrekeyBundle {
            user_id: "bob".into(),
            ik_pub: URL_SAFE_NO_PAD.encode(&bob_ik.public.0),
            spk_pub: URL_SAFE_NO_PAD.encode(bob_spk_pub.as_bytes()),
            spk_sig: URL_SAFE_NO_PAD.encode(&bob_spk_sig),
            opk_pub: None,
            opk_id: None,
            quantum_identity_key: Some(URL_SAFE_NO_PAD.encode(&bob_pq_kp.public_key)),
            quantum_algorithm: Some(PqAlgorithm::MlKem768),
        };

        let result = initiate("alice", &alice_ik, &bundle, PqMode::Hybrid).unwrap();
        assert!(result.hybrid_active);
        assert!(result.header.quantum_ciphertext.is_some());

        let alice_ik_ed: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
        let (bob_sk, _, bob_hybrid) = respond(
            &bob_ik,
            &bob_spk_secret,
            None,
            Some(&bob_pq_kp),
            &alice_ik_ed,
            &result.header,
            PqMode::Hybrid,
        )
        .unwrap();

        assert!(bob_hybrid);
        assert_eq!(result.shared_key, bob_sk);
    }

    #[test]
    fn quantum_only_rejects_classical_only_bundle() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();
        let (_bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_ik).unwrap();

        let bundle = PrekeyBundle {
            user_id: "bob".into(),
            ik_pub: URL_SAFE_NO_PAD.encode(&bob_ik.public.0),
            spk_pub: URL_SAFE_NO_PAD.encode(bob_spk_pub.as_bytes()),
            spk_sig: URL_SAFE_NO_PAD.encode(&bob_spk_sig),
            opk_pub: None,
            opk_id: None,
            quantum_identity_key: None,
            quantum_algorithm: None,
        };

        let err = initiate("alice", &alice_ik, &bundle, PqMode::QuantumOnly);
        assert!(matches!(err, Err(CryptoError::PQUnavailable(_))));
    }

    #[test]
    fn rejects_invalid_spk_signature() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();
        let evil_ik = IdentityKeyPair::generate().unwrap();

        let (_spk_secret, spk_pub, _good_sig) = generate_signed_prekey(&bob_ik).unwrap();
        let evil_sig = evil_ik.sign(spk_pub.as_bytes());

        let bundle = PrekeyBundle {
            user_id: "bob".into(),
            ik_pub: URL_SAFE_NO_PAD.encode(&bob_ik.public.0),
            spk_pub: URL_SAFE_NO_PAD.encode(spk_pub.as_bytes()),
            spk_sig: URL_SAFE_NO_PAD.encode(&evil_sig),
            opk_pub: None,
            opk_id: None,
            quantum_identity_key: None,
            quantum_algorithm: None,
        };

        let err = initiate("alice", &alice_ik, &bundle, PqMode::Classical);
        assert!(matches!(err, Err(CryptoError::BadBundle(_))));
    }
}
