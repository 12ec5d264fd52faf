//! Post-quantum KEM co-agreement (ML-KEM), layered alongside the classical
//! X3DH exchange in `x3dh.rs`.
//!
//! Three parameter sets are supported; the caller picks one via
//! `PqAlgorithm` (the algorithm negotiator is the only caller that should
//! make that choice — this module just executes it). All public key,
//! ciphertext, and shared-secret material is handled as owned byte vectors
//! so the rest of the stack doesn't need to know which ML-KEM variant is
//! active.

use pqcrypto_mlkem::{mlkem1024, mlkem512, mlkem768};
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::CryptoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PqAlgorithm {
    MlKem512,
    MlKem768,
    MlKem1024,
}

impl PqAlgorithm {
    /// Matches the closed set of capability strings in the wire format.
    pub fn wire_name(&self) -> &'static str {
        match self {
            PqAlgorithm::MlKem512 => "ML-KEM-512",
            PqAlgorithm::MlKem768 => "ML-KEM-768",
            PqAlgorithm::MlKem1024 => "ML-KEM-1024",
        }
    }

    pub fn from_wire_name(s: &str) -> Option<Self> {
        match s {
            "ML-KEM-512" => Some(PqAlgorithm::MlKem512),
            "ML-KEM-768" => Some(PqAlgorithm::MlKem768),
            "ML-KEM-1024" => Some(PqAlgorithm::MlKem1024),
            _ => None,
        }
    }
}

/// A generated KEM keypair, public half ready for publishing.
pub struct PqKeyPair {
    pub algorithm: PqAlgorithm,
    pub public_key: Vec<u8>,
    secret_key: Vec<u8>,
}

impl Drop for PqKeyPair {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

impl PqKeyPair {
    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret_key
    }

    /// Rebuild a keypair from previously generated and persisted halves
    /// (public key alongside, secret key out of vault storage).
    pub fn from_parts(algorithm: PqAlgorithm, public_key: Vec<u8>, secret_key: Vec<u8>) -> Self {
        Self { algorithm, public_key, secret_key }
    }
}

pub fn generate_keypair(algorithm: PqAlgorithm) -> PqKeyPair {
    match algorithm {
        PqAlgorithm::MlKem512 => {
            let (pk, sk) = mlkem512::keypair();
            PqKeyPair {
                algorithm,
                public_key: pk.as_bytes().to_vec(),
                secret_key: sk.as_bytes().to_vec(),
            }
        }
        PqAlgorithm::MlKem768 => {
            let (pk, sk) = mlkem768::keypair();
            PqKeyPair {
                algorithm,
                public_key: pk.as_bytes().to_vec(),
                secret_key: sk.as_bytes().to_vec(),
            }
        }
        PqAlgorithm::MlKem1024 => {
            let (pk, sk) = mlkem1024::keypair();
            PqKeyPair {
                algorithm,
                public_key: pk.as_bytes().to_vec(),
                secret_key: sk.as_bytes().to_vec(),
            }
        }
    }
}

/// Encapsulate against a peer's published public key.
/// Returns (ciphertext, shared_secret).
pub fn encapsulate(
    algorithm: PqAlgorithm,
    peer_public_key: &[u8],
) -> Result<(Vec<u8>, [u8; 32]), CryptoError> {
    match algorithm {
        PqAlgorithm::MlKem512 => {
            let pk = mlkem512::PublicKey::from_bytes(peer_public_key)
                .map_err(|e| CryptoError::PQUnavailable(e.to_string()))?;
            let (ss, ct) = mlkem512::encapsulate(&pk);
            Ok((ct.as_bytes().to_vec(), to_32(ss.as_bytes())?))
        }
        PqAlgorithm::MlKem768 => {
            let pk = mlkem768::PublicKey::from_bytes(peer_public_key)
                .map_err(|e| CryptoError::PQUnavailable(e.to_string()))?;
            let (ss, ct) = mlkem768::encapsulate(&pk);
            Ok((ct.as_bytes().to_vec(), to_32(ss.as_bytes())?))
        }
        PqAlgorithm::MlKem1024 => {
            let pk = mlkem1024::PublicKey::from_bytes(peer_public_key)
                .map_err(|e| CryptoError::PQUnavailable(e.to_string()))?;
            let (ss, ct) = mlkem1024::encapsulate(&pk);
            Ok((ct.as_bytes().to_vec(), to_32(ss.as_bytes())?))
        }
    }
}

/// Decapsulate a ciphertext produced by `encapsulate` against our own keypair.
pub fn decapsulate(keypair: &PqKeyPair, ciphertext: &[u8]) -> Result<[u8; 32], CryptoError> {
    match keypair.algorithm {
        PqAlgorithm::MlKem512 => {
            let sk = mlkem512::SecretKey::from_bytes(keypair.secret_bytes())
                .map_err(|e| CryptoError::PQUnavailable(e.to_string()))?;
            let ct = mlkem512::Ciphertext::from_bytes(ciphertext)
                .map_err(|e| CryptoError::PQUnavailable(e.to_string()))?;
            to_32(mlkem512::decapsulate(&ct, &sk).as_bytes())
        }
        PqAlgorithm::MlKem768 => {
            let sk = mlkem768::SecretKey::from_bytes(keypair.secret_bytes())
                .map_err(|e| CryptoError::PQUnavailable(e.to_string()))?;
            let ct = mlkem768::Ciphertext::from_bytes(ciphertext)
                .map_err(|e| CryptoError::PQUnavailable(e.to_string()))?;
            to_32(mlkem768::decapsulate(&ct, &sk).as_bytes())
        }
        PqAlgorithm::MlKem1024 => {
            let sk = mlkem1024::SecretKey::from_bytes(keypair.secret_bytes())
                .map_err(|e| CryptoError::PQUnavailable(e.to_string()))?;
            let ct = mlkem1024::Ciphertext::from_bytes(ciphertext)
                .map_err(|e| CryptoError::PQUnavailable(e.to_string()))?;
            to_32(mlkem1024::decapsulate(&ct, &sk).as_bytes())
        }
    }
}

fn to_32(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    // ML-KEM shared secrets are 32 bytes for all three parameter sets.
    bytes
        .try_into()
        .map_err(|_| CryptoError::PQUnavailable("unexpected shared-secret length".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_parameter_sets() {
        for alg in [PqAlgorithm::MlKem512, PqAlgorithm::MlKem768, PqAlgorithm::MlKem1024] {
            let kp = generate_keypair(alg);
            let (ct, ss_sender) = encapsulate(alg, &kp.public_key).unwrap();
            let ss_receiver = decapsulate(&kp, &ct).unwrap();
            assert_eq!(ss_sender, ss_receiver);
        }
    }

    #[test]
    fn wire_name_roundtrip() {
        for alg in [PqAlgorithm::MlKem512, PqAlgorithm::MlKem768, PqAlgorithm::MlKem1024] {
            assert_eq!(PqAlgorithm::from_wire_name(alg.wire_name()), Some(alg));
        }
    }
}
