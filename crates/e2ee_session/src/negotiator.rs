//! Algorithm negotiator: picks a single wire algorithm from local and
//! remote capability sets before any DH value is computed.

use crate::error::SessionError;

/// Fixed priority, highest to lowest. The first entry present in both
/// local and remote capability sets wins; ordering inside a capability
/// list is only a preference hint and never overrides this table.
const PRIORITY: &[&str] = &[
    "ML-KEM-1024",
    "ML-KEM-768",
    "ML-KEM-512",
    "HYBRID-RSA4096-MLKEM768",
    "Curve25519",
    "P-256",
    "RSA-4096-OAEP",
    "RSA-2048-OAEP",
];

const FALLBACK: &str = "RSA-2048-OAEP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmCategory {
    Quantum,
    Hybrid,
    Classical,
}

#[derive(Debug, Clone)]
pub struct NegotiationRecord {
    pub algorithm: String,
    pub category: AlgorithmCategory,
    /// Notional security level in bits, for audit display only.
    pub security_level_bits: u32,
    pub fallback_used: bool,
}

fn categorize(algorithm: &str) -> (AlgorithmCategory, u32) {
    match algorithm {
        "ML-KEM-1024" => (AlgorithmCategory::Quantum, 256),
        "ML-KEM-768" => (AlgorithmCategory::Quantum, 192),
        "ML-KEM-512" => (AlgorithmCategory::Quantum, 128),
        "HYBRID-RSA4096-MLKEM768" => (AlgorithmCategory::Hybrid, 192),
        "Curve25519" => (AlgorithmCategory::Classical, 128),
        "P-256" => (AlgorithmCategory::Classical, 128),
        "RSA-4096-OAEP" => (AlgorithmCategory::Classical, 152),
        "RSA-2048-OAEP" => (AlgorithmCategory::Classical, 112),
        _ => (AlgorithmCategory::Classical, 0),
    }
}

/// Negotiate a single wire algorithm. `quantum_only` rejects any result
/// that isn't `Quantum`-category rather than letting a classical pick
/// through.
pub fn negotiate(
    local: &[String],
    remote: &[String],
    quantum_only: bool,
) -> Result<NegotiationRecord, SessionError> {
    let picked = PRIORITY
        .iter()
        .find(|alg| local.iter().any(|l| l == *alg) && remote.iter().any(|r| r == *alg))
        .copied();

    let (algorithm, fallback_used) = match picked {
        Some(alg) => (alg.to_string(), false),
        None => (FALLBACK.to_string(), true),
    };

    let (category, security_level_bits) = categorize(&algorithm);

    if quantum_only && category != AlgorithmCategory::Quantum {
        return Err(SessionError::Crypto(e2ee_crypto::CryptoError::PQUnavailable(
            format!("quantum_only policy but negotiated {algorithm}"),
        )));
    }

    Ok(NegotiationRecord {
        algorithm,
        category,
        security_level_bits,
        fallback_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_pq_over_classical() {
        let local = vec!["Curve25519".to_string(), "ML-KEM-768".to_string()];
        let remote = vec!["ML-KEM-768".to_string(), "Curve25519".to_string()];
        let record = negotiate(&local, &remote, false).unwrap();
        assert_eq!(record.algorithm, "ML-KEM-768");
        assert_eq!(record.category, AlgorithmCategory::Quantum);
        assert!(!record.fallback_used);
    }

    #[test]
    fn quantum_only_rejects_classical_negotiation() {
        let local = vec!["Curve25519".to_string()];
        let remote = vec!["Curve25519".to_string()];
        let err = negotiate(&local, &remote, true);
        assert!(matches!(err, Err(SessionError::Crypto(e2ee_crypto::CryptoError::PQUnavailable(_)))));
    }

    #[test]
    fn empty_intersection_falls_back() {
        let local = vec!["ML-KEM-1024".to_string()];
        let remote = vec!["P-256".to_string()];
        let record = negotiate(&local, &remote, false).unwrap();
        assert_eq!(record.algorithm, FALLBACK);
        assert!(record.fallback_used);
    }
}
