//! e2ee_crypto — cryptographic primitives for the messaging core
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - All public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity` — long-term Ed25519 identity + device keys + device certificates
//! - `x3dh`     — X3DH asynchronous key agreement with optional PQ co-agreement
//! - `pq`       — ML-KEM key-encapsulation, layered alongside X3DH
//! - `ratchet`  — Double Ratchet: DH ratchet, skipped keys, quantum epoch rotation
//! - `aead`     — XChaCha20-Poly1305 encrypt/decrypt helpers
//! - `kdf`      — HKDF / Argon2id key derivation
//! - `hash`     — BLAKE3 utilities (message IDs, chain links)
//! - `hash_chain` — tamper-evident local message history chain
//! - `error`    — unified error type

pub mod aead;
pub mod error;
pub mod hash;
pub mod hash_chain;
pub mod identity;
pub mod kdf;
pub mod pq;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
