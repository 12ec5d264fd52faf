//! Authenticated Encryption with Associated Data
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Nonce: 24 bytes (random, mixed with the ratchet
//! epoch).  Tag: 16 bytes.
//!
//! Ciphertext wire format:
//!   [ nonce (24 bytes) | ciphertext + tag ]

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    XChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// XOR the quantum epoch into the first 4 bytes of a nonce.
///
/// A fresh random nonce already makes reuse vanishingly unlikely, but mixing
/// in the epoch ties every nonce to the key family that produced it: a
/// message key replayed across an epoch boundary produces a different nonce
/// than it did when first used, so a stale ciphertext cannot be re-presented
/// under a matching nonce from another epoch.
pub fn mix_nonce_with_epoch(nonce: &mut [u8; 24], epoch: u32) {
    let epoch_bytes = epoch.to_be_bytes();
    for i in 0..4 {
        nonce[i] ^= epoch_bytes[i];
    }
}

/// Encrypt `plaintext` with a 32-byte key, prepending a random 24-byte nonce
/// mixed with `epoch`.
/// `aad` — additional associated data (authenticated but not encrypted).
pub fn encrypt_with_epoch(
    key: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
    epoch: u32,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut nonce_bytes: [u8; 24] = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng).into();
    mix_nonce_with_epoch(&mut nonce_bytes, epoch);
    let nonce = chacha20poly1305::XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, chacha20poly1305::aead::Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(24 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Encrypt `plaintext` with a 32-byte key, prepending a random 24-byte nonce.
/// `aad` — additional associated data (authenticated but not encrypted).
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&nonce, chacha20poly1305::aead::Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    // Prepend nonce
    let mut out = Vec::with_capacity(24 + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < 24 {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(24);
    let nonce = chacha20poly1305::XNonce::from_slice(nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::AeadDecrypt)?;

    let plaintext = cipher
        .decrypt(nonce, chacha20poly1305::aead::Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

/// Encrypt a 32-byte key with another 32-byte wrapping key (key transport).
pub fn wrap_key(wrap_key: &[u8; 32], key_to_wrap: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    encrypt(wrap_key, key_to_wrap, b"e2ee-key-wrap")
}

/// Decrypt a wrapped key.
pub fn unwrap_key(wrap_key: &[u8; 32], wrapped: &[u8]) -> Result<[u8; 32], CryptoError> {
    let plaintext = decrypt(wrap_key, wrapped, b"e2ee-key-wrap")?;
    if plaintext.len() != 32 {
        return Err(CryptoError::InvalidKey("Unwrapped key wrong length".into()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&plaintext);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = [1u8; 32];
        let ct = encrypt(&key, b"hello", b"aad").unwrap();
        let pt = decrypt(&key, &ct, b"aad").unwrap();
        assert_eq!(&pt[..], b"hello");
    }

    #[test]
    fn tampered_aad_fails() {
        let key = [2u8; 32];
        let ct = encrypt(&key, b"hello", b"aad-1").unwrap();
        assert!(decrypt(&key, &ct, b"aad-2").is_err());
    }

    #[test]
    fn key_wrap_roundtrip() {
        let wrap = [3u8; 32];
        let inner = [9u8; 32];
        let wrapped = wrap_key(&wrap, &inner).unwrap();
        let unwrapped = unwrap_key(&wrap, &wrapped).unwrap();
        assert_eq!(inner, unwrapped);
    }

    #[test]
    fn epoch_mixing_is_reversible_via_xor() {
        let original = [0xABu8; 24];
        let mut mixed = original;
        mix_nonce_with_epoch(&mut mixed, 42);
        assert_ne!(mixed, original);
        // XOR is its own inverse
        mix_nonce_with_epoch(&mut mixed, 42);
        assert_eq!(mixed, original);
    }

    #[test]
    fn encrypt_with_epoch_roundtrips() {
        let key = [4u8; 32];
        let ct = encrypt_with_epoch(&key, b"hello", b"aad", 7).unwrap();
        let pt = decrypt(&key, &ct, b"aad").unwrap();
        assert_eq!(&pt[..], b"hello");
    }
}
