use thiserror::Error;

/// Orchestration-level error. Wraps the lower-layer error types and adds
/// the failure modes that only exist once sessions, devices, and the
/// directory are in the picture.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("crypto error: {0}")]
    Crypto(#[from] e2ee_crypto::CryptoError),

    #[error("store error: {0}")]
    Store(#[from] e2ee_store::StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] e2ee_proto::codec::CodecError),

    #[error("directory error: {0}")]
    Directory(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("device not trusted: {0}")]
    DeviceNotTrusted(String),

    #[error("device not initialised")]
    DeviceNotInitialized,

    #[error("conversation key bound to a different device fingerprint")]
    KeyMismatch,

    #[error("handshake did not complete within the configured timeout")]
    HandshakeTimeout,

    #[error("too many skipped message keys")]
    TooManySkipped,

    #[error("device reset exhausted recovery retries for this send")]
    RecoveryExhausted,

    #[error("out-of-order queue is full for this session")]
    QueueFull,
}

impl SessionError {
    /// Whether the caller can reasonably retry (possibly after recovery)
    /// or whether the session/operation is permanently dead.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::Crypto(e) => crypto_error_is_recoverable(e),
            SessionError::Store(_) => false,
            SessionError::Codec(_) => false,
            SessionError::Directory(_) => true,
            SessionError::SessionNotFound(_) => false,
            SessionError::DeviceNotTrusted(_) => true,
            SessionError::DeviceNotInitialized => true,
            SessionError::KeyMismatch => true,
            SessionError::HandshakeTimeout => true,
            SessionError::TooManySkipped => false,
            SessionError::RecoveryExhausted => false,
            SessionError::QueueFull => true,
        }
    }
}

fn crypto_error_is_recoverable(e: &e2ee_crypto::CryptoError) -> bool {
    use e2ee_crypto::CryptoError::*;
    match e {
        PQUnavailable(_) => false, // policy decision, not transient
        TooOld | Replay | InvalidHeader(_) | BadBundle(_) | TooManySkipped(_) => false,
        SignatureVerification | CertificateValidation(_) => false,
        _ => false,
    }
}
