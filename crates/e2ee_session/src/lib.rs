//! e2ee_session — session orchestration on top of `e2ee_crypto`'s ratchet
//! and X3DH primitives and `e2ee_store`'s persistence.
//!
//! # Module layout
//! - `config`        — explicit, no-env-var runtime policy (`SessionConfig`)
//! - `clock`          — `Clock` trait + `SystemClock`/`TestClock`
//! - `error`          — unified orchestration error (`SessionError`)
//! - `directory`      — `DirectoryClient` seam + `MockDirectory` test double
//! - `sync_transport` — `SyncTransport` seam for cross-device fan-out
//! - `telemetry`      — `TelemetryHook` audit sink
//! - `negotiator`      — fixed-priority algorithm negotiation
//! - `prekey_store`   — identity/signed/one-time prekey lifecycle
//! - `handshake`      — X3DH + negotiation orchestration behind a timeout
//! - `manager`        — per-peer session state machine, encrypt/decrypt
//! - `fanout`         — multi-device conversation fan-out and recovery

pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod fanout;
pub mod handshake;
pub mod manager;
pub mod negotiator;
pub mod prekey_store;
pub mod sync_transport;
pub mod telemetry;

pub use config::SessionConfig;
pub use error::SessionError;
pub use manager::{SessionManager, SessionState};
pub use prekey_store::PrekeyStore;
