//! e2ee_proto — wire types, envelopes, and serialisation for the messaging core.
//!
//! All on-wire types are serialised to JSON and versioned to allow future
//! format changes without breaking compatibility.
//!
//! # Modules
//! - `envelope` — encrypted message envelope (what the relay sees)
//! - `message`  — plaintext message types (inside the encrypted envelope)
//! - `codec`    — padding, batching, and wire framing
//! - `api`      — API request/response types shared between clients and services

pub mod api;
pub mod codec;
pub mod envelope;
pub mod message;

pub use codec::{BatchingMode, PaddingMode};
pub use envelope::Envelope;
pub use message::{DeliveryState, MessageContent, MessageType};
