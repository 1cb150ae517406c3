//! Sans-IO MTProto session state.
//!
//! This crate owns the protocol bookkeeping that is independent of any
//! transport:
//! * message-id and sequence-number generation with server-clock correction
//! * salt and session-id tracking
//! * encryption and decryption of complete message frames
//! * plaintext framing for the pre-authorization handshake
//!
//! It is intentionally transport-agnostic: bring your own TCP/WebSocket.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod plain;
pub mod state;

pub use plain::{PlainFrameError, PlainSession};
pub use state::{DecryptError, DecryptedMessage, EncryptedSession, SecurityKind};
