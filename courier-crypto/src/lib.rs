//! Cryptographic primitives for the courier MTProto stack.
//!
//! Provides:
//! - AES-256-IGE block chaining
//! - SHA-1 / SHA-256 hash macros
//! - `AuthKey` — the 256-byte authorization key with its derived identifiers
//! - MTProto 2.0 frame encryption / decryption for both protocol roles

#![deny(unsafe_code)]

mod auth_key;
mod frame;
pub mod ige;
mod sha;

pub use auth_key::AuthKey;
pub use frame::{
    decrypt_client_data_v2, decrypt_data_v2, encrypt_data_v2, encrypt_server_data_v2,
    DecryptError,
};
