//! MTProto 2.0 message encryption and decryption.
//!
//! A frame on the wire is `key_id (8) || msg_key (16) || ciphertext`. The
//! message key doubles as the authenticity check: it is recomputed from the
//! decrypted plaintext and compared against the received value.
//!
//! Frames are assembled in their final wire layout from the start: the header
//! region is reserved up front and the payload is padded and encrypted in
//! place behind it, so no buffer shuffling happens on the hot path.
//!
//! Key derivation differs between the two protocol roles by an 8-byte offset
//! into the auth key, so both halves are provided: clients encrypt with
//! [`encrypt_data_v2`] and decrypt server frames with [`decrypt_data_v2`];
//! the server-role pair exists for protocol test harnesses that impersonate
//! the data center.

use crate::{sha256, AuthKey};

/// Errors from frame decryption.
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// Ciphertext too short or not block-aligned.
    InvalidBuffer,
    /// The `key_id` in the frame does not match our key.
    AuthKeyMismatch,
    /// The `msg_key` does not match the decrypted contents.
    MessageKeyMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBuffer => write!(f, "invalid ciphertext buffer length"),
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
        }
    }
}

impl std::error::Error for DecryptError {}

const KEY_ID_LEN: usize = 8;
const MSG_KEY_LEN: usize = 16;
const HEADER_LEN: usize = KEY_ID_LEN + MSG_KEY_LEN;

/// Auth-key offset for material flowing client → server.
const CLIENT: usize = 0;
/// Auth-key offset for material flowing server → client.
const SERVER: usize = 8;

/// Derive the AES key and IV for `msg_key` in the given role.
///
/// Both are interleaved from two SHA-256 digests over opposite halves of the
/// shared key material.
fn message_keys(auth_key: &AuthKey, msg_key: &[u8; 16], x: usize) -> ([u8; 32], [u8; 32]) {
    let a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let b = sha256!(&auth_key.data[40 + x..76 + x], msg_key);

    let mut key = [0u8; 32];
    let mut iv = [0u8; 32];
    for i in 0..32 {
        // The middle 16 bytes swap sources; the outer bytes keep them.
        let swap = (8..24).contains(&i);
        key[i] = if swap { b[i] } else { a[i] };
        iv[i] = if swap { a[i] } else { b[i] };
    }
    (key, iv)
}

fn seal(payload: &[u8], auth_key: &AuthKey, x: usize) -> Vec<u8> {
    // Always pad with at least one full random block.
    let pad = 32 - payload.len() % 16;
    let mut padding = [0u8; 32];
    getrandom::getrandom(&mut padding).expect("getrandom failed");

    let mut frame = vec![0u8; HEADER_LEN + payload.len() + pad];
    frame[..KEY_ID_LEN].copy_from_slice(&auth_key.key_id);
    frame[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
    frame[HEADER_LEN + payload.len()..].copy_from_slice(&padding[..pad]);

    let digest = sha256!(&auth_key.data[88 + x..120 + x], &frame[HEADER_LEN..]);
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&digest[8..24]);
    frame[KEY_ID_LEN..HEADER_LEN].copy_from_slice(&msg_key);

    let (key, iv) = message_keys(auth_key, &msg_key, x);
    crate::ige::encrypt(&mut frame[HEADER_LEN..], &key, &iv);
    frame
}

fn open<'a>(
    frame: &'a mut [u8],
    auth_key: &AuthKey,
    x: usize,
) -> Result<&'a mut [u8], DecryptError> {
    if frame.len() < HEADER_LEN + 16 || (frame.len() - HEADER_LEN) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if frame[..KEY_ID_LEN] != auth_key.key_id {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&frame[KEY_ID_LEN..HEADER_LEN]);

    let (key, iv) = message_keys(auth_key, &msg_key, x);
    crate::ige::decrypt(&mut frame[HEADER_LEN..], &key, &iv);

    let digest = sha256!(&auth_key.data[88 + x..120 + x], &frame[HEADER_LEN..]);
    if digest[8..24] != msg_key {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(&mut frame[HEADER_LEN..])
}

/// Encrypt `payload` as a client, returning the complete wire frame
/// `key_id || msg_key || ciphertext`.
pub fn encrypt_data_v2(payload: &[u8], auth_key: &AuthKey) -> Vec<u8> {
    seal(payload, auth_key, CLIENT)
}

/// Decrypt a server-sent frame in place. Returns the padded plaintext.
pub fn decrypt_data_v2<'a>(
    frame: &'a mut [u8],
    auth_key: &AuthKey,
) -> Result<&'a mut [u8], DecryptError> {
    open(frame, auth_key, SERVER)
}

/// Encrypt `payload` as the server role.
pub fn encrypt_server_data_v2(payload: &[u8], auth_key: &AuthKey) -> Vec<u8> {
    seal(payload, auth_key, SERVER)
}

/// Decrypt a client-sent frame, as the server role would.
pub fn decrypt_client_data_v2<'a>(
    frame: &'a mut [u8],
    auth_key: &AuthKey,
) -> Result<&'a mut [u8], DecryptError> {
    open(frame, auth_key, CLIENT)
}
