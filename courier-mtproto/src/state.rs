//! Encrypted MTProto 2.0 session state.
//!
//! An [`EncryptedSession`] is created once an authorization key is available
//! and is the single source of message ids, sequence numbers, and the server
//! salt for a connection. On reconnect the session is [`reset`] rather than
//! rebuilt: the salt and time offset belong to the key, not the connection.
//!
//! [`reset`]: EncryptedSession::reset

use std::time::{SystemTime, UNIX_EPOCH};

use courier_crypto::{decrypt_data_v2, encrypt_data_v2, AuthKey};

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Why a received frame failed a security check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SecurityKind {
    /// The frame's `auth_key_id` is not ours.
    AuthKeyMismatch,
    /// The `msg_key` does not match the decrypted contents.
    MessageKeyMismatch,
    /// Ciphertext too short or not block-aligned.
    MalformedCiphertext,
    /// Decrypted plaintext shorter than the message header.
    PlaintextTooShort,
    /// The frame was encrypted for a different session.
    SessionMismatch,
    /// Server message ids must be odd.
    EvenServerMsgId,
    /// The header claims more body bytes than the frame carries.
    TruncatedBody,
}

impl std::fmt::Display for SecurityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
            Self::MalformedCiphertext => write!(f, "malformed ciphertext"),
            Self::PlaintextTooShort => write!(f, "plaintext too short"),
            Self::SessionMismatch => write!(f, "session_id mismatch"),
            Self::EvenServerMsgId => write!(f, "server sent an even msg_id"),
            Self::TruncatedBody => write!(f, "truncated message body"),
        }
    }
}

/// Errors that can occur when decrypting a server frame.
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// The server answered with a bare protocol-level error code instead of
    /// an encrypted message. Code 404 means it no longer knows our key.
    InvalidBuffer {
        /// The (negated) error code from the wire, e.g. `404`.
        code: i32,
    },
    /// The frame failed decryption or one of the post-decryption checks.
    Security(SecurityKind),
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBuffer { code } => write!(f, "server sent error code {code}"),
            Self::Security(kind) => write!(f, "security check failed: {kind}"),
        }
    }
}

impl std::error::Error for DecryptError {}

// ─── DecryptedMessage ────────────────────────────────────────────────────────

/// The inner message extracted from a successfully decrypted server frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedMessage {
    /// The server-assigned `msg_id` of this message.
    pub msg_id: i64,
    /// `seq_no` of the message within the session.
    pub seq_no: i32,
    /// TL-serialized body.
    pub body: Vec<u8>,
}

// ─── EncryptedSession ────────────────────────────────────────────────────────

/// MTProto 2.0 session state around an authorization key.
pub struct EncryptedSession {
    auth_key: AuthKey,
    session_id: i64,
    sequence: i32,
    last_msg_id: i64,
    security_checks: bool,
    /// Current server salt, included in every outgoing frame.
    pub salt: i64,
    /// Clock skew in seconds relative to the server.
    pub time_offset: i32,
}

impl EncryptedSession {
    /// Create a session for `auth_key` with a freshly rolled session id.
    pub fn new(auth_key: [u8; 256], first_salt: i64, time_offset: i32) -> Self {
        Self {
            auth_key: AuthKey::from_bytes(auth_key),
            session_id: random_session_id(),
            sequence: 0,
            last_msg_id: 0,
            security_checks: true,
            salt: first_salt,
            time_offset,
        }
    }

    /// Disable or re-enable the optional integrity checks on received frames.
    pub fn with_security_checks(mut self, enabled: bool) -> Self {
        self.security_checks = enabled;
        self
    }

    /// The current session id.
    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Raw key bytes, for persistence.
    pub fn auth_key_bytes(&self) -> [u8; 256] {
        self.auth_key.to_bytes()
    }

    /// Roll a new session id and restart the per-session counters.
    ///
    /// Called on reconnect. The salt and time offset are kept.
    pub fn reset(&mut self) {
        self.session_id = random_session_id();
        self.sequence = 0;
        self.last_msg_id = 0;
    }

    /// Allocate the next message id: strictly greater than every id issued
    /// before, anchored to the (offset-corrected) wall clock, with the two
    /// lowest bits zero as required for client messages.
    pub fn new_msg_id(&mut self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = now.as_secs().wrapping_add(self.time_offset as i64 as u64);
        let nanos = u64::from(now.subsec_nanos());
        let mut id = ((secs << 32) | (nanos << 2)) as i64;
        if self.last_msg_id >= id {
            id = self.last_msg_id + 4;
        }
        self.last_msg_id = id;
        id
    }

    /// Correct our clock from a known-good server message id.
    ///
    /// Returns the new offset in seconds. The monotonicity watermark is
    /// cleared so the next id is rebuilt from the corrected clock.
    pub fn update_time_offset(&mut self, correct_msg_id: i64) -> i32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let correct = correct_msg_id >> 32;
        self.time_offset = (correct - now) as i32;
        self.last_msg_id = 0;
        self.time_offset
    }

    /// Next sequence number. Content-related messages get odd numbers and
    /// advance the counter; service chatter gets the even slot in between.
    pub fn next_seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            let seq = self.sequence * 2 + 1;
            self.sequence += 1;
            seq
        } else {
            self.sequence * 2
        }
    }

    /// Shift the sequence counter after a bad-msg notification (codes 32/33).
    pub fn adjust_sequence(&mut self, delta: i32) {
        self.sequence += delta;
    }

    /// Append a framed message (`msg_id`, `seq_no`, length, body) to `buf`,
    /// allocating fresh identifiers. Returns the assigned pair.
    pub fn write_message(
        &mut self,
        buf: &mut Vec<u8>,
        body: &[u8],
        content_related: bool,
    ) -> (i64, i32) {
        let msg_id = self.new_msg_id();
        let seq_no = self.next_seq_no(content_related);
        buf.extend_from_slice(&msg_id.to_le_bytes());
        buf.extend_from_slice(&seq_no.to_le_bytes());
        buf.extend_from_slice(&(body.len() as i32).to_le_bytes());
        buf.extend_from_slice(body);
        (msg_id, seq_no)
    }

    /// Encrypt a message stream (as produced by [`write_message`]) into a
    /// complete wire frame.
    ///
    /// [`write_message`]: Self::write_message
    pub fn encrypt_message_data(&self, data: &[u8]) -> Vec<u8> {
        let mut plaintext = Vec::with_capacity(16 + data.len());
        plaintext.extend_from_slice(&self.salt.to_le_bytes());
        plaintext.extend_from_slice(&self.session_id.to_le_bytes());
        plaintext.extend_from_slice(data);
        encrypt_data_v2(&plaintext, &self.auth_key)
    }

    /// Decrypt a received frame and extract the inner message.
    pub fn decrypt_message_data(
        &self,
        mut frame: Vec<u8>,
    ) -> Result<DecryptedMessage, DecryptError> {
        // A bare 4-byte frame is a transport-level error code, e.g. -404
        // when the server has forgotten our authorization key.
        if frame.len() == 4 {
            let code = -i32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
            return Err(DecryptError::InvalidBuffer { code });
        }

        let plaintext = decrypt_data_v2(&mut frame, &self.auth_key).map_err(|e| {
            use courier_crypto::DecryptError as Frame;
            DecryptError::Security(match e {
                Frame::InvalidBuffer => SecurityKind::MalformedCiphertext,
                Frame::AuthKeyMismatch => SecurityKind::AuthKeyMismatch,
                Frame::MessageKeyMismatch => SecurityKind::MessageKeyMismatch,
            })
        })?;

        // salt (8) + session_id (8) + msg_id (8) + seq_no (4) + length (4)
        if plaintext.len() < 32 {
            return Err(DecryptError::Security(SecurityKind::PlaintextTooShort));
        }

        let session_id = i64::from_le_bytes(plaintext[8..16].try_into().unwrap());
        let msg_id = i64::from_le_bytes(plaintext[16..24].try_into().unwrap());
        let seq_no = i32::from_le_bytes(plaintext[24..28].try_into().unwrap());
        let length = u32::from_le_bytes(plaintext[28..32].try_into().unwrap()) as usize;

        if self.security_checks {
            if session_id != self.session_id {
                return Err(DecryptError::Security(SecurityKind::SessionMismatch));
            }
            if msg_id % 2 == 0 {
                return Err(DecryptError::Security(SecurityKind::EvenServerMsgId));
            }
        }

        if 32 + length > plaintext.len() {
            return Err(DecryptError::Security(SecurityKind::TruncatedBody));
        }
        let body = plaintext[32..32 + length].to_vec();

        Ok(DecryptedMessage { msg_id, seq_no, body })
    }
}

impl std::fmt::Debug for EncryptedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedSession")
            .field("auth_key", &self.auth_key)
            .field("session_id", &self.session_id)
            .field("sequence", &self.sequence)
            .field("salt", &self.salt)
            .field("time_offset", &self.time_offset)
            .finish()
    }
}

fn random_session_id() -> i64 {
    let mut rnd = [0u8; 8];
    getrandom::getrandom(&mut rnd).expect("getrandom failed");
    i64::from_le_bytes(rnd)
}
