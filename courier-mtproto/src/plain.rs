//! Plaintext framing for the pre-authorization handshake.
//!
//! Before an authorization key exists, messages travel with `auth_key_id` 0:
//!
//! ```text
//! auth_key_id:long      (0)
//! message_id:long
//! message_data_length:int
//! message_data:bytes
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

/// Errors when parsing a plaintext frame.
#[derive(Clone, Debug, PartialEq)]
pub enum PlainFrameError {
    /// The frame is shorter than its fixed header.
    TooShort,
    /// The frame does not carry `auth_key_id` 0.
    BadAuthKeyId,
    /// The declared body length exceeds the frame.
    TruncatedBody,
}

impl std::fmt::Display for PlainFrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort => write!(f, "plaintext frame too short"),
            Self::BadAuthKeyId => write!(f, "expected auth_key_id 0"),
            Self::TruncatedBody => write!(f, "plaintext body truncated"),
        }
    }
}

impl std::error::Error for PlainFrameError {}

/// Message-id allocator and framer for the unauthenticated channel.
pub struct PlainSession {
    last_msg_id: i64,
}

impl PlainSession {
    /// Create a fresh plaintext session.
    pub fn new() -> Self {
        Self { last_msg_id: 0 }
    }

    /// Frame `body` into a plaintext message ready for the transport.
    pub fn wrap(&mut self, body: &[u8]) -> Vec<u8> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut msg_id = ((now.as_secs() << 32) | (u64::from(now.subsec_nanos()) << 2)) as i64;
        if self.last_msg_id >= msg_id {
            msg_id = self.last_msg_id + 4;
        }
        self.last_msg_id = msg_id;

        let mut buf = Vec::with_capacity(20 + body.len());
        buf.extend_from_slice(&0i64.to_le_bytes());
        buf.extend_from_slice(&msg_id.to_le_bytes());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(body);
        buf
    }

    /// Extract the body of a received plaintext frame.
    pub fn unwrap(frame: &[u8]) -> Result<Vec<u8>, PlainFrameError> {
        if frame.len() < 20 {
            return Err(PlainFrameError::TooShort);
        }
        if frame[..8] != [0u8; 8] {
            return Err(PlainFrameError::BadAuthKeyId);
        }
        let length = u32::from_le_bytes(frame[16..20].try_into().unwrap()) as usize;
        if 20 + length > frame.len() {
            return Err(PlainFrameError::TruncatedBody);
        }
        Ok(frame[20..20 + length].to_vec())
    }
}

impl Default for PlainSession {
    fn default() -> Self {
        Self::new()
    }
}
