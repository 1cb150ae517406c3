//! The authorization-key interface and the plaintext channel it runs over.
//!
//! Generating an authorization key is a multi-step Diffie-Hellman exchange
//! that lives behind the [`Authenticator`] trait; the sender only cares about
//! its outcome. During the exchange, messages travel unencrypted through a
//! [`PlainSender`].

use std::io;

use async_trait::async_trait;
use courier_mtproto::{PlainFrameError, PlainSession};

use crate::connection::Connection;

/// The outcome of a successful key exchange.
#[derive(Clone)]
pub struct AuthDone {
    /// The negotiated 256-byte authorization key.
    pub auth_key: [u8; 256],
    /// Clock skew against the server, in seconds.
    pub time_offset: i32,
}

impl std::fmt::Debug for AuthDone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthDone")
            .field("time_offset", &self.time_offset)
            .finish()
    }
}

/// Errors during the key exchange.
#[derive(Debug)]
pub enum AuthError {
    /// The transport failed underneath the handshake.
    Io(io::Error),
    /// The exchange violated the protocol.
    Protocol(&'static str),
    /// The server rejected the exchange.
    Rejected(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error during handshake: {e}"),
            Self::Protocol(s) => write!(f, "handshake protocol error: {s}"),
            Self::Rejected(s) => write!(f, "handshake rejected: {s}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<io::Error> for AuthError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<PlainFrameError> for AuthError {
    fn from(_: PlainFrameError) -> Self {
        Self::Protocol("malformed plaintext frame")
    }
}

/// Produces authorization keys over a not-yet-authenticated connection.
#[async_trait]
pub trait Authenticator<C: Connection>: Send + Sync {
    /// Run the key exchange to completion.
    async fn authenticate(&self, plain: &mut PlainSender<'_, C>) -> Result<AuthDone, AuthError>;
}

/// Request/response helper for the unauthenticated handshake.
pub struct PlainSender<'a, C: Connection> {
    conn: &'a C,
    session: PlainSession,
}

impl<'a, C: Connection> PlainSender<'a, C> {
    pub(crate) fn new(conn: &'a C) -> Self {
        Self {
            conn,
            session: PlainSession::new(),
        }
    }

    /// Send one serialized request and wait for the server's answer.
    pub async fn invoke(&mut self, body: &[u8]) -> Result<Vec<u8>, AuthError> {
        let frame = self.session.wrap(body);
        self.conn.send(&frame).await?;
        let reply = self.conn.recv().await?;
        Ok(PlainSession::unwrap(&reply)?)
    }
}
