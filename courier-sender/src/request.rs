//! In-flight request bookkeeping and the caller-visible reply future.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use courier_tl_types::service::{LogOut, MsgsAck, MsgsStateInfo};
use courier_tl_types::{deserialize, Deserializable, Identifiable};
use tokio::sync::oneshot;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in response to an RPC call.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with digits removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw server error message like `"FLOOD_WAIT_30"`.
    pub fn from_wire(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(value) = suffix.parse::<u32>() {
                    return Self {
                        code,
                        name: message[..idx].to_string(),
                        value: Some(value),
                    };
                }
            }
        }
        Self {
            code,
            name: message.to_string(),
            value: None,
        }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT")` — exact match
    /// - `err.is("PHONE_CODE_*")` — starts-with match
    /// - `err.is("*_INVALID")` — ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// The flood-wait duration in seconds, if this is a `FLOOD_WAIT` error.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        if self.code == 420 && self.name == "FLOOD_WAIT" {
            self.value.map(u64::from)
        } else {
            None
        }
    }
}

// ─── RequestError ─────────────────────────────────────────────────────────────

/// The error type surfaced through a request's completion handle.
#[derive(Debug)]
pub enum RequestError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// The server reported the message itself as malformed.
    BadMessage {
        /// The bad-msg-notification error code.
        code: i32,
    },
    /// The sender was disconnected while the request was still queued.
    Disconnected,
    /// The request was dropped without an answer (e.g. the sender shut down
    /// mid-flight).
    Dropped,
    /// `send` was called while the sender was not connected.
    NotConnected,
    /// The serialized request exceeds the single-message limit.
    PayloadTooLarge,
    /// The response could not be decoded.
    Deserialize(String),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{e}"),
            Self::BadMessage { code } => {
                write!(f, "bad message (code {code}): {}", bad_message_reason(*code))
            }
            Self::Disconnected => write!(f, "request could not be sent: disconnected"),
            Self::Dropped => write!(f, "request dropped without an answer"),
            Self::NotConnected => write!(f, "cannot send requests while disconnected"),
            Self::PayloadTooLarge => write!(f, "request payload is too large to be sent"),
            Self::Deserialize(s) => write!(f, "deserialize error: {s}"),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<deserialize::Error> for RequestError {
    fn from(e: deserialize::Error) -> Self {
        Self::Deserialize(e.to_string())
    }
}

fn bad_message_reason(code: i32) -> &'static str {
    match code {
        16 => "msg_id too low",
        17 => "msg_id too high",
        18 => "msg_id is not divisible by 4",
        19 => "container msg_id was already seen",
        20 => "message too old",
        32 => "msg_seqno too low",
        33 => "msg_seqno too high",
        34 => "even msg_seqno on a content-related message",
        35 => "odd msg_seqno on a content-unrelated message",
        48 => "bad server salt",
        64 => "invalid container",
        _ => "unknown reason",
    }
}

// ─── RequestState ─────────────────────────────────────────────────────────────

pub(crate) type Completion = oneshot::Sender<Result<Vec<u8>, RequestError>>;

/// One submitted request: its serialized body, the identifiers assigned when
/// it was packed, and (for RPCs) the channel that resolves the caller.
pub(crate) struct RequestState {
    pub(crate) body: Vec<u8>,
    pub(crate) msg_id: i64,
    pub(crate) seq_no: i32,
    pub(crate) container_id: Option<i64>,
    tx: Option<Completion>,
}

impl RequestState {
    /// A request that expects a server reply.
    pub(crate) fn rpc(body: Vec<u8>) -> (Self, oneshot::Receiver<Result<Vec<u8>, RequestError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                body,
                msg_id: 0,
                seq_no: 0,
                container_id: None,
                tx: Some(tx),
            },
            rx,
        )
    }

    /// A fire-and-forget service message (acks, state info).
    pub(crate) fn notification(body: Vec<u8>) -> Self {
        Self {
            body,
            msg_id: 0,
            seq_no: 0,
            container_id: None,
            tx: None,
        }
    }

    /// The TL constructor id at the head of the body.
    pub(crate) fn constructor_id(&self) -> Option<u32> {
        self.body
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Acks and state-info replies do not advance the content sequence.
    pub(crate) fn content_related(&self) -> bool {
        !matches!(
            self.constructor_id(),
            Some(MsgsAck::CONSTRUCTOR_ID) | Some(MsgsStateInfo::CONSTRUCTOR_ID)
        )
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.constructor_id() == Some(MsgsAck::CONSTRUCTOR_ID)
    }

    pub(crate) fn is_log_out(&self) -> bool {
        self.constructor_id() == Some(LogOut::CONSTRUCTOR_ID)
    }

    pub(crate) fn expects_reply(&self) -> bool {
        self.tx.is_some()
    }

    /// Complete the request. Subsequent calls are no-ops.
    pub(crate) fn resolve(&mut self, body: Vec<u8>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(body));
        }
    }

    /// Fail the request. Subsequent calls are no-ops.
    pub(crate) fn reject(&mut self, error: RequestError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}

impl fmt::Debug for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestState")
            .field("constructor", &self.constructor_id())
            .field("msg_id", &self.msg_id)
            .field("container_id", &self.container_id)
            .field("pending", &self.tx.is_some())
            .finish()
    }
}

// ─── PendingReply ─────────────────────────────────────────────────────────────

/// The caller's half of a submitted request.
///
/// Awaiting it yields the deserialized response, an [`RequestError::Rpc`] if
/// the server rejected the call, or a transport-level failure.
pub struct PendingReply<T> {
    rx: oneshot::Receiver<Result<Vec<u8>, RequestError>>,
    _reply: PhantomData<fn() -> T>,
}

impl<T> PendingReply<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Vec<u8>, RequestError>>) -> Self {
        Self {
            rx,
            _reply: PhantomData,
        }
    }
}

impl<T: Deserializable> Future for PendingReply<T> {
    type Output = Result<T, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(Ok(body))) => {
                Poll::Ready(T::from_bytes(&body).map_err(RequestError::from))
            }
            Poll::Ready(Ok(Err(error))) => Poll::Ready(Err(error)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RequestError::Dropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_tl_types::Serializable;

    #[test]
    fn rpc_error_parses_numeric_suffix() {
        let err = RpcError::from_wire(420, "FLOOD_WAIT_30");
        assert_eq!(err.name, "FLOOD_WAIT");
        assert_eq!(err.value, Some(30));
        assert_eq!(err.flood_wait_seconds(), Some(30));
    }

    #[test]
    fn rpc_error_keeps_plain_names() {
        let err = RpcError::from_wire(401, "AUTH_KEY_UNREGISTERED");
        assert_eq!(err.name, "AUTH_KEY_UNREGISTERED");
        assert_eq!(err.value, None);
    }

    #[test]
    fn rpc_error_wildcards() {
        let err = RpcError::from_wire(400, "PHONE_CODE_INVALID");
        assert!(err.is("PHONE_CODE_INVALID"));
        assert!(err.is("PHONE_CODE_*"));
        assert!(err.is("*_INVALID"));
        assert!(!err.is("FLOOD_WAIT"));
    }

    #[test]
    fn completion_is_idempotent() {
        let (mut state, mut rx) = RequestState::rpc(vec![1, 2, 3]);
        state.resolve(vec![9]);
        state.resolve(vec![8]);
        state.reject(RequestError::Dropped);
        assert_eq!(rx.try_recv().unwrap().unwrap(), vec![9]);
    }

    #[test]
    fn notification_kinds() {
        let ack = RequestState::notification(MsgsAck { msg_ids: vec![1] }.to_bytes());
        assert!(ack.is_ack());
        assert!(!ack.content_related());
        assert!(!ack.expects_reply());

        let (logout, _rx) = RequestState::rpc(LogOut.to_bytes());
        assert!(logout.is_log_out());
        assert!(logout.content_related());
    }
}
