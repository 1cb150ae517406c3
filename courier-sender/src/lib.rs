//! # courier-sender
//!
//! The authenticated MTProto session endpoint: takes typed RPC requests,
//! batches and encrypts them, correlates the server's answers back to the
//! awaiting callers, and surfaces server-pushed updates through an event
//! channel.
//!
//! ## Shape
//!
//! A connected [`Sender`] runs two cooperating tasks over one [`Connection`]:
//!
//! * the **send loop** drains the send queue, flushing pending
//!   acknowledgements first, wraps multi-message batches in a container,
//!   encrypts, and writes;
//! * the **receive loop** reads frames, decrypts them, and dispatches each
//!   service message: RPC results resolve their pending request, protocol
//!   notifications adjust session state and may re-enqueue affected requests,
//!   updates are forwarded raw.
//!
//! Requests survive involuntary disconnects: on reconnect the pending map is
//! drained back into the send queue and everything is resent under fresh
//! message ids. A user-initiated [`Sender::disconnect`] instead rejects all
//! queued work.

#![deny(unsafe_code)]

mod auth;
mod connection;
mod packer;
mod request;

pub use auth::{AuthDone, AuthError, Authenticator, PlainSender};
pub use connection::{Connection, ConnectionInfo, Proxy, TcpConnection};
pub use request::{PendingReply, RequestError, RpcError};

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_mtproto::{DecryptError, EncryptedSession};
use courier_tl_types::service::{self, ServiceMessage};
use courier_tl_types::{Deserializable, Identifiable, RemoteCall, Serializable};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use packer::MessagePacker;
use request::RequestState;

/// How many recently-sent acknowledgements are kept around so a
/// `bad_server_salt` that references one of them can be answered by
/// re-sending it.
const MAX_RECENT_ACKS: usize = 10;

/// Wait this long before reconnecting, protecting the server from tight
/// reconnect storms.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

// ─── Events ──────────────────────────────────────────────────────────────────

/// Out-of-band notifications delivered through the configured event channel.
#[derive(Clone, Debug, PartialEq)]
pub enum SenderEvent {
    /// The sender (re)established its connection.
    Connected,
    /// The sender lost or closed its connection.
    Disconnected,
    /// The server no longer knows our authorization key; the session must be
    /// rebuilt by the owner of this sender.
    Broken,
    /// A server-pushed update, as raw TL bytes of an `Updates` constructor.
    Update(Vec<u8>),
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Configuration for a [`Sender`].
#[derive(Clone)]
pub struct SenderConfig {
    /// Maximum connection attempts per connect; `None` retries forever.
    pub retries: Option<u32>,
    /// Delay between connection attempts.
    pub retry_delay: Duration,
    /// Reconnect automatically when the connection drops.
    pub auto_reconnect: bool,
    /// Abort a connection attempt that takes longer than this.
    pub connect_timeout: Option<Duration>,
    /// Whether this sender serves the account's home data center. Controls
    /// how an unknown-auth-key condition is reported.
    pub is_main_sender: bool,
    /// The data center this sender talks to.
    pub dc_id: i32,
    /// Enforce the optional integrity checks on received frames.
    pub security_checks: bool,
    /// Receives [`SenderEvent`]s: connection transitions and raw updates.
    pub events: Option<mpsc::UnboundedSender<SenderEvent>>,
    /// Called exactly once whenever a new authorization key is generated.
    pub auth_key_hook: Option<Arc<dyn Fn(&[u8; 256], i32) + Send + Sync>>,
    /// Called when a non-main sender's key is no longer known by the server.
    pub on_connection_break: Option<Arc<dyn Fn(i32) + Send + Sync>>,
    /// Called after every successful automatic reconnect.
    pub auto_reconnect_hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl SenderConfig {
    /// Defaults: retry forever every 2 s, auto-reconnect, main sender, all
    /// security checks on.
    pub fn new(dc_id: i32) -> Self {
        Self {
            retries: None,
            retry_delay: Duration::from_millis(2000),
            auto_reconnect: true,
            connect_timeout: None,
            is_main_sender: true,
            dc_id,
            security_checks: true,
            events: None,
            auth_key_hook: None,
            on_connection_break: None,
            auto_reconnect_hook: None,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self::new(2)
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors from [`Sender::connect`].
#[derive(Debug)]
pub enum SenderError {
    /// The transport could not be established.
    Io(io::Error),
    /// The authorization-key exchange failed.
    Auth(AuthError),
    /// The configured connect timeout elapsed.
    Timeout,
}

impl std::fmt::Display for SenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Auth(e) => write!(f, "{e}"),
            Self::Timeout => write!(f, "connection attempt timed out"),
        }
    }
}

impl std::error::Error for SenderError {}

impl From<io::Error> for SenderError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

// ─── Tracker ─────────────────────────────────────────────────────────────────

/// Everything the receive loop needs to correlate server messages back to
/// submitted requests.
struct Tracker {
    /// Requests that were written to the wire and await a server response,
    /// keyed by their message id.
    pending: HashMap<i64, RequestState>,
    /// Server message ids we still owe an acknowledgement for.
    pending_ack: Vec<i64>,
    /// Ring of the most recently sent acknowledgements.
    last_acks: VecDeque<RequestState>,
}

impl Tracker {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
            pending_ack: Vec::new(),
            last_acks: VecDeque::with_capacity(MAX_RECENT_ACKS),
        }
    }

    fn push_last_ack(&mut self, state: RequestState) {
        if self.last_acks.len() == MAX_RECENT_ACKS {
            self.last_acks.pop_front();
        }
        self.last_acks.push_back(state);
    }

    fn note_pending_ack(&mut self, msg_id: i64) {
        if !self.pending_ack.contains(&msg_id) {
            self.pending_ack.push(msg_id);
        }
    }

    /// Remove and return every state linked to `msg_id`: a direct match, the
    /// members of a container, or a recently sent acknowledgement.
    fn pop_states(&mut self, msg_id: i64) -> Vec<RequestState> {
        if let Some(state) = self.pending.remove(&msg_id) {
            return vec![state];
        }

        let mut member_ids: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, state)| state.container_id == Some(msg_id))
            .map(|(id, _)| *id)
            .collect();
        if !member_ids.is_empty() {
            // Message ids grow with submission order; keep that order.
            member_ids.sort_unstable();
            return member_ids
                .into_iter()
                .filter_map(|id| self.pending.remove(&id))
                .collect();
        }

        if let Some(at) = self
            .last_acks
            .iter()
            .position(|ack| ack.msg_id == msg_id || ack.container_id == Some(msg_id))
        {
            return self.last_acks.remove(at).into_iter().collect();
        }

        Vec::new()
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.pending_ack.clear();
        self.last_acks.clear();
    }
}

// ─── Sender ──────────────────────────────────────────────────────────────────

struct SenderInner<C: Connection> {
    config: SenderConfig,
    authenticator: Arc<dyn Authenticator<C>>,
    /// Key material and clock skew that outlive individual connections.
    auth: Mutex<AuthState>,
    session: Mutex<Option<EncryptedSession>>,
    queue: MessagePacker,
    tracker: Mutex<Tracker>,
    conn: Mutex<Option<Arc<C>>>,
    conn_info: Mutex<Option<ConnectionInfo>>,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
    user_connected: AtomicBool,
    user_disconnected: AtomicBool,
    is_connecting: AtomicBool,
    reconnecting: AtomicBool,
}

/// A bidirectional, authenticated MTProto session endpoint.
///
/// Cheap to clone; clones share the same session.
pub struct Sender<C: Connection> {
    inner: Arc<SenderInner<C>>,
}

impl<C: Connection> Clone for Sender<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connection> Sender<C> {
    /// Create a disconnected sender.
    ///
    /// `auth_key` is the persisted authorization key for this data center, if
    /// one exists; without it, [`connect`] runs the key exchange through
    /// `authenticator` first.
    ///
    /// [`connect`]: Self::connect
    pub fn new(
        config: SenderConfig,
        auth_key: Option<[u8; 256]>,
        authenticator: Arc<dyn Authenticator<C>>,
    ) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                config,
                authenticator,
                auth: Mutex::new(AuthState {
                    key: auth_key,
                    time_offset: 0,
                }),
                session: Mutex::new(None),
                queue: MessagePacker::new(),
                tracker: Mutex::new(Tracker::new()),
                conn: Mutex::new(None),
                conn_info: Mutex::new(None),
                loop_handles: Mutex::new(Vec::new()),
                user_connected: AtomicBool::new(false),
                user_disconnected: AtomicBool::new(false),
                is_connecting: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    /// Open the session over `conn`.
    ///
    /// Retries per the configured policy, emitting
    /// [`SenderEvent::Disconnected`] after the first failed attempt and
    /// [`SenderEvent::Connected`] on success. Returns `Ok(false)` without
    /// doing anything when already connected and `force` is not set.
    pub async fn connect(&self, conn: C, force: bool) -> Result<bool, SenderError> {
        if self.inner.user_connected.load(Ordering::SeqCst) && !force {
            log::info!("User is already connected, not connecting again");
            return Ok(false);
        }
        if self.inner.is_connecting.swap(true, Ordering::SeqCst) {
            log::info!("Another connection attempt is already in progress");
            return Ok(false);
        }
        let result = SenderInner::connect_with_retries(&self.inner, Arc::new(conn)).await;
        self.inner.is_connecting.store(false, Ordering::SeqCst);
        result.map(|()| true)
    }

    /// Whether the session is currently usable for [`send`].
    ///
    /// [`send`]: Self::send
    pub fn is_connected(&self) -> bool {
        self.inner.user_connected.load(Ordering::SeqCst)
    }

    /// Submit a request.
    ///
    /// Fails synchronously when disconnected; otherwise returns a handle that
    /// resolves once the server answers (or the request fails at the protocol
    /// level).
    pub fn send<R: RemoteCall>(&self, request: &R) -> Result<PendingReply<R::Return>, RequestError> {
        if !self.is_connected() {
            return Err(RequestError::NotConnected);
        }
        let (state, rx) = RequestState::rpc(request.to_bytes());
        self.inner.queue.append(state);
        Ok(PendingReply::new(rx))
    }

    /// Close the session, rejecting all queued requests.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        if !inner.user_connected.load(Ordering::SeqCst) {
            log::info!("User is already disconnected");
            return;
        }
        log::info!("Disconnecting from DC {}...", inner.config.dc_id);
        inner.user_disconnected.store(true, Ordering::SeqCst);
        inner.user_connected.store(false, Ordering::SeqCst);

        inner.queue.reject_all();
        inner.queue.append_sentinel();

        let conn = inner.conn.lock().take();
        if let Some(conn) = conn {
            conn.disconnect().await;
        }

        let handles: Vec<_> = inner.loop_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        // Anything still awaiting a response observes a dropped channel.
        inner.tracker.lock().clear();
        *inner.session.lock() = None;
        inner.emit(SenderEvent::Disconnected);
    }
}

struct AuthState {
    key: Option<[u8; 256]>,
    time_offset: i32,
}

impl<C: Connection> SenderInner<C> {
    fn emit(&self, event: SenderEvent) {
        if let Some(events) = &self.config.events {
            let _ = events.send(event);
        }
    }

    // ── Connect ────────────────────────────────────────────────────────────

    async fn connect_with_retries(inner: &Arc<Self>, conn: Arc<C>) -> Result<(), SenderError> {
        *inner.conn_info.lock() = Some(conn.info().clone());
        inner.user_disconnected.store(false, Ordering::SeqCst);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let tried = match inner.config.connect_timeout {
                Some(limit) => match timeout(limit, Self::try_connect(inner, &conn)).await {
                    Ok(result) => result,
                    Err(_) => Err(SenderError::Timeout),
                },
                None => Self::try_connect(inner, &conn).await,
            };

            match tried {
                Ok(()) => break,
                Err(e) => {
                    log::warn!("Attempt {attempt} at connecting failed: {e}");
                    if attempt == 1 {
                        inner.emit(SenderEvent::Disconnected);
                    }
                    if let Some(max) = inner.config.retries {
                        if attempt >= max {
                            return Err(e);
                        }
                    }
                    sleep(inner.config.retry_delay).await;
                }
            }
        }

        inner.user_connected.store(true, Ordering::SeqCst);
        inner.reconnecting.store(false, Ordering::SeqCst);

        {
            let mut handles = inner.loop_handles.lock();
            handles.push(tokio::spawn(Self::send_loop(inner.clone(), conn.clone())));
            handles.push(tokio::spawn(Self::recv_loop(inner.clone(), conn.clone())));
        }
        *inner.conn.lock() = Some(conn);

        log::info!("Connection to DC {} complete!", inner.config.dc_id);
        inner.emit(SenderEvent::Connected);
        Ok(())
    }

    async fn try_connect(inner: &Arc<Self>, conn: &Arc<C>) -> Result<(), SenderError> {
        log::info!("Connecting to {}...", conn.info().address());
        conn.connect().await?;

        let (key, time_offset) = {
            let auth = inner.auth.lock();
            (auth.key, auth.time_offset)
        };

        match key {
            Some(key) => {
                let mut session = inner.session.lock();
                match session.as_mut() {
                    // Same key, new connection: only the session id rolls.
                    Some(session) => session.reset(),
                    None => {
                        *session = Some(
                            EncryptedSession::new(key, 0, time_offset)
                                .with_security_checks(inner.config.security_checks),
                        )
                    }
                }
            }
            None => {
                log::info!("New auth_key attempt...");
                let mut plain = PlainSender::new(conn.as_ref());
                let done = inner
                    .authenticator
                    .authenticate(&mut plain)
                    .await
                    .map_err(SenderError::Auth)?;
                {
                    let mut auth = inner.auth.lock();
                    auth.key = Some(done.auth_key);
                    auth.time_offset = done.time_offset;
                }
                *inner.session.lock() = Some(
                    EncryptedSession::new(done.auth_key, 0, done.time_offset)
                        .with_security_checks(inner.config.security_checks),
                );
                if let Some(hook) = &inner.config.auth_key_hook {
                    hook(&done.auth_key, inner.config.dc_id);
                }
            }
        }
        Ok(())
    }

    // ── Send loop ──────────────────────────────────────────────────────────

    async fn send_loop(inner: Arc<Self>, conn: Arc<C>) {
        loop {
            if !inner.user_connected.load(Ordering::SeqCst)
                || inner.reconnecting.load(Ordering::SeqCst)
            {
                break;
            }

            // Owed acknowledgements ride at the front of the next batch.
            let acks: Vec<i64> = {
                let mut tracker = inner.tracker.lock();
                tracker.pending_ack.drain(..).collect()
            };
            if !acks.is_empty() {
                log::debug!("Acknowledging {} message(s)", acks.len());
                inner
                    .queue
                    .append(RequestState::notification(
                        service::MsgsAck { msg_ids: acks }.to_bytes(),
                    ));
            }

            let Some(batch) = inner.queue.get(&inner.session).await else {
                // Shutdown sentinel; the loop condition decides what's next.
                continue;
            };

            let ciphertext = {
                let session = inner.session.lock();
                match session.as_ref() {
                    Some(session) => session.encrypt_message_data(&batch.data),
                    None => break,
                }
            };
            log::debug!(
                "Encrypting {} message(s) in {} bytes for sending",
                batch.states.len(),
                batch.data.len()
            );

            if let Err(e) = conn.send(&ciphertext).await {
                // The receive loop or the user will drive reconnection.
                log::warn!("Failed to send message: {e}");
                break;
            }

            let mut tracker = inner.tracker.lock();
            for state in batch.states {
                if state.is_ack() {
                    tracker.push_last_ack(state);
                } else if state.expects_reply() {
                    tracker.pending.insert(state.msg_id, state);
                }
                // Remaining notifications are fire-and-forget.
            }
        }
        log::debug!("Send loop exiting");
    }

    // ── Receive loop ───────────────────────────────────────────────────────

    async fn recv_loop(inner: Arc<Self>, conn: Arc<C>) {
        loop {
            if inner.reconnecting.load(Ordering::SeqCst) {
                break;
            }

            let frame = match conn.recv().await {
                Ok(frame) => frame,
                Err(e) => {
                    if inner.user_disconnected.load(Ordering::SeqCst) {
                        log::debug!("Connection closed by the user");
                    } else {
                        log::warn!("Connection closed while receiving data: {e}");
                        Self::start_reconnect(&inner);
                    }
                    break;
                }
            };
            log::debug!("Handling {} bytes of incoming data", frame.len());

            let decrypted = {
                let session = inner.session.lock();
                match session.as_ref() {
                    Some(session) => session.decrypt_message_data(frame),
                    None => break,
                }
            };

            match decrypted {
                Ok(message) => {
                    if let Err(e) = inner.process_message(message.msg_id, &message.body) {
                        // Unknown constructor in the stream; its bytes are
                        // skippable and the frame boundary keeps us in sync.
                        log::info!("Dropping unparsable message: {e}");
                    }
                }
                Err(DecryptError::Security(kind)) => {
                    log::warn!("Security error while unpacking a received message: {kind}");
                    continue;
                }
                Err(DecryptError::InvalidBuffer { code: 404 }) => {
                    if inner.config.is_main_sender {
                        log::error!(
                            "Server does not know about the current auth key; the session may need to be recreated"
                        );
                        inner.emit(SenderEvent::Broken);
                    } else {
                        log::warn!(
                            "Server does not know about the current auth key of DC {}",
                            inner.config.dc_id
                        );
                        if let Some(hook) = &inner.config.on_connection_break {
                            hook(inner.config.dc_id);
                        }
                    }
                    break;
                }
                Err(DecryptError::InvalidBuffer { code }) => {
                    log::warn!("Invalid buffer (code {code}); reconnecting");
                    Self::start_reconnect(&inner);
                    break;
                }
            }
        }
        log::debug!("Receive loop exiting");
    }

    // ── Reconnect ──────────────────────────────────────────────────────────

    fn start_reconnect(inner: &Arc<Self>) {
        if inner.user_disconnected.load(Ordering::SeqCst) {
            return;
        }
        if inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        if !inner.config.auto_reconnect {
            log::warn!("Connection lost and automatic reconnection is disabled");
            inner.reconnecting.store(false, Ordering::SeqCst);
            inner.user_connected.store(false, Ordering::SeqCst);
            inner.queue.reject_all();
            inner.queue.append_sentinel();
            let mut tracker = inner.tracker.lock();
            for (_, mut state) in tracker.pending.drain() {
                state.reject(RequestError::Disconnected);
            }
            drop(tracker);
            inner.emit(SenderEvent::Disconnected);
            return;
        }

        let inner = inner.clone();
        tokio::spawn(async move {
            Self::reconnect(&inner).await;
        });
    }

    async fn reconnect(inner: &Arc<Self>) {
        log::info!("Closing current connection to begin reconnect...");
        sleep(RECONNECT_BACKOFF).await;

        let conn = inner.conn.lock().take();
        if let Some(conn) = conn {
            conn.disconnect().await;
        }
        inner.queue.append_sentinel();
        let handles: Vec<_> = inner.loop_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        inner.reconnecting.store(false, Ordering::SeqCst);

        let info = inner.conn_info.lock().clone();
        let Some(info) = info else {
            log::warn!("No connection information available, cannot reconnect");
            return;
        };

        let conn = Arc::new(C::create(info));
        match Self::connect_with_retries(inner, conn).await {
            Ok(()) => {
                // Everything that was in flight goes back out, oldest first.
                let mut states: Vec<RequestState> = {
                    let mut tracker = inner.tracker.lock();
                    tracker.pending.drain().map(|(_, state)| state).collect()
                };
                states.sort_unstable_by_key(|state| state.msg_id);
                if !states.is_empty() {
                    log::debug!("Resending {} request(s) after reconnect", states.len());
                }
                inner.queue.extend(states);
                if let Some(hook) = &inner.config.auto_reconnect_hook {
                    hook();
                }
            }
            Err(e) => {
                log::error!("Failed to reconnect: {e}");
                inner.user_connected.store(false, Ordering::SeqCst);
                inner.queue.reject_all();
                let mut tracker = inner.tracker.lock();
                for (_, mut state) in tracker.pending.drain() {
                    state.reject(RequestError::Disconnected);
                }
                drop(tracker);
                inner.emit(SenderEvent::Disconnected);
            }
        }
    }

    // ── Dispatch ───────────────────────────────────────────────────────────

    /// Dispatch one decoded message. `msg_id` is the id of the envelope the
    /// body arrived in (inner container messages carry their own).
    fn process_message(
        &self,
        msg_id: i64,
        body: &[u8],
    ) -> Result<(), courier_tl_types::deserialize::Error> {
        self.tracker.lock().note_pending_ack(msg_id);

        match ServiceMessage::from_bytes(body)? {
            ServiceMessage::RpcResult(result) => self.handle_rpc_result(result),
            ServiceMessage::Container(container) => {
                for message in container.messages {
                    if let Err(e) = self.process_message(message.msg_id, &message.body) {
                        log::info!("Dropping unparsable container message: {e}");
                    }
                }
            }
            ServiceMessage::Gzip(packed) => match gunzip(&packed.packed_data) {
                Ok(data) => self.process_message(msg_id, &data)?,
                Err(e) => log::warn!("Failed to decompress message: {e}"),
            },
            ServiceMessage::Pong(pong) => self.handle_pong(pong, body),
            ServiceMessage::BadServerSalt(salt) => self.handle_bad_server_salt(salt),
            ServiceMessage::BadMsgNotification(bad) => self.handle_bad_notification(bad, msg_id),
            ServiceMessage::NewSessionCreated(new_session) => {
                self.handle_new_session_created(new_session)
            }
            ServiceMessage::Ack(ack) => self.handle_ack(ack),
            ServiceMessage::DetailedInfo(info) => {
                // The answer is what actually needs acknowledging.
                self.tracker.lock().note_pending_ack(info.answer_msg_id);
            }
            ServiceMessage::NewDetailedInfo(info) => {
                self.tracker.lock().note_pending_ack(info.answer_msg_id);
            }
            ServiceMessage::FutureSalts(salts) => self.handle_future_salts(salts, msg_id, body),
            ServiceMessage::StateReq(req) => self.handle_state_forgotten(msg_id, &req.msg_ids),
            ServiceMessage::ResendReq(req) => self.handle_state_forgotten(msg_id, &req.msg_ids),
            ServiceMessage::AllInfo(_) => {
                // Purely informational.
            }
            ServiceMessage::Update(update) => self.emit(SenderEvent::Update(update)),
        }
        Ok(())
    }

    fn handle_rpc_result(&self, result: service::RpcResult) {
        let service::RpcResult { req_msg_id, body } = result;
        log::debug!("Handling RPC result for message {req_msg_id}");

        let state = self.tracker.lock().pending.remove(&req_msg_id);
        let Some(mut state) = state else {
            match constructor_id(&body) {
                // A stray download chunk whose request was dropped; the data
                // is useless without its owner but harmless.
                Some(service::UPLOAD_FILE_ID) | Some(service::UPLOAD_FILE_CDN_REDIRECT_ID) => {}
                _ => log::info!("Received response without parent request: {req_msg_id}"),
            }
            return;
        };

        match constructor_id(&body) {
            Some(id) if id == service::RpcError::CONSTRUCTOR_ID => {
                match service::RpcError::from_bytes(&body) {
                    Ok(reply) => {
                        // The error still answers the request; ack it.
                        self.queue.append(RequestState::notification(
                            service::MsgsAck {
                                msg_ids: vec![state.msg_id],
                            }
                            .to_bytes(),
                        ));
                        state.reject(RequestError::Rpc(RpcError::from_wire(
                            reply.error_code,
                            &reply.error_message,
                        )));
                    }
                    Err(e) => state.reject(RequestError::from(e)),
                }
            }
            Some(id) if id == service::GzipPacked::CONSTRUCTOR_ID => {
                match service::GzipPacked::from_bytes(&body)
                    .map_err(RequestError::from)
                    .and_then(|packed| {
                        gunzip(&packed.packed_data)
                            .map_err(|e| RequestError::Deserialize(e.to_string()))
                    }) {
                    Ok(data) => state.resolve(data),
                    Err(e) => state.reject(e),
                }
            }
            _ => state.resolve(body),
        }
    }

    fn handle_pong(&self, pong: service::Pong, raw: &[u8]) {
        log::debug!("Handling pong for message {}", pong.msg_id);
        let state = self.tracker.lock().pending.remove(&pong.msg_id);
        if let Some(mut state) = state {
            state.resolve(raw.to_vec());
        }
    }

    fn handle_bad_server_salt(&self, salt: service::BadServerSalt) {
        log::debug!("Handling bad salt for message {}", salt.bad_msg_id);
        {
            let mut session = self.session.lock();
            if let Some(session) = session.as_mut() {
                session.salt = salt.new_server_salt;
            }
        }
        // The new salt must be installed before anything is resent.
        let states = self.tracker.lock().pop_states(salt.bad_msg_id);
        if states.is_empty() {
            log::info!("Received bad salt for unknown message {}", salt.bad_msg_id);
        }
        self.queue.extend(states);
    }

    fn handle_bad_notification(&self, bad: service::BadMsgNotification, envelope_msg_id: i64) {
        log::debug!(
            "Handling bad message {} (code {})",
            bad.bad_msg_id,
            bad.error_code
        );

        match bad.error_code {
            16 | 17 => {
                // Our clock disagrees with the server's; the envelope's id
                // is a trustworthy sample of the correct time.
                let offset = {
                    let mut session = self.session.lock();
                    session
                        .as_mut()
                        .map(|session| session.update_time_offset(envelope_msg_id))
                };
                if let Some(offset) = offset {
                    log::info!("System clock is wrong, time offset updated to {offset}s");
                }
            }
            32 => {
                let mut session = self.session.lock();
                if let Some(session) = session.as_mut() {
                    session.adjust_sequence(64);
                }
            }
            33 => {
                let mut session = self.session.lock();
                if let Some(session) = session.as_mut() {
                    session.adjust_sequence(-16);
                }
            }
            code => {
                for mut state in self.tracker.lock().pop_states(bad.bad_msg_id) {
                    state.reject(RequestError::BadMessage { code });
                }
                return;
            }
        }

        let states = self.tracker.lock().pop_states(bad.bad_msg_id);
        log::debug!("Resending {} request(s) after bad message", states.len());
        self.queue.extend(states);
    }

    fn handle_new_session_created(&self, new_session: service::NewSessionCreated) {
        log::debug!("Handling new session created");
        let mut session = self.session.lock();
        if let Some(session) = session.as_mut() {
            session.salt = new_session.server_salt;
        }
    }

    fn handle_ack(&self, ack: service::MsgsAck) {
        // Acknowledgements are informational, with one exception: a log-out
        // request never gets an rpc_result, its ack is the reply.
        let mut resolved = Vec::new();
        {
            let mut tracker = self.tracker.lock();
            for msg_id in &ack.msg_ids {
                if tracker
                    .pending
                    .get(msg_id)
                    .map_or(false, |state| state.is_log_out())
                {
                    if let Some(state) = tracker.pending.remove(msg_id) {
                        resolved.push(state);
                    }
                }
            }
        }
        for mut state in resolved {
            state.resolve(true.to_bytes());
        }
    }

    fn handle_future_salts(&self, salts: service::FutureSalts, msg_id: i64, raw: &[u8]) {
        log::debug!("Handling future salts for message {}", salts.req_msg_id);
        let state = self.tracker.lock().pending.remove(&msg_id);
        if let Some(mut state) = state {
            state.resolve(raw.to_vec());
        }
    }

    fn handle_state_forgotten(&self, envelope_msg_id: i64, msg_ids: &[i64]) {
        // One status byte per asked-about message: 0x01, "nothing known".
        self.queue.append(RequestState::notification(
            service::MsgsStateInfo {
                req_msg_id: envelope_msg_id,
                info: vec![0x01; msg_ids.len()],
            }
            .to_bytes(),
        ));
    }
}

fn constructor_id(body: &[u8]) -> Option<u32> {
    body.get(..4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Inflate a `gzip_packed` payload. Some servers emit raw zlib streams, so
/// both framings are attempted, gzip first.
fn gunzip(data: &[u8]) -> io::Result<Vec<u8>> {
    use std::io::Read;

    let mut out = Vec::new();
    if flate2::read::GzDecoder::new(data)
        .read_to_end(&mut out)
        .is_ok()
        && !out.is_empty()
    {
        return Ok(out);
    }
    out.clear();
    flate2::read::ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}
