//! Full-sender scenarios over an in-memory transport.
//!
//! A [`MockConnection`] pops endpoint pairs from a per-address registry, so a
//! reconnecting sender transparently picks up the next pair. The
//! [`TestServer`] half speaks real MTProto: it decrypts client frames with
//! the server-role crypto and forges encrypted pushes back.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use courier_crypto::{decrypt_client_data_v2, encrypt_server_data_v2, AuthKey};
use courier_sender::{
    AuthDone, AuthError, Authenticator, Connection, ConnectionInfo, PendingReply, PlainSender,
    RequestError, Sender, SenderConfig, SenderEvent,
};
use courier_tl_types::service::{
    self, FutureSalts, GetFutureSalts, LogOut, MessageContainer, MsgsAck, MsgsStateInfo, Ping,
    Pong,
};
use courier_tl_types::{Deserializable, Identifiable, Serializable};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{sleep, timeout};

const AUTH_KEY: [u8; 256] = [0x6B; 256];
const DC_ID: i32 = 2;

// ─── In-memory transport ─────────────────────────────────────────────────────

struct Wire {
    to_server: mpsc::UnboundedSender<Vec<u8>>,
    from_server: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    send_gate: Option<Arc<Semaphore>>,
    closed: watch::Sender<bool>,
}

#[derive(Default)]
struct Registry {
    wires: HashMap<String, VecDeque<Arc<Wire>>>,
    connects: HashMap<String, usize>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

struct MockConnection {
    info: ConnectionInfo,
    wire: OnceLock<Arc<Wire>>,
}

#[async_trait]
impl Connection for MockConnection {
    fn create(info: ConnectionInfo) -> Self {
        Self {
            info,
            wire: OnceLock::new(),
        }
    }

    async fn connect(&self) -> io::Result<()> {
        let mut registry = registry().lock().unwrap();
        *registry.connects.entry(self.info.ip.clone()).or_default() += 1;
        let wire = registry
            .wires
            .get_mut(&self.info.ip)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "no endpoint registered")
            })?;
        let _ = self.wire.set(wire);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> io::Result<()> {
        let wire = self.wire.get().ok_or_else(not_connected)?;
        if let Some(gate) = &wire.send_gate {
            let mut closed = wire.closed.subscribe();
            tokio::select! {
                permit = gate.acquire() => permit.unwrap().forget(),
                _ = closed.changed() => return Err(aborted()),
            }
        }
        if *wire.closed.subscribe().borrow() {
            return Err(aborted());
        }
        wire.to_server
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server hung up"))
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        let wire = self.wire.get().ok_or_else(not_connected)?;
        let mut closed = wire.closed.subscribe();
        if *closed.borrow() {
            return Err(aborted());
        }
        let mut rx = wire.from_server.lock().await;
        tokio::select! {
            frame = rx.recv() => {
                frame.ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "server hung up"))
            }
            _ = closed.changed() => Err(aborted()),
        }
    }

    async fn disconnect(&self) {
        if let Some(wire) = self.wire.get() {
            wire.closed.send_replace(true);
        }
    }

    fn info(&self) -> &ConnectionInfo {
        &self.info
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "not connected")
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

// ─── Server harness ──────────────────────────────────────────────────────────

struct ClientMessage {
    msg_id: i64,
    body: Vec<u8>,
}

struct ClientFrame {
    salt: i64,
    messages: Vec<ClientMessage>,
}

struct TestServer {
    key: AuthKey,
    to_client: mpsc::UnboundedSender<Vec<u8>>,
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    session_id: i64,
    next_msg_id: i64,
}

impl TestServer {
    /// Register a fresh endpoint pair under `address` and return its server
    /// half.
    fn listen(address: &str, send_gate: Option<Arc<Semaphore>>) -> Self {
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        registry()
            .lock()
            .unwrap()
            .wires
            .entry(address.to_string())
            .or_default()
            .push_back(Arc::new(Wire {
                to_server,
                from_server: tokio::sync::Mutex::new(from_server),
                send_gate,
                closed,
            }));

        Self {
            key: AuthKey::from_bytes(AUTH_KEY),
            to_client,
            from_client,
            session_id: 0,
            next_msg_id: 0x5000_0000_0000_0000,
        }
    }

    /// Receive and decrypt the next client frame, unpacking containers.
    async fn recv_frame(&mut self) -> ClientFrame {
        let mut frame = timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the connection");
        let plain = decrypt_client_data_v2(&mut frame, &self.key).expect("client frame decrypt");

        let salt = i64::from_le_bytes(plain[..8].try_into().unwrap());
        self.session_id = i64::from_le_bytes(plain[8..16].try_into().unwrap());
        let msg_id = i64::from_le_bytes(plain[16..24].try_into().unwrap());
        let length = u32::from_le_bytes(plain[28..32].try_into().unwrap()) as usize;
        let body = &plain[32..32 + length];

        let messages = if body.len() >= 4
            && body[..4] == MessageContainer::CONSTRUCTOR_ID.to_le_bytes()
        {
            let count = u32::from_le_bytes(body[4..8].try_into().unwrap()) as usize;
            let mut messages = Vec::with_capacity(count);
            let mut at = 8;
            for _ in 0..count {
                let inner_id = i64::from_le_bytes(body[at..at + 8].try_into().unwrap());
                let inner_len =
                    u32::from_le_bytes(body[at + 12..at + 16].try_into().unwrap()) as usize;
                at += 16;
                messages.push(ClientMessage {
                    msg_id: inner_id,
                    body: body[at..at + inner_len].to_vec(),
                });
                at += inner_len;
            }
            messages
        } else {
            vec![ClientMessage {
                msg_id,
                body: body.to_vec(),
            }]
        };

        ClientFrame { salt, messages }
    }

    /// Keep receiving frames until `count` messages with `constructor` were
    /// collected; other messages (acks etc.) are skipped. Also returns the
    /// salt of the frame that completed the collection.
    async fn collect(&mut self, constructor: u32, count: usize) -> (Vec<ClientMessage>, ClientFrame) {
        let mut found = Vec::new();
        loop {
            let frame = self.recv_frame().await;
            let salt = frame.salt;
            for message in frame.messages {
                if message.body.len() >= 4
                    && message.body[..4] == constructor.to_le_bytes()
                {
                    found.push(message);
                }
            }
            if found.len() >= count {
                return (
                    found,
                    ClientFrame {
                        salt,
                        messages: Vec::new(),
                    },
                );
            }
        }
    }

    /// Encrypt and push a server message, returning the msg id it was
    /// assigned.
    fn push(&mut self, body: &[u8]) -> i64 {
        self.next_msg_id += 16;
        let msg_id = self.next_msg_id | 1;
        self.push_with_id(msg_id, body);
        msg_id
    }

    /// Like [`push`] but with an explicit envelope msg id.
    ///
    /// [`push`]: Self::push
    fn push_with_id(&mut self, msg_id: i64, body: &[u8]) {
        let mut plain = Vec::with_capacity(32 + body.len());
        plain.extend_from_slice(&0i64.to_le_bytes());
        plain.extend_from_slice(&self.session_id.to_le_bytes());
        plain.extend_from_slice(&msg_id.to_le_bytes());
        plain.extend_from_slice(&1i32.to_le_bytes());
        plain.extend_from_slice(&(body.len() as i32).to_le_bytes());
        plain.extend_from_slice(body);

        let _ = self.to_client.send(encrypt_server_data_v2(&plain, &self.key));
    }

    /// Push an unencrypted frame, e.g. a bare protocol error code.
    fn push_raw(&self, frame: Vec<u8>) {
        let _ = self.to_client.send(frame);
    }

    /// Assert the client stays quiet for `ms` milliseconds.
    async fn expect_silence(&mut self, ms: u64) {
        if timeout(Duration::from_millis(ms), self.from_client.recv())
            .await
            .is_ok()
        {
            panic!("expected no client frames");
        }
    }
}

// ─── Authenticators ──────────────────────────────────────────────────────────

/// Used when a persisted key is installed and the handshake must never run.
struct NullAuthenticator;

#[async_trait]
impl Authenticator<MockConnection> for NullAuthenticator {
    async fn authenticate(
        &self,
        _plain: &mut PlainSender<'_, MockConnection>,
    ) -> Result<AuthDone, AuthError> {
        Err(AuthError::Protocol("no authenticator installed"))
    }
}

/// Hands out a fixed key as if a DH exchange had completed.
struct StubAuthenticator;

#[async_trait]
impl Authenticator<MockConnection> for StubAuthenticator {
    async fn authenticate(
        &self,
        _plain: &mut PlainSender<'_, MockConnection>,
    ) -> Result<AuthDone, AuthError> {
        Ok(AuthDone {
            auth_key: AUTH_KEY,
            time_offset: 0,
        })
    }
}

// ─── Setup helpers ───────────────────────────────────────────────────────────

fn base_config(events: mpsc::UnboundedSender<SenderEvent>) -> SenderConfig {
    let mut config = SenderConfig::new(DC_ID);
    config.retries = Some(3);
    config.retry_delay = Duration::from_millis(50);
    config.events = Some(events);
    config
}

async fn connect_sender(
    address: &str,
) -> (
    Sender<MockConnection>,
    TestServer,
    mpsc::UnboundedReceiver<SenderEvent>,
) {
    let server = TestServer::listen(address, None);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let sender = Sender::new(
        base_config(events_tx),
        Some(AUTH_KEY),
        Arc::new(NullAuthenticator),
    );
    let conn = MockConnection::create(ConnectionInfo::new(address, 443, DC_ID));
    assert!(sender.connect(conn, false).await.unwrap());
    (sender, server, events_rx)
}

fn ping_id_of(body: &[u8]) -> Option<i64> {
    (body.len() == 12 && body[..4] == Ping::CONSTRUCTOR_ID.to_le_bytes())
        .then(|| i64::from_le_bytes(body[4..12].try_into().unwrap()))
}

async fn expect_pending<T: Deserializable + Unpin>(reply: &mut PendingReply<T>) {
    assert!(
        timeout(Duration::from_millis(100), reply).await.is_err(),
        "reply should still be pending"
    );
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn rpc_round_trip_resolves_pong() {
    let (sender, mut server, mut events) = connect_sender("s1-round-trip").await;
    assert_eq!(events.recv().await, Some(SenderEvent::Connected));

    let reply = sender.send(&Ping { ping_id: 7 }).unwrap();

    let frame = server.recv_frame().await;
    assert_eq!(frame.messages.len(), 1);
    let ping_msg_id = frame.messages[0].msg_id;
    assert_eq!(ping_id_of(&frame.messages[0].body), Some(7));

    let pong_msg_id = server.push(
        &Pong {
            msg_id: ping_msg_id,
            ping_id: 7,
        }
        .to_bytes(),
    );

    let pong = reply.await.unwrap();
    assert_eq!(pong.ping_id, 7);
    assert_eq!(pong.msg_id, ping_msg_id);

    // The server's message is acknowledged on the next send-loop pass.
    let _ = sender.send(&Ping { ping_id: 8 }).unwrap();
    let (acks, _) = server.collect(MsgsAck::CONSTRUCTOR_ID, 1).await;
    let ack = MsgsAck::from_bytes(&acks[0].body).unwrap();
    assert!(ack.msg_ids.contains(&pong_msg_id));
}

#[tokio::test]
async fn rpc_error_rejects_the_caller() {
    let (sender, mut server, _events) = connect_sender("s1-rpc-error").await;

    let reply = sender.send(&GetFutureSalts { num: 1 }).unwrap();
    let frame = server.recv_frame().await;
    let req_msg_id = frame.messages[0].msg_id;

    let mut rpc_result = Vec::new();
    service::RpcResult::CONSTRUCTOR_ID.serialize(&mut rpc_result);
    req_msg_id.serialize(&mut rpc_result);
    service::RpcError::CONSTRUCTOR_ID.serialize(&mut rpc_result);
    420i32.serialize(&mut rpc_result);
    "FLOOD_WAIT_30".to_string().serialize(&mut rpc_result);
    server.push(&rpc_result);

    match reply.await {
        Err(RequestError::Rpc(e)) => {
            assert_eq!(e.code, 420);
            assert_eq!(e.name, "FLOOD_WAIT");
            assert_eq!(e.value, Some(30));
        }
        other => panic!("expected an RPC error, got {other:?}"),
    }

    // The failed request is still acknowledged.
    let (acks, _) = server.collect(MsgsAck::CONSTRUCTOR_ID, 1).await;
    let ack = MsgsAck::from_bytes(&acks[0].body).unwrap();
    assert!(ack.msg_ids.contains(&req_msg_id));
}

#[tokio::test]
async fn queued_requests_share_one_container_frame() {
    let address = "s2-container";
    let gate = Arc::new(Semaphore::new(0));
    let mut server = TestServer::listen(address, Some(gate.clone()));

    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let sender = Sender::new(
        base_config(events_tx),
        Some(AUTH_KEY),
        Arc::new(NullAuthenticator),
    );
    let conn = MockConnection::create(ConnectionInfo::new(address, 443, DC_ID));
    assert!(sender.connect(conn, false).await.unwrap());

    // First ping gets stuck in the gated transport write...
    let _r1 = sender.send(&Ping { ping_id: 1 }).unwrap();
    sleep(Duration::from_millis(100)).await;
    // ...while two more pile up in the queue.
    let _r2 = sender.send(&Ping { ping_id: 2 }).unwrap();
    let _r3 = sender.send(&Ping { ping_id: 3 }).unwrap();
    sleep(Duration::from_millis(100)).await;
    gate.add_permits(2);

    let first = server.recv_frame().await;
    assert_eq!(first.messages.len(), 1);
    assert_eq!(ping_id_of(&first.messages[0].body), Some(1));

    // One transport write carries both queued pings in a container.
    let second = server.recv_frame().await;
    assert_eq!(second.messages.len(), 2);
    assert_eq!(ping_id_of(&second.messages[0].body), Some(2));
    assert_eq!(ping_id_of(&second.messages[1].body), Some(3));

    let mut ids: Vec<i64> = first
        .messages
        .iter()
        .chain(second.messages.iter())
        .map(|m| m.msg_id)
        .collect();
    let sorted = ids.clone();
    ids.dedup();
    assert_eq!(ids.len(), 3, "message ids are distinct");
    assert!(
        sorted.windows(2).all(|w| w[0] < w[1]),
        "message ids increase in send order"
    );
}

#[tokio::test]
async fn bad_server_salt_installs_salt_and_resends() {
    let (sender, mut server, _events) = connect_sender("s3-bad-salt").await;

    let mut reply = sender.send(&Ping { ping_id: 42 }).unwrap();
    let frame = server.recv_frame().await;
    let old_msg_id = frame.messages[0].msg_id;

    server.push(
        &service::BadServerSalt {
            bad_msg_id: old_msg_id,
            bad_msg_seqno: 0,
            error_code: 48,
            new_server_salt: 0xDEADBEEF,
        }
        .to_bytes(),
    );

    // The request is resent with the new salt and a fresh msg id.
    let (pings, frame) = server.collect(Ping::CONSTRUCTOR_ID, 1).await;
    assert_eq!(ping_id_of(&pings[0].body), Some(42));
    assert_ne!(pings[0].msg_id, old_msg_id);
    assert_eq!(frame.salt, 0xDEADBEEF);

    // Still unanswered as far as the caller is concerned.
    expect_pending(&mut reply).await;

    server.push(
        &Pong {
            msg_id: pings[0].msg_id,
            ping_id: 42,
        }
        .to_bytes(),
    );
    assert_eq!(reply.await.unwrap().ping_id, 42);
}

#[tokio::test]
async fn bad_msg_code_48_rejects_without_resend() {
    let (sender, mut server, _events) = connect_sender("s4-bad-msg").await;

    let reply = sender.send(&Ping { ping_id: 9 }).unwrap();
    let frame = server.recv_frame().await;

    server.push(
        &service::BadMsgNotification {
            bad_msg_id: frame.messages[0].msg_id,
            bad_msg_seqno: 0,
            error_code: 48,
        }
        .to_bytes(),
    );

    match reply.await {
        Err(RequestError::BadMessage { code: 48 }) => {}
        other => panic!("expected BadMessage(48), got {other:?}"),
    }
    server.expect_silence(150).await;
}

#[tokio::test]
async fn bad_msg_code_16_corrects_clock_and_resends() {
    let (sender, mut server, _events) = connect_sender("s4-bad-msg-16").await;

    let mut reply = sender.send(&Ping { ping_id: 16 }).unwrap();
    let frame = server.recv_frame().await;
    let old_msg_id = frame.messages[0].msg_id;

    // Pretend the server clock runs five minutes ahead; its envelope id
    // carries the correct time.
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let server_msg_id = ((now + 300) << 32) | 1;
    server.push_with_id(
        server_msg_id,
        &service::BadMsgNotification {
            bad_msg_id: old_msg_id,
            bad_msg_seqno: 0,
            error_code: 16,
        }
        .to_bytes(),
    );

    let (pings, _) = server.collect(Ping::CONSTRUCTOR_ID, 1).await;
    assert_eq!(ping_id_of(&pings[0].body), Some(16));
    assert_ne!(pings[0].msg_id, old_msg_id);
    let resent_secs = pings[0].msg_id >> 32;
    assert!(
        resent_secs >= now + 295,
        "resent id {resent_secs} must be anchored to the corrected clock"
    );

    expect_pending(&mut reply).await;
}

#[tokio::test]
async fn auth_key_404_on_non_main_sender_breaks_quietly() {
    let address = "s5-broken-aux";
    let server = TestServer::listen(address, None);

    let breaks: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut config = base_config(events_tx);
    config.is_main_sender = false;
    config.on_connection_break = Some({
        let breaks = breaks.clone();
        Arc::new(move |dc_id| breaks.lock().unwrap().push(dc_id))
    });

    let sender = Sender::new(config, Some(AUTH_KEY), Arc::new(NullAuthenticator));
    let conn = MockConnection::create(ConnectionInfo::new(address, 443, DC_ID));
    assert!(sender.connect(conn, false).await.unwrap());

    server.push_raw((-404i32).to_le_bytes().to_vec());

    // Give any (wrong) reconnect attempt time to show up past the backoff.
    sleep(Duration::from_millis(1300)).await;

    assert_eq!(*breaks.lock().unwrap(), vec![DC_ID]);
    assert_eq!(
        registry().lock().unwrap().connects.get(address),
        Some(&1),
        "no reconnect may be scheduled"
    );
    assert_eq!(events_rx.try_recv(), Ok(SenderEvent::Connected));
    assert!(
        events_rx.try_recv().is_err(),
        "no Broken event for an auxiliary sender"
    );
}

#[tokio::test]
async fn auth_key_404_on_main_sender_reports_broken() {
    let address = "s5-broken-main";
    let server = TestServer::listen(address, None);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let sender = Sender::new(
        base_config(events_tx),
        Some(AUTH_KEY),
        Arc::new(NullAuthenticator),
    );
    let conn = MockConnection::create(ConnectionInfo::new(address, 443, DC_ID));
    assert!(sender.connect(conn, false).await.unwrap());

    server.push_raw((-404i32).to_le_bytes().to_vec());

    assert_eq!(events_rx.recv().await, Some(SenderEvent::Connected));
    let broken = timeout(Duration::from_secs(2), events_rx.recv())
        .await
        .expect("no Broken event arrived");
    assert_eq!(broken, Some(SenderEvent::Broken));
}

#[tokio::test]
async fn involuntary_disconnect_resends_pending_requests() {
    let address = "s6-reconnect";
    let mut server = TestServer::listen(address, None);
    let server2 = TestServer::listen(address, None);

    let reconnects = Arc::new(AtomicUsize::new(0));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut config = base_config(events_tx);
    config.auto_reconnect_hook = Some({
        let reconnects = reconnects.clone();
        Arc::new(move || {
            reconnects.fetch_add(1, Ordering::SeqCst);
        })
    });

    let sender = Sender::new(config, Some(AUTH_KEY), Arc::new(NullAuthenticator));
    let conn = MockConnection::create(ConnectionInfo::new(address, 443, DC_ID));
    assert!(sender.connect(conn, false).await.unwrap());

    let _a = sender.send(&Ping { ping_id: 1 }).unwrap();
    let _b = sender.send(&Ping { ping_id: 2 }).unwrap();
    let _c = sender.send(&Ping { ping_id: 3 }).unwrap();

    // Make sure all three made it onto the wire (into pending state).
    let (sent, _) = server.collect(Ping::CONSTRUCTOR_ID, 3).await;
    let old_ids: Vec<i64> = sent.iter().map(|m| m.msg_id).collect();

    // Kill the connection server-side.
    drop(server);

    // After the backoff the sender comes back on the next endpoint and
    // resends everything, in submission order.
    let mut server2 = server2;
    let (resent, _) = server2.collect(Ping::CONSTRUCTOR_ID, 3).await;
    let resent_pings: Vec<i64> = resent
        .iter()
        .filter_map(|m| ping_id_of(&m.body))
        .collect();
    assert_eq!(resent_pings, vec![1, 2, 3]);
    for message in &resent {
        assert!(!old_ids.contains(&message.msg_id), "ids must be fresh");
    }

    assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    assert!(sender.is_connected());
    assert_eq!(events_rx.recv().await, Some(SenderEvent::Connected));
    let reconnected = timeout(Duration::from_secs(2), events_rx.recv())
        .await
        .expect("no second Connected event arrived");
    assert_eq!(
        reconnected,
        Some(SenderEvent::Connected),
        "a second Connected event marks the reconnect"
    );
}

#[tokio::test]
async fn user_disconnect_rejects_queued_and_inflight_requests() {
    let address = "disconnect-rejects";
    let gate = Arc::new(Semaphore::new(0));
    let _server = TestServer::listen(address, Some(gate));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let sender = Sender::new(
        base_config(events_tx),
        Some(AUTH_KEY),
        Arc::new(NullAuthenticator),
    );
    let conn = MockConnection::create(ConnectionInfo::new(address, 443, DC_ID));
    assert!(sender.connect(conn, false).await.unwrap());

    // First request gets packed and stuck in the transport write.
    let in_flight = sender.send(&Ping { ping_id: 1 }).unwrap();
    sleep(Duration::from_millis(100)).await;
    // Second request never leaves the queue.
    let queued = sender.send(&Ping { ping_id: 2 }).unwrap();

    sender.disconnect().await;

    assert!(matches!(in_flight.await, Err(RequestError::Dropped)));
    assert!(matches!(queued.await, Err(RequestError::Disconnected)));
    assert!(!sender.is_connected());
    assert!(matches!(
        sender.send(&Ping { ping_id: 3 }),
        Err(RequestError::NotConnected)
    ));

    assert_eq!(events_rx.try_recv(), Ok(SenderEvent::Connected));
    assert_eq!(events_rx.try_recv(), Ok(SenderEvent::Disconnected));
}

#[tokio::test]
async fn log_out_is_resolved_by_its_ack() {
    let (sender, mut server, _events) = connect_sender("logout-ack").await;

    let reply = sender.send(&LogOut).unwrap();
    let frame = server.recv_frame().await;
    assert_eq!(
        &frame.messages[0].body[..4],
        &LogOut::CONSTRUCTOR_ID.to_le_bytes()
    );

    server.push(
        &MsgsAck {
            msg_ids: vec![frame.messages[0].msg_id],
        }
        .to_bytes(),
    );

    assert!(reply.await.unwrap());
}

#[tokio::test]
async fn state_request_is_answered_with_one_byte_per_id() {
    let (sender, mut server, _events) = connect_sender("state-req").await;

    // Reveal the session to the server first.
    let _ = sender.send(&Ping { ping_id: 1 }).unwrap();
    server.recv_frame().await;

    let req_msg_id = server.push(
        &service::MsgsStateReq {
            msg_ids: vec![101, 102, 103],
        }
        .to_bytes(),
    );

    let (infos, _) = server.collect(MsgsStateInfo::CONSTRUCTOR_ID, 1).await;
    let info = MsgsStateInfo::from_bytes(&infos[0].body).unwrap();
    assert_eq!(info.req_msg_id, req_msg_id);
    assert_eq!(info.info, vec![0x01, 0x01, 0x01]);
}

#[tokio::test]
async fn new_session_created_installs_the_salt() {
    let (sender, mut server, _events) = connect_sender("new-session-salt").await;

    let _ = sender.send(&Ping { ping_id: 1 }).unwrap();
    server.recv_frame().await;

    server.push(
        &service::NewSessionCreated {
            first_msg_id: 0,
            unique_id: 1,
            server_salt: 0x1234_5678,
        }
        .to_bytes(),
    );
    sleep(Duration::from_millis(100)).await;

    let _ = sender.send(&Ping { ping_id: 2 }).unwrap();
    let (_, frame) = server.collect(Ping::CONSTRUCTOR_ID, 1).await;
    assert_eq!(frame.salt, 0x1234_5678);
}

#[tokio::test]
async fn updates_are_forwarded_raw() {
    let (sender, mut server, mut events) = connect_sender("update-forward").await;

    let _ = sender.send(&Ping { ping_id: 1 }).unwrap();
    server.recv_frame().await;

    let updates_too_long = 0xe317af7eu32.to_le_bytes().to_vec();
    server.push(&updates_too_long);

    loop {
        match timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no update arrived")
            .expect("event channel closed")
        {
            SenderEvent::Update(bytes) => {
                assert_eq!(bytes, updates_too_long);
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn future_salts_resolve_by_envelope_id() {
    let address = "future-salts";
    let mut server = TestServer::listen(address, None);

    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let mut config = base_config(events_tx);
    // The envelope id of the reply mirrors the request id here, which is a
    // client-side (even) id.
    config.security_checks = false;

    let sender = Sender::new(config, Some(AUTH_KEY), Arc::new(NullAuthenticator));
    let conn = MockConnection::create(ConnectionInfo::new(address, 443, DC_ID));
    assert!(sender.connect(conn, false).await.unwrap());

    let reply = sender.send(&GetFutureSalts { num: 2 }).unwrap();
    let frame = server.recv_frame().await;
    let req_msg_id = frame.messages[0].msg_id;

    let salts = FutureSalts {
        req_msg_id,
        now: 1000,
        salts: vec![service::FutureSalt {
            valid_since: 1000,
            valid_until: 2000,
            salt: 77,
        }],
    };
    server.push_with_id(req_msg_id, &salts.to_bytes());

    let resolved = reply.await.unwrap();
    assert_eq!(resolved.salts.len(), 1);
    assert_eq!(resolved.salts[0].salt, 77);
}

#[tokio::test]
async fn handshake_runs_when_no_key_is_installed() {
    let address = "fresh-handshake";
    let _server = TestServer::listen(address, None);

    let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let mut config = base_config(events_tx);
    config.auth_key_hook = Some({
        let seen = seen.clone();
        Arc::new(move |key, dc_id| {
            assert_eq!(key, &AUTH_KEY);
            seen.lock().unwrap().push(dc_id);
        })
    });

    let sender = Sender::new(config, None, Arc::new(StubAuthenticator));
    let conn = MockConnection::create(ConnectionInfo::new(address, 443, DC_ID));
    assert!(sender.connect(conn, false).await.unwrap());

    assert_eq!(*seen.lock().unwrap(), vec![DC_ID]);
    assert!(sender.is_connected());

    // A second connect without force is a no-op.
    let conn = MockConnection::create(ConnectionInfo::new(address, 443, DC_ID));
    assert!(!sender.connect(conn, false).await.unwrap());
}
