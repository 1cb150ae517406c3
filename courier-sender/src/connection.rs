//! The transport abstraction the sender drives, and its TCP implementation.
//!
//! The sender never touches sockets directly: it is generic over
//! [`Connection`], which frames complete messages in both directions. On
//! reconnect a fresh connection of the same concrete type is rebuilt from the
//! [`ConnectionInfo`] captured at connect time.

use std::io;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_socks::tcp::Socks5Stream;

// ─── ConnectionInfo ───────────────────────────────────────────────────────────

/// Everything needed to (re)establish a transport to one data center.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    /// Data center host address.
    pub ip: String,
    /// Data center port.
    pub port: u16,
    /// Data center identifier.
    pub dc_id: i32,
    /// Optional SOCKS5 proxy every connection is tunnelled through.
    pub proxy: Option<Proxy>,
    /// Connect to the test servers instead of production.
    pub test_servers: bool,
}

/// A SOCKS5 proxy endpoint.
///
/// Plain data; the dialing itself happens inside
/// [`TcpConnection::connect`], so the same descriptor survives reconnects
/// as part of [`ConnectionInfo`].
#[derive(Clone, Debug)]
pub struct Proxy {
    /// `host:port` of the SOCKS5 server.
    pub addr: String,
    /// Username and password, when the proxy requires authentication.
    pub credentials: Option<(String, String)>,
}

impl ConnectionInfo {
    /// Plain info for a production data center.
    pub fn new(ip: impl Into<String>, port: u16, dc_id: i32) -> Self {
        Self {
            ip: ip.into(),
            port,
            dc_id,
            proxy: None,
            test_servers: false,
        }
    }

    /// `host:port` form.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

// ─── Connection trait ─────────────────────────────────────────────────────────

/// A bidirectional message transport.
///
/// `send` and `recv` operate on whole MTProto frames; framing, obfuscation,
/// and proxying are the implementation's concern. Both directions may be in
/// flight at the same time from different tasks.
#[async_trait]
pub trait Connection: Send + Sync + Sized + 'static {
    /// Build an unconnected transport for `info`.
    fn create(info: ConnectionInfo) -> Self;

    /// Open the transport.
    async fn connect(&self) -> io::Result<()>;

    /// Write one complete outgoing frame.
    async fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Read the next complete incoming frame.
    async fn recv(&self) -> io::Result<Vec<u8>>;

    /// Close the transport, waking any blocked `recv`.
    async fn disconnect(&self);

    /// The endpoint this transport talks to.
    fn info(&self) -> &ConnectionInfo;
}

// ─── TcpConnection ────────────────────────────────────────────────────────────

type Stream = Box<dyn AsyncStream>;

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// TCP transport with MTProto intermediate framing.
///
/// Init marker `0xeeeeeeee`, then each packet is `[4-byte LE length][payload]`.
/// More proxy-friendly than the abridged variant, which is why it is the
/// default here.
pub struct TcpConnection {
    info: ConnectionInfo,
    reader: AsyncMutex<Option<ReadHalf<Stream>>>,
    writer: AsyncMutex<Option<WriteHalf<Stream>>>,
    closed: Mutex<watch::Sender<bool>>,
}

#[async_trait]
impl Connection for TcpConnection {
    fn create(info: ConnectionInfo) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            info,
            reader: AsyncMutex::new(None),
            writer: AsyncMutex::new(None),
            closed: Mutex::new(closed),
        }
    }

    async fn connect(&self) -> io::Result<()> {
        let address = self.info.address();
        let stream: Stream = match &self.info.proxy {
            Some(proxy) => {
                log::info!("Tunnelling to {address} through SOCKS5 {}", proxy.addr);
                let tunnel = match &proxy.credentials {
                    Some((user, pass)) => {
                        Socks5Stream::connect_with_password(
                            proxy.addr.as_str(),
                            address.as_str(),
                            user.as_str(),
                            pass.as_str(),
                        )
                        .await
                    }
                    None => Socks5Stream::connect(proxy.addr.as_str(), address.as_str()).await,
                }
                .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
                Box::new(tunnel.into_inner())
            }
            None => Box::new(TcpStream::connect(&address).await?),
        };
        let (reader, mut writer) = tokio::io::split(stream);
        writer.write_all(&[0xee, 0xee, 0xee, 0xee]).await?;

        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        let (closed, _) = watch::channel(false);
        *self.closed.lock() = closed;
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(not_connected)?;
        writer.write_all(&(data.len() as u32).to_le_bytes()).await?;
        writer.write_all(data).await
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        let mut closed = self.closed.lock().subscribe();
        if *closed.borrow() {
            return Err(aborted());
        }
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or_else(not_connected)?;

        tokio::select! {
            frame = read_frame(reader) => frame,
            _ = closed.changed() => Err(aborted()),
        }
    }

    async fn disconnect(&self) {
        // send_replace updates the value even with no live subscribers, so a
        // recv that starts later still observes the closed state.
        self.closed.lock().send_replace(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn info(&self) -> &ConnectionInfo {
        &self.info
    }
}

async fn read_frame(reader: &mut ReadHalf<Stream>) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is not connected")
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}
