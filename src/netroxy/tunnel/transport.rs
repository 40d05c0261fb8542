use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::netroxy::net;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// How control and data connections are carried: plain TCP or TLS over TCP.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Completes the server side of a freshly accepted TCP connection.
    async fn accept(&self, conn: TcpStream) -> anyhow::Result<BoxedStream>;

    /// Opens a client connection to `addr`.
    async fn dial(&self, addr: &str) -> anyhow::Result<BoxedStream>;
}

pub mod tcp;
pub mod tls;

/// Bound listener that hands out connections already wrapped by its transport.
pub struct TransportListener {
    ln: TcpListener,
    transport: Arc<dyn Transport>,
    handshake_timeout: Duration,
}

impl TransportListener {
    pub async fn bind(addr: &str, transport: Arc<dyn Transport>) -> anyhow::Result<Self> {
        let bind_addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind {} {addr}", transport.name()))?;
        Ok(Self {
            ln,
            transport,
            handshake_timeout: Duration::from_secs(10),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Accepts the next raw connection. The transport handshake is left to
    /// [`Accepted::finish`] so a slow peer cannot stall the accept loop.
    pub async fn accept(&self) -> std::io::Result<Accepted> {
        let (conn, peer) = self.ln.accept().await?;
        Ok(Accepted {
            conn,
            peer,
            transport: self.transport.clone(),
            handshake_timeout: self.handshake_timeout,
        })
    }
}

pub struct Accepted {
    conn: TcpStream,
    pub peer: SocketAddr,
    transport: Arc<dyn Transport>,
    handshake_timeout: Duration,
}

impl Accepted {
    pub async fn finish(self) -> anyhow::Result<BoxedStream> {
        let _ = self.conn.set_nodelay(true);
        tokio::time::timeout(self.handshake_timeout, self.transport.accept(self.conn))
            .await
            .with_context(|| format!("{} handshake timeout", self.transport.name()))?
    }
}

pub async fn dial_with_timeout(
    transport: &dyn Transport,
    addr: &str,
    timeout: Duration,
) -> anyhow::Result<BoxedStream> {
    if timeout > Duration::from_millis(0) {
        tokio::time::timeout(timeout, transport.dial(addr))
            .await
            .with_context(|| format!("dial timeout {addr}"))?
    } else {
        transport.dial(addr).await
    }
}
