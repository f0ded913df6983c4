//! Byte-level transport over TCP, optionally wrapped in TLS.
//!
//! A [`Transport`] is established once, then split into a
//! [`TransportReader`] owned by the connection worker and a
//! [`TransportWriter`] owned by the connection's writer task.
//!
//! # Teardown Order
//!
//! 1. [`TransportWriter::shutdown`] - TLS `close_notify`, then TCP FIN
//! 2. Both halves dropped - socket closed
//! 3. Last [`TlsContext`] clone dropped - context released

// ============================================================================
// Imports
// ============================================================================

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::signal::StopListener;
use super::tls::TlsContext;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on a graceful shutdown write.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// MaybeTlsStream
// ============================================================================

/// A TCP stream, plain or wrapped in a TLS session.
pub enum MaybeTlsStream {
    /// Plaintext TCP.
    Plain(TcpStream),
    /// TLS session we initiated.
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// TLS session we accepted.
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::ClientTls(s) => Pin::new(&mut **s).poll_read(cx, buf),
            Self::ServerTls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::ClientTls(s) => Pin::new(&mut **s).poll_write(cx, buf),
            Self::ServerTls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::ClientTls(s) => Pin::new(&mut **s).poll_flush(cx),
            Self::ServerTls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::ClientTls(s) => Pin::new(&mut **s).poll_shutdown(cx),
            Self::ServerTls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// An established byte stream to one peer.
pub struct Transport {
    stream: MaybeTlsStream,
    peer_addr: SocketAddr,
}

impl Transport {
    /// Opens a TCP connection and, with a client context, a TLS session.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if `stop` fires first
    /// - [`Error::Transport`] if the TCP connect fails
    /// - [`Error::Tls`] if the TLS handshake fails; there is no plaintext fallback
    pub async fn connect(
        host: &str,
        port: u16,
        tls: Option<&TlsContext>,
        stop: &mut StopListener,
    ) -> Result<Self> {
        let tcp = tokio::select! {
            biased;
            () = stop.stopped() => return Err(Error::Cancelled),
            result = TcpStream::connect((host, port)) => result
                .map_err(|e| Error::transport(format!("connect to {host}:{port} failed: {e}")))?,
        };

        tokio::select! {
            biased;
            () = stop.stopped() => Err(Error::Cancelled),
            result = Self::establish(tcp, tls, Some(host)) => result,
        }
    }

    /// Wraps an already connected socket, performing the TLS handshake for
    /// `tls` if given.
    ///
    /// `server_name` is required for a client context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] on any handshake failure.
    pub async fn establish(
        tcp: TcpStream,
        tls: Option<&TlsContext>,
        server_name: Option<&str>,
    ) -> Result<Self> {
        let peer_addr = tcp.peer_addr()?;
        let _ = tcp.set_nodelay(true);

        let stream = match tls {
            None => MaybeTlsStream::Plain(tcp),
            Some(TlsContext::Server(acceptor)) => {
                let session = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| Error::tls(format!("accept from {peer_addr} failed: {e}")))?;
                MaybeTlsStream::ServerTls(Box::new(session))
            }
            Some(TlsContext::Client(connector)) => {
                let host = server_name
                    .ok_or_else(|| Error::tls("client TLS requires a server name"))?;
                let name = ServerName::try_from(host.to_owned())
                    .map_err(|e| Error::tls(format!("invalid server name '{host}': {e}")))?;
                let session = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| Error::tls(format!("connect to {peer_addr} failed: {e}")))?;
                MaybeTlsStream::ClientTls(Box::new(session))
            }
        };

        debug!(%peer_addr, secure = tls.is_some(), "Transport established");
        Ok(Self { stream, peer_addr })
    }

    /// Returns the remote address.
    #[inline]
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Returns `true` if a TLS session wraps the socket.
    #[inline]
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        !matches!(self.stream, MaybeTlsStream::Plain(_))
    }

    /// Splits into independently usable read and write halves.
    #[must_use]
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        let (read, write) = tokio::io::split(self.stream);
        (
            TransportReader { inner: read },
            TransportWriter {
                inner: write,
                shut_down: false,
            },
        )
    }
}

// ============================================================================
// TransportReader
// ============================================================================

/// Receiving half, owned by the connection worker.
pub struct TransportReader {
    inner: ReadHalf<MaybeTlsStream>,
}

impl TransportReader {
    /// Reads available bytes into `buf`.
    ///
    /// Blocks until data arrives, the peer closes (returns `Ok(0)`), or
    /// `stop` fires.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if `stop` fires first
    /// - [`Error::Transport`] on socket or TLS failure
    pub async fn recv_raw(&mut self, buf: &mut [u8], stop: &mut StopListener) -> Result<usize> {
        tokio::select! {
            biased;
            () = stop.stopped() => Err(Error::Cancelled),
            read = self.inner.read(buf) => {
                let n = read.map_err(|e| Error::transport(format!("recv failed: {e}")))?;
                trace!(bytes = n, "recv");
                Ok(n)
            }
        }
    }
}

// ============================================================================
// TransportWriter
// ============================================================================

/// Sending half, owned by the connection's writer task.
pub struct TransportWriter {
    inner: WriteHalf<MaybeTlsStream>,
    shut_down: bool,
}

impl TransportWriter {
    /// Writes all of `bytes` and flushes.
    ///
    /// A partial write is an error; the caller aborts the connection rather
    /// than retrying.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] on failure or after shutdown.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<usize> {
        if self.shut_down {
            return Err(Error::transport("send after shutdown"));
        }
        self.inner
            .write_all(bytes)
            .await
            .map_err(|e| Error::transport(format!("send failed: {e}")))?;
        self.inner
            .flush()
            .await
            .map_err(|e| Error::transport(format!("flush failed: {e}")))?;
        trace!(bytes = bytes.len(), "send");
        Ok(bytes.len())
    }

    /// Shuts down the TLS session (if any) and the socket's write side.
    ///
    /// Idempotent; failures are ignored since the socket is going away.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let _ = timeout(SHUTDOWN_TIMEOUT, self.inner.shutdown()).await;
    }
}

// ============================================================================
// Tests
// ============================================================================
