//! Listening socket and accept loop.
//!
//! A [`Listener`] binds one TCP port and turns every accepted socket into a
//! server-accepted [`Connection`] that reports to the same event channel.
//!
//! # Bind Policy
//!
//! Only loopback addresses bind by default. A non-loopback host is
//! downgraded to `127.0.0.1` unless `allow_non_loopback` is set, in which
//! case it is used as-is (or resolved via DNS) with a warning.
//!
//! # Shutdown
//!
//! [`Listener::close`] signals the accept task, which owns the listening
//! socket and drops it only after it has left `accept()`. Children are
//! closed afterwards.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpSocket, lookup_host};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::CloseCode;

use super::connection::{Connection, ConnectionOptions, EventSender, WeakConnection};
use super::signal::{StopListener, StopSignal};

// ============================================================================
// Constants
// ============================================================================

/// Default `listen()` backlog.
pub const DEFAULT_BACKLOG: u32 = 128;

/// Default pause after a failed `accept()`.
pub const DEFAULT_ACCEPT_SLEEP: Duration = Duration::from_millis(10);

/// Upper bound on waiting for the accept task to exit.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// ListenerSettings
// ============================================================================

/// Bind parameters for one port.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Requested host; see the module docs for the loopback policy.
    pub host: String,
    /// Port, or 0 for an OS-assigned port.
    pub port: u16,
    /// Permits binding a non-loopback address.
    pub allow_non_loopback: bool,
    /// `listen()` backlog.
    pub backlog: u32,
    /// Pause after a failed `accept()`.
    pub accept_sleep: Duration,
}

impl ListenerSettings {
    /// Loopback settings for `port` with default backlog and accept sleep.
    #[must_use]
    pub fn loopback(port: u16) -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST.to_string(),
            port,
            allow_non_loopback: false,
            backlog: DEFAULT_BACKLOG,
            accept_sleep: DEFAULT_ACCEPT_SLEEP,
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

/// A bound port with a running accept task.
///
/// # Example
///
/// ```ignore
/// let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
/// let listener = Listener::bind(&ListenerSettings::loopback(0), ConnectionOptions::default(), tx).await?;
/// println!("listening on {}", listener.ws_url());
/// ```
pub struct Listener {
    local_addr: SocketAddr,
    secure: bool,
    stop: StopSignal,
    children: Arc<Mutex<FxHashMap<ConnectionId, WeakConnection>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("secure", &self.secure)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Listener {
    /// Binds and starts accepting.
    ///
    /// `options.tls`, when set, must be a server context.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the host cannot be resolved or the TLS context
    ///   is a client context
    /// - [`Error::Transport`] if bind or listen fails
    pub async fn bind(
        settings: &ListenerSettings,
        options: ConnectionOptions,
        events: EventSender,
    ) -> Result<Self> {
        if options.tls.as_ref().is_some_and(|tls| !tls.is_server()) {
            return Err(Error::config("listener requires a server TLS context"));
        }

        let addr =
            resolve_bind_addr(&settings.host, settings.port, settings.allow_non_loopback).await?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .map_err(|e| Error::transport(format!("bind {addr} failed: {e}")))?;
        let listener = socket
            .listen(settings.backlog)
            .map_err(|e| Error::transport(format!("listen on {addr} failed: {e}")))?;
        let local_addr = listener.local_addr()?;

        let stop = StopSignal::new();
        let children = Arc::new(Mutex::new(FxHashMap::default()));
        let secure = options.tls.is_some();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            options,
            events,
            Arc::clone(&children),
            stop.listener(),
            settings.accept_sleep,
        ));

        info!(%local_addr, secure, backlog = settings.backlog, "Listener bound");

        Ok(Self {
            local_addr,
            secure,
            stop,
            children,
            accept_task: Mutex::new(Some(accept_task)),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the bound port.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the URL peers should dial.
    #[must_use]
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}", self.local_addr)
    }

    /// Returns `true` once [`close`](Self::close) was called.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the accepted connections that are still alive.
    #[must_use]
    pub fn children(&self) -> Vec<Connection> {
        let mut children = self.children.lock();
        children.retain(|_, weak| weak.upgrade().is_some());
        children.values().filter_map(WeakConnection::upgrade).collect()
    }

    /// Returns the number of live accepted connections.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children().len()
    }

    /// Stops accepting, then closes every child with `code`.
    ///
    /// Idempotent.
    pub async fn close(&self, code: CloseCode, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.stop.trigger();
        let task = self.accept_task.lock().take();
        if let Some(task) = task
            && timeout(JOIN_TIMEOUT, task).await.is_err()
        {
            warn!(port = self.port(), "Accept task did not exit in time");
        }

        let children = self.children();
        self.children.lock().clear();
        for child in children {
            child.close(code, reason);
        }

        info!(port = self.port(), "Listener closed");
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

/// Owns the listening socket until stopped.
async fn accept_loop(
    listener: TcpListener,
    options: ConnectionOptions,
    events: EventSender,
    children: Arc<Mutex<FxHashMap<ConnectionId, WeakConnection>>>,
    mut stop: StopListener,
    accept_sleep: Duration,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            () = stop.stopped() => break,
            result = listener.accept() => result,
        };

        match accepted {
            Ok((tcp, peer)) => {
                let connection = Connection::accept(tcp, options.clone(), events.clone());
                debug!(id = %connection.id(), %peer, "Accepted connection");

                let mut children = children.lock();
                children.retain(|_, weak| weak.upgrade().is_some());
                children.insert(connection.id(), connection.downgrade());
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::select! {
                    biased;
                    () = stop.stopped() => break,
                    () = tokio::time::sleep(accept_sleep) => {}
                }
            }
        }
    }

    drop(listener);
    debug!("Accept loop exited");
}

// ============================================================================
// Address Resolution
// ============================================================================

/// Applies the loopback policy to `host`.
///
/// # Errors
///
/// Returns [`Error::Config`] if a permitted hostname does not resolve.
pub async fn resolve_bind_addr(
    host: &str,
    port: u16,
    allow_non_loopback: bool,
) -> Result<SocketAddr> {
    let loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');

    if host.is_empty() || host.eq_ignore_ascii_case("localhost") {
        return Ok(loopback);
    }

    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => Ok(SocketAddr::new(ip, port)),
        Ok(ip) if allow_non_loopback => {
            warn!(%ip, "Binding to a non-loopback address");
            Ok(SocketAddr::new(ip, port))
        }
        Ok(ip) => {
            warn!(%ip, "Non-loopback bind not allowed, using 127.0.0.1");
            Ok(loopback)
        }
        Err(_) if allow_non_loopback => {
            let addr = lookup_host((host, port))
                .await
                .map_err(|e| Error::config(format!("failed to resolve '{host}': {e}")))?
                .next()
                .ok_or_else(|| Error::config(format!("'{host}' resolved to no addresses")))?;
            warn!(host, %addr, "Binding to a resolved non-loopback address");
            Ok(addr)
        }
        Err(_) => {
            warn!(host, "Non-loopback bind not allowed, using 127.0.0.1");
            Ok(loopback)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    use crate::transport::TlsContext;
    use crate::transport::connection::{ConnectionEventKind, ConnectionRole};

    const WAIT: Duration = Duration::from_secs(3);

    #[tokio::test]
    async fn test_resolve_loopback_policy() {
        let addr = resolve_bind_addr("localhost", 9000, false).await.unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());

        let addr = resolve_bind_addr("0.0.0.0", 9000, false).await.unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());

        let addr = resolve_bind_addr("0.0.0.0", 9000, true).await.unwrap();
        assert_eq!(addr, "0.0.0.0:9000".parse().unwrap());

        let addr = resolve_bind_addr("[::1]", 9000, false).await.unwrap();
        assert_eq!(addr, "[::1]:9000".parse().unwrap());

        let addr = resolve_bind_addr("example.invalid", 9000, false).await.unwrap();
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_bind_accept_and_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = Listener::bind(&ListenerSettings::loopback(0), ConnectionOptions::default(), tx)
            .await
            .unwrap();
        assert_ne!(listener.port(), 0);
        assert_eq!(listener.ws_url(), format!("ws://127.0.0.1:{}", listener.port()));

        let (_ws, _) = tokio_tungstenite::connect_async(listener.ws_url()).await.unwrap();

        let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event.kind, ConnectionEventKind::Connected { .. }));
        assert_eq!(event.connection.role(), ConnectionRole::ServerAccepted);
        event.connection.signal_ready();
        assert_eq!(listener.child_count(), 1);

        let port = listener.port();
        listener.close(CloseCode::Normal, "shutdown").await;
        listener.close(CloseCode::Normal, "again").await;
        assert!(listener.is_closed());
        assert!(!event.connection.is_connected());
        assert_eq!(listener.child_count(), 0);

        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_client_tls_context_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let options = ConnectionOptions {
            tls: Some(crate::transport::TlsContext::client(None).unwrap()),
            ..ConnectionOptions::default()
        };
        let err = Listener::bind(&ListenerSettings::loopback(0), options, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn test_tls_listener_exchanges_text_both_ways() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let options = ConnectionOptions {
            tls: Some(TlsContext::server_from_pem(&cert_path, &key_path).unwrap()),
            ..ConnectionOptions::default()
        };
        let listener = Listener::bind(&ListenerSettings::loopback(0), options, server_tx)
            .await
            .unwrap();
        assert!(listener.ws_url().starts_with("wss://"));

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let client_options = ConnectionOptions {
            tls: Some(TlsContext::client(Some(&cert_path)).unwrap()),
            ..ConnectionOptions::default()
        };
        let client = Connection::connect(
            &format!("wss://localhost:{}/", listener.port()),
            client_options,
            client_tx,
        )
        .unwrap();

        let accepted = timeout(WAIT, server_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(accepted.kind, ConnectionEventKind::Connected { .. }));
        let server_side = accepted.connection;
        server_side.signal_ready();

        let opened = timeout(WAIT, client_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(opened.kind, ConnectionEventKind::Connected { .. }));

        client.send_text("from client").unwrap();
        let received = timeout(WAIT, server_rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.kind, ConnectionEventKind::Message("from client".into()));

        server_side.send_text("from server").unwrap();
        let received = timeout(WAIT, client_rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.kind, ConnectionEventKind::Message("from server".into()));

        client.close(CloseCode::Normal, "done");
        client.join().await;
        assert_eq!(
            timeout(WAIT, client_rx.recv()).await.unwrap().unwrap().kind,
            ConnectionEventKind::Closed {
                code: CloseCode::Normal,
                reason: "done".into()
            }
        );
        listener.close(CloseCode::Normal, "shutdown").await;
    }
}
