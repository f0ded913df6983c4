//! WebSocket connection and receive loop.
//!
//! One [`Connection`] is one logical peer. It owns a transport, runs the
//! opening handshake and the receive loop on a dedicated worker task, and
//! reports lifecycle events to its owner over an unbounded channel.
//!
//! # Worker Loop
//!
//! ```text
//! Idle → Handshaking → Open → Closing → Closed
//!            │                    ▲
//!            └── failure ─────────┴──► Error event (never a Message)
//! ```
//!
//! The worker handles:
//!
//! - Frame decoding with partial-read accumulation
//! - Ping → Pong echo, Pong → Heartbeat event
//! - Fragment reassembly via [`MessageAssembler`]
//! - Close frames in both directions
//!
//! Messages are never interpreted on the worker; they are handed to the
//! owner in wire order.
//!
//! # Send Path
//!
//! Outbound frames are queued to a per-connection writer task, so
//! [`Connection::send_text`] and [`Connection::close`] never wait on the
//! socket. A write that does not finish within `send_timeout` aborts the
//! connection.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, ProtocolError, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::CloseCode;

use super::assembler::{DEFAULT_MAX_MESSAGE_BYTES, MessageAssembler};
use super::frame::{DEFAULT_MAX_FRAME_BYTES, Frame, FrameCodec, Opcode};
use super::handshake::{self, Endpoint};
use super::signal::{StopListener, StopSignal};
use super::stream::{Transport, TransportReader, TransportWriter};
use super::tls::TlsContext;

// ============================================================================
// Constants
// ============================================================================

/// Default wait for the owner's ready signal after a server handshake.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_millis(500);

/// Default limit on writing one queued frame.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on waiting for a worker to exit in [`Connection::join`].
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Time the writer gets to flush queued frames during teardown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Bytes requested per socket read.
const READ_CHUNK: usize = 16 * 1024;

// ============================================================================
// Types
// ============================================================================

/// Channel carrying worker events to the owner.
pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// Receiving side of [`EventSender`].
pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Which side of the protocol a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// We dialed out; outbound frames are masked.
    ClientOutbound,
    /// A listening socket. Never carries frames itself.
    ServerListening,
    /// Accepted from a listener; inbound frames must be masked.
    ServerAccepted,
}

impl ConnectionRole {
    /// Returns `true` if frames sent in this role must be masked.
    #[inline]
    #[must_use]
    pub const fn masks_outbound(self) -> bool {
        !matches!(self, Self::ServerAccepted)
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ClientOutbound => "client_outbound",
            Self::ServerListening => "server_listening",
            Self::ServerAccepted => "server_accepted",
        })
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, worker not started.
    Idle,
    /// TCP/TLS setup and opening handshake in progress.
    Handshaking,
    /// Frames flowing.
    Open,
    /// Teardown started.
    Closing,
    /// Worker finished; terminal event emitted.
    Closed,
}

/// Event emitted by a connection worker.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// The connection that produced the event.
    pub connection: Connection,
    /// What happened.
    pub kind: ConnectionEventKind,
}

/// Kinds of worker events.
///
/// Every connection emits exactly one terminal event: `Error` or `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    /// Handshake complete; frames may flow.
    Connected {
        /// Negotiated subprotocol.
        protocol: Option<String>,
    },
    /// A complete text message.
    Message(String),
    /// A Pong was received.
    Heartbeat,
    /// Handshake or transport failure.
    Error {
        /// Code describing the failure.
        code: CloseCode,
        /// Human-readable reason.
        reason: String,
    },
    /// Clean or protocol-driven close.
    Closed {
        /// Close code.
        code: CloseCode,
        /// Human-readable reason.
        reason: String,
    },
}

impl ConnectionEventKind {
    /// Returns `true` for `Error` and `Closed`.
    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Closed { .. })
    }
}

// ============================================================================
// ConnectionOptions
// ============================================================================

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Cap on a single frame payload.
    pub max_frame_bytes: u64,
    /// Cap on a reassembled message.
    pub max_message_bytes: usize,
    /// Subprotocols offered (client) or supported (server).
    pub protocols: Vec<String>,
    /// Extra upgrade request headers (client only).
    pub extra_headers: Vec<(String, String)>,
    /// TLS context; server role for accepted sockets, client role for dialing.
    pub tls: Option<TlsContext>,
    /// Wait for the owner's ready signal after a server handshake.
    pub ready_timeout: Duration,
    /// Limit on writing one frame before the connection is aborted.
    pub send_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            protocols: Vec::new(),
            extra_headers: Vec::new(),
            tls: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

// ============================================================================
// Internal Types
// ============================================================================

/// How a worker obtains its socket.
enum Setup {
    Connect(Endpoint),
    Accept(TcpStream),
}

/// Work for the writer task.
enum Outbound {
    Frame(Vec<u8>),
    Shutdown,
}

/// Why the receive loop ended.
enum LoopExit {
    PeerClosed { code: CloseCode, reason: String },
    Protocol(ProtocolError),
    Transport(String),
    Stopped,
}

/// Shared state between the worker and every handle.
struct ConnectionInner {
    id: ConnectionId,
    role: ConnectionRole,
    state: Mutex<ConnectionState>,
    peer_addr: Mutex<Option<SocketAddr>>,
    protocol: Mutex<Option<String>>,
    /// Writer queue; `None` before the handshake and after teardown.
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    stop: StopSignal,
    ready: Notify,
    authenticated: AtomicBool,
    last_heartbeat_at: Mutex<Option<Instant>>,
    close_request: Mutex<Option<(CloseCode, String)>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// Connection
// ============================================================================

/// Reference-counted handle to one WebSocket connection.
///
/// Cloning is cheap. The connection stays alive while the worker or any
/// handle holds it; [`WeakConnection`] does not extend its life.
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync`. Only the worker reads from the socket and
/// only the writer task writes to it; `send_*` and `close` enqueue frames.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

// ============================================================================
// Connection - Constructors
// ============================================================================

impl Connection {
    /// Dials `url` and starts the worker.
    ///
    /// Returns immediately in `Handshaking`; the outcome arrives as a
    /// `Connected` or `Error` event. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if `url` is not `ws://` or `wss://`.
    pub fn connect(url: &str, options: ConnectionOptions, events: EventSender) -> Result<Self> {
        let endpoint = Endpoint::parse(url)?;
        Ok(Self::spawn(
            ConnectionRole::ClientOutbound,
            Setup::Connect(endpoint),
            options,
            events,
        ))
    }

    /// Wraps an accepted socket and starts the worker.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn accept(tcp: TcpStream, options: ConnectionOptions, events: EventSender) -> Self {
        Self::spawn(
            ConnectionRole::ServerAccepted,
            Setup::Accept(tcp),
            options,
            events,
        )
    }

    fn spawn(
        role: ConnectionRole,
        setup: Setup,
        options: ConnectionOptions,
        events: EventSender,
    ) -> Self {
        let peer_addr = match &setup {
            Setup::Accept(tcp) => tcp.peer_addr().ok(),
            Setup::Connect(_) => None,
        };

        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::next(),
                role,
                state: Mutex::new(ConnectionState::Idle),
                peer_addr: Mutex::new(peer_addr),
                protocol: Mutex::new(None),
                outbound: Mutex::new(None),
                writer_task: Mutex::new(None),
                stop: StopSignal::new(),
                ready: Notify::new(),
                authenticated: AtomicBool::new(false),
                last_heartbeat_at: Mutex::new(None),
                close_request: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        };

        debug!(id = %connection.id(), %role, "Starting connection worker");

        let worker = tokio::spawn(connection.clone().run_worker(setup, options, events));
        *connection.inner.worker.lock() = Some(worker);

        connection
    }
}

// ============================================================================
// Connection - Public API
// ============================================================================

impl Connection {
    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Returns the role.
    #[inline]
    #[must_use]
    pub fn role(&self) -> ConnectionRole {
        self.inner.role
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Returns `true` while frames can be sent.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Returns the remote address once known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.inner.peer_addr.lock()
    }

    /// Returns the negotiated subprotocol.
    #[must_use]
    pub fn protocol(&self) -> Option<String> {
        self.inner.protocol.lock().clone()
    }

    /// Returns `true` once the peer completed `bridge_hello`.
    #[inline]
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::Acquire)
    }

    /// Marks the connection as authenticated or not.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.inner
            .authenticated
            .store(authenticated, Ordering::Release);
    }

    /// Returns when the last Pong arrived.
    #[must_use]
    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        *self.inner.last_heartbeat_at.lock()
    }

    /// Tells a server-accepted worker that the owner is listening.
    ///
    /// Safe to call before the worker starts waiting.
    pub fn signal_ready(&self) {
        self.inner.ready.notify_one();
    }

    /// Creates a non-owning handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Queues one unfragmented Text frame.
    ///
    /// Returns once the frame is queued; a later write failure or timeout
    /// aborts the connection and surfaces as its terminal `Error` event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless `Open`.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_frame(Opcode::Text, text.as_bytes())
    }

    /// Queues a Ping control frame.
    ///
    /// # Errors
    ///
    /// Same as [`send_text`](Self::send_text), plus [`Error::Config`] if
    /// `payload` exceeds 125 bytes.
    pub fn send_ping(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > super::frame::MAX_CONTROL_PAYLOAD {
            return Err(Error::config("ping payload exceeds 125 bytes"));
        }
        self.send_frame(Opcode::Ping, payload)
    }

    /// Starts closing with `code`. Does not wait; see [`join`](Self::join).
    ///
    /// The Close frame is queued behind any pending sends. Idempotent:
    /// later calls have no effect.
    pub fn close(&self, code: CloseCode, reason: &str) {
        {
            let mut state = self.inner.state.lock();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        *self.inner.close_request.lock() = Some((code, reason.to_owned()));

        debug!(id = %self.id(), %code, reason, "Closing connection");

        if code.is_sendable() {
            let _ = self.enqueue(self.encode(Opcode::Close, &code.payload(reason)));
        }
        self.inner.stop.trigger();
    }

    /// Waits, bounded, for the worker to exit.
    pub async fn join(&self) {
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker
            && timeout(JOIN_TIMEOUT, worker).await.is_err()
        {
            warn!(id = %self.id(), "Connection worker did not exit in time");
        }
    }
}

// ============================================================================
// Connection - Internals
// ============================================================================

impl Connection {
    fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock() = state;
    }

    fn encode(&self, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        FrameCodec::encode(opcode, payload, self.role().masks_outbound())
    }

    fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::not_connected(self.id()));
        }
        self.enqueue(self.encode(opcode, payload))
    }

    /// Hands an encoded frame to the writer task.
    fn enqueue(&self, frame: Vec<u8>) -> Result<()> {
        match self.inner.outbound.lock().as_ref() {
            Some(queue) => queue
                .send(Outbound::Frame(frame))
                .map_err(|_| Error::not_connected(self.id())),
            None => Err(Error::not_connected(self.id())),
        }
    }

    /// Writer task: drains the queue in order until shutdown.
    async fn run_writer(
        self,
        mut writer: TransportWriter,
        mut queue: mpsc::UnboundedReceiver<Outbound>,
        send_timeout: Duration,
    ) {
        while let Some(Outbound::Frame(frame)) = queue.recv().await {
            let result = match timeout(send_timeout, writer.send_raw(&frame)).await {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(Error::transport(format!(
                    "send timed out after {} ms",
                    send_timeout.as_millis()
                ))),
            };
            if let Err(e) = result {
                warn!(id = %self.id(), error = %e, "Send failed, aborting connection");
                self.abort(e.to_string());
                break;
            }
        }
        writer.shutdown().await;
    }

    /// Stops the worker after a local transport failure.
    fn abort(&self, reason: String) {
        {
            let mut state = self.inner.state.lock();
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        *self.inner.close_request.lock() = Some((CloseCode::Abnormal, reason));
        self.inner.stop.trigger();
    }

    fn emit(&self, events: &EventSender, kind: ConnectionEventKind) {
        trace!(id = %self.id(), ?kind, "Connection event");
        let _ = events.send(ConnectionEvent {
            connection: self.clone(),
            kind,
        });
    }

    /// Worker entry point.
    async fn run_worker(self, setup: Setup, options: ConnectionOptions, events: EventSender) {
        let mut stop = self.inner.stop.listener();

        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Idle {
                *state = ConnectionState::Handshaking;
            }
        }

        let (reader, leftover) = match self.establish(setup, &options, &mut stop).await {
            Ok(established) => established,
            Err(e) => {
                self.set_state(ConnectionState::Closed);
                let kind = match e {
                    Error::Cancelled => {
                        let (code, reason) = self.requested_close();
                        ConnectionEventKind::Closed { code, reason }
                    }
                    other => {
                        warn!(id = %self.id(), error = %other, "Connection setup failed");
                        ConnectionEventKind::Error {
                            code: other.close_code(),
                            reason: other.to_string(),
                        }
                    }
                };
                self.emit(&events, kind);
                return;
            }
        };

        let opened = {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Handshaking {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        };

        let exit = if opened {
            info!(
                id = %self.id(),
                role = %self.role(),
                peer = ?self.peer_addr(),
                "WebSocket connection open"
            );
            self.emit(
                &events,
                ConnectionEventKind::Connected {
                    protocol: self.protocol(),
                },
            );

            if self.role() == ConnectionRole::ServerAccepted {
                self.wait_for_owner(options.ready_timeout, &mut stop).await;
            }

            self.receive_loop(reader, leftover, &options, &events, &mut stop)
                .await
        } else {
            drop(reader);
            LoopExit::Stopped
        };

        self.finish(exit, &events).await;
    }

    /// Connects or accepts, then runs the opening handshake.
    async fn establish(
        &self,
        setup: Setup,
        options: &ConnectionOptions,
        stop: &mut StopListener,
    ) -> Result<(TransportReader, Vec<u8>)> {
        let (transport, endpoint) = match setup {
            Setup::Connect(endpoint) => {
                let tls = match (&options.tls, endpoint.use_tls) {
                    (_, false) => None,
                    (Some(context @ TlsContext::Client(_)), true) => Some(context.clone()),
                    (Some(TlsContext::Server(_)), true) => {
                        return Err(Error::tls("server TLS context used for an outbound connection"));
                    }
                    (None, true) => Some(TlsContext::client(None)?),
                };
                let transport =
                    Transport::connect(&endpoint.host, endpoint.port, tls.as_ref(), stop).await?;
                (transport, Some(endpoint))
            }
            Setup::Accept(tcp) => {
                let transport = tokio::select! {
                    biased;
                    () = stop.stopped() => return Err(Error::Cancelled),
                    result = Transport::establish(tcp, options.tls.as_ref(), None) => result?,
                };
                (transport, None)
            }
        };

        *self.inner.peer_addr.lock() = Some(transport.peer_addr());
        let (mut reader, mut writer) = transport.into_split();

        let outcome = match &endpoint {
            Some(endpoint) => {
                handshake::client_handshake(
                    &mut reader,
                    &mut writer,
                    endpoint,
                    &options.protocols,
                    &options.extra_headers,
                    stop,
                )
                .await
            }
            None => {
                handshake::server_handshake(&mut reader, &mut writer, &options.protocols, stop)
                    .await
            }
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                writer.shutdown().await;
                return Err(e);
            }
        };

        *self.inner.protocol.lock() = outcome.protocol;

        let (queue, drain) = mpsc::unbounded_channel();
        *self.inner.outbound.lock() = Some(queue);
        let writer_task = tokio::spawn(self.clone().run_writer(writer, drain, options.send_timeout));
        *self.inner.writer_task.lock() = Some(writer_task);

        Ok((reader, outcome.leftover))
    }

    /// Waits, bounded, for the owner to signal it is ready for messages.
    async fn wait_for_owner(&self, ready_timeout: Duration, stop: &mut StopListener) {
        let ready = tokio::select! {
            biased;
            () = stop.stopped() => return,
            result = timeout(ready_timeout, self.inner.ready.notified()) => result.is_ok(),
        };
        if !ready {
            debug!(id = %self.id(), "Owner ready signal timed out, continuing");
        }
    }

    /// Decodes and dispatches frames until close, error, or stop.
    async fn receive_loop(
        &self,
        mut reader: TransportReader,
        mut pending: Vec<u8>,
        options: &ConnectionOptions,
        events: &EventSender,
        stop: &mut StopListener,
    ) -> LoopExit {
        let codec = FrameCodec::new(options.max_frame_bytes);
        let mut assembler = MessageAssembler::new(options.max_message_bytes);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            loop {
                let frame = match codec.decode(&mut pending) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => return LoopExit::Protocol(e.into()),
                };
                if let Some(exit) = self.handle_frame(frame, &mut assembler, events) {
                    return exit;
                }
            }

            match reader.recv_raw(&mut chunk, stop).await {
                Ok(0) => {
                    let reason = match codec.decode_complete(&pending) {
                        Err(e) if !pending.is_empty() => format!("peer closed mid-frame: {e}"),
                        _ => "peer closed without a close frame".to_owned(),
                    };
                    return LoopExit::Transport(reason);
                }
                Ok(n) => pending.extend_from_slice(&chunk[..n]),
                Err(Error::Cancelled) => return LoopExit::Stopped,
                Err(e) => return LoopExit::Transport(e.to_string()),
            }
        }
    }

    /// Applies one frame. Returns `Some` when the loop must end.
    fn handle_frame(
        &self,
        frame: Frame,
        assembler: &mut MessageAssembler,
        events: &EventSender,
    ) -> Option<LoopExit> {
        if self.role() == ConnectionRole::ServerAccepted && !frame.masked {
            return Some(LoopExit::Protocol(ProtocolError::UnmaskedClientFrame));
        }

        match frame.opcode {
            Opcode::Close => {
                let (code, reason) = CloseCode::parse_payload(&frame.payload);
                Some(LoopExit::PeerClosed { code, reason })
            }
            Opcode::Ping => {
                trace!(id = %self.id(), "Ping received");
                let _ = self.enqueue(self.encode(Opcode::Pong, &frame.payload));
                None
            }
            Opcode::Pong => {
                *self.inner.last_heartbeat_at.lock() = Some(Instant::now());
                self.emit(events, ConnectionEventKind::Heartbeat);
                None
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => match assembler.push(frame) {
                Ok(Some(text)) => {
                    self.emit(events, ConnectionEventKind::Message(text));
                    None
                }
                Ok(None) => None,
                Err(e) => Some(LoopExit::Protocol(e)),
            },
        }
    }

    /// Tears down the transport and emits the terminal event.
    async fn finish(&self, exit: LoopExit, events: &EventSender) {
        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Closing;
            }
        }

        let (kind, reply) = match exit {
            LoopExit::PeerClosed { code, reason } => {
                debug!(id = %self.id(), %code, %reason, "Peer closed connection");
                (
                    ConnectionEventKind::Closed { code, reason },
                    Some((CloseCode::Normal, String::new())),
                )
            }
            LoopExit::Protocol(e) => {
                warn!(id = %self.id(), error = %e, code = %e.close_code(), "Protocol violation");
                let code = e.close_code();
                let reason = e.to_string();
                (
                    ConnectionEventKind::Closed {
                        code,
                        reason: reason.clone(),
                    },
                    Some((code, reason)),
                )
            }
            LoopExit::Transport(reason) => {
                debug!(id = %self.id(), %reason, "Transport ended");
                (
                    ConnectionEventKind::Error {
                        code: CloseCode::Abnormal,
                        reason,
                    },
                    None,
                )
            }
            LoopExit::Stopped => {
                let (code, reason) = self.requested_close();
                let kind = if code == CloseCode::Abnormal {
                    ConnectionEventKind::Error { code, reason }
                } else {
                    ConnectionEventKind::Closed { code, reason }
                };
                (kind, None)
            }
        };

        if let Some((code, reason)) = reply {
            let _ = self.enqueue(self.encode(Opcode::Close, &code.payload(&reason)));
        }
        let queue = self.inner.outbound.lock().take();
        if let Some(queue) = queue {
            let _ = queue.send(Outbound::Shutdown);
        }
        let writer_task = self.inner.writer_task.lock().take();
        if let Some(mut writer_task) = writer_task
            && timeout(DRAIN_TIMEOUT, &mut writer_task).await.is_err()
        {
            debug!(id = %self.id(), "Writer did not drain in time, dropping queued frames");
            writer_task.abort();
        }

        self.set_state(ConnectionState::Closed);
        info!(id = %self.id(), role = %self.role(), ?kind, "WebSocket connection closed");
        self.emit(events, kind);
    }

    fn requested_close(&self) -> (CloseCode, String) {
        self.inner
            .close_request
            .lock()
            .clone()
            .unwrap_or((CloseCode::Normal, "closed locally".to_owned()))
    }
}

// ============================================================================
// WeakConnection
// ============================================================================

/// Non-owning connection handle.
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    /// Returns a strong handle if the connection is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakConnection")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    use crate::transport::handshake::{build_client_request, find_terminator, generate_key};

    const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

    async fn next_event(rx: &mut EventReceiver) -> ConnectionEvent {
        timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("event timed out")
            .expect("event channel closed")
    }

    async fn next_terminal(rx: &mut EventReceiver) -> ConnectionEventKind {
        loop {
            let event = next_event(rx).await;
            if event.kind.is_terminal() {
                return event.kind;
            }
        }
    }

    /// Accepts one socket into a server-accepted connection.
    async fn server() -> (u16, tokio::task::JoinHandle<(Connection, EventReceiver)>) {
        server_with(ConnectionOptions::default()).await
    }

    async fn server_with(
        options: ConnectionOptions,
    ) -> (u16, tokio::task::JoinHandle<(Connection, EventReceiver)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let (tx, rx) = mpsc::unbounded_channel();
            let connection = Connection::accept(tcp, options, tx);
            connection.signal_ready();
            (connection, rx)
        });
        (port, task)
    }

    /// Raw socket that completed the upgrade; frames are hand-written.
    async fn raw_client(port: u16) -> TcpStream {
        let mut tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let endpoint = Endpoint::parse(&format!("ws://127.0.0.1:{port}/")).unwrap();
        let request = build_client_request(&endpoint, &generate_key(), &[], &[]).unwrap();
        tcp.write_all(request.as_bytes()).await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while find_terminator(&head).is_none() {
            tcp.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        assert!(head.starts_with(b"HTTP/1.1 101"));
        tcp
    }

    async fn read_close_code(tcp: &mut TcpStream) -> u16 {
        let mut buf = Vec::new();
        let codec = FrameCodec::default();
        let mut chunk = [0u8; 256];
        loop {
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                if frame.opcode == Opcode::Close {
                    return CloseCode::parse_payload(&frame.payload).0.as_u16();
                }
                continue;
            }
            let n = timeout(EVENT_TIMEOUT, tcp.read(&mut chunk)).await.unwrap().unwrap();
            assert!(n > 0, "socket closed before close frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn masked(opcode: Opcode, fin: bool, payload: &[u8]) -> Vec<u8> {
        let mut bytes = FrameCodec::encode(opcode, payload, true);
        if !fin {
            bytes[0] &= 0x7F;
        }
        bytes
    }

    #[test]
    fn test_role_masking() {
        assert!(ConnectionRole::ClientOutbound.masks_outbound());
        assert!(!ConnectionRole::ServerAccepted.masks_outbound());
    }

    #[tokio::test]
    async fn test_server_accepted_with_tungstenite_client() {
        let (port, task) = server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/"))
            .await
            .unwrap();
        let (connection, mut rx) = task.await.unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, ConnectionEventKind::Connected { protocol: None });
        assert_eq!(event.connection, connection);
        assert!(connection.is_connected());

        ws.send(Message::text("hello bridge")).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await.kind,
            ConnectionEventKind::Message("hello bridge".into())
        );

        connection.send_text("hello peer").unwrap();
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), "hello peer"),
            other => panic!("unexpected {other:?}"),
        }

        ws.send(Message::Ping(b"hb".to_vec().into())).await.unwrap();
        match ws.next().await.unwrap().unwrap() {
            Message::Pong(payload) => assert_eq!(&payload[..], b"hb"),
            other => panic!("unexpected {other:?}"),
        }

        connection.send_ping(b"p").unwrap();
        // tungstenite yields the Ping, then flushes its Pong on the next read.
        let _ = timeout(Duration::from_millis(200), ws.next()).await;
        let _ = timeout(Duration::from_millis(200), ws.next()).await;
        assert_eq!(next_event(&mut rx).await.kind, ConnectionEventKind::Heartbeat);
        assert!(connection.last_heartbeat_at().is_some());

        ws.close(None).await.unwrap();
        assert!(matches!(
            next_terminal(&mut rx).await,
            ConnectionEventKind::Closed { .. }
        ));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_fragmented_message_reassembled() {
        let (port, task) = server().await;
        let mut tcp = raw_client(port).await;
        let (_connection, mut rx) = task.await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await.kind,
            ConnectionEventKind::Connected { .. }
        ));

        let mut bytes = masked(Opcode::Text, false, b"{\"type\":");
        bytes.extend(masked(Opcode::Ping, true, b"mid"));
        bytes.extend(masked(Opcode::Continuation, true, b"\"bridge_hello\"}"));
        tcp.write_all(&bytes).await.unwrap();

        assert_eq!(
            next_event(&mut rx).await.kind,
            ConnectionEventKind::Message("{\"type\":\"bridge_hello\"}".into())
        );
    }

    #[tokio::test]
    async fn test_continuation_without_start_closes_4002() {
        let (port, task) = server().await;
        let mut tcp = raw_client(port).await;
        let (_connection, mut rx) = task.await.unwrap();

        tcp.write_all(&masked(Opcode::Continuation, true, b"x"))
            .await
            .unwrap();

        assert_eq!(read_close_code(&mut tcp).await, 4002);
        match next_terminal(&mut rx).await {
            ConnectionEventKind::Closed { code, .. } => {
                assert_eq!(code, CloseCode::FragmentationViolation);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unmasked_frame_closes_1002() {
        let (port, task) = server().await;
        let mut tcp = raw_client(port).await;
        let (_connection, mut rx) = task.await.unwrap();

        tcp.write_all(&FrameCodec::encode(Opcode::Ping, b"", false))
            .await
            .unwrap();

        assert_eq!(read_close_code(&mut tcp).await, 1002);
        assert!(matches!(
            next_terminal(&mut rx).await,
            ConnectionEventKind::Closed {
                code: CloseCode::ProtocolError,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_binary_frame_closes_4003() {
        let (port, task) = server().await;
        let mut tcp = raw_client(port).await;
        let (_connection, mut rx) = task.await.unwrap();

        tcp.write_all(&masked(Opcode::Binary, true, &[1, 2, 3]))
            .await
            .unwrap();

        assert_eq!(read_close_code(&mut tcp).await, 4003);
        assert!(matches!(
            next_terminal(&mut rx).await,
            ConnectionEventKind::Closed {
                code: CloseCode::UnsupportedBinary,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_1009() {
        let options = ConnectionOptions {
            max_frame_bytes: 1024,
            ..ConnectionOptions::default()
        };
        let (port, task) = server_with(options).await;
        let mut tcp = raw_client(port).await;
        let (_connection, mut rx) = task.await.unwrap();

        tcp.write_all(&masked(Opcode::Text, true, &[b'a'; 2048]))
            .await
            .unwrap();

        assert_eq!(read_close_code(&mut tcp).await, 1009);
        assert!(matches!(
            next_terminal(&mut rx).await,
            ConnectionEventKind::Closed {
                code: CloseCode::MessageTooBig,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_oversized_fragmented_message_closes_1009() {
        let options = ConnectionOptions {
            max_message_bytes: 1024,
            ..ConnectionOptions::default()
        };
        let (port, task) = server_with(options).await;
        let mut tcp = raw_client(port).await;
        let (_connection, mut rx) = task.await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await.kind,
            ConnectionEventKind::Connected { .. }
        ));

        // Each fragment fits, the reassembled message does not.
        let mut bytes = masked(Opcode::Text, false, &[b'a'; 800]);
        bytes.extend(masked(Opcode::Continuation, true, &[b'b'; 800]));
        tcp.write_all(&bytes).await.unwrap();

        assert_eq!(read_close_code(&mut tcp).await, 1009);
        match next_terminal(&mut rx).await {
            ConnectionEventKind::Closed { code, .. } => assert_eq!(code, CloseCode::MessageTooBig),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stalled_peer_aborts_without_blocking_sender() {
        let options = ConnectionOptions {
            send_timeout: Duration::from_millis(200),
            ..ConnectionOptions::default()
        };
        let (port, task) = server_with(options).await;
        // Completes the upgrade, then never reads.
        let _tcp = raw_client(port).await;
        let (connection, mut rx) = task.await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await.kind,
            ConnectionEventKind::Connected { .. }
        ));

        let chunk = "x".repeat(1024 * 1024);
        let started = Instant::now();
        assert!(connection.send_text(&chunk).is_ok());
        for _ in 0..63 {
            if connection.send_text(&chunk).is_err() {
                break;
            }
        }
        assert!(started.elapsed() < Duration::from_secs(2));

        let terminal = timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if event.kind.is_terminal() {
                    return event.kind;
                }
            }
        })
        .await
        .expect("no terminal event");
        match terminal {
            ConnectionEventKind::Error { code, reason } => {
                assert_eq!(code, CloseCode::Abnormal);
                assert!(reason.contains("timed out"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (port, task) = server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/"))
            .await
            .unwrap();
        let (connection, mut rx) = task.await.unwrap();
        let _ = next_event(&mut rx).await;

        connection.close(CloseCode::Normal, "bye");
        connection.close(CloseCode::RateLimited, "again");
        assert_eq!(connection.state(), ConnectionState::Closing);
        connection.join().await;
        assert_eq!(connection.state(), ConnectionState::Closed);

        match next_terminal(&mut rx).await {
            ConnectionEventKind::Closed { code, reason } => {
                assert_eq!(code, CloseCode::Normal);
                assert_eq!(reason, "bye");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.map_or(true, |e| e.is_none()));

        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 1000),
            other => panic!("unexpected {other:?}"),
        }
        assert!(connection.send_text("late").is_err());
    }

    #[tokio::test]
    async fn test_client_outbound_against_tungstenite_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let echo = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if message.is_text() {
                    ws.send(message).await.unwrap();
                }
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = Connection::connect(
            &format!("ws://127.0.0.1:{port}/"),
            ConnectionOptions::default(),
            tx,
        )
        .unwrap();
        assert_eq!(connection.role(), ConnectionRole::ClientOutbound);
        assert!(matches!(
            next_event(&mut rx).await.kind,
            ConnectionEventKind::Connected { .. }
        ));

        connection.send_text("masked echo").unwrap();
        assert_eq!(
            next_event(&mut rx).await.kind,
            ConnectionEventKind::Message("masked echo".into())
        );

        connection.close(CloseCode::Normal, "done");
        connection.join().await;
        let _ = timeout(EVENT_TIMEOUT, echo).await;
    }

    #[tokio::test]
    async fn test_client_handshake_failure_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tcp.read(&mut buf).await;
            let _ = tcp.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection =
            Connection::connect(&format!("ws://127.0.0.1:{port}/"), ConnectionOptions::default(), tx)
                .unwrap();

        let event = next_event(&mut rx).await;
        match event.kind {
            ConnectionEventKind::Error { code, .. } => assert_eq!(code.as_u16(), 4000),
            other => panic!("expected handshake error, got {other:?}"),
        }
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_synchronously() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = Connection::connect("http://localhost/", ConnectionOptions::default(), tx);
        assert!(matches!(result, Err(Error::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_weak_handle_does_not_keep_alive() {
        let (port, task) = server().await;
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/"))
            .await
            .unwrap();
        let (connection, mut rx) = task.await.unwrap();
        let weak = connection.downgrade();
        assert!(weak.upgrade().is_some());

        drop(ws);
        let _ = next_terminal(&mut rx).await;
        drop(rx);
        connection.close(CloseCode::Normal, "");
        drop(connection);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(weak.upgrade().is_none());
    }
}
