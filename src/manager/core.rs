//! Connection manager: the owner side of every connection.
//!
//! The [`ConnectionManager`] composes zero or more [`Listener`]s and at most
//! one outbound [`Connection`]. Workers never run application logic; they
//! queue [`ConnectionEvent`]s which the owner drains in [`tick`] or [`run`].
//!
//! # Envelope Protocol
//!
//! | Inbound | Condition | Outcome |
//! |---------|-----------|---------|
//! | `bridge_hello` | token ok | `bridge_ack`, authenticated |
//! | `bridge_hello` | token wrong | `bridge_error`, close 4005 |
//! | `automation_request` | not authenticated | `bridge_error`, close 4004 |
//! | `automation_request` | authenticated | correlated, handler invoked |
//! | any | over rate cap | `bridge_error`, close 4008 |
//! | unparsable | | `bridge_error{INVALID_MESSAGE}` |
//!
//! # Timers
//!
//! Each tick also drives the reconnect countdown, the heartbeat watchdog,
//! heartbeat pings and the telemetry summary.
//!
//! [`tick`]: ConnectionManager::tick
//! [`run`]: ConnectionManager::run

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, RequestId, SessionId};
use crate::protocol::{
    AutomationRequest, AutomationResponse, BridgeAck, BridgeErrorCode, BridgeHello, CloseCode,
    Envelope,
};
use crate::transport::handshake::CAPABILITY_TOKEN_HEADER;
use crate::transport::{
    Connection, ConnectionEvent, ConnectionEventKind, ConnectionOptions, ConnectionRole,
    EventReceiver, EventSender, Listener, ListenerSettings, TlsContext,
};

use super::builder::BridgeBuilder;
use super::config::BridgeConfig;
use super::event::BridgeEvent;
use super::handle::{BridgeHandle, ManagerShared, send_envelope};
use super::rate_limit::{RateDecision, RateLimiter};
use super::telemetry::ActionSummary;

// ============================================================================
// Constants
// ============================================================================

/// Envelope protocol version advertised in `bridge_ack`.
pub const PROTOCOL_VERSION: u32 = 1;

/// `type` tag of a request envelope.
const AUTOMATION_REQUEST: &str = "automation_request";

/// Message types accepted from peers.
const SUPPORTED_OPCODES: &[&str] = &["bridge_hello", AUTOMATION_REQUEST];

/// Message types peers receive.
const RESPONSE_OPCODES: &[&str] = &[
    "bridge_ack",
    "bridge_error",
    "automation_response",
    "progress_update",
];

/// Features advertised in `bridge_ack`.
const CAPABILITIES: &[&str] = &["automation", "progress_updates", "heartbeat"];

// ============================================================================
// Types
// ============================================================================

/// A correlated `automation_request` handed to the request handler.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    /// Correlation id.
    pub request_id: RequestId,
    /// Handler name.
    pub action: String,
    /// Action arguments; `Null` if absent.
    pub payload: Value,
    /// Connection that issued the request.
    pub connection_id: ConnectionId,
}

/// Callback invoked on the owner for each valid request.
///
/// Must not block; long work belongs in a spawned task that answers through
/// the [`BridgeHandle`].
pub type RequestHandler = Box<dyn Fn(IncomingRequest, BridgeHandle) + Send + Sync>;

// ============================================================================
// ConnectionManager
// ============================================================================

/// Owns listeners, the outbound connection, and all bridge bookkeeping.
///
/// # Example
///
/// ```no_run
/// use automation_bridge::{BridgeConfig, ConnectionManager};
///
/// # async fn example() -> automation_bridge::Result<()> {
/// let mut manager = ConnectionManager::builder()
///     .config(BridgeConfig::new().with_capability_token("secret", true))
///     .on_request(|request, handle| {
///         tokio::spawn(async move {
///             handle.send_automation_response(&request.request_id, None, None).await;
///         });
///     })
///     .build()?;
///
/// manager
///     .run(async {
///         let _ = tokio::signal::ctrl_c().await;
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager {
    config: BridgeConfig,
    session_id: SessionId,
    shared: Arc<ManagerShared>,
    handler: Option<RequestHandler>,
    events_tx: EventSender,
    events_rx: EventReceiver,
    listeners: Vec<Listener>,
    /// Ports actually bound on first start; reused on reconnect.
    bound_ports: Vec<u16>,
    outbound: Option<Connection>,
    server_tls: Option<TlsContext>,
    client_tls: Option<TlsContext>,
    started: bool,
    reconnect_at: Option<Instant>,
    last_heartbeat_at: Instant,
    last_ping_at: Instant,
    last_telemetry_at: Instant,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("session_id", &self.session_id)
            .field("started", &self.started)
            .field("listeners", &self.listeners.len())
            .field("outbound", &self.outbound.as_ref().map(Connection::id))
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ConnectionManager - Constructors
// ============================================================================

impl ConnectionManager {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::new()
    }

    /// Creates a stopped manager.
    ///
    /// # Errors
    ///
    /// Returns the first problem found by [`BridgeConfig::validate`].
    pub fn new(config: BridgeConfig, handler: Option<RequestHandler>) -> Result<Self> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let rate = RateLimiter::new(
            config.max_messages_per_minute,
            config.max_automation_requests_per_minute,
        );
        let now = Instant::now();

        Ok(Self {
            config,
            session_id: SessionId::generate(),
            shared: Arc::new(ManagerShared::new(rate)),
            handler,
            events_tx,
            events_rx,
            listeners: Vec::new(),
            bound_ports: Vec::new(),
            outbound: None,
            server_tls: None,
            client_tls: None,
            started: false,
            reconnect_at: None,
            last_heartbeat_at: now,
            last_ping_at: now,
            last_telemetry_at: now,
        })
    }
}

// ============================================================================
// ConnectionManager - Lifecycle
// ============================================================================

impl ConnectionManager {
    /// Binds listeners and dials the outbound endpoint.
    ///
    /// Idempotent while started.
    ///
    /// # Errors
    ///
    /// - [`Error::Tls`] if a TLS context cannot be built
    /// - [`Error::Transport`] if a listener cannot bind
    /// - [`Error::InvalidUrl`] for a bad outbound URL
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        if self.config.enable_tls
            && let (Some(cert), Some(key)) = (
                &self.config.tls_certificate_path,
                &self.config.tls_private_key_path,
            )
        {
            self.server_tls = Some(TlsContext::server_from_pem(cert, key)?);
        }
        if let Some(url) = &self.config.server_url
            && url.trim_start().to_ascii_lowercase().starts_with("wss:")
        {
            self.client_tls = Some(TlsContext::client(self.config.tls_ca_path.as_deref())?);
        }

        self.bound_ports = self.config.effective_ports().to_vec();
        if let Err(e) = self.open_listeners().await {
            self.close_listeners(CloseCode::Normal, "startup failed").await;
            return Err(e);
        }
        self.bound_ports = self.listeners.iter().map(Listener::port).collect();

        if self.config.server_url.is_some() {
            self.connect_outbound()?;
        }

        let now = Instant::now();
        self.last_heartbeat_at = now;
        self.last_ping_at = now;
        self.last_telemetry_at = now;
        self.started = true;

        info!(
            session = %self.session_id,
            ports = ?self.bound_ports,
            outbound = ?self.config.server_url,
            "Bridge started"
        );
        Ok(())
    }

    /// Closes every connection and clears all state.
    ///
    /// Idempotent.
    pub async fn stop(&mut self) {
        if !self.started && self.listeners.is_empty() && self.outbound.is_none() {
            return;
        }
        self.started = false;
        self.reconnect_at = None;

        let closing = self.close_everything(CloseCode::Normal, "bridge stopping").await;
        for connection in closing {
            connection.join().await;
        }
        while self.events_rx.try_recv().is_ok() {}
        self.shared.clear();

        info!(session = %self.session_id, "Bridge stopped");
    }

    /// Starts if needed, then ticks until `shutdown` completes, then stops.
    ///
    /// Events are handled as they arrive; timers advance every
    /// `tick_interval`.
    ///
    /// # Errors
    ///
    /// Returns errors from [`start`](Self::start).
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.start().await?;

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Drains queued worker events and advances timers.
    ///
    /// Call periodically from the owning task when not using [`run`](Self::run).
    pub async fn tick(&mut self) {
        let queued = self.events_rx.len();
        for _ in 0..queued {
            let Ok(event) = self.events_rx.try_recv() else {
                break;
            };
            self.handle_event(event);
        }
        if self.started {
            self.drive_timers(Instant::now()).await;
        }
    }
}

// ============================================================================
// ConnectionManager - Accessors
// ============================================================================

impl ConnectionManager {
    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Returns the session id advertised in `bridge_ack`.
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Returns `true` between `start` and `stop`.
    #[inline]
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Returns a handle for sending responses.
    #[must_use]
    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle::new(Arc::clone(&self.shared))
    }

    /// Subscribes to [`BridgeEvent`]s.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.subscribe()
    }

    /// Returns the ports currently listening.
    #[must_use]
    pub fn listener_ports(&self) -> Vec<u16> {
        self.listeners.iter().map(Listener::port).collect()
    }

    /// Returns the outbound connection, if one exists.
    #[must_use]
    pub fn outbound(&self) -> Option<&Connection> {
        self.outbound.as_ref()
    }

    /// Returns the number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Returns the number of authenticated connections.
    #[must_use]
    pub fn authenticated_count(&self) -> usize {
        self.shared.authenticated.lock().len()
    }

    /// Returns the number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Returns per-action telemetry.
    #[must_use]
    pub fn telemetry(&self) -> Vec<ActionSummary> {
        self.shared.telemetry.snapshot()
    }
}

// ============================================================================
// ConnectionManager - Sockets
// ============================================================================

impl ConnectionManager {
    fn connection_options(&self, tls: Option<TlsContext>) -> ConnectionOptions {
        ConnectionOptions {
            max_frame_bytes: self.config.max_frame_bytes,
            max_message_bytes: self.config.max_message_bytes,
            protocols: self.config.subprotocols.clone(),
            extra_headers: Vec::new(),
            tls,
            ready_timeout: self.config.ready_timeout,
            send_timeout: self.config.send_timeout,
        }
    }

    async fn open_listeners(&mut self) -> Result<()> {
        for port in self.bound_ports.clone() {
            let settings = ListenerSettings {
                host: self.config.listen_host.clone(),
                port,
                allow_non_loopback: self.config.allow_non_loopback,
                backlog: self.config.listen_backlog,
                accept_sleep: self.config.accept_sleep,
            };
            let options = self.connection_options(self.server_tls.clone());
            let listener = Listener::bind(&settings, options, self.events_tx.clone()).await?;
            self.listeners.push(listener);
        }
        Ok(())
    }

    fn connect_outbound(&mut self) -> Result<()> {
        let Some(url) = self.config.server_url.clone() else {
            return Ok(());
        };

        let mut options = self.connection_options(self.client_tls.clone());
        if let Some(token) = self.config.token() {
            options
                .extra_headers
                .push((CAPABILITY_TOKEN_HEADER.to_owned(), token.to_owned()));
        }

        let connection = Connection::connect(&url, options, self.events_tx.clone())?;
        info!(id = %connection.id(), %url, "Dialing bridge endpoint");
        self.outbound = Some(connection);
        Ok(())
    }

    async fn close_listeners(&mut self, code: CloseCode, reason: &str) {
        for listener in self.listeners.drain(..) {
            listener.close(code, reason).await;
        }
    }

    /// Starts closing every socket and returns the connections closed.
    async fn close_everything(&mut self, code: CloseCode, reason: &str) -> Vec<Connection> {
        let mut closing: Vec<Connection> =
            self.shared.connections.lock().values().cloned().collect();
        self.close_listeners(code, reason).await;
        if let Some(outbound) = self.outbound.take() {
            closing.push(outbound);
        }
        for connection in &closing {
            connection.close(code, reason);
        }
        closing
    }

    fn schedule_reconnect(&mut self, delay: Duration, forced: bool) {
        self.reconnect_at = Some(Instant::now() + delay);
        info!(delay_ms = delay.as_millis() as u64, forced, "Reconnect scheduled");
        self.shared
            .emit(BridgeEvent::ReconnectScheduled { delay, forced });
    }

    async fn reconnect(&mut self) {
        debug!("Reconnect countdown elapsed");

        if self.listeners.is_empty()
            && !self.bound_ports.is_empty()
            && let Err(e) = self.open_listeners().await
        {
            error!(error = %e, "Failed to reopen listeners");
            self.close_listeners(CloseCode::Normal, "reopen failed").await;
        }

        if self.outbound.is_none()
            && self.config.server_url.is_some()
            && let Err(e) = self.connect_outbound()
        {
            error!(error = %e, "Failed to dial bridge endpoint");
        }

        let listeners_missing = self.listeners.is_empty() && !self.bound_ports.is_empty();
        if listeners_missing {
            let delay = self.retry_delay();
            self.schedule_reconnect(delay, false);
        }
        self.last_heartbeat_at = Instant::now();
    }

    /// Closes every socket and arms the reconnect countdown.
    async fn force_reconnect(&mut self, reason: &str) {
        warn!(reason, "Forcing reconnect of all connections");
        self.close_everything(CloseCode::Normal, reason).await;
        let delay = self.retry_delay();
        self.schedule_reconnect(delay, true);
    }

    fn retry_delay(&self) -> Duration {
        self.config.reconnect_delay
    }
}

// ============================================================================
// ConnectionManager - Timers
// ============================================================================

impl ConnectionManager {
    async fn drive_timers(&mut self, now: Instant) {
        if let Some(at) = self.reconnect_at
            && now >= at
        {
            self.reconnect_at = None;
            self.reconnect().await;
        }

        let timeout = self.config.heartbeat_timeout;
        if !timeout.is_zero()
            && self.reconnect_at.is_none()
            && self.connection_count() > 0
            && now.saturating_duration_since(self.last_heartbeat_at) > timeout
        {
            self.force_reconnect("heartbeat timeout").await;
        }

        let interval = self.config.heartbeat_interval;
        if !interval.is_zero() && now.saturating_duration_since(self.last_ping_at) >= interval {
            self.last_ping_at = now;
            let open: Vec<Connection> = self.shared.connections.lock().values().cloned().collect();
            for connection in open {
                if let Err(e) = connection.send_ping(&[]) {
                    debug!(id = %connection.id(), error = %e, "Heartbeat ping failed");
                }
            }
        }

        let interval = self.config.telemetry_interval;
        if !interval.is_zero() && now.saturating_duration_since(self.last_telemetry_at) >= interval
        {
            self.last_telemetry_at = now;
            self.shared.telemetry.log_summary();
        }
    }
}

// ============================================================================
// ConnectionManager - Event Handling
// ============================================================================

impl ConnectionManager {
    fn handle_event(&mut self, event: ConnectionEvent) {
        let ConnectionEvent { connection, kind } = event;
        let id = connection.id();

        match kind {
            ConnectionEventKind::Connected { protocol } => {
                self.shared.connections.lock().insert(id, connection.clone());
                self.last_heartbeat_at = Instant::now();
                debug!(%id, ?protocol, "Connection registered");
                self.shared.emit(BridgeEvent::Connected {
                    connection_id: id,
                    role: connection.role(),
                    peer_addr: connection.peer_addr(),
                });

                match connection.role() {
                    ConnectionRole::ServerAccepted => connection.signal_ready(),
                    ConnectionRole::ClientOutbound => self.greet_endpoint(&connection),
                    ConnectionRole::ServerListening => {}
                }
            }
            ConnectionEventKind::Message(text) => self.handle_message(&connection, &text),
            ConnectionEventKind::Heartbeat => {
                self.last_heartbeat_at = Instant::now();
            }
            ConnectionEventKind::Error { code, reason } => {
                self.shared.forget(&connection);
                self.shared.emit(BridgeEvent::ConnectionError {
                    connection_id: id,
                    code,
                    reason,
                });
                self.outbound_lost(&connection);
            }
            ConnectionEventKind::Closed { code, reason } => {
                self.shared.forget(&connection);
                self.shared.emit(BridgeEvent::Closed {
                    connection_id: id,
                    code,
                    reason,
                });
                self.outbound_lost(&connection);
            }
        }
    }

    /// Tears down bookkeeping for the outbound connection and arms a redial.
    fn outbound_lost(&mut self, connection: &Connection) {
        if self.outbound.as_ref() != Some(connection) {
            return;
        }
        self.outbound = None;

        let delay = self.config.reconnect_delay;
        if self.started && !delay.is_zero() && self.reconnect_at.is_none() {
            self.schedule_reconnect(delay, false);
        }
    }

    /// Sends `bridge_hello` on a freshly opened outbound connection.
    fn greet_endpoint(&self, connection: &Connection) {
        connection.set_authenticated(true);
        self.shared.authenticated.lock().insert(connection.id());
        self.shared.emit(BridgeEvent::Authenticated {
            connection_id: connection.id(),
        });

        let hello = Envelope::BridgeHello(BridgeHello {
            capability_token: self.config.token().map(str::to_owned),
        });
        if let Err(e) = send_envelope(connection, &hello) {
            warn!(id = %connection.id(), error = %e, "Failed to send bridge_hello");
        }
    }

    fn handle_message(&mut self, connection: &Connection, text: &str) {
        let id = connection.id();
        let parsed = Envelope::parse(text);
        let is_automation = match &parsed {
            Ok(envelope) => matches!(envelope, Envelope::AutomationRequest(_)),
            Err(_) => declares_type(text, AUTOMATION_REQUEST),
        };

        let decision = self.shared.rate.record(id, is_automation, Instant::now());
        if decision != RateDecision::Allowed {
            let err = Error::RateLimitExceeded { connection_id: id };
            warn!(%id, ?decision, "Rate limit exceeded");
            self.reject(
                connection,
                BridgeErrorCode::RateLimitExceeded,
                &err.to_string(),
                err.close_code(),
            );
            return;
        }

        let envelope = match parsed {
            Ok(envelope) => envelope,
            Err(e) => {
                if is_automation && !self.shared.is_authenticated(id) {
                    warn!(%id, "Malformed automation_request before bridge_hello");
                    self.require_handshake(connection);
                    return;
                }
                debug!(%id, error = %e, "Invalid envelope");
                self.send_bridge_error(connection, BridgeErrorCode::InvalidMessage, &e.to_string());
                return;
            }
        };

        match envelope {
            Envelope::BridgeHello(hello) => self.handle_hello(connection, hello),
            Envelope::AutomationRequest(request) => self.handle_request(connection, request),
            Envelope::BridgeAck(ack) => {
                info!(
                    %id,
                    server = %ack.server_name,
                    version = %ack.server_version,
                    session = %ack.session_id,
                    "Bridge endpoint acknowledged"
                );
            }
            Envelope::BridgeError(err) => {
                warn!(%id, error = %err.error, message = %err.message, "Peer reported bridge error");
                if connection.role() == ConnectionRole::ClientOutbound {
                    connection.close(CloseCode::Normal, &err.error);
                }
            }
            other @ (Envelope::AutomationResponse(_) | Envelope::ProgressUpdate(_)) => {
                let message = format!("unexpected message type '{}'", other.kind());
                self.send_bridge_error(connection, BridgeErrorCode::InvalidMessage, &message);
            }
        }
    }

    fn handle_hello(&self, connection: &Connection, hello: BridgeHello) {
        let id = connection.id();

        if self.config.require_capability_token {
            let expected = self.config.token();
            if expected.is_none() || hello.capability_token.as_deref() != expected {
                let err = Error::auth("capability token missing or invalid");
                warn!(%id, "Rejected bridge_hello: {err}");
                self.reject(
                    connection,
                    BridgeErrorCode::InvalidCapabilityToken,
                    &err.to_string(),
                    err.close_code(),
                );
                return;
            }
        }

        connection.set_authenticated(true);
        self.shared.authenticated.lock().insert(id);
        info!(%id, peer = ?connection.peer_addr(), "Peer authenticated");
        self.shared
            .emit(BridgeEvent::Authenticated { connection_id: id });

        let ack = Envelope::BridgeAck(BridgeAck {
            message: "Automation bridge ready".to_owned(),
            server_name: self.config.server_name.clone(),
            server_version: self.config.server_version.clone(),
            session_id: self.session_id,
            protocol_version: PROTOCOL_VERSION,
            supported_opcodes: to_strings(SUPPORTED_OPCODES),
            expected_response_opcodes: to_strings(RESPONSE_OPCODES),
            capabilities: to_strings(CAPABILITIES),
            heartbeat_interval_ms: u64::try_from(self.config.heartbeat_interval.as_millis())
                .unwrap_or(u64::MAX),
        });
        if let Err(e) = send_envelope(connection, &ack) {
            warn!(%id, error = %e, "Failed to send bridge_ack");
        }
    }

    fn handle_request(&self, connection: &Connection, request: AutomationRequest) {
        let id = connection.id();

        if !self.shared.is_authenticated(id) {
            warn!(%id, action = %request.action, "automation_request before bridge_hello");
            self.require_handshake(connection);
            return;
        }

        if request.request_id.is_empty() {
            self.send_bridge_error(connection, BridgeErrorCode::InvalidMessage, "requestId is empty");
            return;
        }

        let Some(handler) = &self.handler else {
            self.send_failure(
                connection,
                &request.request_id,
                BridgeErrorCode::HandlerUnavailable,
                "no request handler is registered",
            );
            return;
        };

        let duplicate = {
            let mut pending = self.shared.pending.lock();
            let in_flight = pending
                .get(&request.request_id)
                .is_some_and(|weak| weak.upgrade().is_some());
            if !in_flight {
                pending.insert(request.request_id.clone(), connection.downgrade());
            }
            in_flight
        };
        if duplicate {
            self.send_failure(
                connection,
                &request.request_id,
                BridgeErrorCode::DuplicateRequest,
                "requestId is already in flight",
            );
            return;
        }

        debug!(%id, request_id = %request.request_id, action = %request.action, "Dispatching request");
        self.shared
            .telemetry
            .start(&request.request_id, &request.action);

        handler(
            IncomingRequest {
                request_id: request.request_id,
                action: request.action,
                payload: request.payload,
                connection_id: id,
            },
            self.handle(),
        );
    }

    fn send_bridge_error(&self, connection: &Connection, code: BridgeErrorCode, message: &str) {
        if let Err(e) = send_envelope(connection, &Envelope::bridge_error(code, message)) {
            debug!(id = %connection.id(), error = %e, "Failed to send bridge_error");
        }
    }

    fn send_failure(
        &self,
        connection: &Connection,
        request_id: &RequestId,
        code: BridgeErrorCode,
        message: &str,
    ) {
        let response = Envelope::AutomationResponse(AutomationResponse::failure(
            request_id.clone(),
            code.as_str(),
            message,
        ));
        if let Err(e) = send_envelope(connection, &response) {
            debug!(id = %connection.id(), error = %e, "Failed to send failure response");
        }
    }

    fn require_handshake(&self, connection: &Connection) {
        self.reject(
            connection,
            BridgeErrorCode::HandshakeRequired,
            "send bridge_hello before automation_request",
            CloseCode::HandshakeRequired,
        );
    }

    /// Sends `bridge_error` then closes with `close`.
    fn reject(
        &self,
        connection: &Connection,
        code: BridgeErrorCode,
        message: &str,
        close: CloseCode,
    ) {
        self.send_bridge_error(connection, code, message);
        connection.close(close, code.as_str());
    }
}

/// Checks only the `type` tag of a message that failed full parsing.
fn declares_type(text: &str, kind: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| value.get("type")?.as_str().map(|tag| tag == kind))
        .unwrap_or(false)
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

// ============================================================================
// Tests
// ============================================================================
