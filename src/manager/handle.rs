//! Response path shared by the manager and request handlers.
//!
//! A [`BridgeHandle`] is given to every request handler. It is `Clone`,
//! `Send` and `Sync`, so a handler may move it into a spawned task and
//! answer whenever the work finishes.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::Result;
use crate::identifiers::{ConnectionId, RequestId};
use crate::protocol::{AutomationResponse, Envelope, ProgressUpdate};
use crate::transport::{Connection, WeakConnection};

use super::event::{BridgeEvent, EVENT_CAPACITY};
use super::rate_limit::RateLimiter;
use super::telemetry::Telemetry;

// ============================================================================
// Delivery
// ============================================================================

/// Where an `automation_response` ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent on the connection that issued the request.
    Original,
    /// The original was gone; sent on another authenticated connection.
    Fallback(ConnectionId),
    /// No connection could take it; a `ResponseFallback` event was emitted.
    Undelivered,
}

impl Delivery {
    /// Returns `true` unless [`Undelivered`](Self::Undelivered).
    #[inline]
    #[must_use]
    pub const fn is_delivered(self) -> bool {
        !matches!(self, Self::Undelivered)
    }
}

// ============================================================================
// ManagerShared
// ============================================================================

/// State touched by both the owner loop and handler tasks.
///
/// Each map has its own short-held lock; none is held across an await.
pub(crate) struct ManagerShared {
    /// Correlation table: request → issuing connection.
    pub(crate) pending: Mutex<FxHashMap<RequestId, WeakConnection>>,
    /// Open connections by id.
    pub(crate) connections: Mutex<FxHashMap<ConnectionId, Connection>>,
    /// Connections that completed `bridge_hello`.
    pub(crate) authenticated: Mutex<FxHashSet<ConnectionId>>,
    pub(crate) rate: RateLimiter,
    pub(crate) telemetry: Telemetry,
    events: broadcast::Sender<BridgeEvent>,
}

impl ManagerShared {
    pub(crate) fn new(rate: RateLimiter) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pending: Mutex::new(FxHashMap::default()),
            connections: Mutex::new(FxHashMap::default()),
            authenticated: Mutex::new(FxHashSet::default()),
            rate,
            telemetry: Telemetry::new(),
            events,
        }
    }

    pub(crate) fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub(crate) fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.authenticated.lock().contains(&id)
    }

    /// Authenticated, open connections ordered by id.
    pub(crate) fn authenticated_connections(&self) -> Vec<Connection> {
        let authenticated = self.authenticated.lock().clone();
        let mut connections: Vec<_> = self
            .connections
            .lock()
            .values()
            .filter(|c| authenticated.contains(&c.id()) && c.is_connected())
            .cloned()
            .collect();
        connections.sort_by_key(Connection::id);
        connections
    }

    /// Drops every trace of a connection.
    pub(crate) fn forget(&self, connection: &Connection) {
        let id = connection.id();
        self.connections.lock().remove(&id);
        self.authenticated.lock().remove(&id);
        self.rate.remove(id);

        let mut orphaned = Vec::new();
        self.pending.lock().retain(|request_id, weak| {
            let keep = weak.upgrade().is_some_and(|c| c.id() != id);
            if !keep {
                orphaned.push(request_id.clone());
            }
            keep
        });
        for request_id in &orphaned {
            self.telemetry.discard(request_id);
        }
    }

    pub(crate) fn clear(&self) {
        self.pending.lock().clear();
        self.connections.lock().clear();
        self.authenticated.lock().clear();
        self.rate.clear();
        self.telemetry.clear();
    }
}

/// Serializes and sends one envelope.
pub(crate) fn send_envelope(connection: &Connection, envelope: &Envelope) -> Result<()> {
    let text = envelope.to_json()?;
    connection.send_text(&text)
}

// ============================================================================
// BridgeHandle
// ============================================================================

/// Sends responses and progress updates for correlated requests.
#[derive(Clone)]
pub struct BridgeHandle {
    pub(crate) shared: Arc<ManagerShared>,
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl BridgeHandle {
    pub(crate) fn new(shared: Arc<ManagerShared>) -> Self {
        Self { shared }
    }

    /// Sends a successful `automation_response`.
    pub async fn send_automation_response(
        &self,
        request_id: &RequestId,
        message: Option<String>,
        result: Option<Value>,
    ) -> Delivery {
        self.send_response(AutomationResponse::success(
            request_id.clone(),
            message,
            result,
        ))
        .await
    }

    /// Sends a failed `automation_response` with `error` as its code.
    pub async fn send_automation_error(
        &self,
        request_id: &RequestId,
        error: &str,
        message: &str,
    ) -> Delivery {
        self.send_response(AutomationResponse::failure(
            request_id.clone(),
            error,
            message,
        ))
        .await
    }

    /// Delivers `response` and completes its correlation entry.
    ///
    /// Tries the issuing connection, then any other authenticated open
    /// connection. Never fails; see [`Delivery`].
    pub async fn send_response(&self, response: AutomationResponse) -> Delivery {
        let request_id = response.request_id.clone();
        let error_code = (!response.error.is_empty()).then_some(response.error.as_str());
        self.shared.telemetry.record(
            &request_id,
            response.success,
            response.message.as_deref(),
            error_code,
        );

        let envelope = Envelope::AutomationResponse(response);
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                return self.undelivered(request_id, format!("serialization failed: {e}"));
            }
        };

        let original = self
            .shared
            .pending
            .lock()
            .remove(&request_id)
            .and_then(|weak| weak.upgrade());
        let original_id = original.as_ref().map(Connection::id);

        if let Some(connection) = original {
            match connection.send_text(&text) {
                Ok(()) => return Delivery::Original,
                Err(e) => {
                    debug!(%request_id, id = %connection.id(), error = %e, "Original connection unreachable");
                }
            }
        }

        for candidate in self.shared.authenticated_connections() {
            if Some(candidate.id()) == original_id {
                continue;
            }
            if candidate.send_text(&text).is_ok() {
                warn!(%request_id, id = %candidate.id(), "Response delivered on fallback connection");
                return Delivery::Fallback(candidate.id());
            }
        }

        self.undelivered(request_id, "no authenticated connection available".to_owned())
    }

    /// Sends a `progress_update` to the issuing connection only.
    ///
    /// Best effort: returns `false` if it could not be sent.
    pub async fn send_progress_update(
        &self,
        request_id: &RequestId,
        percent: Option<f32>,
        message: Option<String>,
        still_working: bool,
    ) -> bool {
        let Some(connection) = self
            .shared
            .pending
            .lock()
            .get(request_id)
            .and_then(WeakConnection::upgrade)
        else {
            debug!(%request_id, "Progress update for unknown request dropped");
            return false;
        };

        let update = ProgressUpdate::now(request_id.clone(), percent, message, still_working);
        match send_envelope(&connection, &Envelope::ProgressUpdate(update)) {
            Ok(()) => true,
            Err(e) => {
                debug!(%request_id, error = %e, "Progress update not sent");
                false
            }
        }
    }

    /// Returns `true` while `request_id` awaits a response.
    #[must_use]
    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.shared.pending.lock().contains_key(request_id)
    }

    /// Returns the number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    fn undelivered(&self, request_id: RequestId, reason: String) -> Delivery {
        warn!(%request_id, %reason, "Response undelivered");
        self.shared
            .emit(BridgeEvent::ResponseFallback { request_id, reason });
        Delivery::Undelivered
    }
}

// ============================================================================
// Tests
// ============================================================================
