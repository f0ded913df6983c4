//! Diagnostic events published by the connection manager.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::time::Duration;

use crate::identifiers::{ConnectionId, RequestId};
use crate::protocol::CloseCode;
use crate::transport::ConnectionRole;

// ============================================================================
// Constants
// ============================================================================

/// Buffered events per subscriber before the oldest are dropped.
pub const EVENT_CAPACITY: usize = 256;

// ============================================================================
// BridgeEvent
// ============================================================================

/// Lifecycle and delivery events, observed via
/// [`ConnectionManager::subscribe`](crate::ConnectionManager::subscribe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A handshake completed.
    Connected {
        /// The connection.
        connection_id: ConnectionId,
        /// Its role.
        role: ConnectionRole,
        /// Remote address.
        peer_addr: Option<SocketAddr>,
    },

    /// A connection may now send `automation_request`s.
    Authenticated {
        /// The connection.
        connection_id: ConnectionId,
    },

    /// A connection closed.
    Closed {
        /// The connection.
        connection_id: ConnectionId,
        /// Close code.
        code: CloseCode,
        /// Reason.
        reason: String,
    },

    /// A connection failed during handshake or transport.
    ConnectionError {
        /// The connection.
        connection_id: ConnectionId,
        /// Failure code.
        code: CloseCode,
        /// Reason.
        reason: String,
    },

    /// A response found no connection to deliver to.
    ResponseFallback {
        /// The undelivered request.
        request_id: RequestId,
        /// Why delivery failed.
        reason: String,
    },

    /// A reconnect countdown was armed.
    ReconnectScheduled {
        /// Time until the attempt.
        delay: Duration,
        /// `true` when triggered by the heartbeat watchdog.
        forced: bool,
    },
}

impl BridgeEvent {
    /// Returns the connection the event concerns, if any.
    #[must_use]
    pub const fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::Connected { connection_id, .. }
            | Self::Authenticated { connection_id }
            | Self::Closed { connection_id, .. }
            | Self::ConnectionError { connection_id, .. } => Some(*connection_id),
            Self::ResponseFallback { .. } | Self::ReconnectScheduled { .. } => None,
        }
    }
}
