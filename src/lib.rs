//! Automation Bridge - WebSocket transport for editor automation.
//!
//! This library connects an automation client to a host process over
//! RFC 6455 WebSockets, with optional TLS, and runs a small JSON envelope
//! protocol on top: hello/ack authentication, correlated requests and
//! responses, and progress updates.
//!
//! # Architecture
//!
//! The bridge follows an owner/worker model:
//!
//! - **Workers**: one task per connection. Handshake, framing, reassembly,
//!   ping/pong. Results are queued as events.
//! - **Owner**: the [`ConnectionManager`]. Drains events, authenticates,
//!   rate-limits, dispatches requests, routes responses, drives timers.
//!
//! Key design principles:
//!
//! - Application logic never runs on a worker
//! - Every connection reports exactly one terminal event
//! - Responses fall back to another authenticated connection if the
//!   requester is gone
//!
//! # Quick Start
//!
//! ```no_run
//! use automation_bridge::{BridgeConfig, ConnectionManager, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = BridgeConfig::new()
//!         .with_listen_ports([8091])
//!         .with_capability_token("secret", true);
//!
//!     let mut manager = ConnectionManager::builder()
//!         .config(config)
//!         .on_request(|request, handle| {
//!             tokio::spawn(async move {
//!                 handle
//!                     .send_automation_response(&request.request_id, None, Some(request.payload))
//!                     .await;
//!             });
//!         })
//!         .build()?;
//!
//!     manager
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`manager`] | [`ConnectionManager`], configuration, response routing |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Close codes and JSON envelopes |
//! | [`transport`] | Frames, handshake, TLS, connections, listeners |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for connections, requests and sessions.
pub mod identifiers;

/// Connection manager.
///
/// Use [`ConnectionManager::builder()`] to create a configured instance.
pub mod manager;

/// Bridge message types.
///
/// Close codes and the `type`-tagged JSON envelope.
pub mod protocol;

/// WebSocket transport layer.
///
/// RFC 6455 framing and handshake over plain or TLS TCP streams.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Manager types
pub use manager::{
    ActionSummary, BridgeBuilder, BridgeConfig, BridgeEvent, BridgeHandle, ConnectionManager,
    Delivery, IncomingRequest, RequestHandler,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, RequestId, SessionId};

// Protocol types
pub use protocol::{BridgeErrorCode, CloseCode, Envelope};

// Transport types
pub use transport::{Connection, ConnectionEvent, ConnectionEventKind, ConnectionRole, Listener};
