//! Connection manager: listeners, outbound dialing, and bridge protocol.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ConnectionManager`] | Owner of every connection; runs the envelope protocol |
//! | [`BridgeBuilder`] | Fluent construction |
//! | [`BridgeConfig`] | Settings, loadable from JSON |
//! | [`BridgeHandle`] | Response path for request handlers |
//! | [`BridgeEvent`] | Lifecycle notifications |
//! | [`RateLimiter`] | Per-connection minute windows |
//! | [`Telemetry`] | Per-action timing |
//!
//! # Example
//!
//! ```no_run
//! use automation_bridge::{BridgeConfig, ConnectionManager, Result};
//!
//! # async fn example() -> Result<()> {
//! let mut manager = ConnectionManager::builder()
//!     .config(BridgeConfig::new().with_listen_ports([8091]))
//!     .on_request(|request, handle| {
//!         tokio::spawn(async move {
//!             handle
//!                 .send_automation_response(&request.request_id, Some("ok".into()), None)
//!                 .await;
//!         });
//!     })
//!     .build()?;
//!
//! manager
//!     .run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder.
pub mod builder;

/// Bridge settings.
pub mod config;

/// Owner loop and envelope dispatch.
pub mod core;

/// Broadcast events.
pub mod event;

/// Response delivery.
pub mod handle;

/// Message rate caps.
pub mod rate_limit;

/// Request timing.
pub mod telemetry;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::BridgeBuilder;
pub use config::BridgeConfig;
pub use core::{ConnectionManager, IncomingRequest, PROTOCOL_VERSION, RequestHandler};
pub use event::BridgeEvent;
pub use handle::{BridgeHandle, Delivery};
pub use rate_limit::{RateDecision, RateLimiter};
pub use telemetry::{ActionSummary, Telemetry};
