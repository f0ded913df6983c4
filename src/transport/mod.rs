//! WebSocket transport layer.
//!
//! A from-scratch RFC 6455 engine: frame codec, opening handshake,
//! TLS-aware byte stream, and the per-connection worker that ties them
//! together.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   bytes   ┌─────────────┐  frames  ┌──────────────┐
//! │  Transport   │◄─────────►│ FrameCodec  │◄────────►│  Connection  │
//! │ (TCP / TLS)  │           │ + Assembler │          │   (worker)   │
//! └──────────────┘           └─────────────┘          └──────┬───────┘
//!                                                            │ events
//!                                                            ▼
//!                                                     ConnectionManager
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `Connection::connect` / `Listener` accept - worker task spawned
//! 2. Handshake - `Connected` or terminal `Error` event
//! 3. Receive loop - `Message` / `Heartbeat` events
//! 4. `Connection::close` or peer close - terminal `Closed` event
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Frame encode/decode |
//! | `assembler` | Fragment reassembly |
//! | `stream` | TCP/TLS byte stream |
//! | `tls` | TLS contexts |
//! | `handshake` | HTTP Upgrade exchange |
//! | `connection` | Connection worker and handle |
//! | `listener` | Bind and accept loop |
//! | `signal` | Cooperative stop signal |

// ============================================================================
// Submodules
// ============================================================================

/// Fragment reassembly.
pub mod assembler;

/// WebSocket connection and receive loop.
pub mod connection;

/// Frame codec.
pub mod frame;

/// Opening handshake, client and server.
pub mod handshake;

/// Listening socket and accept loop.
pub mod listener;

/// Cooperative stop signal.
pub mod signal;

/// Byte stream over TCP or TLS.
pub mod stream;

/// TLS contexts.
pub mod tls;

// ============================================================================
// Re-exports
// ============================================================================

pub use assembler::MessageAssembler;
pub use connection::{
    Connection, ConnectionEvent, ConnectionEventKind, ConnectionOptions, ConnectionRole,
    ConnectionState, EventReceiver, EventSender, WeakConnection,
};
pub use frame::{Frame, FrameCodec, Opcode};
pub use handshake::Endpoint;
pub use listener::{Listener, ListenerSettings};
pub use signal::{StopListener, StopSignal};
pub use stream::{Transport, TransportReader, TransportWriter};
pub use tls::TlsContext;
