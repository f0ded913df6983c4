//! Bridge wire protocol above raw WebSocket frames.
//!
//! # Protocol Overview
//!
//! | Layer | Carried In | Purpose |
//! |-------|------------|---------|
//! | [`Envelope`] | Text frame payload | `type`-tagged JSON messages |
//! | [`CloseCode`] | Close frame payload | Why a connection ended |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `close` | Close codes, standard and private range |
//! | `envelope` | Hello/ack/error/request/response/progress messages |

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket close codes.
pub mod close;

/// JSON envelope messages.
pub mod envelope;

// ============================================================================
// Re-exports
// ============================================================================

pub use close::CloseCode;
pub use envelope::{
    AutomationRequest, AutomationResponse, BridgeAck, BridgeError, BridgeErrorCode, BridgeHello,
    Envelope, ProgressUpdate,
};
