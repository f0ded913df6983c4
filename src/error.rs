//! Error types for the automation bridge.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use automation_bridge::{Result, ConnectionManager};
//!
//! async fn example(manager: &mut ConnectionManager) -> Result<()> {
//!     manager.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Input | [`Error::InvalidUrl`], [`Error::Handshake`] |
//! | Protocol | [`Error::Protocol`], [`Error::Framing`] |
//! | Transport | [`Error::Transport`], [`Error::Tls`], [`Error::ConnectionClosed`], [`Error::NotConnected`], [`Error::Cancelled`] |
//! | Session | [`Error::Auth`], [`Error::RateLimitExceeded`] |
//! | External | [`Error::Io`], [`Error::Json`] |
//!
//! Frame- and handshake-level errors never escape a connection: the worker
//! converts them into a terminal lifecycle event carrying a [`CloseCode`].

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::ConnectionId;
use crate::protocol::CloseCode;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// FramingError
// ============================================================================

/// Wire-level decode failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Declared payload length exceeds the configured cap.
    ///
    /// Raised right after length decoding, before any payload byte is read.
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge {
        /// Declared payload length.
        size: u64,
        /// Configured cap.
        max: u64,
    },

    /// The byte source ended before the frame was complete.
    #[error("truncated frame: needed {needed} more bytes")]
    Truncated {
        /// Bytes still missing.
        needed: usize,
    },

    /// Opcode outside the RFC 6455 set.
    #[error("invalid opcode: 0x{0:X}")]
    InvalidOpcode(u8),

    /// RSV bits set without a negotiated extension.
    #[error("reserved bits set without extension")]
    ReservedBits,

    /// Control frame fragmented or longer than 125 bytes.
    #[error("invalid control frame: {0}")]
    InvalidControlFrame(&'static str),

    /// Declared length is not representable.
    #[error("invalid frame length: {0}")]
    InvalidLength(&'static str),
}

impl FramingError {
    /// Returns the close code used when this error terminates a connection.
    #[inline]
    #[must_use]
    pub const fn close_code(&self) -> CloseCode {
        match self {
            Self::PayloadTooLarge { .. } => CloseCode::MessageTooBig,
            _ => CloseCode::ProtocolError,
        }
    }
}

// ============================================================================
// ProtocolError
// ============================================================================

/// Peer violated the framing or fragmentation rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Server-accepted connection received an unmasked frame.
    #[error("client frame must be masked")]
    UnmaskedClientFrame,

    /// Continuation frame with no open fragmentation sequence.
    #[error("continuation frame without a preceding fragment")]
    UnexpectedContinuation,

    /// Text or Binary frame while a fragmented message is open.
    #[error("data frame received mid-fragmentation")]
    FrameMidFragmentation,

    /// Reassembled message exceeds the configured cap.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Size the message would reach.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// Binary frames are not supported.
    #[error("binary frames are not supported")]
    UnsupportedBinary,

    /// Text message is not valid UTF-8.
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,

    /// Decode failure.
    #[error(transparent)]
    Framing(#[from] FramingError),
}

impl ProtocolError {
    /// Returns the close code used when this error terminates a connection.
    #[must_use]
    pub const fn close_code(&self) -> CloseCode {
        match self {
            Self::UnmaskedClientFrame => CloseCode::ProtocolError,
            Self::UnexpectedContinuation | Self::FrameMidFragmentation => {
                CloseCode::FragmentationViolation
            }
            Self::MessageTooLarge { .. } => CloseCode::MessageTooBig,
            Self::UnsupportedBinary => CloseCode::UnsupportedBinary,
            Self::InvalidUtf8 => CloseCode::InvalidPayload,
            Self::Framing(e) => e.close_code(),
        }
    }
}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when bridge configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Input Errors
    // ========================================================================
    /// Malformed WebSocket URL.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Opening handshake failed.
    ///
    /// Carries the close code reported for the failed connection.
    #[error("Handshake failed ({code}): {message}")]
    Handshake {
        /// Close code reported in the terminal event.
        code: CloseCode,
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Peer violated framing rules.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Frame could not be decoded.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Socket I/O failure.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
    },

    /// TLS context or session failure.
    #[error("TLS error: {message}")]
    Tls {
        /// Description of the failure.
        message: String,
    },

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation on a connection that is not open.
    #[error("Connection {connection_id} is not open")]
    NotConnected {
        /// The connection.
        connection_id: ConnectionId,
    },

    /// Cooperative stop signal observed.
    #[error("Operation cancelled by stop signal")]
    Cancelled,

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// Missing or incorrect capability token.
    #[error("Authentication failed: {message}")]
    Auth {
        /// Description of the failure.
        message: String,
    },

    /// Per-connection rate limit exceeded.
    #[error("Rate limit exceeded on connection {connection_id}")]
    RateLimitExceeded {
        /// The offending connection.
        connection_id: ConnectionId,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid URL error.
    #[inline]
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a handshake error reported with close code 4000.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::handshake_with_code(CloseCode::HandshakeFailed, message)
    }

    /// Creates a handshake error with an explicit close code.
    #[inline]
    pub fn handshake_with_code(code: CloseCode, message: impl Into<String>) -> Self {
        Self::Handshake {
            code,
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a TLS error.
    #[inline]
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Creates an authentication error.
    #[inline]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Creates a not-connected error.
    #[inline]
    pub fn not_connected(connection_id: ConnectionId) -> Self {
        Self::NotConnected { connection_id }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection-level error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Tls { .. }
                | Self::ConnectionClosed
                | Self::NotConnected { .. }
                | Self::Io(_)
        )
    }

    /// Returns `true` if the peer broke the wire protocol.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Framing(_) | Self::Handshake { .. }
        )
    }

    /// Returns the close code a connection reports when it dies of this error.
    ///
    /// Transport failures have no close frame and report 1006.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Handshake { code, .. } => *code,
            Self::InvalidUrl { .. } => CloseCode::HandshakeFailed,
            Self::Protocol(e) => e.close_code(),
            Self::Framing(e) => e.close_code(),
            Self::Auth { .. } => CloseCode::InvalidToken,
            Self::RateLimitExceeded { .. } => CloseCode::RateLimited,
            Self::Cancelled => CloseCode::Normal,
            _ => CloseCode::Abnormal,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::transport("broken pipe");
        assert_eq!(err.to_string(), "Transport error: broken pipe");
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("no listener and no server url");
        assert_eq!(
            err.to_string(),
            "Configuration error: no listener and no server url"
        );
    }

    #[test]
    fn test_protocol_close_codes() {
        assert_eq!(
            ProtocolError::UnmaskedClientFrame.close_code(),
            CloseCode::ProtocolError
        );
        assert_eq!(
            ProtocolError::UnexpectedContinuation.close_code(),
            CloseCode::FragmentationViolation
        );
        assert_eq!(
            ProtocolError::FrameMidFragmentation.close_code(),
            CloseCode::FragmentationViolation
        );
        assert_eq!(
            ProtocolError::UnsupportedBinary.close_code(),
            CloseCode::UnsupportedBinary
        );
        assert_eq!(
            ProtocolError::MessageTooLarge { size: 10, max: 5 }.close_code(),
            CloseCode::MessageTooBig
        );
        assert_eq!(
            ProtocolError::from(FramingError::ReservedBits).close_code(),
            CloseCode::ProtocolError
        );
    }

    #[test]
    fn test_error_close_codes() {
        assert_eq!(Error::handshake("bad accept").close_code().as_u16(), 4000);
        assert_eq!(
            Error::handshake_with_code(CloseCode::NoSubprotocol, "none").close_code(),
            CloseCode::NoSubprotocol
        );
        assert_eq!(Error::transport("reset").close_code(), CloseCode::Abnormal);
        assert_eq!(Error::auth("bad token").close_code().as_u16(), 4005);
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::transport("x").is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(!Error::config("x").is_connection_error());
        assert!(Error::from(ProtocolError::InvalidUtf8).is_protocol_error());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::ConnectionReset, "reset");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
