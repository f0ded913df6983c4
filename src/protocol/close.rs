//! WebSocket close codes used by the bridge.
//!
//! RFC 6455 reserves `1000-2999` for the protocol and `4000-4999` for
//! private use. The bridge uses both ranges consistently:
//!
//! | Code | Variant | Meaning |
//! |------|---------|---------|
//! | 1000 | [`CloseCode::Normal`] | Normal closure |
//! | 1002 | [`CloseCode::ProtocolError`] | Unmasked client frame, framing violation |
//! | 1006 | [`CloseCode::Abnormal`] | Peer vanished without a close frame (never sent) |
//! | 1007 | [`CloseCode::InvalidPayload`] | Text message is not valid UTF-8 |
//! | 1009 | [`CloseCode::MessageTooBig`] | Message exceeds the configured cap |
//! | 4000 | [`CloseCode::HandshakeFailed`] | Opening handshake failed |
//! | 4002 | [`CloseCode::FragmentationViolation`] | Bad continuation sequence |
//! | 4003 | [`CloseCode::UnsupportedBinary`] | Binary frames are not accepted |
//! | 4004 | [`CloseCode::HandshakeRequired`] | `automation_request` before `bridge_hello` |
//! | 4005 | [`CloseCode::InvalidToken`] | Capability token mismatch |
//! | 4008 | [`CloseCode::RateLimited`] | Rate limit exceeded |
//! | 4403 | [`CloseCode::NoSubprotocol`] | No mutually supported subprotocol |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

// ============================================================================
// CloseCode
// ============================================================================

/// Close status code carried in a Close frame or a terminal connection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000 - normal closure.
    Normal,
    /// 1002 - peer violated framing rules.
    ProtocolError,
    /// 1006 - connection dropped without a close frame.
    Abnormal,
    /// 1007 - text payload was not UTF-8.
    InvalidPayload,
    /// 1009 - message exceeded the size cap.
    MessageTooBig,
    /// 4000 - opening handshake failed.
    HandshakeFailed,
    /// 4002 - continuation misuse.
    FragmentationViolation,
    /// 4003 - binary frame received.
    UnsupportedBinary,
    /// 4004 - request sent before `bridge_hello`.
    HandshakeRequired,
    /// 4005 - invalid capability token.
    InvalidToken,
    /// 4008 - rate limit exceeded.
    RateLimited,
    /// 4403 - no matching subprotocol.
    NoSubprotocol,
    /// Any other code received from a peer.
    Other(u16),
}

impl CloseCode {
    /// Returns the numeric wire value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::ProtocolError => 1002,
            Self::Abnormal => 1006,
            Self::InvalidPayload => 1007,
            Self::MessageTooBig => 1009,
            Self::HandshakeFailed => 4000,
            Self::FragmentationViolation => 4002,
            Self::UnsupportedBinary => 4003,
            Self::HandshakeRequired => 4004,
            Self::InvalidToken => 4005,
            Self::RateLimited => 4008,
            Self::NoSubprotocol => 4403,
            Self::Other(code) => code,
        }
    }

    /// Maps a wire value back to a known code.
    #[must_use]
    pub const fn from_u16(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1002 => Self::ProtocolError,
            1006 => Self::Abnormal,
            1007 => Self::InvalidPayload,
            1009 => Self::MessageTooBig,
            4000 => Self::HandshakeFailed,
            4002 => Self::FragmentationViolation,
            4003 => Self::UnsupportedBinary,
            4004 => Self::HandshakeRequired,
            4005 => Self::InvalidToken,
            4008 => Self::RateLimited,
            4403 => Self::NoSubprotocol,
            other => Self::Other(other),
        }
    }

    /// Returns `true` if this code may appear on the wire.
    ///
    /// 1006 is reserved for local reporting only.
    #[inline]
    #[must_use]
    pub const fn is_sendable(self) -> bool {
        !matches!(self, Self::Abnormal)
    }

    /// Builds a Close frame payload: 2-byte big-endian code plus UTF-8 reason.
    ///
    /// The reason is truncated on a character boundary so the payload stays
    /// within the 125-byte control frame limit.
    #[must_use]
    pub fn payload(self, reason: &str) -> Vec<u8> {
        let mut end = reason.len().min(123);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }

        let mut payload = Vec::with_capacity(2 + end);
        payload.extend_from_slice(&self.as_u16().to_be_bytes());
        payload.extend_from_slice(&reason.as_bytes()[..end]);
        payload
    }

    /// Parses a Close frame payload into code and reason.
    ///
    /// An empty payload means "no status", reported as [`CloseCode::Normal`].
    #[must_use]
    pub fn parse_payload(payload: &[u8]) -> (Self, String) {
        if payload.len() < 2 {
            return (Self::Normal, String::new());
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        (Self::from_u16(code), reason)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

// ============================================================================
// Tests
// ============================================================================
