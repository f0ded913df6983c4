//! JSON envelope messages layered on top of text frames.
//!
//! Every text frame carries one JSON object with a mandatory `type`
//! discriminator.
//!
//! # Format
//!
//! ```json
//! { "type": "automation_request", "requestId": "r-1", "action": "list_assets", "payload": {} }
//! ```
//!
//! | `type` | Direction | Purpose |
//! |--------|-----------|---------|
//! | `bridge_hello` | Peer → Bridge | Authenticate with a capability token |
//! | `bridge_ack` | Bridge → Peer | Hello accepted, session parameters |
//! | `bridge_error` | Bridge → Peer | Control-level failure, usually followed by close |
//! | `automation_request` | Peer → Bridge | Invoke an action |
//! | `automation_response` | Bridge → Peer | Result of an action |
//! | `progress_update` | Bridge → Peer | Advisory progress for a long action |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::identifiers::{RequestId, SessionId};

// ============================================================================
// Envelope
// ============================================================================

/// One decoded bridge message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Peer greeting.
    BridgeHello(BridgeHello),
    /// Greeting accepted.
    BridgeAck(BridgeAck),
    /// Control-level error.
    BridgeError(BridgeError),
    /// Action invocation.
    AutomationRequest(AutomationRequest),
    /// Action result.
    AutomationResponse(AutomationResponse),
    /// Advisory progress.
    ProgressUpdate(ProgressUpdate),
}

impl Envelope {
    /// Parses a text message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) for malformed JSON, an
    /// unknown `type`, or missing mandatory fields.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes to a JSON text payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if a payload value fails to
    /// serialize.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Returns the wire `type` discriminator.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BridgeHello(_) => "bridge_hello",
            Self::BridgeAck(_) => "bridge_ack",
            Self::BridgeError(_) => "bridge_error",
            Self::AutomationRequest(_) => "automation_request",
            Self::AutomationResponse(_) => "automation_response",
            Self::ProgressUpdate(_) => "progress_update",
        }
    }

    /// Creates a `bridge_error` envelope.
    #[must_use]
    pub fn bridge_error(code: BridgeErrorCode, message: impl Into<String>) -> Self {
        Self::BridgeError(BridgeError {
            error: code.as_str().to_owned(),
            message: message.into(),
        })
    }
}

// ============================================================================
// Message Bodies
// ============================================================================

/// `bridge_hello` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeHello {
    /// Pre-shared capability token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_token: Option<String>,
}

/// `bridge_ack` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeAck {
    /// Human-readable greeting.
    pub message: String,
    /// Bridge name.
    pub server_name: String,
    /// Bridge version.
    pub server_version: String,
    /// Manager session.
    pub session_id: SessionId,
    /// Envelope protocol version.
    pub protocol_version: u32,
    /// Message types the bridge accepts.
    pub supported_opcodes: Vec<String>,
    /// Message types the peer should expect back.
    pub expected_response_opcodes: Vec<String>,
    /// Feature flags.
    pub capabilities: Vec<String>,
    /// Interval between bridge pings.
    pub heartbeat_interval_ms: u64,
}

/// `bridge_error` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeError {
    /// Machine-readable code, see [`BridgeErrorCode`].
    pub error: String,
    /// Description.
    #[serde(default)]
    pub message: String,
}

/// `automation_request` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRequest {
    /// Correlation id.
    pub request_id: RequestId,
    /// Handler name.
    pub action: String,
    /// Action arguments.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

/// `automation_response` body.
///
/// `error` is always serialized, as the empty string on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationResponse {
    /// Correlation id.
    pub request_id: RequestId,
    /// Whether the action succeeded.
    pub success: bool,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error code, empty on success.
    #[serde(default)]
    pub error: String,
    /// Action result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl AutomationResponse {
    /// Creates a successful response.
    #[must_use]
    pub fn success(request_id: RequestId, message: Option<String>, result: Option<Value>) -> Self {
        Self {
            request_id,
            success: true,
            message,
            error: String::new(),
            result,
        }
    }

    /// Creates a failed response.
    #[must_use]
    pub fn failure(
        request_id: RequestId,
        error: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            success: false,
            message: Some(message.into()),
            error: error.into(),
            result: None,
        }
    }
}

/// `progress_update` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Correlation id.
    pub request_id: RequestId,
    /// Completion percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f32>,
    /// Status text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// `false` once the action is about to complete.
    pub still_working: bool,
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
}

impl ProgressUpdate {
    /// Creates an update stamped with the current time.
    #[must_use]
    pub fn now(
        request_id: RequestId,
        percent: Option<f32>,
        message: Option<String>,
        still_working: bool,
    ) -> Self {
        Self {
            request_id,
            percent,
            message,
            still_working,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ============================================================================
// BridgeErrorCode
// ============================================================================

/// Codes carried in `bridge_error.error` and failed `automation_response.error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeErrorCode {
    /// `automation_request` before a successful `bridge_hello`.
    HandshakeRequired,
    /// Capability token missing or wrong.
    InvalidCapabilityToken,
    /// Per-connection rate limit hit.
    RateLimitExceeded,
    /// Text frame is not a valid envelope.
    InvalidMessage,
    /// No request handler is registered.
    HandlerUnavailable,
    /// `requestId` already in flight.
    DuplicateRequest,
}

impl BridgeErrorCode {
    /// Returns the wire string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HandshakeRequired => "HANDSHAKE_REQUIRED",
            Self::InvalidCapabilityToken => "INVALID_CAPABILITY_TOKEN",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::HandlerUnavailable => "HANDLER_UNAVAILABLE",
            Self::DuplicateRequest => "DUPLICATE_REQUEST",
        }
    }
}

impl fmt::Display for BridgeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_parse_hello_with_token() {
        let envelope =
            Envelope::parse(r#"{"type":"bridge_hello","capabilityToken":"s3cret"}"#).unwrap();
        assert_eq!(
            envelope,
            Envelope::BridgeHello(BridgeHello {
                capability_token: Some("s3cret".into())
            })
        );
        assert_eq!(envelope.kind(), "bridge_hello");
    }

    #[test]
    fn test_parse_hello_without_token() {
        let envelope = Envelope::parse(r#"{"type":"bridge_hello"}"#).unwrap();
        assert_eq!(envelope, Envelope::BridgeHello(BridgeHello::default()));
    }

    #[test]
    fn test_parse_request_without_payload() {
        let envelope = Envelope::parse(
            r#"{"type":"automation_request","requestId":"r-1","action":"ping"}"#,
        )
        .unwrap();
        let Envelope::AutomationRequest(request) = envelope else {
            panic!("expected automation_request");
        };
        assert_eq!(request.request_id.as_str(), "r-1");
        assert_eq!(request.action, "ping");
        assert!(request.payload.is_null());
    }

    #[test]
    fn test_request_missing_action_is_rejected() {
        assert!(Envelope::parse(r#"{"type":"automation_request","requestId":"r-1"}"#).is_err());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(Envelope::parse(r#"{"type":"teleport"}"#).is_err());
        assert!(Envelope::parse("not json").is_err());
    }

    #[test]
    fn test_success_response_always_has_error_field() {
        let response = Envelope::AutomationResponse(AutomationResponse::success(
            RequestId::from("r-2"),
            None,
            Some(json!({"count": 3})),
        ));
        let value: Value = serde_json::from_str(&response.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "automation_response");
        assert_eq!(value["requestId"], "r-2");
        assert_eq!(value["success"], true);
        assert_eq!(value["error"], "");
        assert_eq!(value["result"]["count"], 3);
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_bridge_error_layout() {
        let envelope = Envelope::bridge_error(BridgeErrorCode::HandshakeRequired, "say hello");
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "bridge_error", "error": "HANDSHAKE_REQUIRED", "message": "say hello"})
        );
    }

    #[test]
    fn test_progress_update_layout() {
        let update = ProgressUpdate::now(RequestId::from("r-3"), Some(50.0), None, true);
        let value = serde_json::to_value(Envelope::ProgressUpdate(update)).unwrap();
        assert_eq!(value["type"], "progress_update");
        assert_eq!(value["stillWorking"], true);
        assert_eq!(value["percent"], 50.0);
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_ack_field_names() {
        let ack = Envelope::BridgeAck(BridgeAck {
            message: "ok".into(),
            server_name: "bridge".into(),
            server_version: "0.1.0".into(),
            session_id: SessionId::generate(),
            protocol_version: 1,
            supported_opcodes: vec!["automation_request".into()],
            expected_response_opcodes: vec!["automation_response".into()],
            capabilities: vec![],
            heartbeat_interval_ms: 10_000,
        });
        let value = serde_json::to_value(&ack).unwrap();
        for key in [
            "serverName",
            "serverVersion",
            "sessionId",
            "protocolVersion",
            "supportedOpcodes",
            "expectedResponseOpcodes",
            "capabilities",
            "heartbeatIntervalMs",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }
}
