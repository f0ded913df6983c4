//! Bridge configuration.
//!
//! [`BridgeConfig`] is a plain value built once and handed to the manager;
//! nothing reads settings from ambient globals.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use automation_bridge::BridgeConfig;
//!
//! let config = BridgeConfig::new()
//!     .with_listen_ports([8091, 8092])
//!     .with_multi_listen(true)
//!     .with_capability_token("secret", true)
//!     .with_heartbeat_timeout(Duration::from_secs(30));
//!
//! config.validate()?;
//! ```
//!
//! # JSON
//!
//! [`BridgeConfig::from_json_str`] accepts camelCase keys; durations are
//! given as `...Seconds` or `...Ms` numbers. Missing keys keep defaults.

// ============================================================================
// Imports
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::transport::Endpoint;
use crate::transport::assembler::DEFAULT_MAX_MESSAGE_BYTES;
use crate::transport::connection::{DEFAULT_READY_TIMEOUT, DEFAULT_SEND_TIMEOUT};
use crate::transport::frame::DEFAULT_MAX_FRAME_BYTES;
use crate::transport::listener::{DEFAULT_ACCEPT_SLEEP, DEFAULT_BACKLOG};

// ============================================================================
// Constants
// ============================================================================

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8091;

/// Default subprotocol.
pub const DEFAULT_SUBPROTOCOL: &str = "mcp-automation";

/// Default outbound reconnect delay.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default interval between heartbeat pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default interval between telemetry summaries.
pub const DEFAULT_TELEMETRY_INTERVAL: Duration = Duration::from_secs(120);

/// Default owner tick period for [`run`](crate::ConnectionManager::run).
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// BridgeConfig
// ============================================================================

/// Settings consumed by the connection manager.
///
/// A zero duration or rate cap disables the feature it controls.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Host to bind listeners on.
    pub listen_host: String,

    /// Ports to listen on. Only the first is used unless `multi_listen`.
    pub listen_ports: Vec<u16>,

    /// Bind every port in `listen_ports`.
    pub multi_listen: bool,

    /// Permit binding a non-loopback host.
    pub allow_non_loopback: bool,

    /// Outbound endpoint (`ws://` or `wss://`).
    pub server_url: Option<String>,

    /// Serve listeners over TLS.
    pub enable_tls: bool,

    /// PEM certificate chain for listeners.
    pub tls_certificate_path: Option<PathBuf>,

    /// PEM private key for listeners.
    pub tls_private_key_path: Option<PathBuf>,

    /// PEM CA bundle trusted by the outbound connection. Bundled roots if unset.
    pub tls_ca_path: Option<PathBuf>,

    /// Shared secret expected in `bridge_hello`.
    pub capability_token: Option<String>,

    /// Reject `bridge_hello` without a matching token.
    pub require_capability_token: bool,

    /// Subprotocols offered and accepted.
    pub subprotocols: Vec<String>,

    /// Delay before redialing the outbound endpoint.
    pub reconnect_delay: Duration,

    /// Silence after which a forced reconnect happens.
    pub heartbeat_timeout: Duration,

    /// Period between heartbeat pings.
    pub heartbeat_interval: Duration,

    /// Inbound messages allowed per connection per minute.
    pub max_messages_per_minute: u32,

    /// Automation requests allowed per connection per minute.
    pub max_automation_requests_per_minute: u32,

    /// `listen()` backlog.
    pub listen_backlog: u32,

    /// Pause after a failed `accept()`.
    pub accept_sleep: Duration,

    /// Period between telemetry summary logs.
    pub telemetry_interval: Duration,

    /// Owner tick period used by `run`.
    pub tick_interval: Duration,

    /// Cap on one frame payload.
    pub max_frame_bytes: u64,

    /// Cap on one reassembled message.
    pub max_message_bytes: usize,

    /// Wait for the owner's ready signal after a server handshake.
    pub ready_timeout: Duration,

    /// Limit on writing one outbound frame; a stalled peer is aborted.
    pub send_timeout: Duration,

    /// Name reported in `bridge_ack`.
    pub server_name: String,

    /// Version reported in `bridge_ack`.
    pub server_version: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl BridgeConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_ports: vec![DEFAULT_PORT],
            multi_listen: false,
            allow_non_loopback: false,
            server_url: None,
            enable_tls: false,
            tls_certificate_path: None,
            tls_private_key_path: None,
            tls_ca_path: None,
            capability_token: None,
            require_capability_token: false,
            subprotocols: vec![DEFAULT_SUBPROTOCOL.to_string()],
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat_timeout: Duration::ZERO,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_messages_per_minute: 0,
            max_automation_requests_per_minute: 0,
            listen_backlog: DEFAULT_BACKLOG,
            accept_sleep: DEFAULT_ACCEPT_SLEEP,
            telemetry_interval: DEFAULT_TELEMETRY_INTERVAL,
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            server_name: env!("CARGO_PKG_NAME").to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Creates an outbound-only configuration for `url`.
    #[must_use]
    pub fn outbound(url: impl Into<String>) -> Self {
        Self::new()
            .with_listen_ports(Vec::new())
            .with_server_url(url)
    }

    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] on malformed JSON or unknown keys
    /// - [`Error::Config`] on negative or non-finite durations
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(json)?;
        raw.into_config()
    }

    /// Reads and parses a JSON file.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if unreadable, otherwise as [`from_json_str`](Self::from_json_str).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl BridgeConfig {
    /// Sets the listen host.
    #[inline]
    #[must_use]
    pub fn with_listen_host(mut self, host: impl Into<String>) -> Self {
        self.listen_host = host.into();
        self
    }

    /// Replaces the listen ports.
    #[inline]
    #[must_use]
    pub fn with_listen_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.listen_ports = ports.into_iter().collect();
        self
    }

    /// Enables or disables listening on every configured port.
    #[inline]
    #[must_use]
    pub fn with_multi_listen(mut self, enabled: bool) -> Self {
        self.multi_listen = enabled;
        self
    }

    /// Permits a non-loopback listen host.
    #[inline]
    #[must_use]
    pub fn with_allow_non_loopback(mut self, allowed: bool) -> Self {
        self.allow_non_loopback = allowed;
        self
    }

    /// Sets the outbound endpoint.
    #[inline]
    #[must_use]
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    /// Enables TLS on listeners with a PEM certificate chain and key.
    #[inline]
    #[must_use]
    pub fn with_tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.enable_tls = true;
        self.tls_certificate_path = Some(cert.into());
        self.tls_private_key_path = Some(key.into());
        self
    }

    /// Trusts a PEM CA bundle for the outbound connection.
    #[inline]
    #[must_use]
    pub fn with_tls_ca(mut self, ca: impl Into<PathBuf>) -> Self {
        self.tls_ca_path = Some(ca.into());
        self
    }

    /// Sets the capability token and whether it is mandatory.
    #[inline]
    #[must_use]
    pub fn with_capability_token(mut self, token: impl Into<String>, required: bool) -> Self {
        self.capability_token = Some(token.into());
        self.require_capability_token = required;
        self
    }

    /// Replaces the subprotocol list.
    #[inline]
    #[must_use]
    pub fn with_subprotocols(mut self, protocols: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.subprotocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the outbound reconnect delay.
    #[inline]
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the heartbeat watchdog timeout.
    #[inline]
    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the heartbeat ping interval.
    #[inline]
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the per-connection rate caps.
    #[inline]
    #[must_use]
    pub fn with_rate_limits(mut self, messages: u32, automation_requests: u32) -> Self {
        self.max_messages_per_minute = messages;
        self.max_automation_requests_per_minute = automation_requests;
        self
    }

    /// Sets the listen backlog.
    #[inline]
    #[must_use]
    pub fn with_listen_backlog(mut self, backlog: u32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    /// Sets the pause after a failed accept.
    #[inline]
    #[must_use]
    pub fn with_accept_sleep(mut self, sleep: Duration) -> Self {
        self.accept_sleep = sleep;
        self
    }

    /// Sets the telemetry summary interval.
    #[inline]
    #[must_use]
    pub fn with_telemetry_interval(mut self, interval: Duration) -> Self {
        self.telemetry_interval = interval;
        self
    }

    /// Sets the owner tick period.
    #[inline]
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the frame and message size caps.
    #[inline]
    #[must_use]
    pub fn with_size_limits(mut self, max_frame_bytes: u64, max_message_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self.max_message_bytes = max_message_bytes;
        self
    }

    /// Sets the owner-ready wait.
    #[inline]
    #[must_use]
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Sets the per-frame send timeout.
    #[inline]
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Sets the name and version reported in `bridge_ack`.
    #[inline]
    #[must_use]
    pub fn with_server_identity(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.server_name = name.into();
        self.server_version = version.into();
        self
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl BridgeConfig {
    /// Returns the ports that will actually be bound.
    #[must_use]
    pub fn effective_ports(&self) -> &[u16] {
        if self.multi_listen {
            &self.listen_ports
        } else {
            &self.listen_ports[..self.listen_ports.len().min(1)]
        }
    }

    /// Returns the token to send and to check, ignoring empty strings.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.capability_token.as_deref().filter(|t| !t.is_empty())
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.effective_ports().is_empty() && self.server_url.is_none() {
            return Err(Error::config(
                "nothing to do: configure listen ports or a server URL",
            ));
        }

        if let Some(url) = &self.server_url {
            Endpoint::parse(url)?;
        }

        if self.enable_tls
            && (self.tls_certificate_path.is_none() || self.tls_private_key_path.is_none())
        {
            return Err(Error::config(
                "TLS is enabled but the certificate or private key path is missing",
            ));
        }

        if self.require_capability_token && self.token().is_none() {
            return Err(Error::config(
                "a capability token is required but none is configured",
            ));
        }

        if self.max_frame_bytes == 0 || self.max_message_bytes == 0 {
            return Err(Error::config("frame and message size caps must be non-zero"));
        }

        if self.tick_interval.is_zero() {
            return Err(Error::config("tick interval must be non-zero"));
        }

        if self.send_timeout.is_zero() {
            return Err(Error::config("send timeout must be non-zero"));
        }

        Ok(())
    }
}

// ============================================================================
// JSON Form
// ============================================================================

/// Wire form of [`BridgeConfig`]; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
struct RawConfig {
    listen_host: Option<String>,
    listen_ports: Option<Vec<u16>>,
    multi_listen: Option<bool>,
    allow_non_loopback: Option<bool>,
    server_url: Option<String>,
    enable_tls: Option<bool>,
    tls_certificate_path: Option<PathBuf>,
    tls_private_key_path: Option<PathBuf>,
    tls_ca_path: Option<PathBuf>,
    capability_token: Option<String>,
    require_capability_token: Option<bool>,
    subprotocols: Option<Vec<String>>,
    auto_reconnect_delay_seconds: Option<f64>,
    heartbeat_timeout_seconds: Option<f64>,
    heartbeat_interval_seconds: Option<f64>,
    max_messages_per_minute: Option<u32>,
    max_automation_requests_per_minute: Option<u32>,
    listen_backlog: Option<u32>,
    accept_sleep_ms: Option<u64>,
    telemetry_summary_interval_seconds: Option<f64>,
    tick_interval_ms: Option<u64>,
    max_frame_bytes: Option<u64>,
    max_message_bytes: Option<usize>,
    ready_timeout_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
    server_name: Option<String>,
    server_version: Option<String>,
}

impl RawConfig {
    fn into_config(self) -> Result<BridgeConfig> {
        let mut config = BridgeConfig::new();

        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field { config.$field = value; })*
            };
        }
        apply!(
            listen_host,
            listen_ports,
            multi_listen,
            allow_non_loopback,
            enable_tls,
            require_capability_token,
            subprotocols,
            max_messages_per_minute,
            max_automation_requests_per_minute,
            listen_backlog,
            max_frame_bytes,
            max_message_bytes,
            server_name,
            server_version,
        );

        config.server_url = self.server_url.or(config.server_url);
        config.tls_certificate_path = self.tls_certificate_path;
        config.tls_private_key_path = self.tls_private_key_path;
        config.tls_ca_path = self.tls_ca_path;
        config.capability_token = self.capability_token;

        if let Some(secs) = self.auto_reconnect_delay_seconds {
            config.reconnect_delay = seconds("autoReconnectDelaySeconds", secs)?;
        }
        if let Some(secs) = self.heartbeat_timeout_seconds {
            config.heartbeat_timeout = seconds("heartbeatTimeoutSeconds", secs)?;
        }
        if let Some(secs) = self.heartbeat_interval_seconds {
            config.heartbeat_interval = seconds("heartbeatIntervalSeconds", secs)?;
        }
        if let Some(secs) = self.telemetry_summary_interval_seconds {
            config.telemetry_interval = seconds("telemetrySummaryIntervalSeconds", secs)?;
        }
        if let Some(ms) = self.accept_sleep_ms {
            config.accept_sleep = Duration::from_millis(ms);
        }
        if let Some(ms) = self.tick_interval_ms {
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.ready_timeout_ms {
            config.ready_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.send_timeout_ms {
            config.send_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn seconds(key: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| Error::config(format!("{key} must be a non-negative number: {e}")))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::new();
        assert_eq!(config.listen_host, "127.0.0.1");
        assert_eq!(config.listen_ports, vec![8091]);
        assert_eq!(config.subprotocols, vec!["mcp-automation".to_string()]);
        assert_eq!(config.max_frame_bytes, 5 * 1024 * 1024);
        assert_eq!(config.ready_timeout, Duration::from_millis(500));
        assert_eq!(config.send_timeout, Duration::from_secs(10));
        assert_eq!(config.telemetry_interval, Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_ports() {
        let config = BridgeConfig::new().with_listen_ports([1, 2, 3]);
        assert_eq!(config.effective_ports(), &[1]);
        assert_eq!(config.clone().with_multi_listen(true).effective_ports(), &[1, 2, 3]);
        assert!(BridgeConfig::new().with_listen_ports([]).effective_ports().is_empty());
    }

    #[test]
    fn test_validate_rejects_inconsistent_settings() {
        let nothing = BridgeConfig::new().with_listen_ports([]);
        assert!(nothing.validate().is_err());

        let bad_url = BridgeConfig::outbound("http://example.com");
        assert!(matches!(bad_url.validate(), Err(Error::InvalidUrl { .. })));

        let mut tls = BridgeConfig::new();
        tls.enable_tls = true;
        assert!(tls.validate().is_err());

        let mut token = BridgeConfig::new();
        token.require_capability_token = true;
        assert!(token.validate().is_err());

        let empty_token = BridgeConfig::new().with_capability_token("", true);
        assert!(empty_token.validate().is_err());

        let no_send_timeout = BridgeConfig::new().with_send_timeout(Duration::ZERO);
        assert!(no_send_timeout.validate().is_err());

        assert!(BridgeConfig::outbound("wss://bridge.local:9443/ws").validate().is_ok());
    }

    #[test]
    fn test_from_json_str() {
        let config = BridgeConfig::from_json_str(
            r#"{
                "listenPorts": [9001, 9002],
                "multiListen": true,
                "capabilityToken": "abc",
                "requireCapabilityToken": true,
                "autoReconnectDelaySeconds": 2.5,
                "heartbeatTimeoutSeconds": 30,
                "maxMessagesPerMinute": 60,
                "acceptSleepMs": 25,
                "sendTimeoutMs": 750
            }"#,
        )
        .unwrap();

        assert_eq!(config.effective_ports(), &[9001, 9002]);
        assert_eq!(config.token(), Some("abc"));
        assert!(config.require_capability_token);
        assert_eq!(config.reconnect_delay, Duration::from_millis(2500));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.max_messages_per_minute, 60);
        assert_eq!(config.accept_sleep, Duration::from_millis(25));
        assert_eq!(config.send_timeout, Duration::from_millis(750));
        assert_eq!(config.listen_host, "127.0.0.1");
    }

    #[test]
    fn test_from_json_rejects_bad_input() {
        assert!(matches!(
            BridgeConfig::from_json_str(r#"{"listenPort": 1}"#),
            Err(Error::Json(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json_str(r#"{"heartbeatTimeoutSeconds": -1}"#),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"serverUrl": "ws://127.0.0.1:9100/", "listenPorts": []}}"#).unwrap();

        let config = BridgeConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.server_url.as_deref(), Some("ws://127.0.0.1:9100/"));
        assert!(config.validate().is_ok());

        assert!(matches!(
            BridgeConfig::from_json_file("/nonexistent/bridge.json"),
            Err(Error::Io(_))
        ));
    }
}
