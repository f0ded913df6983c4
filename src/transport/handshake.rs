//! WebSocket opening handshake (RFC 6455 Section 4).
//!
//! Both roles run on the connection worker before any frame is read.
//! Bytes that arrive after the `\r\n\r\n` terminator in the same read are
//! returned in [`HandshakeOutcome::leftover`] and fed to the frame decoder.
//!
//! # Client Path
//!
//! 1. [`Endpoint::parse`] - `ws://` or `wss://` only
//! 2. Send `GET` with a random `Sec-WebSocket-Key`
//! 3. Require `101` and an exact `Sec-WebSocket-Accept` match
//!
//! # Server Path
//!
//! 1. Require `Upgrade: websocket`, `Connection: Upgrade`, version 13, key
//! 2. Pick the first offered subprotocol the server supports
//! 3. Reply `101 Switching Protocols`

// ============================================================================
// Imports
// ============================================================================

use std::fmt::Write as _;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};
use url::{Host, Url};

use crate::error::{Error, Result};
use crate::protocol::CloseCode;

use super::frame::{FrameCodec, Opcode};
use super::signal::StopListener;
use super::stream::{TransportReader, TransportWriter};

// ============================================================================
// Constants
// ============================================================================

/// GUID appended to the key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Header carrying the capability token out of band.
pub const CAPABILITY_TOKEN_HEADER: &str = "X-MCP-Capability-Token";

/// Cap on the size of a handshake head.
pub const MAX_HANDSHAKE_BYTES: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

// ============================================================================
// Endpoint
// ============================================================================

/// Parsed outbound WebSocket URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or IP literal, without IPv6 brackets.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Request target: path plus query.
    pub path: String,
    /// `true` for `wss://`.
    pub use_tls: bool,
}

impl Endpoint {
    /// Parses a `ws://` or `wss://` URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] for any other scheme, a missing host,
    /// or a malformed URL.
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| Error::invalid_url(url, e.to_string()))?;

        let use_tls = match parsed.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(Error::invalid_url(
                    url,
                    format!("unsupported scheme '{other}'"),
                ));
            }
        };

        let host = match parsed.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_owned(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(Error::invalid_url(url, "missing host")),
        };

        let port = parsed
            .port_or_known_default()
            .unwrap_or(if use_tls { 443 } else { 80 });

        let mut path = parsed.path().to_owned();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            host,
            port,
            path,
            use_tls,
        })
    }

    /// Returns the `Host` header value, omitting the scheme's default port.
    #[must_use]
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let default_port = if self.use_tls { 443 } else { 80 };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Generates a random Base64-encoded 16-byte `Sec-WebSocket-Key`.
#[must_use]
pub fn generate_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

/// Computes `Base64(SHA1(key + GUID))`.
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(sha1.finalize())
}

// ============================================================================
// HttpHead
// ============================================================================

/// Start line and headers of an HTTP/1.1 request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHead {
    /// Request line or status line.
    pub start_line: String,
    headers: Vec<(String, String)>,
}

impl HttpHead {
    /// Parses a head, excluding the blank-line terminator.
    ///
    /// # Errors
    ///
    /// Returns a 4000 [`Error::Handshake`] for non-UTF-8 input, an empty
    /// start line, or a header line without `:`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::handshake("handshake head is not UTF-8"))?;
        let mut lines = text.split("\r\n");

        let start_line = lines
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .ok_or_else(|| Error::handshake("empty handshake start line"))?
            .to_owned();

        let mut headers = Vec::new();
        for line in lines.filter(|line| !line.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::handshake(format!("malformed header line '{line}'")))?;
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }

        Ok(Self {
            start_line,
            headers,
        })
    }

    /// Returns the first value of a header, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns `true` if a comma-separated header contains `token`
    /// (case-insensitive).
    #[must_use]
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .flat_map(|(_, value)| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    /// Returns the comma-separated items of a header, trimmed, empties dropped.
    #[must_use]
    pub fn header_list(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .flat_map(|(_, value)| value.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

/// Returns the index one past the `\r\n\r\n` terminator, if present.
#[must_use]
pub fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

// ============================================================================
// Client Side
// ============================================================================

/// Builds the client upgrade request.
///
/// # Errors
///
/// Returns [`Error::Config`] if an extra header contains CR or LF.
pub fn build_client_request(
    endpoint: &Endpoint,
    key: &str,
    protocols: &[String],
    extra_headers: &[(String, String)],
) -> Result<String> {
    let mut request = String::with_capacity(256);
    let _ = write!(
        request,
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        endpoint.path,
        endpoint.host_header(),
    );

    if !protocols.is_empty() {
        let _ = write!(request, "Sec-WebSocket-Protocol: {}\r\n", protocols.join(", "));
    }

    for (name, value) in extra_headers {
        if has_line_break(name) || has_line_break(value) || name.is_empty() {
            return Err(Error::config(format!("invalid extra header '{name}'")));
        }
        let _ = write!(request, "{name}: {value}\r\n");
    }

    request.push_str("\r\n");
    Ok(request)
}

fn has_line_break(value: &str) -> bool {
    value.contains(['\r', '\n'])
}

/// Validates the server's reply and returns the selected subprotocol.
///
/// # Errors
///
/// Returns a 4000 [`Error::Handshake`] if the status is not 101, the accept
/// value does not match exactly, or the server picked a protocol that was
/// not offered.
pub fn validate_server_response(
    head: &HttpHead,
    key: &str,
    offered: &[String],
) -> Result<Option<String>> {
    let status = head.start_line.split_whitespace().nth(1);
    if status != Some("101") {
        return Err(Error::handshake(format!(
            "unexpected status line '{}'",
            head.start_line
        )));
    }

    let expected = accept_key(key);
    match head.header("Sec-WebSocket-Accept") {
        Some(accept) if accept == expected => {}
        Some(accept) => {
            return Err(Error::handshake(format!(
                "Sec-WebSocket-Accept mismatch: got '{accept}'"
            )));
        }
        None => return Err(Error::handshake("missing Sec-WebSocket-Accept")),
    }

    match head.header("Sec-WebSocket-Protocol") {
        None => Ok(None),
        Some(selected) if offered.iter().any(|p| p.eq_ignore_ascii_case(selected)) => {
            Ok(Some(selected.to_owned()))
        }
        Some(selected) => Err(Error::handshake(format!(
            "server selected unoffered subprotocol '{selected}'"
        ))),
    }
}

// ============================================================================
// Server Side
// ============================================================================

/// Result of validating a client upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAcceptance {
    /// `Sec-WebSocket-Accept` value.
    pub accept: String,
    /// Negotiated subprotocol.
    pub protocol: Option<String>,
}

/// Validates a client upgrade request and negotiates a subprotocol.
///
/// # Errors
///
/// - 4000 [`Error::Handshake`] for a missing or wrong upgrade header
/// - 4403 [`Error::Handshake`] if the client offered protocols and none match
pub fn negotiate_request(head: &HttpHead, supported: &[String]) -> Result<ServerAcceptance> {
    if !head.start_line.starts_with("GET ") {
        return Err(Error::handshake(format!(
            "expected GET request, got '{}'",
            head.start_line
        )));
    }
    if !head.header_has_token("Upgrade", "websocket") {
        return Err(Error::handshake("missing 'Upgrade: websocket'"));
    }
    if !head.header_has_token("Connection", "upgrade") {
        return Err(Error::handshake("missing 'Connection: Upgrade'"));
    }
    if head.header("Sec-WebSocket-Version") != Some("13") {
        return Err(Error::handshake("unsupported Sec-WebSocket-Version"));
    }
    let key = head
        .header("Sec-WebSocket-Key")
        .filter(|key| !key.is_empty())
        .ok_or_else(|| Error::handshake("missing Sec-WebSocket-Key"))?;

    let offered = head.header_list("Sec-WebSocket-Protocol");
    let protocol = if offered.is_empty() || supported.is_empty() {
        None
    } else {
        let selected = offered
            .iter()
            .find(|candidate| supported.iter().any(|s| s.eq_ignore_ascii_case(candidate)))
            .cloned();
        if selected.is_none() {
            return Err(Error::handshake_with_code(
                CloseCode::NoSubprotocol,
                format!("no supported subprotocol in [{}]", offered.join(", ")),
            ));
        }
        selected
    };

    Ok(ServerAcceptance {
        accept: accept_key(key),
        protocol,
    })
}

/// Builds the `101 Switching Protocols` response.
#[must_use]
pub fn build_server_response(acceptance: &ServerAcceptance) -> String {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        acceptance.accept
    );
    if let Some(protocol) = &acceptance.protocol {
        let _ = write!(response, "Sec-WebSocket-Protocol: {protocol}\r\n");
    }
    response.push_str("\r\n");
    response
}

/// Builds a plain HTTP rejection for a failed upgrade.
#[must_use]
pub fn build_rejection(code: CloseCode) -> String {
    let status = match code {
        CloseCode::NoSubprotocol => "403 Forbidden",
        _ => "400 Bad Request",
    };
    format!("HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
}

// ============================================================================
// Async Drivers
// ============================================================================

/// Result of a completed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Negotiated subprotocol.
    pub protocol: Option<String>,
    /// Bytes received after the head, the start of the frame stream.
    pub leftover: Vec<u8>,
}

/// Runs the client side of the handshake.
///
/// On an accept mismatch after a `101`, a Close frame with code 4000 is sent
/// before failing.
///
/// # Errors
///
/// [`Error::Handshake`], [`Error::Transport`], or [`Error::Cancelled`].
pub async fn client_handshake(
    reader: &mut TransportReader,
    writer: &mut TransportWriter,
    endpoint: &Endpoint,
    protocols: &[String],
    extra_headers: &[(String, String)],
    stop: &mut StopListener,
) -> Result<HandshakeOutcome> {
    let key = generate_key();
    let request = build_client_request(endpoint, &key, protocols, extra_headers)?;
    writer.send_raw(request.as_bytes()).await?;

    let (head_bytes, leftover) = read_head(reader, stop).await?;
    let head = HttpHead::parse(&head_bytes)?;

    match validate_server_response(&head, &key, protocols) {
        Ok(protocol) => {
            debug!(host = %endpoint.host, port = endpoint.port, ?protocol, "Client handshake complete");
            Ok(HandshakeOutcome { protocol, leftover })
        }
        Err(e) => {
            if head.start_line.split_whitespace().nth(1) == Some("101") {
                let close = FrameCodec::encode(
                    Opcode::Close,
                    &CloseCode::HandshakeFailed.payload("handshake validation failed"),
                    true,
                );
                let _ = writer.send_raw(&close).await;
            }
            Err(e)
        }
    }
}

/// Runs the server side of the handshake.
///
/// On failure an HTTP rejection is written before returning the error.
///
/// # Errors
///
/// [`Error::Handshake`], [`Error::Transport`], or [`Error::Cancelled`].
pub async fn server_handshake(
    reader: &mut TransportReader,
    writer: &mut TransportWriter,
    supported: &[String],
    stop: &mut StopListener,
) -> Result<HandshakeOutcome> {
    let (head_bytes, leftover) = read_head(reader, stop).await?;

    let negotiated = HttpHead::parse(&head_bytes).and_then(|head| negotiate_request(&head, supported));
    let acceptance = match negotiated {
        Ok(acceptance) => acceptance,
        Err(e) => {
            warn!(error = %e, "Rejecting WebSocket upgrade");
            let _ = writer.send_raw(build_rejection(e.close_code()).as_bytes()).await;
            return Err(e);
        }
    };

    writer
        .send_raw(build_server_response(&acceptance).as_bytes())
        .await?;

    debug!(protocol = ?acceptance.protocol, "Server handshake complete");
    Ok(HandshakeOutcome {
        protocol: acceptance.protocol,
        leftover,
    })
}

/// Reads until `\r\n\r\n`, returning the head and any bytes past it.
async fn read_head(
    reader: &mut TransportReader,
    stop: &mut StopListener,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buffer = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = reader.recv_raw(&mut chunk, stop).await?;
        if n == 0 {
            return Err(Error::handshake("peer closed during handshake"));
        }

        let scan_from = buffer.len().saturating_sub(3);
        buffer.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_terminator(&buffer[scan_from..]).map(|i| i + scan_from) {
            let leftover = buffer.split_off(end);
            buffer.truncate(end - 4);
            return Ok((buffer, leftover));
        }

        if buffer.len() > MAX_HANDSHAKE_BYTES {
            return Err(Error::handshake(format!(
                "handshake head exceeds {MAX_HANDSHAKE_BYTES} bytes"
            )));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
