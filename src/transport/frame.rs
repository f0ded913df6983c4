//! WebSocket frame codec (RFC 6455 Section 5.2).
//!
//! Pure encode/decode of frames to and from byte buffers. No I/O happens
//! here; the connection worker feeds bytes in and writes bytes out.
//!
//! # Frame Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |  Extended payload length continued, if payload len == 127     |
//! +-------------------------------+-------------------------------+
//! |                               |  Masking-key, if MASK set     |
//! +-------------------------------+-------------------------------+
//! |                         Payload Data                          |
//! +---------------------------------------------------------------+
//! ```
//!
//! Outbound frames are never fragmented: every encoded frame has `fin = 1`.

// ============================================================================
// Imports
// ============================================================================

use crate::error::FramingError;

// ============================================================================
// Constants
// ============================================================================

/// Default cap on a single frame payload (5 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: u64 = 5 * 1024 * 1024;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest possible header: 2 + 8 extended length + 4 mask key.
const MAX_HEADER_LEN: usize = 14;

// ============================================================================
// Opcode
// ============================================================================

/// Frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// UTF-8 text data.
    Text = 0x1,
    /// Binary data.
    Binary = 0x2,
    /// Connection close.
    Close = 0x8,
    /// Ping.
    Ping = 0x9,
    /// Pong.
    Pong = 0xA,
}

impl Opcode {
    /// Parses the low nibble of the first header byte.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::InvalidOpcode`] for reserved values.
    pub const fn from_u8(value: u8) -> Result<Self, FramingError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FramingError::InvalidOpcode(other)),
        }
    }

    /// Returns `true` for Close, Ping and Pong (`opcode & 0x8 != 0`).
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One decoded wire frame.
///
/// `payload` is always stored unmasked; `mask_key` records the key the peer
/// used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Whether the payload was masked on the wire.
    pub masked: bool,
    /// Declared payload length.
    pub payload_length: u64,
    /// Masking key, present iff `masked`.
    pub mask_key: Option<[u8; 4]>,
    /// Unmasked payload bytes.
    pub payload: Vec<u8>,
}

// ============================================================================
// Header
// ============================================================================

/// Parsed frame header.
#[derive(Debug, Clone, Copy)]
struct Header {
    fin: bool,
    opcode: Opcode,
    mask_key: Option<[u8; 4]>,
    payload_length: u64,
    header_len: usize,
}

impl Header {
    /// Header plus payload length, if it fits in `usize`.
    fn frame_len(&self) -> Result<usize, FramingError> {
        usize::try_from(self.payload_length)
            .ok()
            .and_then(|len| self.header_len.checked_add(len))
            .ok_or(FramingError::InvalidLength("frame length overflows usize"))
    }
}

/// Outcome of header parsing over a possibly short buffer.
enum HeaderParse {
    Complete(Header),
    NeedMore(usize),
}

// ============================================================================
// FrameCodec
// ============================================================================

/// Frame encoder/decoder with a payload size cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_payload: u64,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    /// Creates a codec rejecting payloads above `max_payload` bytes.
    #[inline]
    #[must_use]
    pub const fn new(max_payload: u64) -> Self {
        Self { max_payload }
    }

    /// Returns the configured payload cap.
    #[inline]
    #[must_use]
    pub const fn max_payload(&self) -> u64 {
        self.max_payload
    }

    /// Encodes a final frame, masking with a random key when `must_mask`.
    #[must_use]
    pub fn encode(opcode: Opcode, payload: &[u8], must_mask: bool) -> Vec<u8> {
        let mask_key = must_mask.then(rand::random::<[u8; 4]>);
        Self::encode_with_key(opcode, payload, mask_key)
    }

    /// Encodes a final frame with an explicit masking key.
    #[must_use]
    pub fn encode_with_key(opcode: Opcode, payload: &[u8], mask_key: Option<[u8; 4]>) -> Vec<u8> {
        let len = payload.len();
        let mut out = Vec::with_capacity(MAX_HEADER_LEN + len);

        out.push(0x80 | opcode as u8);

        let mask_bit = if mask_key.is_some() { 0x80 } else { 0x00 };
        if len < 126 {
            out.push(mask_bit | len as u8);
        } else if let Ok(len16) = u16::try_from(len) {
            out.push(mask_bit | 126);
            out.extend_from_slice(&len16.to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match mask_key {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.extend_from_slice(payload),
        }

        out
    }

    /// Decodes one frame from the front of `src`, consuming its bytes.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a whole frame; the
    /// caller reads more bytes and retries. The size cap is enforced as soon
    /// as the length field is known, so an oversized frame is rejected
    /// before any payload byte arrives.
    ///
    /// # Errors
    ///
    /// Any [`FramingError`] except `Truncated`.
    pub fn decode(&self, src: &mut Vec<u8>) -> Result<Option<Frame>, FramingError> {
        let header = match self.parse_header(src)? {
            HeaderParse::Complete(header) => header,
            HeaderParse::NeedMore(_) => return Ok(None),
        };

        let total = header.frame_len()?;
        if src.len() < total {
            return Ok(None);
        }

        let mut payload: Vec<u8> = src.drain(..total).skip(header.header_len).collect();
        if let Some(key) = header.mask_key {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin: header.fin,
            opcode: header.opcode,
            masked: header.mask_key.is_some(),
            payload_length: header.payload_length,
            mask_key: header.mask_key,
            payload,
        }))
    }

    /// Decodes exactly one frame from a complete byte source.
    ///
    /// Returns the frame and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::Truncated`] if `bytes` ends before the frame
    /// does, or any other [`FramingError`] the header triggers.
    pub fn decode_complete(&self, bytes: &[u8]) -> Result<(Frame, usize), FramingError> {
        let header = match self.parse_header(bytes)? {
            HeaderParse::Complete(header) => header,
            HeaderParse::NeedMore(needed) => return Err(FramingError::Truncated { needed }),
        };

        let total = header.frame_len()?;
        if bytes.len() < total {
            return Err(FramingError::Truncated {
                needed: total - bytes.len(),
            });
        }

        let mut buffer = bytes[..total].to_vec();
        match self.decode(&mut buffer)? {
            Some(frame) => Ok((frame, total)),
            None => Err(FramingError::Truncated { needed: 0 }),
        }
    }

    /// Parses the header, validating opcode, control rules and size cap.
    fn parse_header(&self, src: &[u8]) -> Result<HeaderParse, FramingError> {
        if src.len() < 2 {
            return Ok(HeaderParse::NeedMore(2 - src.len()));
        }

        let first = src[0];
        let second = src[1];

        if first & 0x70 != 0 {
            return Err(FramingError::ReservedBits);
        }

        let fin = first & 0x80 != 0;
        let opcode = Opcode::from_u8(first & 0x0F)?;
        let masked = second & 0x80 != 0;
        let len7 = second & 0x7F;

        let (payload_length, mut offset) = match len7 {
            126 => {
                if src.len() < 4 {
                    return Ok(HeaderParse::NeedMore(4 - src.len()));
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(HeaderParse::NeedMore(10 - src.len()));
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                let length = u64::from_be_bytes(raw);
                if length >> 63 != 0 {
                    return Err(FramingError::InvalidLength(
                        "64-bit length has the most significant bit set",
                    ));
                }
                (length, 10)
            }
            short => (u64::from(short), 2),
        };

        if payload_length > self.max_payload {
            return Err(FramingError::PayloadTooLarge {
                size: payload_length,
                max: self.max_payload,
            });
        }

        if opcode.is_control() {
            if !fin {
                return Err(FramingError::InvalidControlFrame("fragmented control frame"));
            }
            if payload_length > MAX_CONTROL_PAYLOAD as u64 {
                return Err(FramingError::InvalidControlFrame(
                    "control payload exceeds 125 bytes",
                ));
            }
        }

        let mask_key = if masked {
            if src.len() < offset + 4 {
                return Ok(HeaderParse::NeedMore(offset + 4 - src.len()));
            }
            let key = [src[offset], src[offset + 1], src[offset + 2], src[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        Ok(HeaderParse::Complete(Header {
            fin,
            opcode,
            mask_key,
            payload_length,
            header_len: offset,
        }))
    }
}

/// XORs `data` in place with the repeating 4-byte key.
#[inline]
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    use crate::protocol::CloseCode;

    fn codec() -> FrameCodec {
        FrameCodec::default()
    }

    #[test]
    fn test_short_text_unmasked_layout() {
        let bytes = FrameCodec::encode(Opcode::Text, b"hi", false);
        assert_eq!(bytes, vec![0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_length_encoding_boundaries() {
        let medium = FrameCodec::encode(Opcode::Text, &[b'a'; 126], false);
        assert_eq!(medium[1], 126);
        assert_eq!(u16::from_be_bytes([medium[2], medium[3]]), 126);
        assert_eq!(medium.len(), 4 + 126);

        let large = FrameCodec::encode(Opcode::Text, &vec![b'a'; 70_000], false);
        assert_eq!(large[1], 127);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&large[2..10]);
        assert_eq!(u64::from_be_bytes(raw), 70_000);
    }

    #[test]
    fn test_masked_encoding_known_key() {
        let bytes = FrameCodec::encode_with_key(Opcode::Text, b"Hello", Some([0x37, 0xfa, 0x21, 0x3d]));
        // RFC 6455 Section 5.7 example
        assert_eq!(
            bytes,
            vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );

        let (frame, used) = codec().decode_complete(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert!(frame.masked);
        assert_eq!(frame.mask_key, Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn test_decode_waits_for_partial_input() {
        let bytes = FrameCodec::encode(Opcode::Text, b"partial read", true);
        let mut buffer = Vec::new();

        for (i, byte) in bytes.iter().enumerate() {
            buffer.push(*byte);
            let decoded = codec().decode(&mut buffer).unwrap();
            if i + 1 < bytes.len() {
                assert!(decoded.is_none(), "decoded early at byte {i}");
            } else {
                assert_eq!(decoded.unwrap().payload, b"partial read");
            }
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_decode_leaves_following_frame() {
        let mut buffer = FrameCodec::encode(Opcode::Ping, b"a", false);
        buffer.extend(FrameCodec::encode(Opcode::Text, b"b", false));

        let first = codec().decode(&mut buffer).unwrap().unwrap();
        assert_eq!(first.opcode, Opcode::Ping);
        let second = codec().decode(&mut buffer).unwrap().unwrap();
        assert_eq!(second.opcode, Opcode::Text);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_oversized_length_rejected_before_payload() {
        let small = FrameCodec::new(1024);
        // Header only: 64-bit length of 1 GiB, no payload bytes present.
        let mut header = vec![0x81, 127];
        header.extend_from_slice(&(1u64 << 30).to_be_bytes());

        let err = small.decode(&mut header.clone()).unwrap_err();
        assert_eq!(
            err,
            FramingError::PayloadTooLarge {
                size: 1 << 30,
                max: 1024
            }
        );
        assert!(matches!(
            small.decode_complete(&header),
            Err(FramingError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_64_bit_length_with_high_bit_rejected() {
        let unbounded = FrameCodec::new(u64::MAX);
        let mut header = vec![0x81, 127];
        header.extend_from_slice(&(1u64 << 63).to_be_bytes());

        let err = unbounded.decode(&mut header.clone()).unwrap_err();
        assert!(matches!(err, FramingError::InvalidLength(_)));
        assert_eq!(err.close_code(), CloseCode::ProtocolError);
        assert!(matches!(
            codec().decode_complete(&header),
            Err(FramingError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_truncated_source() {
        let bytes = FrameCodec::encode(Opcode::Text, b"abcdef", false);
        assert_eq!(
            codec().decode_complete(&bytes[..4]),
            Err(FramingError::Truncated { needed: 4 })
        );
        assert_eq!(
            codec().decode_complete(&bytes[..1]),
            Err(FramingError::Truncated { needed: 1 })
        );
    }

    #[test]
    fn test_invalid_opcode_and_reserved_bits() {
        assert_eq!(
            codec().decode_complete(&[0x83, 0x00]),
            Err(FramingError::InvalidOpcode(0x3))
        );
        assert_eq!(
            codec().decode_complete(&[0xC1, 0x00]),
            Err(FramingError::ReservedBits)
        );
    }

    #[test]
    fn test_control_frame_rules() {
        // Ping without FIN
        assert!(matches!(
            codec().decode_complete(&[0x09, 0x00]),
            Err(FramingError::InvalidControlFrame(_))
        ));
        // Ping with 126-byte payload
        let mut bytes = vec![0x89, 126, 0x00, 126];
        bytes.extend_from_slice(&[0u8; 126]);
        assert!(matches!(
            codec().decode_complete(&bytes),
            Err(FramingError::InvalidControlFrame(_))
        ));
    }

    #[test]
    fn test_opcode_control_bit() {
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(!Opcode::Text.is_control());
        assert!(!Opcode::Continuation.is_control());
    }

    proptest! {
        #[test]
        fn prop_control_frame_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..=125)) {
            let bytes = FrameCodec::encode(Opcode::Ping, &payload, false);
            let (frame, _) = codec().decode_complete(&bytes).unwrap();
            prop_assert_eq!(frame.opcode, Opcode::Ping);
            prop_assert!(frame.fin);
            prop_assert!(!frame.masked);
            prop_assert_eq!(frame.payload, payload);
        }

        #[test]
        fn prop_masked_text_round_trip(text in ".{0,2000}") {
            let bytes = FrameCodec::encode(Opcode::Text, text.as_bytes(), true);
            let (frame, used) = codec().decode_complete(&bytes).unwrap();
            prop_assert_eq!(used, bytes.len());
            prop_assert!(frame.masked);
            prop_assert_eq!(frame.payload_length, text.len() as u64);
            prop_assert_eq!(String::from_utf8(frame.payload).unwrap(), text);
        }
    }
}
