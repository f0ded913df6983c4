//! Reassembly of fragmented text messages.
//!
//! Data frames (Text, Binary, Continuation) pass through a
//! [`MessageAssembler`]. Control frames never reach it, so a Ping arriving
//! between fragments leaves the reassembly state untouched.
//!
//! | Frame | Not reassembling | Reassembling |
//! |-------|------------------|--------------|
//! | Text, fin | deliver | 4002 |
//! | Text, !fin | start | 4002 |
//! | Continuation | 4002 | append, deliver on fin |
//! | Binary | 4003 | 4002 |

// ============================================================================
// Imports
// ============================================================================

use crate::error::ProtocolError;

use super::frame::{Frame, Opcode};

// ============================================================================
// Constants
// ============================================================================

/// Default cap on a reassembled message (5 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 5 * 1024 * 1024;

// ============================================================================
// MessageAssembler
// ============================================================================

/// Accumulates fragments of one text message.
#[derive(Debug)]
pub struct MessageAssembler {
    reassembling: bool,
    buffer: Vec<u8>,
    max_message_bytes: usize,
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

impl MessageAssembler {
    /// Creates an assembler with a message size cap.
    #[must_use]
    pub const fn new(max_message_bytes: usize) -> Self {
        Self {
            reassembling: false,
            buffer: Vec::new(),
            max_message_bytes,
        }
    }

    /// Returns `true` while a fragmented message is open.
    #[inline]
    #[must_use]
    pub const fn is_reassembling(&self) -> bool {
        self.reassembling
    }

    /// Bytes accumulated so far.
    #[inline]
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feeds one data frame.
    ///
    /// Returns `Ok(Some(text))` when a message completes.
    ///
    /// # Errors
    ///
    /// Any [`ProtocolError`]; the assembler is reset before returning one.
    pub fn push(&mut self, frame: Frame) -> Result<Option<String>, ProtocolError> {
        let result = self.accept(frame);
        if result.is_err() {
            self.reset();
        }
        result
    }

    /// Drops any partial message.
    pub fn reset(&mut self) {
        self.reassembling = false;
        self.buffer = Vec::new();
    }

    fn accept(&mut self, frame: Frame) -> Result<Option<String>, ProtocolError> {
        match (frame.opcode, self.reassembling) {
            (Opcode::Continuation, false) => Err(ProtocolError::UnexpectedContinuation),
            (Opcode::Continuation, true) => {
                self.append(&frame.payload)?;
                if frame.fin {
                    let bytes = std::mem::take(&mut self.buffer);
                    self.reassembling = false;
                    return into_text(bytes).map(Some);
                }
                Ok(None)
            }
            (Opcode::Text | Opcode::Binary, true) => Err(ProtocolError::FrameMidFragmentation),
            (Opcode::Binary, false) => Err(ProtocolError::UnsupportedBinary),
            (Opcode::Text, false) => {
                if frame.payload.len() > self.max_message_bytes {
                    return Err(ProtocolError::MessageTooLarge {
                        size: frame.payload.len(),
                        max: self.max_message_bytes,
                    });
                }
                if frame.fin {
                    return into_text(frame.payload).map(Some);
                }
                self.reassembling = true;
                self.buffer = frame.payload;
                Ok(None)
            }
            (Opcode::Close | Opcode::Ping | Opcode::Pong, _) => Ok(None),
        }
    }

    fn append(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let size = self.buffer.len() + payload.len();
        if size > self.max_message_bytes {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_message_bytes,
            });
        }
        self.buffer.extend_from_slice(payload);
        Ok(())
    }
}

fn into_text(bytes: Vec<u8>) -> Result<String, ProtocolError> {
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(opcode: Opcode, fin: bool, payload: &[u8]) -> Frame {
        Frame {
            fin,
            opcode,
            masked: false,
            payload_length: payload.len() as u64,
            mask_key: None,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_single_text_frame_delivered() {
        let mut assembler = MessageAssembler::default();
        let text = assembler.push(frame(Opcode::Text, true, b"{}")).unwrap();
        assert_eq!(text.as_deref(), Some("{}"));
        assert!(!assembler.is_reassembling());
    }

    #[test]
    fn test_text_then_continuation_concatenates() {
        let mut assembler = MessageAssembler::default();
        assert_eq!(assembler.push(frame(Opcode::Text, false, b"hello ")).unwrap(), None);
        assert!(assembler.is_reassembling());
        assert_eq!(
            assembler.push(frame(Opcode::Continuation, false, b"fragmented ")).unwrap(),
            None
        );
        let text = assembler
            .push(frame(Opcode::Continuation, true, b"world"))
            .unwrap();
        assert_eq!(text.as_deref(), Some("hello fragmented world"));
        assert!(!assembler.is_reassembling());
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_continuation_without_start() {
        let mut assembler = MessageAssembler::default();
        let err = assembler
            .push(frame(Opcode::Continuation, true, b"x"))
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedContinuation);
        assert_eq!(err.close_code().as_u16(), 4002);
    }

    #[test]
    fn test_text_mid_fragmentation() {
        let mut assembler = MessageAssembler::default();
        assembler.push(frame(Opcode::Text, false, b"a")).unwrap();
        let err = assembler.push(frame(Opcode::Text, true, b"b")).unwrap_err();
        assert_eq!(err, ProtocolError::FrameMidFragmentation);
        assert!(!assembler.is_reassembling());
    }

    #[test]
    fn test_binary_rejected() {
        let mut assembler = MessageAssembler::default();
        let err = assembler.push(frame(Opcode::Binary, true, b"\x00")).unwrap_err();
        assert_eq!(err.close_code().as_u16(), 4003);

        let err = assembler.push(frame(Opcode::Binary, false, b"\x00")).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedBinary);
    }

    #[test]
    fn test_binary_mid_fragmentation_is_fragmentation_error() {
        let mut assembler = MessageAssembler::default();
        assembler.push(frame(Opcode::Text, false, b"a")).unwrap();
        let err = assembler.push(frame(Opcode::Binary, true, b"b")).unwrap_err();
        assert_eq!(err, ProtocolError::FrameMidFragmentation);
    }

    #[test]
    fn test_cumulative_size_cap() {
        let mut assembler = MessageAssembler::new(8);
        assembler.push(frame(Opcode::Text, false, b"12345")).unwrap();
        let err = assembler
            .push(frame(Opcode::Continuation, true, b"6789"))
            .unwrap_err();
        assert_eq!(err, ProtocolError::MessageTooLarge { size: 9, max: 8 });
        assert_eq!(err.close_code().as_u16(), 1009);
        assert!(!assembler.is_reassembling());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut assembler = MessageAssembler::default();
        let err = assembler
            .push(frame(Opcode::Text, true, &[0xff, 0xfe]))
            .unwrap_err();
        assert_eq!(err, ProtocolError::InvalidUtf8);
    }

    #[test]
    fn test_control_frames_do_not_disturb_state() {
        let mut assembler = MessageAssembler::default();
        assembler.push(frame(Opcode::Text, false, b"a")).unwrap();
        assert_eq!(assembler.push(frame(Opcode::Ping, true, b"p")).unwrap(), None);
        assert!(assembler.is_reassembling());
        let text = assembler.push(frame(Opcode::Continuation, true, b"b")).unwrap();
        assert_eq!(text.as_deref(), Some("ab"));
    }
}
