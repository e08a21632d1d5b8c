// ============================================
// File: crates/warren-core/src/codec.rs
// ============================================
//! # Stream Framing Codec
//!
//! ## Creation Reason
//! Stream transports carry discrete ciphertext records; this module
//! provides the 2-byte big-endian length prefix framing and the
//! reassembly state that turns short reads back into whole records.
//!
//! ## Wire Format
//! ```text
//! ┌──────────────┬───────────────────────────────┐
//! │ length (u16) │ record (length bytes)         │
//! │  big-endian  │                               │
//! └──────────────┴───────────────────────────────┘
//! ```
//!
//! ## Parsing Strategy
//! 1. Accumulate received chunks in a residual buffer
//! 2. Once 2 bytes are present, latch the record length
//! 3. Once `length` payload bytes are present, split off one record
//! 4. Framing violations poison the assembler; the connection must be
//!    reset because the record boundary is lost
//!
//! ## ⚠️ Important Note for Next Developer
//! - The 2-byte network-order prefix is a wire constant
//! - A poisoned assembler never yields frames again - reset the stream

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, Result};

// ============================================
// Constants
// ============================================

/// Size of the length prefix framing each stream record (wire constant).
pub const FRAME_LEN_SIZE: usize = 2;

/// Largest record length expressible by the prefix.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

// ============================================
// Encoding
// ============================================

/// Frames a record for a stream transport.
///
/// # Errors
/// Returns `FrameOversize` if the payload exceeds what the 2-byte
/// prefix can express, and `ZeroLengthFrame` for an empty payload.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    if payload.is_empty() {
        return Err(CoreError::ZeroLengthFrame);
    }
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CoreError::FrameOversize {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(FRAME_LEN_SIZE + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

// ============================================
// StreamAssembler
// ============================================

/// Reassembles length-prefixed records from a byte stream.
///
/// # Purpose
/// TCP delivers arbitrary chunks; the assembler buffers them and yields
/// exactly one complete record at a time, in order.
///
/// # Example
/// ```
/// use warren_core::codec::{encode_frame, StreamAssembler};
///
/// let mut asm = StreamAssembler::new(1500);
/// let framed = encode_frame(b"hello").unwrap();
///
/// // Feed the stream one byte at a time
/// for b in framed.iter() {
///     asm.push(&[*b]);
/// }
///
/// let record = asm.next_frame().unwrap().unwrap();
/// assert_eq!(&record[..], b"hello");
/// ```
#[derive(Debug)]
pub struct StreamAssembler {
    /// Bytes received but not yet assembled into a record.
    residual: BytesMut,
    /// Length of the record being assembled; `None` until the prefix
    /// has been read.
    next_len: Option<usize>,
    /// Largest acceptable record.
    max_frame: usize,
    /// Set on a framing violation; the stream must be reset.
    poisoned: bool,
}

impl StreamAssembler {
    /// Creates an assembler accepting records up to `max_frame` bytes.
    #[must_use]
    pub fn new(max_frame: usize) -> Self {
        Self {
            residual: BytesMut::with_capacity(FRAME_LEN_SIZE + max_frame),
            next_len: None,
            max_frame: max_frame.min(MAX_FRAME_SIZE),
            poisoned: false,
        }
    }

    /// Appends a received chunk to the residual buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        if !self.poisoned {
            self.residual.extend_from_slice(chunk);
        }
    }

    /// Yields the next fully formed record, if one is buffered.
    ///
    /// # Errors
    /// - `FrameOversize` / `ZeroLengthFrame` on a framing violation;
    ///   the assembler is poisoned afterwards
    /// - `StreamPoisoned` on any call after a violation
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.poisoned {
            return Err(CoreError::StreamPoisoned);
        }

        if self.next_len.is_none() {
            if self.residual.len() < FRAME_LEN_SIZE {
                return Ok(None);
            }
            let len = usize::from(self.residual.get_u16());
            if len == 0 {
                self.poisoned = true;
                return Err(CoreError::ZeroLengthFrame);
            }
            if len > self.max_frame {
                self.poisoned = true;
                return Err(CoreError::FrameOversize {
                    len,
                    max: self.max_frame,
                });
            }
            self.next_len = Some(len);
        }

        let len = self.next_len.expect("latched above");
        if self.residual.len() < len {
            return Ok(None);
        }

        self.next_len = None;
        Ok(Some(self.residual.split_to(len).freeze()))
    }

    /// Returns `true` once a framing violation has occurred.
    #[must_use]
    pub const fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Number of buffered bytes not yet assembled.
    #[must_use]
    pub fn residual_len(&self) -> usize {
        self.residual.len()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefix_is_big_endian() {
        let framed = encode_frame(&[0xaa; 300]).unwrap();
        assert_eq!(&framed[..2], &[0x01, 0x2c]); // 300 = 0x012c
        assert_eq!(framed.len(), 302);
    }

    #[test]
    fn test_encode_rejects_empty_and_oversize() {
        assert!(matches!(encode_frame(&[]), Err(CoreError::ZeroLengthFrame)));
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(&big),
            Err(CoreError::FrameOversize { .. })
        ));
    }

    #[test]
    fn test_assemble_single_record() {
        let mut asm = StreamAssembler::new(1500);
        asm.push(&encode_frame(b"record one").unwrap());

        let got = asm.next_frame().unwrap().unwrap();
        assert_eq!(&got[..], b"record one");
        assert!(asm.next_frame().unwrap().is_none());
        assert_eq!(asm.residual_len(), 0);
    }

    #[test]
    fn test_assemble_across_short_reads() {
        let mut asm = StreamAssembler::new(1500);
        let framed = encode_frame(b"split across reads").unwrap();

        // One byte at a time, as a pathological stream would deliver
        for b in framed.iter() {
            asm.push(&[*b]);
        }
        let got = asm.next_frame().unwrap().unwrap();
        assert_eq!(&got[..], b"split across reads");
    }

    #[test]
    fn test_assemble_coalesced_records() {
        let mut asm = StreamAssembler::new(1500);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(b"first").unwrap());
        wire.extend_from_slice(&encode_frame(b"second").unwrap());
        asm.push(&wire);

        assert_eq!(&asm.next_frame().unwrap().unwrap()[..], b"first");
        assert_eq!(&asm.next_frame().unwrap().unwrap()[..], b"second");
        assert!(asm.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_oversize_poisons() {
        let mut asm = StreamAssembler::new(100);
        // Declared length 200 > max 100
        asm.push(&[0x00, 0xc8]);

        assert!(matches!(
            asm.next_frame(),
            Err(CoreError::FrameOversize { .. })
        ));
        assert!(asm.is_poisoned());
        assert!(matches!(asm.next_frame(), Err(CoreError::StreamPoisoned)));
    }

    #[test]
    fn test_zero_length_poisons() {
        let mut asm = StreamAssembler::new(100);
        asm.push(&[0x00, 0x00]);
        assert!(matches!(asm.next_frame(), Err(CoreError::ZeroLengthFrame)));
        assert!(asm.is_poisoned());
    }
}
