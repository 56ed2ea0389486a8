//! Incremental frame parser over an append-only byte buffer.
//!
//! Mirrors the length-prefix incremental decode idiom used elsewhere in
//! this codebase's lineage (see `LengthPrefixedCodec`/`FrameCodec`), but
//! frames here are self-delimiting MessagePack arrays rather than
//! length-prefixed payloads: the array header itself carries the element
//! count, so there is no outer length to read first.

use bytes::BytesMut;

use super::message::{self, Message, MessageError};
use super::value::{Decoded, Value, decode};

/// Maximum input buffer size. Exceeding this while waiting for a frame
/// to complete is a protocol violation — the input buffer never grows
/// past its fixed capacity.
pub const INPUT_BUFFER_CAPACITY: usize = 1024 * 1024;

/// Result of attempting to pull one frame out of the buffer.
pub enum FrameResult {
    /// A complete, valid frame was parsed and consumed.
    Frame(Message),
    /// Not enough bytes yet for a full frame; buffer left untouched.
    NeedMore,
}

/// Errors that make the framer itself fatal (distinct from `NeedMore`).
#[derive(Debug, thiserror::Error)]
pub enum FramerError {
    #[error("input buffer would exceed {INPUT_BUFFER_CAPACITY} byte capacity")]
    BufferOverflow,
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("unrecognized wire tag byte 0x{0:02x}")]
    InvalidTag(u8),
    #[error("tag byte 0x{0:02x} encodes a value that a narrower tag could have carried")]
    NonCanonical(u8),
}

/// Owns the input buffer and extracts complete frames from it.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Number of unconsumed bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Append freshly-read bytes. Returns an error if doing so would
    /// exceed the fixed input buffer capacity.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), FramerError> {
        if self.buf.len() + bytes.len() > INPUT_BUFFER_CAPACITY {
            return Err(FramerError::BufferOverflow);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Attempt to parse and consume the next complete frame.
    ///
    /// On `NeedMore`, the buffer is left exactly as it was — no partial
    /// frame is ever exposed. Any other error is a protocol violation
    /// and is fatal in the caller.
    pub fn next_frame(&mut self) -> Result<FrameResult, FramerError> {
        match decode(&self.buf) {
            Decoded::Complete(Value::Array(items), consumed) => {
                let msg = message::from_array(&items)?;
                self.buf.advance_and_compact(consumed);
                Ok(FrameResult::Frame(msg))
            }
            Decoded::Complete(_non_array, _) => {
                // Top-level value that isn't an array: a frame must be
                // an array per the data model. Protocol violation.
                Err(MessageError::WrongKind {
                    type_code: u64::MAX,
                    index: 0,
                }
                .into())
            }
            Decoded::Incomplete => Ok(FrameResult::NeedMore),
            Decoded::InvalidTag(t) => Err(FramerError::InvalidTag(t)),
            Decoded::NonCanonical(t) => Err(FramerError::NonCanonical(t)),
        }
    }
}

/// Small helper trait so `Framer::next_frame` reads naturally; advances
/// past `n` consumed bytes and compacts the buffer so the free region
/// stays contiguous (the head of the buffer is memmoved down).
trait AdvanceCompact {
    fn advance_and_compact(&mut self, n: usize);
}

impl AdvanceCompact for BytesMut {
    fn advance_and_compact(&mut self, n: usize) {
        use bytes::Buf;
        self.advance(n);
    }
}
