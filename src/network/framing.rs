//! Message Framing
//!
//! Turns a raw TCP byte stream into discrete, integrity-checked messages.
//!
//! ## Envelope
//!
//! ```text
//! ┌────────────────┬───────────────────┬────────────────────┐
//! │ length: u32 BE │ checksum: 4 bytes │ payload: length B  │
//! └────────────────┴───────────────────┴────────────────────┘
//! ```
//!
//! The checksum is the first four bytes of a domain-separated SHA-256 of the
//! payload. There is no synchronization marker, so a corrupt envelope cannot
//! be skipped: once a [`Framer`] fails it stays failed and the owning session
//! is expected to be killed.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length prefix size in bytes.
pub const LENGTH_LEN: usize = 4;

/// Checksum size in bytes.
pub const CHECKSUM_LEN: usize = 4;

/// Total envelope header size.
pub const HEADER_LEN: usize = LENGTH_LEN + CHECKSUM_LEN;

/// Default payload limit (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Domain separator mixed into every checksum.
const CHECKSUM_DOMAIN: &[u8] = b"SEEQD_FRAME_V1";

/// Frame checksum type.
pub type Checksum = [u8; CHECKSUM_LEN];

/// Framing and integrity errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Length field exceeds the configured limit.
    #[error("Frame too large: {len} bytes (max {max})")]
    TooLarge {
        /// Declared payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Payload does not match the envelope checksum.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum carried by the envelope (hex).
        expected: String,
        /// Checksum computed over the payload (hex).
        actual: String,
    },

    /// The framer already rejected this stream.
    #[error("Stream already failed integrity checks")]
    Poisoned,
}

/// Compute the envelope checksum of a payload.
pub fn checksum(payload: &[u8]) -> Checksum {
    let mut hasher = Sha256::new();
    hasher.update(CHECKSUM_DOMAIN);
    hasher.update(payload);
    let digest = hasher.finalize();

    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

/// Wrap a payload in an envelope.
pub fn encode_frame(payload: &[u8], max_message_size: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_message_size || payload.len() > u32::MAX as usize {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: max_message_size,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&checksum(payload));
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Per-session stream reassembler.
///
/// Bytes are appended with [`Framer::push`] as they arrive and complete
/// messages are pulled with [`Framer::next_message`]. The consumed prefix of
/// the buffer is dropped after every extracted message.
#[derive(Debug, Clone)]
pub struct Framer {
    buffer: Vec<u8>,
    max_message_size: usize,
    poisoned: bool,
}

impl Framer {
    /// Create a framer accepting payloads up to `max_message_size` bytes.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_message_size,
            poisoned: false,
        }
    }

    /// Append raw bytes from the socket.
    ///
    /// Ignored once the framer has failed.
    pub fn push(&mut self, bytes: &[u8]) {
        if !self.poisoned {
            self.buffer.extend_from_slice(bytes);
        }
    }

    /// Extract the next complete message, if one is buffered.
    ///
    /// `Ok(None)` means more bytes are needed. An oversized length is
    /// reported as soon as the header is available, without waiting for the
    /// payload.
    pub fn next_message(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.poisoned {
            return Err(FrameError::Poisoned);
        }
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut len_bytes = [0u8; LENGTH_LEN];
        len_bytes.copy_from_slice(&self.buffer[..LENGTH_LEN]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > self.max_message_size {
            return Err(self.fail(FrameError::TooLarge {
                len,
                max: self.max_message_size,
            }));
        }

        let total = HEADER_LEN + len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let mut expected = [0u8; CHECKSUM_LEN];
        expected.copy_from_slice(&self.buffer[LENGTH_LEN..HEADER_LEN]);
        let payload = &self.buffer[HEADER_LEN..total];
        let actual = checksum(payload);
        if actual != expected {
            return Err(self.fail(FrameError::ChecksumMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            }));
        }

        let payload = payload.to_vec();
        self.buffer.drain(..total);

        #[cfg(feature = "debug-tracing")]
        tracing::trace!(len, remaining = self.buffer.len(), "frame extracted");

        Ok(Some(payload))
    }

    /// Number of bytes buffered but not yet extracted.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the stream failed integrity checks.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn fail(&mut self, err: FrameError) -> FrameError {
        self.poisoned = true;
        self.buffer = Vec::new();
        err
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

// =============================================================================
// TESTS
// =============================================================================
