//! Length-prefixed frame extraction.
//!
//! The distributor writes each record as `<decimal length>{...}` where the
//! length counts the payload starting at the opening brace. [`FrameBuffer`]
//! accumulates raw bytes and yields complete payloads; it performs no I/O so
//! it can be driven by any reader.

use std::collections::VecDeque;

use thiserror::Error;

/// Minimum number of buffered bytes before a missing length prefix is
/// treated as a framing violation (five length digits plus the brace).
pub const NETWORK_BUFFER_MIN_SIZE: usize = 6;

/// Hard ceiling on buffered bytes. Keep in sync with the daemon's
/// `NETWORK_BUFFER_MAX_SIZE`.
pub const NETWORK_BUFFER_MAX_SIZE: usize = 33792;

/// One complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Payload bytes, starting at the opening brace.
    pub payload: Vec<u8>,
    /// Number of ASCII digits in the length prefix.
    pub digits: usize,
}

impl Frame {
    /// Total wire size of the frame including the length prefix.
    pub fn wire_len(&self) -> usize {
        self.payload.len() + self.digits
    }
}

/// Framing violations detected while extracting frames.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("buffer capacity reached: {current} of {max} bytes")]
    CapacityReached { current: usize, max: usize },

    #[error("received line does not start with a length prefix")]
    InvalidLine { buffer: Vec<u8> },
}

/// Result of inspecting the head of the buffer for a length prefix.
#[derive(Debug, PartialEq, Eq)]
enum Prefix {
    Complete { length: usize, digits: usize },
    Incomplete,
    Invalid,
}

/// Accumulates stream bytes and splits them into frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Declared payload length of the frame at the head, 0 if not yet known.
    pending_len: usize,
    pending_digits: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// Create a buffer with the protocol's default ceiling.
    pub fn new() -> Self {
        Self::with_capacity(NETWORK_BUFFER_MAX_SIZE)
    }

    /// Create a buffer with a custom ceiling.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            pending_len: 0,
            pending_digits: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes that can still be appended before the ceiling is hit.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    /// Raw buffered bytes that have not yet formed a complete frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Append bytes, truncating to the remaining capacity. Returns the number
    /// of bytes accepted.
    pub fn extend(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.remaining());
        if let Some(chunk) = data.get(..take) {
            self.buf.extend_from_slice(chunk);
        }
        take
    }

    /// Move every complete frame into `out`, in arrival order.
    ///
    /// Frames completed before a framing violation are still delivered; the
    /// error is returned afterwards. A buffer that is still at capacity once
    /// extraction is done can never make progress and is reported as
    /// [`FrameError::CapacityReached`].
    pub fn extract(&mut self, out: &mut VecDeque<Frame>) -> Result<usize, FrameError> {
        let mut consumed = 0usize;
        let mut count = 0usize;
        let mut violation = None;

        loop {
            let pending = self.buf.get(consumed..).unwrap_or_default();

            if self.pending_len == 0 {
                match parse_prefix(pending) {
                    Prefix::Complete { length, digits } => {
                        self.pending_len = length;
                        self.pending_digits = digits;
                    }
                    Prefix::Incomplete => break,
                    Prefix::Invalid => {
                        violation = Some(FrameError::InvalidLine {
                            buffer: pending.to_vec(),
                        });
                        break;
                    }
                }
            }

            let total = self.pending_len + self.pending_digits;
            let Some(payload) = pending.get(self.pending_digits..total) else {
                break;
            };

            out.push_back(Frame {
                payload: payload.to_vec(),
                digits: self.pending_digits,
            });
            consumed += total;
            count += 1;
            self.pending_len = 0;
            self.pending_digits = 0;
        }

        self.buf.drain(..consumed);

        if let Some(err) = violation {
            return Err(err);
        }

        if self.is_full() {
            return Err(FrameError::CapacityReached {
                current: self.buf.len(),
                max: self.capacity,
            });
        }

        Ok(count)
    }
}

/// Inspect the head of `pending` for `<digits>{`.
fn parse_prefix(pending: &[u8]) -> Prefix {
    let window = pending
        .get(..NETWORK_BUFFER_MIN_SIZE)
        .unwrap_or(pending);
    let digits = window.iter().take_while(|b| b.is_ascii_digit()).count();

    if digits > 0 && window.get(digits) == Some(&b'{') {
        let length = window
            .iter()
            .take(digits)
            .fold(0usize, |acc, b| acc * 10 + usize::from(b - b'0'));
        if length == 0 {
            return Prefix::Invalid;
        }
        return Prefix::Complete { length, digits };
    }

    if pending.len() < NETWORK_BUFFER_MIN_SIZE {
        Prefix::Incomplete
    } else {
        Prefix::Invalid
    }
}

/// Encode a payload as a frame. The payload must start with `{`.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = payload.len().to_string().into_bytes();
    out.extend_from_slice(payload);
    out
}
