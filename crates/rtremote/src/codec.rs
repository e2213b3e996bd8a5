//! Length-prefixed document framing.
//!
//! Frame format: `[length:4][payload:N]`
//!
//! - **length**: payload size in bytes (big-endian u32), header excluded
//! - **payload**: UTF-8 JSON document
//!
//! A read may deliver any number of frames, or part of one; [`FrameDecoder`]
//! keeps the remainder until the rest arrives.

use crate::document::Document;
use crate::error::RemoteError;

/// Size of the length prefix.
pub const HEADER_SIZE: usize = 4;

/// Framing errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    /// Payload exceeds the configured maximum. The byte stream can no longer
    /// be resynchronized.
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// Announced or actual payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A complete frame whose payload is not a JSON document. The frame has
    /// been consumed; decoding may continue.
    #[error("malformed frame payload: {0}")]
    Malformed(String),
}

impl FrameError {
    /// Whether the decoder can keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Malformed(_))
    }
}

impl From<FrameError> for RemoteError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Malformed(msg) => RemoteError::MalformedMessage(msg),
            FrameError::TooLarge { .. } => {
                RemoteError::io(std::io::ErrorKind::InvalidData, e.to_string())
            }
        }
    }
}

/// Encode a document as one frame.
pub fn encode_frame(doc: &Document, max_size: usize) -> Result<Vec<u8>, FrameError> {
    let payload = doc.to_bytes();
    if payload.len() > max_size || payload.len() > u32::MAX as usize {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: max_size,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame decoder.
///
/// Decoded frames advance a read offset; the consumed prefix is compacted
/// once per [`extend`](Self::extend) rather than once per frame.
pub struct FrameDecoder {
    buf: Vec<u8>,
    pos: usize,
    max_size: usize,
}

impl FrameDecoder {
    /// Create a decoder rejecting payloads above `max_size`.
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            max_size,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Decode the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Document>, FrameError> {
        let pending = &self.buf[self.pos..];
        if pending.len() < HEADER_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([pending[0], pending[1], pending[2], pending[3]]) as usize;
        if len > self.max_size {
            return Err(FrameError::TooLarge {
                size: len,
                max: self.max_size,
            });
        }

        let total = HEADER_SIZE + len;
        if pending.len() < total {
            return Ok(None);
        }

        let parsed = Document::from_slice(&pending[HEADER_SIZE..total]);
        self.pos += total;
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
        parsed
            .map(Some)
            .map_err(|e| FrameError::Malformed(e.to_string()))
    }
}
