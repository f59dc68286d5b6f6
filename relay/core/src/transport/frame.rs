//! Frame Protocol
//!
//! The streaming gateway's wire format. Every event travels as one frame:
//!
//! ```text
//! ┌───────────────┬───────────────┬─────────────────────────────┐
//! │ len: u32 (BE) │ crc: u32 (BE) │ payload: `len` bytes (JSON) │
//! └───────────────┴───────────────┴─────────────────────────────┘
//! ```
//!
//! `crc` is the CRC32 of the payload alone. A payload whose checksum matches
//! but which is not a valid event is consumed before the error surfaces, so
//! the decoder stays on a frame boundary.

use serde::{de::DeserializeOwned, Serialize};

use super::TransportError;

/// Largest payload accepted in either direction (10 MiB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Bytes taken by the length and checksum fields
const HEADER_LEN: usize = 8;

/// Leading fields of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    payload_len: usize,
    crc: u32,
}

impl FrameHeader {
    fn for_payload(payload: &[u8]) -> Result<Self, TransportError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(Self {
            payload_len: payload.len(),
            crc: crc32fast::hash(payload),
        })
    }

    /// Read a header off the front of `bytes`, if enough are buffered
    fn peek(bytes: &[u8]) -> Option<Self> {
        let (len, crc) = bytes.get(..HEADER_LEN)?.split_at(4);
        Some(Self {
            payload_len: u32::from_be_bytes(len.try_into().ok()?) as usize,
            crc: u32::from_be_bytes(crc.try_into().ok()?),
        })
    }

    fn write_to(self, out: &mut Vec<u8>) {
        // payload_len is bounded by MAX_FRAME_SIZE, which fits in a u32
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(self.payload_len as u32).to_be_bytes());
        out.extend_from_slice(&self.crc.to_be_bytes());
    }

    fn frame_len(self) -> usize {
        HEADER_LEN + self.payload_len
    }
}

/// Serialize `msg` into a complete frame
///
/// # Errors
///
/// `SerializationError` when `msg` cannot be turned into JSON, `FrameTooLarge`
/// when the JSON exceeds [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let payload =
        serde_json::to_vec(msg).map_err(|e| TransportError::SerializationError(e.to_string()))?;
    let header = FrameHeader::for_payload(&payload)?;

    let mut frame = Vec::with_capacity(header.frame_len());
    header.write_to(&mut frame);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame reader
///
/// Feed it whatever the socket returned with [`push`](Self::push), then call
/// [`decode`](Self::decode) until it yields `Ok(None)`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    /// An empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer bytes read from the stream
    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Bytes buffered but not yet part of a returned frame
    #[must_use]
    pub fn available(&self) -> usize {
        self.pending.len()
    }

    /// Take the next checksum-verified payload off the buffer
    ///
    /// `Ok(None)` means the frame is still incomplete.
    ///
    /// # Errors
    ///
    /// `FrameTooLarge` for an oversized length field and `ChecksumMismatch`
    /// for a corrupted payload. Neither consumes any bytes: the stream can no
    /// longer be trusted.
    pub fn next_payload(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(header) = FrameHeader::peek(&self.pending) else {
            return Ok(None);
        };
        if header.payload_len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: header.payload_len,
                max: MAX_FRAME_SIZE,
            });
        }
        if self.pending.len() < header.frame_len() {
            return Ok(None);
        }

        let payload = &self.pending[HEADER_LEN..header.frame_len()];
        let actual = crc32fast::hash(payload);
        if actual != header.crc {
            return Err(TransportError::ChecksumMismatch {
                expected: header.crc,
                actual,
            });
        }

        let payload = payload.to_vec();
        self.pending.drain(..header.frame_len());
        Ok(Some(payload))
    }

    /// Decode the next complete frame as `T`
    ///
    /// # Errors
    ///
    /// Everything [`next_payload`](Self::next_payload) reports, plus a
    /// recoverable `SerializationError` when an intact frame is not a `T`.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        match self.next_payload()? {
            Some(payload) => serde_json::from_slice(&payload)
                .map(Some)
                .map_err(|e| TransportError::SerializationError(e.to_string())),
            None => Ok(None),
        }
    }
}
