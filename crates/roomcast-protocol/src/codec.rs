//! JSON codec for Roomcast envelopes.
//!
//! Every socket frame and every pub/sub payload carries exactly one envelope
//! encoded as a UTF-8 JSON object. There is no length prefix: framing is the
//! transport's job.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::Envelope;

/// Default maximum inbound frame size (16 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode an envelope to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(ProtocolError::Encode)
}

/// Decode an envelope from bytes.
///
/// # Errors
///
/// Returns an error if the data is not a valid envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    serde_json::from_slice(data).map_err(ProtocolError::Decode)
}

/// Decode an envelope, rejecting frames larger than `max_size` first.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_bounded(data: &[u8], max_size: usize) -> Result<Envelope, ProtocolError> {
    if data.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max: max_size,
        });
    }
    decode(data)
}
