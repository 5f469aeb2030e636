//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while framing or decoding messages.
///
/// Every variant except [`ProtocolError::Decode`] means the byte stream can
/// no longer be trusted and the connection must be dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Declared payload length exceeds the sanity limit.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u64, max: usize },

    /// Frame does not start with the plaintext indicator byte.
    #[error("invalid frame indicator: 0x{0:02x}")]
    InvalidPreamble(u8),

    /// A varint ran past 10 bytes or does not fit its field.
    #[error("varint overflow")]
    VarintOverflow,

    /// Payload of a known message type failed to decode.
    #[error("malformed {message} payload: {source}")]
    Decode {
        message: &'static str,
        #[source]
        source: prost::DecodeError,
    },

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns true if the stream is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Decode { .. })
    }
}
