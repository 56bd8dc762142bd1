//! Protocol decode and encode errors.

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Header magic did not match [`crate::MessageHeader::MAGIC`].
    #[error("bad magic: {found:#010x}")]
    BadMagic {
        /// Magic value found on the wire.
        found: u32,
    },

    /// Protocol version is not supported by this implementation.
    #[error("unsupported version: {found}")]
    UnsupportedVersion {
        /// Version byte found on the wire.
        found: u8,
    },

    /// Message type tag is not part of the protocol vocabulary.
    #[error("unknown message type tag: {0:#06x}")]
    UnknownMessageType(u16),

    /// Buffer ended before the declared length.
    #[error("truncated message: need {needed} bytes, got {got}")]
    Truncated {
        /// Bytes required to finish decoding.
        needed: usize,
        /// Bytes actually available.
        got: usize,
    },

    /// Declared payload length exceeds the decode limit.
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge {
        /// Declared payload size.
        size: usize,
        /// Enforced maximum.
        limit: usize,
    },

    /// Payload bytes present on a message type that carries none.
    #[error("unexpected payload on {0:?} message")]
    UnexpectedPayload(crate::MessageType),

    /// CBOR payload failed to serialize or deserialize.
    #[error("cbor: {0}")]
    Cbor(String),
}
