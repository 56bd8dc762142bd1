//! Fixed-size binary message header.
//!
//! The header is a 20-byte big-endian structure parsed zero-copy with
//! compile-time verified layout. It carries everything a connection needs
//! for dispatch (type tag, message id, payload length) without touching the
//! CBOR payload.

use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::errors::{ProtocolError, Result};
use crate::types::MessageType;

/// Fixed-size wire header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MessageHeader {
    magic: U32,
    version: u8,
    reserved: u8,
    msg_type: U16,
    message_id: U64,
    payload_len: U32,
}

impl MessageHeader {
    /// Header magic, `"IDSC"` in ASCII.
    pub const MAGIC: u32 = 0x4944_5343;

    /// Wire format version understood by this implementation.
    pub const VERSION: u8 = 1;

    /// Serialized header size in bytes.
    pub const SIZE: usize = 20;

    /// Build a header for an outgoing message.
    #[must_use]
    pub fn new(msg_type: MessageType, message_id: u64, payload_len: u32) -> Self {
        Self {
            magic: U32::new(Self::MAGIC),
            version: Self::VERSION,
            reserved: 0,
            msg_type: U16::new(msg_type.to_u16()),
            message_id: U64::new(message_id),
            payload_len: U32::new(payload_len),
        }
    }

    /// Parse a header from the front of `bytes` and return it together with
    /// the remaining suffix.
    ///
    /// Validates magic, version, and the message type tag; the payload
    /// length is validated against the rest of the buffer by the caller.
    pub fn parse(bytes: &[u8]) -> Result<(&Self, &[u8])> {
        let (header, rest) = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::Truncated { needed: Self::SIZE, got: bytes.len() })?;

        if header.magic.get() != Self::MAGIC {
            return Err(ProtocolError::BadMagic { found: header.magic.get() });
        }
        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion { found: header.version });
        }
        if MessageType::from_u16(header.msg_type.get()).is_none() {
            return Err(ProtocolError::UnknownMessageType(header.msg_type.get()));
        }

        Ok((header, rest))
    }

    /// Message type tag.
    ///
    /// Infallible on headers obtained through [`Self::parse`] or
    /// [`Self::new`]; falls back to `Error` only if the header was
    /// constructed from unchecked bytes.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        MessageType::from_u16(self.msg_type.get()).unwrap_or(MessageType::Error)
    }

    /// Monotonic per-connection message id.
    #[must_use]
    pub fn message_id(&self) -> u64 {
        self.message_id.get()
    }

    /// Declared payload length in bytes.
    #[must_use]
    pub fn payload_len(&self) -> u32 {
        self.payload_len.get()
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}
