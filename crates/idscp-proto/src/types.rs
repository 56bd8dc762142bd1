//! Message type tags.
//!
//! The type tag is the discriminator the handshake state machine uses for
//! transition lookup: every wire message maps to exactly one tag, and the
//! state machine treats the tag as the event key.

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Wire message type.
///
/// Tag values are part of the wire format and must never be reordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize_repr, Deserialize_repr,
)]
#[repr(u16)]
pub enum MessageType {
    /// Attestation handshake opener, sent by the consumer.
    RatStart = 0x0001,
    /// Verifier's attestation request (nonce / supported suites).
    RatRequest = 0x0002,
    /// Prover's attestation response (opaque quote bytes).
    RatResponse = 0x0003,
    /// Verifier's verdict on the attestation response.
    RatResult = 0x0004,
    /// Attestation sub-protocol close, hands over to metadata exchange.
    RatLeave = 0x0005,
    /// Self-description request carrying the sender's DAT.
    MetaRequest = 0x0006,
    /// Self-description response carrying the sender's DAT.
    MetaResponse = 0x0007,
    /// Protocol-level error; terminates the handshake gracefully.
    Error = 0x0008,
}

impl MessageType {
    /// All tags, in wire order. Useful for exhaustive table construction.
    pub const ALL: [Self; 8] = [
        Self::RatStart,
        Self::RatRequest,
        Self::RatResponse,
        Self::RatResult,
        Self::RatLeave,
        Self::MetaRequest,
        Self::MetaResponse,
        Self::Error,
    ];

    /// Convert to the on-wire tag value.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse an on-wire tag value. Returns `None` for unknown tags.
    #[must_use]
    pub fn from_u16(tag: u16) -> Option<Self> {
        match tag {
            0x0001 => Some(Self::RatStart),
            0x0002 => Some(Self::RatRequest),
            0x0003 => Some(Self::RatResponse),
            0x0004 => Some(Self::RatResult),
            0x0005 => Some(Self::RatLeave),
            0x0006 => Some(Self::MetaRequest),
            0x0007 => Some(Self::MetaResponse),
            0x0008 => Some(Self::Error),
            _ => None,
        }
    }
}
