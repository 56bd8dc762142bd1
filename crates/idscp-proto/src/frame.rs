//! Complete wire messages: header plus payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};
use crate::header::MessageHeader;
use crate::payloads::Payload;
use crate::types::MessageType;

/// Maximum accepted payload size. Prevents a peer from forcing a huge
/// allocation with a single crafted header.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Monotonic per-connection message id.
    pub id: u64,
    /// Typed payload body.
    pub payload: Payload,
}

impl Message {
    /// Build a message from an id and payload.
    #[must_use]
    pub fn new(id: u64, payload: Payload) -> Self {
        Self { id, payload }
    }

    /// The wire type tag, used by the state machine as event key.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Serialize header and payload into a single buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let body = self.payload.encode()?;
        if body.len() > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge { size: body.len(), limit: MAX_PAYLOAD });
        }

        let header = MessageHeader::new(self.message_type(), self.id, body.len() as u32);
        let mut out = BytesMut::with_capacity(MessageHeader::SIZE + body.len());
        out.put_slice(&header.to_bytes());
        out.put_slice(&body);
        Ok(out.freeze())
    }

    /// Decode a message from a complete buffer.
    ///
    /// The buffer must contain exactly one message; trailing bytes beyond
    /// the declared payload length are a framing error on the transport's
    /// side and are rejected here.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (header, rest) = MessageHeader::parse(bytes)?;

        let declared = header.payload_len() as usize;
        if declared > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge { size: declared, limit: MAX_PAYLOAD });
        }
        if rest.len() != declared {
            return Err(ProtocolError::Truncated {
                needed: MessageHeader::SIZE + declared,
                got: bytes.len(),
            });
        }

        let payload = Payload::decode(header.message_type(), rest)?;
        Ok(Self { id: header.message_id(), payload })
    }
}
