//! Wire format for the IDSCP connector handshake.
//!
//! Messages consist of a fixed 20-byte header (zero-copy binary) followed by
//! a variable-length CBOR payload. The header carries the message type tag
//! the state machine dispatches on, so a connection can route a message
//! without deserializing its payload.
//!
//! # Security
//!
//! All header parsing uses compile-time verified layouts via `zerocopy`. We
//! enforce a 16 MB payload limit to prevent memory exhaustion attacks, and
//! an unknown type tag is a decode error - the state machine never sees a
//! message it has no vocabulary for.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod frame;
pub mod header;
pub mod payloads;
pub mod types;

pub use errors::{ProtocolError, Result};
pub use frame::Message;
pub use header::MessageHeader;
pub use payloads::{Payload, RequirementFlags};
pub use types::MessageType;
