//! CBOR payload bodies.
//!
//! Attestation evidence (quotes, signatures) is carried as opaque byte
//! strings; its internal layout belongs to the attestation codec, not to
//! this crate.

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};
use crate::types::MessageType;

bitflags::bitflags! {
    /// Security-requirement attributes advertised alongside a DAT.
    ///
    /// Carried in the metadata exchange so the token verifier can check the
    /// peer's claims against local requirements.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RequirementFlags: u32 {
        /// Peer must perform audit logging.
        const AUDIT_LOGGING = 1 << 0;
        /// Peer runs in an isolated (container/enclave) deployment.
        const ISOLATED_DEPLOYMENT = 1 << 1;
        /// Peer enforces usage control on forwarded data.
        const USAGE_CONTROL = 1 << 2;
    }
}

/// Verifier's attestation request.
///
/// # Protocol Flow
///
/// Sent by the attestation verifier right after `RatStart`. Lists the
/// attestation suites the verifier accepts and carries a fresh nonce the
/// prover must bind into its quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatRequestData {
    /// Attestation mechanisms acceptable to the verifier, in preference
    /// order (e.g. `"tpm2.0"`, `"dummy"`).
    pub mechanisms: Vec<String>,
    /// Freshness nonce the prover binds into its evidence.
    pub nonce: Vec<u8>,
}

/// Prover's attestation response.
///
/// # Protocol Flow
///
/// Answer to `RatRequest`. Names the mechanism the prover selected and
/// carries the opaque evidence produced by its driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatResponseData {
    /// Mechanism the prover selected from the verifier's list.
    pub mechanism: String,
    /// Opaque attestation evidence (quote, signature, certificate chain).
    pub payload: Vec<u8>,
}

/// Verifier's verdict on the prover's evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatResultData {
    /// Whether the evidence verified successfully.
    pub success: bool,
    /// Human-readable verification report, for audit logs.
    pub report: String,
}

/// Self-description request.
///
/// # Protocol Flow
///
/// Opens the metadata exchange after `RatLeave`. Carries the sender's DAT
/// and requirement flags; the receiver verifies the token before answering.
/// The `session_id` counter increments on every metadata message and guards
/// against replayed or desynchronized peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRequestData {
    /// Metadata exchange counter; must be one above the last observed.
    pub session_id: u64,
    /// Sender's Dynamic Attribute Token, opaque to this crate.
    pub dat: Vec<u8>,
    /// Requirements the sender expects the peer's token to satisfy.
    pub requirements: RequirementFlags,
}

/// Self-description response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaResponseData {
    /// Metadata exchange counter; must be one above the request's.
    pub session_id: u64,
    /// Responder's Dynamic Attribute Token.
    pub dat: Vec<u8>,
    /// Responder's self-description document (JSON-LD in practice).
    pub self_description: String,
}

/// Protocol-level error notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Machine-readable error code.
    pub code: u32,
    /// Human-readable description, logged by the receiver.
    pub message: String,
}

/// Decoded message payload, one variant per wire type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Attestation handshake opener; carries no body.
    RatStart,
    /// Verifier's attestation request.
    RatRequest(RatRequestData),
    /// Prover's attestation response.
    RatResponse(RatResponseData),
    /// Verifier's verdict.
    RatResult(RatResultData),
    /// Attestation sub-protocol close; carries no body.
    RatLeave,
    /// Self-description request.
    MetaRequest(MetaRequestData),
    /// Self-description response.
    MetaResponse(MetaResponseData),
    /// Protocol-level error.
    Error(ErrorData),
}

impl Payload {
    /// The wire type tag this payload serializes under.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::RatStart => MessageType::RatStart,
            Self::RatRequest(_) => MessageType::RatRequest,
            Self::RatResponse(_) => MessageType::RatResponse,
            Self::RatResult(_) => MessageType::RatResult,
            Self::RatLeave => MessageType::RatLeave,
            Self::MetaRequest(_) => MessageType::MetaRequest,
            Self::MetaResponse(_) => MessageType::MetaResponse,
            Self::Error(_) => MessageType::Error,
        }
    }

    /// Serialize the payload body to CBOR. Body-less types yield an empty
    /// buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Self::RatStart | Self::RatLeave => {},
            Self::RatRequest(data) => write_cbor(data, &mut out)?,
            Self::RatResponse(data) => write_cbor(data, &mut out)?,
            Self::RatResult(data) => write_cbor(data, &mut out)?,
            Self::MetaRequest(data) => write_cbor(data, &mut out)?,
            Self::MetaResponse(data) => write_cbor(data, &mut out)?,
            Self::Error(data) => write_cbor(data, &mut out)?,
        }
        Ok(out)
    }

    /// Deserialize a payload body for the given type tag.
    pub fn decode(msg_type: MessageType, bytes: &[u8]) -> Result<Self> {
        match msg_type {
            MessageType::RatStart => expect_empty(msg_type, bytes).map(|()| Self::RatStart),
            MessageType::RatLeave => expect_empty(msg_type, bytes).map(|()| Self::RatLeave),
            MessageType::RatRequest => read_cbor(bytes).map(Self::RatRequest),
            MessageType::RatResponse => read_cbor(bytes).map(Self::RatResponse),
            MessageType::RatResult => read_cbor(bytes).map(Self::RatResult),
            MessageType::MetaRequest => read_cbor(bytes).map(Self::MetaRequest),
            MessageType::MetaResponse => read_cbor(bytes).map(Self::MetaResponse),
            MessageType::Error => read_cbor(bytes).map(Self::Error),
        }
    }
}

fn write_cbor<T: Serialize>(value: &T, out: &mut Vec<u8>) -> Result<()> {
    ciborium::ser::into_writer(value, out).map_err(|e| ProtocolError::Cbor(e.to_string()))
}

fn read_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Cbor(e.to_string()))
}

fn expect_empty(msg_type: MessageType, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() { Ok(()) } else { Err(ProtocolError::UnexpectedPayload(msg_type)) }
}
