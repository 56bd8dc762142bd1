//! Driver framework errors.

/// Errors surfaced by driver handles and driver implementations.
#[derive(Debug, thiserror::Error)]
pub enum RatError {
    /// The driver was already terminated; no further input is accepted.
    #[error("driver already terminated")]
    Terminated,

    /// The driver thread exited and its input queue is gone.
    #[error("driver thread is gone")]
    ChannelClosed,

    /// Only verifier drivers support restart.
    #[error("driver does not support restart")]
    RestartUnsupported,

    /// The external attestation codec reported a failure.
    #[error("attestation codec: {0}")]
    Codec(String),
}
