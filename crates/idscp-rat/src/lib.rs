//! Remote-attestation driver framework.
//!
//! Attestation mechanisms (TPM quotes, software-only test drivers, ...) plug
//! in behind the [`RatProverDriver`] and [`RatVerifierDriver`] traits. Each
//! started driver runs on its own thread with a queued input channel, so slow
//! hardware or network operations never block protocol message delivery.
//!
//! Drivers report back exclusively through the [`FsmListener`] callback,
//! which the connection layer serializes with wire events - a driver verdict
//! is just another event to the state machine.
//!
//! Registries are plain values handed to each connection rather than process
//! globals, so tests can use isolated registries per case.

pub mod driver;
pub mod dummy;
pub mod error;
pub mod registry;
pub mod tpm;

pub use driver::{
    ControlMessage, DriverContext, DriverEvent, DriverHandle, FsmListener, RatProverDriver,
    RatVerifierDriver,
};
pub use error::RatError;
pub use registry::{DriverConfig, RatProverRegistry, RatVerifierRegistry};
pub use tpm::TpmCodec;
