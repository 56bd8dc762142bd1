//! Deterministic scenario harness for the handshake engine.
//!
//! Tests drive complete consumer/provider exchanges without sockets: the
//! scenario builder wires two [`idscp_core::Connection`]s together, routes
//! their outbound messages across, polls driver callbacks, and hands the
//! final [`scenario::World`] to a mandatory oracle for verification.
//!
//! For threaded end-to-end tests the [`loopback`] module provides an
//! in-memory transport pair that exercises the real
//! [`idscp_core::SecureChannel`] path, attach gate included.

pub mod listener;
pub mod loopback;
pub mod scenario;

pub use listener::{ListenerEvent, QueueListener};
pub use loopback::LoopbackEndpoint;
pub use scenario::{Scenario, World};
