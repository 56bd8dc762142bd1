//! IDSCP handshake engine.
//!
//! Two connectors run this protocol over an established transport before any
//! user traffic flows: a remote-attestation exchange (one side proves its
//! platform integrity, the other verifies it), identity token verification
//! against a DAPS, and a self-description metadata exchange. The handshake
//! always runs to completion - an attestation or token failure is recorded
//! as a verdict, not enforced by tearing the connection down. Trust policy
//! belongs to the layer above.
//!
//! # Architecture
//!
//! Protocol logic is a deterministic, table-driven state machine isolated
//! from I/O, time, and threading. Transitions accumulate declarative actions
//! (send this message, start that driver) that the connection layer
//! executes; time is passed in as a parameter. The same machine therefore
//! runs unchanged under the production transport and the deterministic test
//! harness.
//!
//! # Components
//!
//! - [`fsm`]: generic table-driven state machine engine
//! - [`protocol`]: the concrete consumer/provider handshake graphs
//! - [`session`]: per-connection context, attestation verdict, actions
//! - [`daps`]: DAPS token boundary
//! - [`connection`]: action-executing glue around one handshake
//! - [`secure_channel`]: transport adapter with the attach-ordering gate

pub mod connection;
pub mod daps;
pub mod error;
pub mod fsm;
pub mod protocol;
pub mod secure_channel;
pub mod session;

pub use connection::{Connection, OutboundAction};
pub use daps::{DapsDriver, DapsError, SecurityRequirements, StaticDaps};
pub use error::FsmConfigError;
pub use fsm::{FeedOutcome, Fsm, FsmEvent, StateId};
pub use protocol::{ControlKey, EventKey, HandshakeEvent};
pub use secure_channel::{ChannelListener, SecureChannel, TransportEndpoint};
pub use session::{AttestationResult, ConnectionAction, ConnectionConfig, Role, SessionContext};
