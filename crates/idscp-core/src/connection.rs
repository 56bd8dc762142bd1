//! Per-connection glue around one handshake.
//!
//! A [`Connection`] owns the state machine, the session context, the driver
//! registries, and the running driver handles. Every entry point feeds one
//! event through the machine, executes the staged session actions (starting
//! drivers, delegating payloads), and returns the outbound work the caller
//! must perform on the transport. Time is always passed in; the connection
//! never reads the clock itself.
//!
//! The caller serializes all entry points, typically behind a `Mutex`.
//! Driver threads report through [`FsmListener`], whose implementation
//! re-enters the same lock, so driver callbacks are never concurrent with
//! wire-message handling.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use idscp_proto::payloads::{RatRequestData, RatResponseData};
use idscp_proto::{Message, Payload};
use idscp_rat::{
    ControlMessage, DriverHandle, FsmListener, RatProverRegistry, RatVerifierRegistry,
};

use crate::daps::DapsDriver;
use crate::error::FsmConfigError;
use crate::fsm::Fsm;
use crate::protocol::{
    build_fsm, ControlKey, HandshakeEvent, HandshakeStates, ERR_ATTESTATION, ERR_NO_MECHANISM,
    ERR_TRANSPORT,
};
use crate::session::{
    AttestationResult, ConnectionAction, ConnectionConfig, Role, SessionContext,
};

/// Outbound work the transport driver must perform after an entry point
/// returns.
#[derive(Debug)]
pub enum OutboundAction {
    /// Encode and send this message to the peer.
    SendMessage(Message),
    /// The handshake terminated on an error; tear the transport down.
    Close {
        /// Human-readable teardown reason.
        reason: String,
    },
}

/// One handshake endpoint: state machine, session context, and driver
/// lifecycle management.
pub struct Connection {
    fsm: Fsm<HandshakeEvent, SessionContext>,
    states: HandshakeStates,
    ctx: SessionContext,
    prover_registry: RatProverRegistry,
    verifier_registry: RatVerifierRegistry,
    listener: Option<Arc<dyn FsmListener>>,
    prover: Option<DriverHandle>,
    verifier: Option<DriverHandle>,
    rat_deadline: Option<Instant>,
    finished: bool,
}

impl Connection {
    /// Build a connection in its initial state.
    pub fn new(
        role: Role,
        config: ConnectionConfig,
        daps: Arc<dyn DapsDriver>,
        prover_registry: RatProverRegistry,
        verifier_registry: RatVerifierRegistry,
    ) -> Result<Self, FsmConfigError> {
        let (mut fsm, states) = build_fsm(role)?;
        let mut ctx = SessionContext::new(role, config, daps);
        fsm.set_initial_state(&mut ctx, states.start)?;
        Ok(Self {
            fsm,
            states,
            ctx,
            prover_registry,
            verifier_registry,
            listener: None,
            prover: None,
            verifier: None,
            rat_deadline: None,
            finished: false,
        })
    }

    /// Attach the listener handed to spawned drivers. Must be set before
    /// the handshake starts; a missing listener fails the session as soon
    /// as a driver is needed.
    pub fn set_listener(&mut self, listener: Arc<dyn FsmListener>) {
        self.listener = Some(listener);
    }

    /// Role of this endpoint.
    #[must_use]
    pub fn role(&self) -> Role {
        self.ctx.role()
    }

    /// Recorded attestation verdict, if any.
    #[must_use]
    pub fn verdict(&self) -> Option<AttestationResult> {
        self.ctx.verdict()
    }

    /// Peer's self-description, available once the handshake completed.
    #[must_use]
    pub fn peer_description(&self) -> Option<&str> {
        self.ctx.peer_description()
    }

    /// Whether the handshake has reached its terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Diagnostic name of the current state.
    #[must_use]
    pub fn state_name(&self) -> &str {
        match self.fsm.current_state() {
            Some(state) => self.fsm.state_name(state),
            None => "<uninitialized>",
        }
    }

    /// Kick the handshake off. Only the consumer initiates; on the
    /// provider this is a logged no-op.
    pub fn start(&mut self, now: Instant) -> Vec<OutboundAction> {
        if self.ctx.role() != Role::Consumer {
            tracing::warn!("only the consumer initiates the handshake");
            return Vec::new();
        }
        self.pump(HandshakeEvent::local(Payload::RatStart), now)
    }

    /// Feed one decoded wire message from the peer.
    pub fn handle_message(&mut self, msg: Message, now: Instant) -> Vec<OutboundAction> {
        self.pump(HandshakeEvent::Message(msg), now)
    }

    /// Feed a driver verdict.
    ///
    /// Verdicts from drivers of an earlier session (terminated before a
    /// reset) find no active handle here and are dropped.
    pub fn handle_control(&mut self, msg: ControlMessage, now: Instant) -> Vec<OutboundAction> {
        let relevant = match msg {
            ControlMessage::ProverOk | ControlMessage::ProverFailed => self.prover.is_some(),
            ControlMessage::VerifierOk | ControlMessage::VerifierFailed => {
                self.verifier.is_some()
            },
        };
        if !relevant {
            tracing::debug!(?msg, "stale driver verdict dropped");
            return Vec::new();
        }
        self.rat_deadline = None;
        self.pump(HandshakeEvent::Control(ControlKey::from(msg)), now)
    }

    /// Feed an outbound attestation payload produced by one of our
    /// drivers: the consumer's verifier emits challenges, the provider's
    /// prover emits evidence.
    pub fn handle_driver_message(&mut self, payload: Vec<u8>, now: Instant) -> Vec<OutboundAction> {
        let event = match self.ctx.role() {
            Role::Consumer => HandshakeEvent::local(Payload::RatRequest(RatRequestData {
                mechanisms: self.ctx.config.expected_mechanisms.clone(),
                nonce: payload,
            })),
            Role::Provider => HandshakeEvent::local(Payload::RatResponse(RatResponseData {
                mechanism: self.ctx.active_mechanism.clone().unwrap_or_default(),
                payload,
            })),
        };
        self.pump(event, now)
    }

    /// Expire the attestation deadline, if one is armed and due. The
    /// stalled driver is terminated and its failure routed through the
    /// machine like any other driver failure.
    pub fn tick(&mut self, now: Instant) -> Vec<OutboundAction> {
        if !self.rat_deadline.is_some_and(|deadline| now >= deadline) {
            return Vec::new();
        }
        self.rat_deadline = None;
        tracing::warn!(
            role = self.ctx.role().as_str(),
            state = self.state_name(),
            "attestation round timed out"
        );
        self.shutdown_drivers();
        let key = match self.ctx.role() {
            Role::Consumer => ControlKey::VerifierFailed,
            Role::Provider => ControlKey::ProverFailed,
        };
        self.pump(HandshakeEvent::Control(key), now)
    }

    /// Route a transport-level failure (decode error, channel error or
    /// close) into the error fan-out.
    pub fn handle_transport_error(&mut self, reason: &str, now: Instant) -> Vec<OutboundAction> {
        self.pump(
            HandshakeEvent::local(Payload::Error(idscp_proto::payloads::ErrorData {
                code: ERR_TRANSPORT,
                message: reason.to_owned(),
            })),
            now,
        )
    }

    /// Rewind for a reconnect: terminate any running drivers and return
    /// the machine and session to their initial state.
    pub fn reset(&mut self) -> Result<(), FsmConfigError> {
        self.shutdown_drivers();
        self.rat_deadline = None;
        self.finished = false;
        self.ctx.reset();
        self.fsm.reset(&mut self.ctx)
    }

    fn pump(&mut self, first: HandshakeEvent, now: Instant) -> Vec<OutboundAction> {
        let mut out = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(first);

        while let Some(event) = queue.pop_front() {
            if self.finished {
                tracing::debug!(key = ?crate::fsm::FsmEvent::key(&event), "event after terminal state dropped");
                continue;
            }
            let _ = self.fsm.feed_event(&mut self.ctx, &event);

            // Executing one batch of actions may stage more (a failed
            // driver start fails the session), so drain to a fixed point.
            loop {
                let actions = self.ctx.drain_actions();
                if actions.is_empty() {
                    break;
                }
                for action in actions {
                    match action {
                        ConnectionAction::SendMessage(msg) => {
                            out.push(OutboundAction::SendMessage(msg));
                        },
                        ConnectionAction::StartProver(mechanism) => {
                            self.start_prover(&mechanism, now);
                        },
                        ConnectionAction::StartVerifier(mechanism) => {
                            self.start_verifier(&mechanism, now);
                        },
                        ConnectionAction::DelegateToProver(payload) => {
                            self.delegate_to_prover(payload);
                        },
                        ConnectionAction::DelegateToVerifier(payload) => {
                            self.delegate_to_verifier(payload);
                        },
                        ConnectionAction::Close { reason } => {
                            out.push(OutboundAction::Close { reason });
                        },
                    }
                }
            }

            while let Some(local) = self.ctx.pop_local_event() {
                queue.push_back(local);
            }

            if !self.finished && self.fsm.current_state() == Some(self.states.end) {
                self.finished = true;
                self.rat_deadline = None;
                self.shutdown_drivers();
            }
        }
        out
    }

    fn start_prover(&mut self, mechanism: &str, now: Instant) {
        let Some(listener) = self.listener.clone() else {
            self.ctx.fail_session(ERR_ATTESTATION, "no driver listener attached");
            return;
        };
        match self.prover_registry.start_prover_driver(mechanism, listener) {
            Some(handle) => {
                self.rat_deadline = Some(now + self.ctx.config.rat_timeout);
                self.prover = Some(handle);
            },
            None => {
                self.ctx.fail_session(
                    ERR_NO_MECHANISM,
                    format!("no prover driver registered for {mechanism}"),
                );
            },
        }
    }

    fn start_verifier(&mut self, mechanism: &str, now: Instant) {
        let Some(listener) = self.listener.clone() else {
            self.ctx.fail_session(ERR_ATTESTATION, "no driver listener attached");
            return;
        };
        match self.verifier_registry.start_verifier_driver(mechanism, listener) {
            Some(handle) => {
                self.rat_deadline = Some(now + self.ctx.config.rat_timeout);
                self.verifier = Some(handle);
            },
            None => {
                self.ctx.fail_session(
                    ERR_NO_MECHANISM,
                    format!("no verifier driver registered for {mechanism}"),
                );
            },
        }
    }

    fn delegate_to_prover(&mut self, payload: Vec<u8>) {
        let Some(handle) = &self.prover else {
            self.ctx.fail_session(ERR_ATTESTATION, "no running prover driver");
            return;
        };
        if let Err(err) = handle.delegate(payload) {
            self.ctx.fail_session(ERR_ATTESTATION, format!("prover delegation failed: {err}"));
        }
    }

    fn delegate_to_verifier(&mut self, payload: Vec<u8>) {
        let Some(handle) = &self.verifier else {
            self.ctx.fail_session(ERR_ATTESTATION, "no running verifier driver");
            return;
        };
        if let Err(err) = handle.delegate(payload) {
            self.ctx.fail_session(ERR_ATTESTATION, format!("verifier delegation failed: {err}"));
        }
    }

    fn shutdown_drivers(&mut self) {
        if let Some(handle) = self.prover.take() {
            handle.terminate();
        }
        if let Some(handle) = self.verifier.take() {
            handle.terminate();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown_drivers();
    }
}
