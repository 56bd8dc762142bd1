//! Per-connection session state.
//!
//! The session context is the mutable state the protocol graph's actions
//! operate on: the attestation verdict, metadata counters, and the queues
//! of declarative actions and locally generated follow-up events. It
//! performs no I/O itself.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use idscp_proto::payloads::ErrorData;
use idscp_proto::{Message, Payload};

use crate::daps::{DapsDriver, SecurityRequirements};
use crate::protocol::HandshakeEvent;

/// Handshake role of this endpoint.
///
/// The consumer initiates and verifies the peer's attestation; the provider
/// answers and proves. The two state graphs are symmetric mirror images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiating side; attestation verifier of the peer.
    Consumer,
    /// Accepting side; attestation prover.
    Provider,
}

impl Role {
    /// Lowercase name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consumer => "consumer",
            Self::Provider => "provider",
        }
    }
}

/// Final attestation outcome of one session. Set exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationResult {
    /// The peer's platform integrity was verified.
    Success,
    /// Attestation or token verification failed.
    Failed,
    /// No attestation was performed in this session.
    Skipped,
}

/// Static configuration of one handshake endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Mechanisms this endpoint can prove with, in preference order.
    pub supported_mechanisms: Vec<String>,
    /// Mechanisms this endpoint accepts from a peer, in preference order.
    /// Empty list disables attestation (the verdict becomes `Skipped`).
    pub expected_mechanisms: Vec<String>,
    /// Bound on one attestation round before it is failed.
    pub rat_timeout: Duration,
    /// Requirements the peer's DAT must satisfy.
    pub requirements: SecurityRequirements,
    /// Self-description document announced in the metadata exchange.
    pub self_description: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            supported_mechanisms: vec!["dummy".to_owned()],
            expected_mechanisms: vec!["dummy".to_owned()],
            rat_timeout: Duration::from_secs(30),
            requirements: SecurityRequirements::default(),
            self_description: String::new(),
        }
    }
}

/// Declarative work a transition action requests from the connection layer.
#[derive(Debug)]
pub enum ConnectionAction {
    /// Send this message to the peer.
    SendMessage(Message),
    /// Start the prover driver for this mechanism.
    StartProver(String),
    /// Start the verifier driver for this mechanism.
    StartVerifier(String),
    /// Queue an attestation payload into the running prover.
    DelegateToProver(Vec<u8>),
    /// Queue an attestation payload into the running verifier.
    DelegateToVerifier(Vec<u8>),
    /// Tear the transport down after the handshake terminates on an error.
    Close {
        /// Human-readable teardown reason for logs and the transport layer.
        reason: String,
    },
}

/// Mutable state of one handshake session.
pub struct SessionContext {
    role: Role,
    /// Endpoint configuration, read by graph actions.
    pub config: ConnectionConfig,
    daps: Arc<dyn DapsDriver>,
    verdict: Option<AttestationResult>,
    /// Mechanism the attestation exchange settled on.
    pub active_mechanism: Option<String>,
    peer_description: Option<String>,
    expected_counter: u64,
    next_message_id: u64,
    actions: Vec<ConnectionAction>,
    local_events: VecDeque<HandshakeEvent>,
}

impl SessionContext {
    /// Build a fresh session.
    #[must_use]
    pub fn new(role: Role, config: ConnectionConfig, daps: Arc<dyn DapsDriver>) -> Self {
        Self {
            role,
            config,
            daps,
            verdict: None,
            active_mechanism: None,
            peer_description: None,
            expected_counter: 1,
            next_message_id: 1,
            actions: Vec::new(),
            local_events: VecDeque::new(),
        }
    }

    /// Role of this endpoint.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The token service boundary.
    #[must_use]
    pub fn daps(&self) -> &dyn DapsDriver {
        self.daps.as_ref()
    }

    /// Recorded attestation verdict, if any.
    #[must_use]
    pub fn verdict(&self) -> Option<AttestationResult> {
        self.verdict
    }

    /// Record the verdict if none is set yet. The first write wins; later
    /// attempts are ignored and return `false`.
    pub fn record_verdict(&mut self, result: AttestationResult) -> bool {
        if self.verdict.is_some() {
            return false;
        }
        tracing::info!(role = self.role.as_str(), ?result, "attestation verdict recorded");
        self.verdict = Some(result);
        true
    }

    /// Peer's self-description, once the metadata exchange has completed.
    #[must_use]
    pub fn peer_description(&self) -> Option<&str> {
        self.peer_description.as_deref()
    }

    /// Store the peer's self-description document.
    pub fn set_peer_description(&mut self, description: String) {
        self.peer_description = Some(description);
    }

    /// Metadata counter value expected on the next inbound meta message.
    #[must_use]
    pub fn expected_counter(&self) -> u64 {
        self.expected_counter
    }

    /// Update the expected metadata counter.
    pub fn set_expected_counter(&mut self, value: u64) {
        self.expected_counter = value;
    }

    /// Queue an outbound message, assigning the next message id.
    pub fn push_send(&mut self, payload: Payload) {
        let id = self.next_message_id;
        self.next_message_id += 1;
        self.actions.push(ConnectionAction::SendMessage(Message::new(id, payload)));
    }

    /// Queue a non-send action for the connection layer.
    pub fn push_action(&mut self, action: ConnectionAction) {
        self.actions.push(action);
    }

    /// Enqueue a locally generated follow-up event. The connection layer
    /// feeds these through the machine after the current event, in order.
    pub fn enqueue_local(&mut self, event: HandshakeEvent) {
        self.local_events.push_back(event);
    }

    /// Reply with a protocol error message, without failing the session.
    /// Used for recoverable peer desynchronization (counter mismatch).
    pub fn reply_error(&mut self, code: u32, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(role = self.role.as_str(), code, %message, "sending protocol error");
        self.push_send(Payload::Error(ErrorData { code, message }));
    }

    /// Fail the session: notify the peer and route the local machine into
    /// the error fan-out, which terminates the handshake at `End`.
    pub fn fail_session(&mut self, code: u32, message: impl Into<String>) {
        let message = message.into();
        self.push_send(Payload::Error(ErrorData { code, message: message.clone() }));
        self.enqueue_local(HandshakeEvent::Message(Message::new(
            0,
            Payload::Error(ErrorData { code, message }),
        )));
    }

    /// Drain the accumulated actions.
    pub fn drain_actions(&mut self) -> Vec<ConnectionAction> {
        std::mem::take(&mut self.actions)
    }

    /// Pop the next locally generated event, if any.
    pub fn pop_local_event(&mut self) -> Option<HandshakeEvent> {
        self.local_events.pop_front()
    }

    /// Rewind the session for reuse after a reconnect.
    pub fn reset(&mut self) {
        self.verdict = None;
        self.active_mechanism = None;
        self.peer_description = None;
        self.expected_counter = 1;
        self.next_message_id = 1;
        self.actions.clear();
        self.local_events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daps::StaticDaps;

    fn ctx() -> SessionContext {
        SessionContext::new(
            Role::Consumer,
            ConnectionConfig::default(),
            Arc::new(StaticDaps::accepting()),
        )
    }

    #[test]
    fn verdict_is_write_once() {
        let mut ctx = ctx();
        assert!(ctx.record_verdict(AttestationResult::Success));
        assert!(!ctx.record_verdict(AttestationResult::Failed));
        assert_eq!(ctx.verdict(), Some(AttestationResult::Success));
    }

    #[test]
    fn message_ids_increase() {
        let mut ctx = ctx();
        ctx.push_send(Payload::RatStart);
        ctx.push_send(Payload::RatLeave);
        let actions = ctx.drain_actions();
        let ids: Vec<u64> = actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::SendMessage(m) => Some(m.id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn fail_session_notifies_peer_and_self() {
        let mut ctx = ctx();
        ctx.fail_session(1, "boom");
        let actions = ctx.drain_actions();
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], ConnectionAction::SendMessage(m) if matches!(m.payload, Payload::Error(_))));
        assert!(ctx.pop_local_event().is_some());
    }

    #[test]
    fn reset_clears_session_state() {
        let mut ctx = ctx();
        ctx.record_verdict(AttestationResult::Failed);
        ctx.push_send(Payload::RatStart);
        ctx.set_peer_description("peer".to_owned());
        ctx.reset();
        assert_eq!(ctx.verdict(), None);
        assert!(ctx.drain_actions().is_empty());
        assert_eq!(ctx.peer_description(), None);
    }
}
