//! Transport adapter with the attach-ordering gate.
//!
//! The underlying secure transport (TLS, WebSocket, in-memory pair) lives
//! behind [`TransportEndpoint`]; this module adapts its inbound callbacks
//! onto one [`Connection`]. Transports deliver data as soon as they are up,
//! which can be before the connection object exists, so every inbound
//! callback blocks on a one-shot gate until [`SecureChannel::attach`] has
//! fired. Nothing is dropped and nothing is reordered; early messages
//! simply wait.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

use idscp_proto::Message;
use idscp_rat::{ControlMessage, FsmListener};

use crate::connection::{Connection, OutboundAction};

/// Consumed outbound transport boundary.
///
/// Implementations are expected to be cheap to call from multiple threads;
/// failures are reported through the return value, never panicked.
pub trait TransportEndpoint: Send + Sync {
    /// Send one encoded frame. Returns `false` if the transport is down.
    fn send(&self, data: &[u8]) -> bool;
}

/// Inbound/outbound adapter between one transport and one [`Connection`].
pub struct SecureChannel {
    endpoint: Arc<dyn TransportEndpoint>,
    gate: Mutex<Option<Arc<Mutex<Connection>>>>,
    attached: Condvar,
}

impl SecureChannel {
    /// Wrap a transport endpoint. The channel is unusable for inbound
    /// traffic until a connection is attached.
    #[must_use]
    pub fn new(endpoint: Arc<dyn TransportEndpoint>) -> Self {
        Self { endpoint, gate: Mutex::new(None), attached: Condvar::new() }
    }

    /// Attach the connection and release any callbacks blocked on the
    /// gate. Effective exactly once; a second attach is logged and ignored.
    pub fn attach(&self, connection: Arc<Mutex<Connection>>) {
        let mut slot = self.gate.lock();
        if slot.is_some() {
            tracing::warn!("connection already attached to this channel");
            return;
        }
        *slot = Some(connection);
        self.attached.notify_all();
    }

    /// Send one encoded frame to the peer.
    pub fn send(&self, data: &[u8]) -> bool {
        self.endpoint.send(data)
    }

    /// Inbound frame from the transport. Blocks until a connection is
    /// attached, then decodes and feeds it through the machine.
    pub fn on_message(&self, data: &[u8]) {
        let connection = self.connection();
        let now = Instant::now();
        let actions = match Message::decode(data) {
            Ok(msg) => connection.lock().handle_message(msg, now),
            Err(err) => {
                tracing::warn!(%err, "inbound frame decoding failed");
                connection.lock().handle_transport_error(&format!("decode error: {err}"), now)
            },
        };
        self.dispatch(actions);
    }

    /// Transport-level error. Routes into the handshake's error fan-out.
    pub fn on_error(&self, reason: &str) {
        let connection = self.connection();
        let actions = connection.lock().handle_transport_error(reason, Instant::now());
        self.dispatch(actions);
    }

    /// Transport closed underneath us.
    pub fn on_close(&self) {
        self.on_error("transport closed");
    }

    /// Execute the outbound side of a batch of connection actions.
    pub fn dispatch(&self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::SendMessage(msg) => match msg.encode() {
                    Ok(bytes) => {
                        if !self.endpoint.send(&bytes) {
                            tracing::warn!(
                                msg_type = ?msg.message_type(),
                                "transport rejected outbound frame"
                            );
                        }
                    },
                    Err(err) => {
                        tracing::warn!(%err, "outbound frame encoding failed");
                    },
                },
                OutboundAction::Close { reason } => {
                    tracing::info!(%reason, "handshake channel closing");
                },
            }
        }
    }

    /// Block until the connection is attached, then hand out a reference.
    fn connection(&self) -> Arc<Mutex<Connection>> {
        let mut slot = self.gate.lock();
        loop {
            if let Some(connection) = slot.as_ref() {
                return Arc::clone(connection);
            }
            self.attached.wait(&mut slot);
        }
    }
}

/// Driver callback seam that re-enters the channel's connection.
///
/// Spawned drivers hold this listener; their verdicts and outbound payloads
/// take the same lock as wire messages, which is what serializes everything
/// the state machine sees.
pub struct ChannelListener {
    channel: Arc<SecureChannel>,
}

impl ChannelListener {
    /// Listener for drivers belonging to `channel`'s connection.
    #[must_use]
    pub fn new(channel: Arc<SecureChannel>) -> Self {
        Self { channel }
    }
}

impl FsmListener for ChannelListener {
    fn on_control_message(&self, msg: ControlMessage) {
        let connection = self.channel.connection();
        let actions = connection.lock().handle_control(msg, Instant::now());
        self.channel.dispatch(actions);
    }

    fn on_driver_message(&self, payload: Vec<u8>) {
        let connection = self.channel.connection();
        let actions = connection.lock().handle_driver_message(payload, Instant::now());
        self.channel.dispatch(actions);
    }
}
