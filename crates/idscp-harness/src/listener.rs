//! Polled driver listener for single-threaded scenario execution.

use std::collections::VecDeque;

use parking_lot::Mutex;

use idscp_rat::{ControlMessage, FsmListener};

/// One queued driver callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// A driver verdict.
    Control(ControlMessage),
    /// An outbound attestation payload for the peer.
    Message(Vec<u8>),
}

/// Listener that queues driver callbacks for the scenario loop to poll,
/// instead of re-entering the connection from the driver thread.
#[derive(Default)]
pub struct QueueListener {
    events: Mutex<VecDeque<ListenerEvent>>,
}

impl QueueListener {
    /// Create an empty listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all queued events, oldest first.
    pub fn drain(&self) -> Vec<ListenerEvent> {
        self.events.lock().drain(..).collect()
    }
}

impl FsmListener for QueueListener {
    fn on_control_message(&self, msg: ControlMessage) {
        self.events.lock().push_back(ListenerEvent::Control(msg));
    }

    fn on_driver_message(&self, payload: Vec<u8>) {
        self.events.lock().push_back(ListenerEvent::Message(payload));
    }
}
