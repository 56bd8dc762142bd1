//! In-memory transport pair for threaded channel tests.
//!
//! Frames sent on one endpoint are queued and forwarded to the peer's
//! [`SecureChannel::on_message`] by a dedicated pump thread, never on the
//! sender's thread. That matches a real transport's decoupling and avoids
//! re-entering the sender's connection lock while it is still held.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use idscp_core::{SecureChannel, TransportEndpoint};

/// Sending half of one loopback direction.
pub struct LoopbackEndpoint {
    tx: mpsc::Sender<Vec<u8>>,
}

impl LoopbackEndpoint {
    /// Create an endpoint and the receiver its frames arrive on.
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    /// Forward each frame from `rx` into `target` until the sending side
    /// is dropped.
    pub fn pump(rx: mpsc::Receiver<Vec<u8>>, target: Arc<SecureChannel>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            while let Ok(frame) = rx.recv() {
                target.on_message(&frame);
            }
        })
    }
}

impl TransportEndpoint for LoopbackEndpoint {
    fn send(&self, data: &[u8]) -> bool {
        self.tx.send(data.to_vec()).is_ok()
    }
}

/// Build two channels wired back to back, pump threads running.
#[must_use]
pub fn channel_pair() -> (Arc<SecureChannel>, Arc<SecureChannel>) {
    let (endpoint_a, rx_a) = LoopbackEndpoint::new();
    let (endpoint_b, rx_b) = LoopbackEndpoint::new();
    let channel_a = Arc::new(SecureChannel::new(Arc::new(endpoint_a)));
    let channel_b = Arc::new(SecureChannel::new(Arc::new(endpoint_b)));
    // Frames sent by a arrive at b and vice versa. The pump threads exit
    // when the channels (and with them the endpoints) are dropped.
    LoopbackEndpoint::pump(rx_a, Arc::clone(&channel_b));
    LoopbackEndpoint::pump(rx_b, Arc::clone(&channel_a));
    (channel_a, channel_b)
}
