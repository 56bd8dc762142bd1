//! Software-only test drivers.
//!
//! The dummy prover/verifier pair exchanges fixed payloads through the
//! regular driver queues, exercising the full attestation plumbing (threads,
//! delegation, verdict delivery) without any hardware behind it.

use crate::driver::{
    ControlMessage, DriverContext, DriverEvent, RatProverDriver, RatVerifierDriver,
};
use crate::registry::{DriverConfig, RatProverRegistry, RatVerifierRegistry};

/// Mechanism name the dummy drivers register under.
pub const MECHANISM: &str = "dummy";

/// Challenge payload the verifier sends each round.
pub const CHALLENGE: &[u8] = b"idscp-dummy-challenge";

/// Response payload the prover answers each round with.
pub const RESPONSE: &[u8] = b"idscp-dummy-response";

const DEFAULT_ROUNDS: usize = 3;

fn rounds_from(config: &DriverConfig) -> usize {
    config
        .params
        .get("rounds")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_ROUNDS)
}

/// Dummy prover: answers every challenge with [`RESPONSE`] and reports
/// success once the configured number of rounds is complete.
pub struct DummyProver {
    rounds: usize,
    timeout: std::time::Duration,
}

impl DummyProver {
    /// Build a prover from its registry configuration.
    #[must_use]
    pub fn new(config: &DriverConfig) -> Self {
        Self { rounds: rounds_from(config), timeout: config.timeout }
    }
}

impl RatProverDriver for DummyProver {
    fn run(self: Box<Self>, cx: DriverContext) {
        let mut answered = 0;
        let mut reported = false;
        loop {
            // Until the verdict is out, a silent verifier is a failure; after
            // that we answer further challenges indefinitely (restarts).
            let event =
                if reported { cx.recv() } else { cx.recv_timeout(self.timeout) };
            match event {
                DriverEvent::Message(challenge) if challenge == CHALLENGE => {
                    cx.send_to_peer(RESPONSE.to_vec());
                    answered += 1;
                    if answered >= self.rounds && !reported {
                        cx.report(ControlMessage::ProverOk);
                        reported = true;
                    }
                },
                DriverEvent::Message(other) => {
                    tracing::warn!(len = other.len(), "dummy prover: unexpected payload");
                    cx.report(ControlMessage::ProverFailed);
                    return;
                },
                DriverEvent::Restart => {
                    answered = 0;
                    reported = false;
                },
                DriverEvent::TimedOut => {
                    cx.report(ControlMessage::ProverFailed);
                    return;
                },
                DriverEvent::Stop => return,
            }
        }
    }
}

/// Dummy verifier: drives the configured number of challenge/response
/// rounds and reports the verdict.
pub struct DummyVerifier {
    rounds: usize,
    timeout: std::time::Duration,
}

impl DummyVerifier {
    /// Build a verifier from its registry configuration.
    #[must_use]
    pub fn new(config: &DriverConfig) -> Self {
        Self { rounds: rounds_from(config), timeout: config.timeout }
    }

    fn one_pass(&self, cx: &DriverContext) -> Option<ControlMessage> {
        for _ in 0..self.rounds {
            cx.send_to_peer(CHALLENGE.to_vec());
            match cx.recv_timeout(self.timeout) {
                DriverEvent::Message(response) if response == RESPONSE => {},
                DriverEvent::Message(_) | DriverEvent::TimedOut => {
                    return Some(ControlMessage::VerifierFailed);
                },
                DriverEvent::Restart => return None,
                DriverEvent::Stop => return Some(ControlMessage::VerifierFailed),
            }
        }
        Some(ControlMessage::VerifierOk)
    }
}

impl RatVerifierDriver for DummyVerifier {
    fn run(self: Box<Self>, cx: DriverContext) {
        loop {
            match self.one_pass(&cx) {
                // Restart requested mid-pass; begin a fresh round.
                None => {},
                Some(ControlMessage::VerifierFailed) => {
                    cx.report(ControlMessage::VerifierFailed);
                    return;
                },
                Some(verdict) => {
                    cx.report(verdict);
                    // Wait for restart or terminate.
                    loop {
                        match cx.recv() {
                            DriverEvent::Restart => break,
                            DriverEvent::Stop => return,
                            DriverEvent::Message(_) | DriverEvent::TimedOut => {},
                        }
                    }
                },
            }
        }
    }
}

/// Register the dummy prover under [`MECHANISM`].
pub fn register_prover(registry: &RatProverRegistry) {
    registry.register(MECHANISM, DriverConfig::default(), |cfg| Box::new(DummyProver::new(cfg)));
}

/// Register the dummy verifier under [`MECHANISM`].
pub fn register_verifier(registry: &RatVerifierRegistry) {
    registry
        .register(MECHANISM, DriverConfig::default(), |cfg| Box::new(DummyVerifier::new(cfg)));
}
