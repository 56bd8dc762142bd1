//! Driver traits, handles, and the listener callback seam.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::RatError;

/// Verdicts a driver reports back to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    /// Prover finished its part of the exchange successfully.
    ProverOk,
    /// Prover could not produce evidence.
    ProverFailed,
    /// Verifier accepted the peer's evidence.
    VerifierOk,
    /// Verifier rejected the peer's evidence.
    VerifierFailed,
}

/// Callback seam between a running driver and its owning session.
///
/// The connection layer implements this and serializes both methods with
/// wire-message delivery, so driver callbacks are never concurrent with
/// state machine event processing.
pub trait FsmListener: Send + Sync {
    /// Deliver a driver verdict.
    fn on_control_message(&self, msg: ControlMessage);

    /// Deliver an outbound attestation payload destined for the peer.
    fn on_driver_message(&self, payload: Vec<u8>);
}

/// Input queued into a running driver.
#[derive(Debug)]
enum DriverInput {
    Message(Vec<u8>),
    Restart,
    Terminate,
}

/// What a driver's run loop observes when it polls its input queue.
#[derive(Debug, PartialEq, Eq)]
pub enum DriverEvent {
    /// An attestation-protocol message delegated from the session.
    Message(Vec<u8>),
    /// Request to begin a fresh attestation round (verifiers only).
    Restart,
    /// Cooperative shutdown; the run loop must return promptly.
    Stop,
    /// No input arrived within the requested wait.
    TimedOut,
}

/// Context handed to a driver's run loop: its input queue plus the listener
/// used to report results.
pub struct DriverContext {
    input: mpsc::Receiver<DriverInput>,
    listener: Arc<dyn FsmListener>,
    terminated: Arc<AtomicBool>,
}

impl DriverContext {
    /// Block until the next input arrives.
    ///
    /// Termination (explicit or because the handle was dropped) surfaces as
    /// [`DriverEvent::Stop`]; run loops treat it as the exit signal.
    pub fn recv(&self) -> DriverEvent {
        match self.input.recv() {
            Ok(DriverInput::Message(payload)) => DriverEvent::Message(payload),
            Ok(DriverInput::Restart) => DriverEvent::Restart,
            Ok(DriverInput::Terminate) | Err(mpsc::RecvError) => DriverEvent::Stop,
        }
    }

    /// Block until the next input arrives or `timeout` elapses.
    pub fn recv_timeout(&self, timeout: Duration) -> DriverEvent {
        match self.input.recv_timeout(timeout) {
            Ok(DriverInput::Message(payload)) => DriverEvent::Message(payload),
            Ok(DriverInput::Restart) => DriverEvent::Restart,
            Ok(DriverInput::Terminate) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                DriverEvent::Stop
            },
            Err(mpsc::RecvTimeoutError::Timeout) => DriverEvent::TimedOut,
        }
    }

    /// Report a verdict to the session.
    ///
    /// Dropped silently once the handle has been terminated. The flag check
    /// is best-effort: a report racing a concurrent `terminate()` can still
    /// reach the listener, and the connection layer discards verdicts from
    /// drivers it no longer tracks.
    pub fn report(&self, msg: ControlMessage) {
        if self.terminated.load(Ordering::Acquire) {
            tracing::debug!(?msg, "dropping control message after terminate");
            return;
        }
        self.listener.on_control_message(msg);
    }

    /// Hand an outbound attestation payload to the session for delivery to
    /// the peer. Dropped silently after terminate, like [`Self::report`].
    pub fn send_to_peer(&self, payload: Vec<u8>) {
        if self.terminated.load(Ordering::Acquire) {
            tracing::debug!(len = payload.len(), "dropping driver message after terminate");
            return;
        }
        self.listener.on_driver_message(payload);
    }
}

/// An attestation prover: produces evidence of local platform integrity.
///
/// `run` executes on a dedicated thread and must poll
/// [`DriverContext::recv`] (or the timeout variant) so that termination can
/// interrupt any wait.
pub trait RatProverDriver: Send + 'static {
    /// Drive the prover side of one attestation exchange.
    fn run(self: Box<Self>, cx: DriverContext);
}

/// An attestation verifier: challenges the peer and checks its evidence.
pub trait RatVerifierDriver: Send + 'static {
    /// Drive the verifier side of one attestation exchange.
    fn run(self: Box<Self>, cx: DriverContext);
}

/// Handle to a running driver thread, owned by the session that started it.
pub struct DriverHandle {
    input: mpsc::Sender<DriverInput>,
    terminated: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
    mechanism: String,
    supports_restart: bool,
}

impl DriverHandle {
    pub(crate) fn spawn(
        mechanism: &str,
        role: &str,
        supports_restart: bool,
        listener: Arc<dyn FsmListener>,
        run: impl FnOnce(DriverContext) + Send + 'static,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let terminated = Arc::new(AtomicBool::new(false));
        let cx = DriverContext { input: rx, listener, terminated: Arc::clone(&terminated) };

        let join = thread::Builder::new()
            .name(format!("rat-{role}-{mechanism}"))
            .spawn(move || run(cx))?;

        Ok(Self {
            input: tx,
            terminated,
            join: Some(join),
            mechanism: mechanism.to_owned(),
            supports_restart,
        })
    }

    /// Mechanism name this driver was started for.
    #[must_use]
    pub fn mechanism(&self) -> &str {
        &self.mechanism
    }

    /// Queue an attestation-protocol message into the driver.
    pub fn delegate(&self, payload: Vec<u8>) -> Result<(), RatError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(RatError::Terminated);
        }
        self.input
            .send(DriverInput::Message(payload))
            .map_err(|_| RatError::ChannelClosed)
    }

    /// Request a fresh attestation round. Verifier drivers only.
    pub fn restart(&self) -> Result<(), RatError> {
        if !self.supports_restart {
            return Err(RatError::RestartUnsupported);
        }
        if self.terminated.load(Ordering::Acquire) {
            return Err(RatError::Terminated);
        }
        self.input.send(DriverInput::Restart).map_err(|_| RatError::ChannelClosed)
    }

    /// Request cooperative shutdown. Idempotent.
    ///
    /// Safe to call while the driver thread is blocked on its queue: the
    /// control message wakes the wait. After this returns, no further
    /// callbacks from this driver are accepted by the session; one already
    /// in flight may still reach the listener, and the connection layer
    /// drops verdicts from drivers it no longer tracks.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(mechanism = %self.mechanism, "terminating driver");
        // The thread may already be gone; that is fine.
        let _ = self.input.send(DriverInput::Terminate);
    }

    /// Whether the driver thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(thread::JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the driver thread to exit.
    ///
    /// Returns `true` if the thread exited within the bound.
    pub fn join(mut self, timeout: Duration) -> bool {
        let Some(join) = self.join.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !join.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        join.join().is_ok()
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle")
            .field("mechanism", &self.mechanism)
            .field("terminated", &self.terminated.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
