//! Driver registries.
//!
//! A registry maps an attestation mechanism name to a driver factory plus
//! its configuration. Registries are cheap, cloneable values shared by the
//! connections of one endpoint; registration and lookup are safe from any
//! thread and never participate in per-connection event ordering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::driver::{DriverHandle, FsmListener, RatProverDriver, RatVerifierDriver};

/// Configuration injected into every driver instance a registry starts.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Free-form mechanism parameters (device paths, endpoint URLs, ...).
    pub params: HashMap<String, String>,
    /// Bound on any single wait inside the driver's run loop.
    pub timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { params: HashMap::new(), timeout: Duration::from_secs(30) }
    }
}

type ProverFactory = Arc<dyn Fn(&DriverConfig) -> Box<dyn RatProverDriver> + Send + Sync>;
type VerifierFactory = Arc<dyn Fn(&DriverConfig) -> Box<dyn RatVerifierDriver> + Send + Sync>;

struct Entry<F> {
    factory: F,
    config: DriverConfig,
}

/// Registry of attestation prover mechanisms.
#[derive(Clone, Default)]
pub struct RatProverRegistry {
    inner: Arc<RwLock<HashMap<String, Entry<ProverFactory>>>>,
}

impl RatProverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prover factory under a mechanism name, replacing any
    /// previous registration for that name.
    pub fn register<F>(&self, mechanism: &str, config: DriverConfig, factory: F)
    where
        F: Fn(&DriverConfig) -> Box<dyn RatProverDriver> + Send + Sync + 'static,
    {
        self.inner
            .write()
            .insert(mechanism.to_owned(), Entry { factory: Arc::new(factory), config });
    }

    /// Remove a mechanism. Running driver instances are unaffected.
    pub fn unregister(&self, mechanism: &str) {
        self.inner.write().remove(mechanism);
    }

    /// Registered mechanism names.
    #[must_use]
    pub fn mechanisms(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Instantiate, configure, and start a new prover for `mechanism`.
    ///
    /// An unregistered name is an expected runtime condition (the peer may
    /// request a mechanism this endpoint does not carry) and yields `None`
    /// rather than an error.
    pub fn start_prover_driver(
        &self,
        mechanism: &str,
        listener: Arc<dyn FsmListener>,
    ) -> Option<DriverHandle> {
        let driver = {
            let map = self.inner.read();
            let Some(entry) = map.get(mechanism) else {
                tracing::warn!(mechanism, "no prover driver registered");
                return None;
            };
            (entry.factory)(&entry.config)
        };

        spawn_logged(mechanism, "prover", false, listener, move |cx| driver.run(cx))
    }
}

/// Registry of attestation verifier mechanisms.
#[derive(Clone, Default)]
pub struct RatVerifierRegistry {
    inner: Arc<RwLock<HashMap<String, Entry<VerifierFactory>>>>,
}

impl RatVerifierRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a verifier factory under a mechanism name, replacing any
    /// previous registration for that name.
    pub fn register<F>(&self, mechanism: &str, config: DriverConfig, factory: F)
    where
        F: Fn(&DriverConfig) -> Box<dyn RatVerifierDriver> + Send + Sync + 'static,
    {
        self.inner
            .write()
            .insert(mechanism.to_owned(), Entry { factory: Arc::new(factory), config });
    }

    /// Remove a mechanism. Running driver instances are unaffected.
    pub fn unregister(&self, mechanism: &str) {
        self.inner.write().remove(mechanism);
    }

    /// Registered mechanism names.
    #[must_use]
    pub fn mechanisms(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Instantiate, configure, and start a new verifier for `mechanism`.
    ///
    /// Returns `None` for an unregistered name, like
    /// [`RatProverRegistry::start_prover_driver`].
    pub fn start_verifier_driver(
        &self,
        mechanism: &str,
        listener: Arc<dyn FsmListener>,
    ) -> Option<DriverHandle> {
        let driver = {
            let map = self.inner.read();
            let Some(entry) = map.get(mechanism) else {
                tracing::warn!(mechanism, "no verifier driver registered");
                return None;
            };
            (entry.factory)(&entry.config)
        };

        spawn_logged(mechanism, "verifier", true, listener, move |cx| driver.run(cx))
    }
}

fn spawn_logged(
    mechanism: &str,
    role: &str,
    supports_restart: bool,
    listener: Arc<dyn FsmListener>,
    run: impl FnOnce(crate::driver::DriverContext) + Send + 'static,
) -> Option<DriverHandle> {
    match DriverHandle::spawn(mechanism, role, supports_restart, listener, run) {
        Ok(handle) => {
            tracing::debug!(mechanism, role, "started attestation driver");
            Some(handle)
        },
        Err(err) => {
            tracing::warn!(mechanism, role, %err, "failed to spawn driver thread");
            None
        },
    }
}
