//! Scenario builder API.
//!
//! Declarative construction of one consumer/provider exchange with a
//! mandatory oracle: `Scenario::new(..)` has no `run` method, only the
//! value returned by `.oracle(..)` does.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use idscp_core::{
    Connection, ConnectionConfig, DapsDriver, OutboundAction, Role, StaticDaps,
};
use idscp_rat::{dummy, RatProverRegistry, RatVerifierRegistry};

use crate::listener::{ListenerEvent, QueueListener};
use crate::scenario::{OracleFn, World};

/// Wall-clock bound on one scenario run; driver threads are real threads,
/// so a wedged exchange must fail the test instead of hanging it.
const RUN_DEADLINE: Duration = Duration::from_secs(5);

/// Scenario under construction.
pub struct Scenario {
    name: String,
    consumers: Vec<(String, ConnectionConfig)>,
    providers: Vec<(String, ConnectionConfig)>,
    prover_registry: Option<RatProverRegistry>,
    verifier_registry: Option<RatVerifierRegistry>,
    daps: Option<Arc<dyn DapsDriver>>,
}

impl Scenario {
    /// Create a new scenario with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consumers: Vec::new(),
            providers: Vec::new(),
            prover_registry: None,
            verifier_registry: None,
            daps: None,
        }
    }

    /// Add a consumer actor with default configuration.
    #[must_use]
    pub fn consumer(self, name: impl Into<String>) -> Self {
        self.consumer_with_config(name, ConnectionConfig::default())
    }

    /// Add a consumer actor with custom configuration.
    #[must_use]
    pub fn consumer_with_config(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.consumers.push((name.into(), config));
        self
    }

    /// Add a provider actor with default configuration.
    #[must_use]
    pub fn provider(self, name: impl Into<String>) -> Self {
        self.provider_with_config(name, ConnectionConfig::default())
    }

    /// Add a provider actor with custom configuration.
    #[must_use]
    pub fn provider_with_config(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.providers.push((name.into(), config));
        self
    }

    /// Use these driver registries for every actor instead of the default
    /// dummy-only registries.
    #[must_use]
    pub fn with_registries(
        mut self,
        provers: RatProverRegistry,
        verifiers: RatVerifierRegistry,
    ) -> Self {
        self.prover_registry = Some(provers);
        self.verifier_registry = Some(verifiers);
        self
    }

    /// Use this DAPS driver for every actor instead of the accepting
    /// static one.
    #[must_use]
    pub fn with_daps(mut self, daps: Arc<dyn DapsDriver>) -> Self {
        self.daps = Some(daps);
        self
    }

    /// Set the oracle and return a runnable scenario. The oracle is
    /// mandatory; a scenario without one cannot be executed.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }
}

/// A scenario with its oracle attached.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

impl RunnableScenario {
    /// Execute the exchange and verify the final world with the oracle.
    ///
    /// The consumer starts the handshake; the loop then routes outbound
    /// messages between the two connections and feeds queued driver
    /// callbacks back in, until both connections reach their terminal
    /// state or the run deadline expires.
    pub fn run(self) -> Result<(), String> {
        let name = self.scenario.name;
        if self.scenario.consumers.len() != 1 || self.scenario.providers.len() != 1 {
            return Err(format!(
                "Scenario '{}': exactly one consumer and one provider are supported (got {} and {})",
                name,
                self.scenario.consumers.len(),
                self.scenario.providers.len()
            ));
        }

        let provers = self.scenario.prover_registry.unwrap_or_else(|| {
            let registry = RatProverRegistry::new();
            dummy::register_prover(&registry);
            registry
        });
        let verifiers = self.scenario.verifier_registry.unwrap_or_else(|| {
            let registry = RatVerifierRegistry::new();
            dummy::register_verifier(&registry);
            registry
        });
        let daps: Arc<dyn DapsDriver> =
            self.scenario.daps.unwrap_or_else(|| Arc::new(StaticDaps::accepting()));

        let mut world = World::new();
        let mut consumer_name = String::new();
        for (actor, config) in self.scenario.consumers {
            let listener = Arc::new(QueueListener::new());
            let mut connection = Connection::new(
                Role::Consumer,
                config,
                Arc::clone(&daps),
                provers.clone(),
                verifiers.clone(),
            )
            .map_err(|e| format!("Scenario '{name}': consumer {actor}: {e}"))?;
            connection.set_listener(listener.clone());
            consumer_name.clone_from(&actor);
            world.add_consumer(actor, connection, listener);
        }
        let mut provider_name = String::new();
        for (actor, config) in self.scenario.providers {
            let listener = Arc::new(QueueListener::new());
            let mut connection = Connection::new(
                Role::Provider,
                config,
                Arc::clone(&daps),
                provers.clone(),
                verifiers.clone(),
            )
            .map_err(|e| format!("Scenario '{name}': provider {actor}: {e}"))?;
            connection.set_listener(listener.clone());
            provider_name.clone_from(&actor);
            world.add_provider(actor, connection, listener);
        }

        let mut pending: VecDeque<(String, OutboundAction)> = VecDeque::new();
        {
            let consumer = world
                .connection_mut(&consumer_name)
                .ok_or_else(|| format!("Scenario '{name}': consumer {consumer_name} not found"))?;
            for action in consumer.start(Instant::now()) {
                pending.push_back((consumer_name.clone(), action));
            }
        }

        let deadline = Instant::now() + RUN_DEADLINE;
        loop {
            let mut progress = false;

            while let Some((from, action)) = pending.pop_front() {
                progress = true;
                match action {
                    OutboundAction::SendMessage(msg) => {
                        let to = if from == consumer_name {
                            provider_name.clone()
                        } else {
                            consumer_name.clone()
                        };
                        world.record_message_sent(&from);
                        world.record_message_received(&to);
                        let connection = world
                            .connection_mut(&to)
                            .ok_or_else(|| format!("Scenario '{name}': actor {to} not found"))?;
                        for action in connection.handle_message(msg, Instant::now()) {
                            pending.push_back((to.clone(), action));
                        }
                    },
                    OutboundAction::Close { reason } => {
                        tracing::debug!(actor = %from, %reason, "transport close requested");
                    },
                }
            }

            for actor in [consumer_name.clone(), provider_name.clone()] {
                let events =
                    world.listener(&actor).map(|listener| listener.drain()).unwrap_or_default();
                for event in events {
                    progress = true;
                    let connection = world
                        .connection_mut(&actor)
                        .ok_or_else(|| format!("Scenario '{name}': actor {actor} not found"))?;
                    let actions = match event {
                        ListenerEvent::Control(msg) => {
                            connection.handle_control(msg, Instant::now())
                        },
                        ListenerEvent::Message(payload) => {
                            connection.handle_driver_message(payload, Instant::now())
                        },
                    };
                    for action in actions {
                        pending.push_back((actor.clone(), action));
                    }
                }
            }

            if pending.is_empty() && world.all_completed() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "Scenario '{name}': run deadline expired (consumer in {}, provider in {})",
                    world
                        .connection(&consumer_name)
                        .map_or("<missing>", Connection::state_name),
                    world
                        .connection(&provider_name)
                        .map_or("<missing>", Connection::state_name),
                ));
            }
            if !progress {
                thread::sleep(Duration::from_millis(1));
            }
        }

        (self.oracle)(&world)
    }
}
