//! World state for scenario execution.
//!
//! The world owns every actor's connection and listener during a scenario
//! run, tracks message counts, and provides the accessors oracles verify
//! against.

use std::collections::HashMap;
use std::sync::Arc;

use idscp_core::{AttestationResult, Connection};

use crate::listener::QueueListener;

/// All actors and metrics of one scenario run.
#[derive(Default)]
pub struct World {
    consumers: HashMap<String, Connection>,
    providers: HashMap<String, Connection>,
    listeners: HashMap<String, Arc<QueueListener>>,
    messages_sent: HashMap<String, usize>,
    messages_received: HashMap<String, usize>,
}

impl World {
    /// Create an empty world.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer actor.
    pub fn add_consumer(
        &mut self,
        name: String,
        connection: Connection,
        listener: Arc<QueueListener>,
    ) {
        self.listeners.insert(name.clone(), listener);
        self.messages_sent.insert(name.clone(), 0);
        self.messages_received.insert(name.clone(), 0);
        self.consumers.insert(name, connection);
    }

    /// Add a provider actor.
    pub fn add_provider(
        &mut self,
        name: String,
        connection: Connection,
        listener: Arc<QueueListener>,
    ) {
        self.listeners.insert(name.clone(), listener);
        self.messages_sent.insert(name.clone(), 0);
        self.messages_received.insert(name.clone(), 0);
        self.providers.insert(name, connection);
    }

    /// Consumer connection by name.
    #[must_use]
    pub fn consumer(&self, name: &str) -> Option<&Connection> {
        self.consumers.get(name)
    }

    /// Provider connection by name.
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&Connection> {
        self.providers.get(name)
    }

    /// Any actor's connection by name.
    #[must_use]
    pub fn connection(&self, name: &str) -> Option<&Connection> {
        self.consumers.get(name).or_else(|| self.providers.get(name))
    }

    /// Mutable connection by name, for the run loop.
    pub fn connection_mut(&mut self, name: &str) -> Option<&mut Connection> {
        match self.consumers.get_mut(name) {
            Some(connection) => Some(connection),
            None => self.providers.get_mut(name),
        }
    }

    /// The actor's driver listener.
    #[must_use]
    pub fn listener(&self, name: &str) -> Option<&Arc<QueueListener>> {
        self.listeners.get(name)
    }

    /// Record one outbound message for `actor`.
    pub fn record_message_sent(&mut self, actor: &str) {
        *self.messages_sent.entry(actor.to_owned()).or_insert(0) += 1;
    }

    /// Record one inbound message for `actor`.
    pub fn record_message_received(&mut self, actor: &str) {
        *self.messages_received.entry(actor.to_owned()).or_insert(0) += 1;
    }

    /// Messages the actor sent during the run.
    #[must_use]
    pub fn messages_sent(&self, actor: &str) -> usize {
        self.messages_sent.get(actor).copied().unwrap_or(0)
    }

    /// Messages the actor received during the run.
    #[must_use]
    pub fn messages_received(&self, actor: &str) -> usize {
        self.messages_received.get(actor).copied().unwrap_or(0)
    }

    /// Whether every connection reached its terminal state.
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.consumers.values().all(Connection::is_finished)
            && self.providers.values().all(Connection::is_finished)
    }

    /// The actor's recorded attestation verdict.
    #[must_use]
    pub fn verdict(&self, name: &str) -> Option<AttestationResult> {
        self.connection(name).and_then(Connection::verdict)
    }

    /// All actor names, consumers first.
    #[must_use]
    pub fn actor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.consumers.keys().cloned().collect();
        names.extend(self.providers.keys().cloned());
        names
    }
}
