//! Generic table-driven state machine engine.
//!
//! The engine knows nothing about the handshake protocol: states are
//! registered dynamically and transitions are looked up by `(current state,
//! event key)`. Duplicate registration is a construction-time error, while
//! an event with no transition at runtime is logged and ignored - protocol
//! robustness against duplicate or late messages from an already-advanced
//! peer.
//!
//! A machine instance is deterministic and single-threaded: `feed_event`
//! must never be called concurrently, and the owning connection is
//! responsible for serializing delivery. The transition table itself is
//! immutable once built, so read-only inspection (`to_dot`) is safe from
//! anywhere.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::error::FsmConfigError;

/// An event the machine can consume. The key is the discriminator used for
/// transition lookup; the event itself is handed to the transition action.
pub trait FsmEvent {
    /// Transition lookup discriminator, typically the message type.
    type Key: Copy + Eq + std::hash::Hash + std::fmt::Debug + Send;

    /// The key of this event.
    fn key(&self) -> Self::Key;
}

/// Stable per-machine state identity.
///
/// Ordinals are assigned at registration time and never change for the
/// lifetime of the machine; comparison is by ordinal, never by description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(usize);

impl StateId {
    /// The registration ordinal.
    #[must_use]
    pub fn ordinal(self) -> usize {
        self.0
    }
}

/// A registered state: ordinal identity plus diagnostic naming.
#[derive(Debug, Clone)]
pub struct ProtocolState {
    ordinal: usize,
    id: String,
    description: String,
}

impl ProtocolState {
    /// Short identifier, unique within the machine.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable description for logs and diagnostics.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Registration ordinal.
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

/// A committed state change, handed to success-change listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// State the machine left.
    pub from: StateId,
    /// State the machine committed to.
    pub to: StateId,
}

/// Outcome of feeding one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// A transition matched, its action succeeded, and the state changed.
    Transitioned(StateId),
    /// No transition is registered for (current state, event key); the
    /// event was ignored and the state is unchanged.
    Rejected,
    /// A transition matched but its action reported failure; the state is
    /// unchanged.
    ActionFailed,
}

/// Transition action: performs protocol work and reports success. Success
/// commits the state change; failure leaves the machine where it was.
pub type Action<E, C> = Box<dyn FnMut(&E, &mut C) -> bool + Send>;

/// State entry/exit/always hook.
pub type Hook<C> = Box<dyn FnMut(&mut C) + Send>;

/// Listener invoked after every committed state change.
pub type ChangeListener<E> = Box<dyn FnMut(StateChange, &E) + Send>;

struct StateNode<C> {
    state: ProtocolState,
    on_entry: Option<Hook<C>>,
    on_exit: Option<Hook<C>>,
    on_always: Vec<Hook<C>>,
}

struct TransitionEntry<E, C> {
    to: StateId,
    action: Action<E, C>,
}

/// A generic finite state machine over events `E` and a caller-owned
/// context `C` that actions and hooks may mutate.
pub struct Fsm<E: FsmEvent, C> {
    states: Vec<StateNode<C>>,
    transitions: HashMap<(StateId, E::Key), TransitionEntry<E, C>>,
    listeners: Vec<ChangeListener<E>>,
    initial: Option<StateId>,
    current: Option<StateId>,
}

impl<E: FsmEvent, C> Default for Fsm<E, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: FsmEvent, C> Fsm<E, C> {
    /// Create an empty machine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            transitions: HashMap::new(),
            listeners: Vec::new(),
            initial: None,
            current: None,
        }
    }

    /// Register a state. Ids must be unique within the machine.
    pub fn add_state(
        &mut self,
        id: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<StateId, FsmConfigError> {
        let id = id.into();
        if self.states.iter().any(|node| node.state.id == id) {
            return Err(FsmConfigError::DuplicateState(id));
        }
        let ordinal = self.states.len();
        self.states.push(StateNode {
            state: ProtocolState { ordinal, id, description: description.into() },
            on_entry: None,
            on_exit: None,
            on_always: Vec::new(),
        });
        Ok(StateId(ordinal))
    }

    /// Look up a registered state.
    #[must_use]
    pub fn state(&self, id: StateId) -> Option<&ProtocolState> {
        self.states.get(id.0).map(|node| &node.state)
    }

    /// Diagnostic name for a state id.
    #[must_use]
    pub fn state_name(&self, id: StateId) -> &str {
        self.states.get(id.0).map_or("<unknown>", |node| node.state.id.as_str())
    }

    /// Register a transition. At most one transition may exist per
    /// `(state, event key)` pair; a second registration is a configuration
    /// error.
    pub fn add_transition(
        &mut self,
        from: StateId,
        key: E::Key,
        to: StateId,
        action: Action<E, C>,
    ) -> Result<(), FsmConfigError> {
        if self.states.get(from.0).is_none() {
            return Err(FsmConfigError::UnknownState(from.0));
        }
        if self.states.get(to.0).is_none() {
            return Err(FsmConfigError::UnknownState(to.0));
        }
        match self.transitions.entry((from, key)) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(FsmConfigError::DuplicateTransition {
                    state: self.state_name(from).to_owned(),
                    key: format!("{key:?}"),
                })
            },
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(TransitionEntry { to, action });
                Ok(())
            },
        }
    }

    /// Set the state's entry hook, replacing any previous one.
    pub fn on_entry(&mut self, state: StateId, hook: Hook<C>) -> Result<(), FsmConfigError> {
        let node = self.states.get_mut(state.0).ok_or(FsmConfigError::UnknownState(state.0))?;
        node.on_entry = Some(hook);
        Ok(())
    }

    /// Set the state's exit hook, replacing any previous one.
    pub fn on_exit(&mut self, state: StateId, hook: Hook<C>) -> Result<(), FsmConfigError> {
        let node = self.states.get_mut(state.0).ok_or(FsmConfigError::UnknownState(state.0))?;
        node.on_exit = Some(hook);
        Ok(())
    }

    /// Add an "always" hook: runs after every `feed_event` while the state
    /// is active, regardless of outcome.
    pub fn on_always(&mut self, state: StateId, hook: Hook<C>) -> Result<(), FsmConfigError> {
        let node = self.states.get_mut(state.0).ok_or(FsmConfigError::UnknownState(state.0))?;
        node.on_always.push(hook);
        Ok(())
    }

    /// Add a listener invoked after every committed state change. For
    /// auditing and logging only, never for protocol logic.
    pub fn add_success_change_listener(&mut self, listener: ChangeListener<E>) {
        self.listeners.push(listener);
    }

    /// Set the initial state and run its entry hook. Must be called exactly
    /// once, before the first event.
    pub fn set_initial_state(&mut self, ctx: &mut C, state: StateId) -> Result<(), FsmConfigError> {
        if self.initial.is_some() {
            return Err(FsmConfigError::AlreadyInitialized);
        }
        if self.states.get(state.0).is_none() {
            return Err(FsmConfigError::UnknownState(state.0));
        }
        self.initial = Some(state);
        self.current = Some(state);
        self.run_entry(state, ctx);
        Ok(())
    }

    /// Rewind to the initial state, for reconnection. The caller decides
    /// whether a reconnect actually happens.
    pub fn reset(&mut self, ctx: &mut C) -> Result<(), FsmConfigError> {
        let initial = self.initial.ok_or(FsmConfigError::NotInitialized)?;
        self.current = Some(initial);
        self.run_entry(initial, ctx);
        Ok(())
    }

    /// Currently active state, if initialized.
    #[must_use]
    pub fn current_state(&self) -> Option<StateId> {
        self.current
    }

    /// Feed one event through the machine.
    ///
    /// Looks up the transition for (current state, event key). If none is
    /// registered the event is rejected: logged, no state change, no
    /// escalation. Otherwise the current state's exit hook runs, then the
    /// action; on success the machine commits to the target state, runs its
    /// entry hook, and notifies change listeners. The active state's
    /// "always" hooks run last in every case.
    pub fn feed_event(&mut self, ctx: &mut C, event: &E) -> FeedOutcome {
        let Some(current) = self.current else {
            tracing::warn!(key = ?event.key(), "event before initial state; ignoring");
            return FeedOutcome::Rejected;
        };
        let key = event.key();

        if !self.transitions.contains_key(&(current, key)) {
            tracing::debug!(
                state = self.state_name(current),
                ?key,
                "no transition for event; ignoring"
            );
            self.run_always(current, ctx);
            return FeedOutcome::Rejected;
        }

        self.run_exit(current, ctx);

        let Some((to, success)) = self
            .transitions
            .get_mut(&(current, key))
            .map(|entry| (entry.to, (entry.action)(event, ctx)))
        else {
            return FeedOutcome::Rejected;
        };

        if !success {
            tracing::warn!(state = self.state_name(current), ?key, "transition action failed");
            self.run_always(current, ctx);
            return FeedOutcome::ActionFailed;
        }

        self.current = Some(to);
        tracing::debug!(
            from = self.state_name(current),
            to = self.state_name(to),
            ?key,
            "state change committed"
        );
        self.run_entry(to, ctx);
        let change = StateChange { from: current, to };
        for listener in &mut self.listeners {
            listener(change, event);
        }
        self.run_always(to, ctx);
        FeedOutcome::Transitioned(to)
    }

    /// Render the transition table as a Graphviz digraph, for diagnostics.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut edges: Vec<(usize, String, usize)> = self
            .transitions
            .iter()
            .map(|((from, key), entry)| (from.0, format!("{key:?}"), entry.to.0))
            .collect();
        edges.sort();

        let mut out = String::from("digraph fsm {\n");
        for node in &self.states {
            let _ = writeln!(out, "  {} [label=\"{}\"];", node.state.ordinal, node.state.id);
        }
        for (from, key, to) in edges {
            let _ = writeln!(out, "  {from} -> {to} [label=\"{key}\"];");
        }
        out.push_str("}\n");
        out
    }

    fn run_entry(&mut self, state: StateId, ctx: &mut C) {
        if let Some(hook) = self.states.get_mut(state.0).and_then(|node| node.on_entry.as_mut()) {
            hook(ctx);
        }
    }

    fn run_exit(&mut self, state: StateId, ctx: &mut C) {
        if let Some(hook) = self.states.get_mut(state.0).and_then(|node| node.on_exit.as_mut()) {
            hook(ctx);
        }
    }

    fn run_always(&mut self, state: StateId, ctx: &mut C) {
        if let Some(node) = self.states.get_mut(state.0) {
            for hook in &mut node.on_always {
                hook(ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    struct TestEvent(&'static str);

    impl FsmEvent for TestEvent {
        type Key = &'static str;

        fn key(&self) -> Self::Key {
            self.0
        }
    }

    type Trace = Vec<String>;

    fn push(label: &'static str) -> Hook<Trace> {
        Box::new(move |trace: &mut Trace| trace.push(label.to_owned()))
    }

    fn two_state_machine() -> (Fsm<TestEvent, Trace>, StateId, StateId) {
        let mut fsm = Fsm::new();
        let a = fsm.add_state("a", "first").unwrap();
        let b = fsm.add_state("b", "second").unwrap();
        fsm.add_transition(a, "go", b, Box::new(|_, _| true)).unwrap();
        (fsm, a, b)
    }

    #[test]
    fn duplicate_state_rejected() {
        let mut fsm: Fsm<TestEvent, Trace> = Fsm::new();
        fsm.add_state("a", "first").unwrap();
        assert!(matches!(
            fsm.add_state("a", "again"),
            Err(FsmConfigError::DuplicateState(_))
        ));
    }

    #[test]
    fn duplicate_transition_rejected() {
        let (mut fsm, a, b) = two_state_machine();
        let result = fsm.add_transition(a, "go", b, Box::new(|_, _| true));
        assert!(matches!(result, Err(FsmConfigError::DuplicateTransition { .. })));
    }

    #[test]
    fn initial_state_only_once() {
        let (mut fsm, a, _) = two_state_machine();
        let mut trace = Trace::new();
        fsm.set_initial_state(&mut trace, a).unwrap();
        assert!(matches!(
            fsm.set_initial_state(&mut trace, a),
            Err(FsmConfigError::AlreadyInitialized)
        ));
    }

    #[test]
    fn unknown_event_is_ignored() {
        let (mut fsm, a, _) = two_state_machine();
        let mut trace = Trace::new();
        fsm.set_initial_state(&mut trace, a).unwrap();

        let outcome = fsm.feed_event(&mut trace, &TestEvent("nope"));
        assert_eq!(outcome, FeedOutcome::Rejected);
        assert_eq!(fsm.current_state(), Some(a));
    }

    #[test]
    fn action_failure_keeps_state() {
        let mut fsm: Fsm<TestEvent, Trace> = Fsm::new();
        let a = fsm.add_state("a", "first").unwrap();
        let b = fsm.add_state("b", "second").unwrap();
        fsm.add_transition(a, "go", b, Box::new(|_, _| false)).unwrap();

        let mut trace = Trace::new();
        fsm.set_initial_state(&mut trace, a).unwrap();
        assert_eq!(fsm.feed_event(&mut trace, &TestEvent("go")), FeedOutcome::ActionFailed);
        assert_eq!(fsm.current_state(), Some(a));
    }

    #[test]
    fn hooks_run_in_order() {
        let mut fsm: Fsm<TestEvent, Trace> = Fsm::new();
        let a = fsm.add_state("a", "first").unwrap();
        let b = fsm.add_state("b", "second").unwrap();
        fsm.add_transition(
            a,
            "go",
            b,
            Box::new(|_, trace: &mut Trace| {
                trace.push("action".to_owned());
                true
            }),
        )
        .unwrap();
        fsm.on_entry(a, push("enter-a")).unwrap();
        fsm.on_exit(a, push("exit-a")).unwrap();
        fsm.on_entry(b, push("enter-b")).unwrap();
        fsm.on_always(b, push("always-b")).unwrap();

        let mut trace = Trace::new();
        fsm.set_initial_state(&mut trace, a).unwrap();
        fsm.feed_event(&mut trace, &TestEvent("go"));

        assert_eq!(trace, vec!["enter-a", "exit-a", "action", "enter-b", "always-b"]);
    }

    #[test]
    fn change_listener_observes_commits_only() {
        let (mut fsm, a, b) = two_state_machine();
        let changes = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&changes);
        fsm.add_success_change_listener(Box::new(move |change, _event| {
            sink.lock().unwrap().push(change);
        }));

        let mut trace = Trace::new();
        fsm.set_initial_state(&mut trace, a).unwrap();
        fsm.feed_event(&mut trace, &TestEvent("nope"));
        fsm.feed_event(&mut trace, &TestEvent("go"));

        let seen = changes.lock().unwrap().clone();
        assert_eq!(seen, vec![StateChange { from: a, to: b }]);
    }

    #[test]
    fn reset_rewinds_to_initial() {
        let (mut fsm, a, b) = two_state_machine();
        let mut trace = Trace::new();
        fsm.set_initial_state(&mut trace, a).unwrap();
        fsm.feed_event(&mut trace, &TestEvent("go"));
        assert_eq!(fsm.current_state(), Some(b));

        fsm.reset(&mut trace).unwrap();
        assert_eq!(fsm.current_state(), Some(a));
    }

    #[test]
    fn to_dot_lists_edges() {
        let (fsm, _, _) = two_state_machine();
        let dot = fsm.to_dot();
        assert!(dot.contains("digraph fsm"));
        assert!(dot.contains("0 -> 1"));
        assert!(dot.contains("\"go\""));
    }

    struct NumEvent(u32);

    impl FsmEvent for NumEvent {
        type Key = u32;

        fn key(&self) -> Self::Key {
            self.0
        }
    }

    proptest! {
        #[test]
        fn second_registration_always_errors(
            keys in proptest::collection::hash_set(any::<u32>(), 1..16)
        ) {
            let mut fsm: Fsm<NumEvent, Trace> = Fsm::new();
            let a = fsm.add_state("a", "first").unwrap();
            let b = fsm.add_state("b", "second").unwrap();
            for &key in &keys {
                fsm.add_transition(a, key, b, Box::new(|_, _| true)).unwrap();
            }
            for &key in &keys {
                let result = fsm.add_transition(a, key, b, Box::new(|_, _| true));
                let is_duplicate =
                    matches!(result, Err(FsmConfigError::DuplicateTransition { .. }));
                prop_assert!(is_duplicate);
            }
        }

        #[test]
        fn unknown_keys_never_change_state(
            known in any::<u32>(),
            noise in proptest::collection::vec(any::<u32>(), 0..32)
        ) {
            let mut fsm: Fsm<NumEvent, Trace> = Fsm::new();
            let a = fsm.add_state("a", "first").unwrap();
            let b = fsm.add_state("b", "second").unwrap();
            fsm.add_transition(a, known, b, Box::new(|_, _| true)).unwrap();

            let mut trace = Trace::new();
            fsm.set_initial_state(&mut trace, a).unwrap();
            for key in noise {
                if key == known {
                    continue;
                }
                prop_assert_eq!(fsm.feed_event(&mut trace, &NumEvent(key)), FeedOutcome::Rejected);
                prop_assert_eq!(fsm.current_state(), Some(a));
            }
        }
    }
}
