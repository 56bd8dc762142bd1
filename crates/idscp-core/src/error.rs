//! Configuration-time errors.
//!
//! These fail fast: a mis-built state graph is a programmer error, caught
//! when the machine is constructed, never at event time.

/// Errors raised while building or initializing a state machine.
#[derive(Debug, thiserror::Error)]
pub enum FsmConfigError {
    /// A state with this id was already registered.
    #[error("duplicate state: {0}")]
    DuplicateState(String),

    /// A transition for this (state, event key) pair was already registered.
    #[error("duplicate transition from {state} on {key}")]
    DuplicateTransition {
        /// State the duplicate was registered on.
        state: String,
        /// Event key of the duplicate, in debug form.
        key: String,
    },

    /// A state id that was never registered with this machine.
    #[error("unknown state ordinal {0}")]
    UnknownState(usize),

    /// `set_initial_state` called more than once.
    #[error("initial state already set")]
    AlreadyInitialized,

    /// An operation that requires `set_initial_state` ran before it.
    #[error("initial state not set")]
    NotInitialized,
}
