//! Error types for the node registry.

use mrgc_state::{NodeState, StateError, Transient};
use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("node {0} not found")]
    NotFound(String),

    #[error("node {0} already registered")]
    AlreadyExists(String),

    /// The persisted state did not match the caller's expectation.
    #[error("invalid transition for node {node_id}: expected {expected}, found {actual}")]
    InvalidTransition {
        node_id: String,
        expected: NodeState,
        actual: NodeState,
    },

    /// The requested edge is not part of the lifecycle graph.
    #[error("illegal transition for node {node_id}: {from} -> {to}")]
    IllegalTransition {
        node_id: String,
        from: NodeState,
        to: NodeState,
    },

    #[error("node {node_id} is {state} and no longer accepts updates")]
    Retired { node_id: String, state: NodeState },

    #[error("node {node_id} cannot be reinstated: {reason}")]
    CleanupRequired { node_id: String, reason: String },
}

impl Transient for RegistryError {
    fn is_transient(&self) -> bool {
        matches!(self, RegistryError::State(e) if e.is_transient())
    }
}
