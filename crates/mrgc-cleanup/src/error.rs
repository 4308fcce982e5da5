use mrgc_registry::RegistryError;
use mrgc_state::StateError;
use thiserror::Error;

pub type GateResult<T> = Result<T, GateError>;

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    State(#[from] StateError),

    /// The gate refused the node and quarantined it.
    #[error("node {node_id} quarantined: {reason}")]
    Quarantined { node_id: String, reason: String },

    /// Validation has started but not finished.
    #[error("cleanup of node {0} is still pending")]
    Pending(String),
}
