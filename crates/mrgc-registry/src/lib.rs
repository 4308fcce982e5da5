//! mrgc-registry — lifecycle of worker nodes.
//!
//! Nodes move through `LAUNCHING → AVAILABLE → DRAINING → TERMINATED`.
//! Every state change is a compare-and-swap against the persisted state,
//! so two control loops racing on the same node cannot corrupt it: the
//! loser gets [`RegistryError::InvalidTransition`].
//!
//! Quarantine is the exception: it is unconditional, idempotent, and
//! permanent. A quarantined node id is never released for reuse.

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::{NodeRegistry, is_legal_transition};
