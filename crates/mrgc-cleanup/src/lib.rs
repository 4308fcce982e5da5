//! mrgc-cleanup — the quarantine gate.
//!
//! A node leaving service must produce a `CleanupRecord` proving that
//! compute memory, system memory and the secure-compute enclave were all
//! wiped. Only a sealed, PASSED record lets a DRAINING node return to
//! AVAILABLE or be retired normally. A FAILED record, a missing record, or
//! a record whose integrity hash does not verify quarantines the node.
//! There is no retry and no override.

pub mod error;
pub mod gate;
pub mod integrity;
pub mod validator;

pub use error::{GateError, GateResult};
pub use gate::CleanupGate;
pub use integrity::{compute_integrity, seal, verify};
pub use validator::{CleanupChecks, CleanupValidator};
