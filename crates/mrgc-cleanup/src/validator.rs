//! Node-side cleanup checks.

use std::future::Future;
use std::pin::Pin;

use mrgc_state::NodeRecord;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of the three wipe checks on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupChecks {
    pub compute_memory_wiped: bool,
    pub system_memory_wiped: bool,
    pub secure_compute_restarted: bool,
    /// Why a check failed, when the node said.
    pub failure_reason: Option<String>,
}

impl CleanupChecks {
    pub fn all_passed() -> Self {
        Self {
            compute_memory_wiped: true,
            system_memory_wiped: true,
            secure_compute_restarted: true,
            failure_reason: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.compute_memory_wiped && self.system_memory_wiped && self.secure_compute_restarted
    }

    /// Names of the checks that did not pass.
    pub fn failed_checks(&self) -> Vec<&'static str> {
        [
            ("compute_memory_wiped", self.compute_memory_wiped),
            ("system_memory_wiped", self.system_memory_wiped),
            ("secure_compute_restarted", self.secure_compute_restarted),
        ]
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect()
    }
}

/// Runs the wipe checks on a node.
///
/// An `Err` means the checks could not be run at all; the gate treats
/// that exactly like a failed check.
pub trait CleanupValidator: Send + Sync {
    fn validate<'a>(&'a self, node: &'a NodeRecord) -> BoxFuture<'a, anyhow::Result<CleanupChecks>>;
}
