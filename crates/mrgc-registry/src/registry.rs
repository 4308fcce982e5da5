//! Node registry — lifecycle CRUD over `NodeRecord`s.

use std::collections::BTreeMap;
use std::time::Duration;

use mrgc_state::*;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};

/// Whether `from -> to` is an edge of the lifecycle graph reachable through
/// [`NodeRegistry::transition`].
///
/// `DRAINING -> AVAILABLE` is deliberately absent: it requires a passed
/// cleanup validation and goes through [`NodeRegistry::reinstate`].
/// Quarantine is never a plain transition either.
pub fn is_legal_transition(from: NodeState, to: NodeState) -> bool {
    use NodeState::*;
    matches!(
        (from, to),
        (Launching, Available)
            | (Launching, Draining)
            | (Launching, Terminated)
            | (Available, Draining)
            | (Available, Terminated)
            | (Draining, Terminated)
    )
}

/// Manages the lifecycle of worker nodes.
///
/// `NodeRegistry` is the sole writer of `NodeRecord`s.
#[derive(Clone)]
pub struct NodeRegistry {
    store: StateStore,
}

impl NodeRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn now_ms(&self) -> u64 {
        self.store.clock().now_ms()
    }

    /// Register a newly launched node in `LAUNCHING`.
    ///
    /// Fails if any live record holds the id, including a quarantined one.
    pub fn register(&self, mut node: NodeRecord) -> RegistryResult<NodeRecord> {
        let now = self.now_ms();
        node.state = NodeState::Launching;
        node.state_reason = None;
        node.last_heartbeat_ms = now;
        if node.launch_time_ms == 0 {
            node.launch_time_ms = now;
        }

        match self.store.insert_new(node.clone()) {
            Ok(()) => {
                info!(
                    node_id = %node.node_id,
                    region = %node.region,
                    pool = %node.pool,
                    "node registered"
                );
                Ok(node)
            }
            Err(StateError::AlreadyExists(_)) => {
                Err(RegistryError::AlreadyExists(node.node_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, node_id: &str) -> RegistryResult<Option<NodeRecord>> {
        Ok(self.store.get::<NodeRecord>(node_id)?)
    }

    /// Record a heartbeat.
    ///
    /// Only the timestamp and queue depth change, so repeating the same
    /// call leaves the record identical apart from `last_heartbeat_ms`.
    pub fn heartbeat(&self, node_id: &str, queue_depth: u32) -> RegistryResult<NodeRecord> {
        let now = self.now_ms();
        let outcome = self.store.update::<NodeRecord, RegistryError, _>(node_id, |n| {
            if n.state.is_terminal() {
                return Err(RegistryError::Retired {
                    node_id: n.node_id.clone(),
                    state: n.state,
                });
            }
            n.queue_depth = queue_depth;
            n.last_heartbeat_ms = now;
            Ok(())
        });
        let node = flatten(node_id, outcome).inspect_err(|e| {
            debug!(%node_id, error = %e, "heartbeat rejected");
        })?;
        debug!(%node_id, queue_depth, "heartbeat received");
        Ok(node)
    }

    /// Guarded state change: applied only if the persisted state is `from`.
    pub fn transition(
        &self,
        node_id: &str,
        from: NodeState,
        to: NodeState,
    ) -> RegistryResult<NodeRecord> {
        self.transition_with_reason(node_id, from, to, None)
    }

    /// [`transition`](Self::transition) that also records why.
    pub fn transition_with_reason(
        &self,
        node_id: &str,
        from: NodeState,
        to: NodeState,
        reason: Option<&str>,
    ) -> RegistryResult<NodeRecord> {
        if !is_legal_transition(from, to) {
            warn!(%node_id, %from, %to, "illegal transition requested");
            return Err(RegistryError::IllegalTransition {
                node_id: node_id.to_string(),
                from,
                to,
            });
        }
        self.compare_and_set(node_id, from, to, reason)
    }

    fn compare_and_set(
        &self,
        node_id: &str,
        from: NodeState,
        to: NodeState,
        reason: Option<&str>,
    ) -> RegistryResult<NodeRecord> {
        self.guarded_set(node_id, from, to, reason, |_| Ok(()))
    }

    fn guarded_set<G>(
        &self,
        node_id: &str,
        from: NodeState,
        to: NodeState,
        reason: Option<&str>,
        guard: G,
    ) -> RegistryResult<NodeRecord>
    where
        G: Fn(&NodeRecord) -> RegistryResult<()>,
    {
        let now = self.now_ms();
        let outcome = self.store.update::<NodeRecord, RegistryError, _>(node_id, |n| {
            if n.state != from {
                return Err(RegistryError::InvalidTransition {
                    node_id: n.node_id.clone(),
                    expected: from,
                    actual: n.state,
                });
            }
            guard(n)?;
            n.state = to;
            n.state_reason = reason.map(str::to_string);
            if to == NodeState::Draining {
                n.drained_at_ms = now;
            }
            Ok(())
        });
        match flatten(node_id, outcome) {
            Ok(node) => {
                info!(%node_id, %from, %to, "node transitioned");
                Ok(node)
            }
            Err(e) => {
                warn!(%node_id, %from, %to, error = %e, "transition rejected");
                Err(e)
            }
        }
    }

    /// Return a drained node to service after a passed cleanup validation.
    ///
    /// Callers are expected to have verified the record's integrity; this
    /// only checks that it belongs to the node, passed every check and was
    /// taken during the node's current drain.
    pub fn reinstate(&self, node_id: &str, cleanup: &CleanupRecord) -> RegistryResult<NodeRecord> {
        let refusal = if cleanup.node_id != node_id {
            Some(format!("cleanup record belongs to {}", cleanup.node_id))
        } else if cleanup.status != CleanupStatus::Passed {
            Some(format!("cleanup status is {}", cleanup.status))
        } else if !cleanup.all_checks_passed() {
            Some("cleanup record has failed checks".to_string())
        } else {
            None
        };
        if let Some(reason) = refusal {
            warn!(%node_id, %reason, "reinstate refused");
            return Err(RegistryError::CleanupRequired {
                node_id: node_id.to_string(),
                reason,
            });
        }
        let validated_at = cleanup.timestamp_ms;
        self.guarded_set(
            node_id,
            NodeState::Draining,
            NodeState::Available,
            Some("cleanup passed"),
            |n| {
                if validated_at < n.drained_at_ms {
                    return Err(RegistryError::CleanupRequired {
                        node_id: n.node_id.clone(),
                        reason: format!(
                            "cleanup record {validated_at} predates drain at {}",
                            n.drained_at_ms
                        ),
                    });
                }
                Ok(())
            },
        )
    }

    /// Permanently retire a node. Always succeeds and is idempotent.
    ///
    /// An unknown id gets a bare quarantined record so it can never be
    /// registered later. A terminated node is upgraded to quarantined.
    pub fn quarantine(&self, node_id: &str, reason: &str) -> RegistryResult<NodeRecord> {
        let outcome = self.store.update::<NodeRecord, RegistryError, _>(node_id, |n| {
            if n.state != NodeState::Quarantined {
                n.state = NodeState::Quarantined;
                n.state_reason = Some(reason.to_string());
            }
            Ok(())
        });
        let node = match outcome {
            Ok(result) => result?,
            Err(StateError::NotFound(_)) => {
                let mut tombstone = NodeRecord::launching(node_id, "", "", "");
                tombstone.state = NodeState::Quarantined;
                tombstone.state_reason = Some(reason.to_string());
                tombstone.launch_time_ms = self.now_ms();
                self.store.put(tombstone.clone())?;
                tombstone
            }
            Err(e) => return Err(e.into()),
        };
        warn!(%node_id, %reason, "node quarantined");
        Ok(node)
    }

    /// List nodes, filtered by any combination of region, pool and state.
    pub fn list(
        &self,
        region: Option<&str>,
        pool: Option<&str>,
        state: Option<NodeState>,
    ) -> RegistryResult<Vec<NodeRecord>> {
        let candidates: Vec<NodeRecord> = if let Some(region) = region {
            self.store.query(&Query::on(index::REGION, region))?
        } else if let Some(pool) = pool {
            self.store.query(&Query::on(index::POOL, pool))?
        } else if let Some(state) = state {
            self.store.query(&Query::on(index::STATE, state.as_str()))?
        } else {
            self.store.list_all()?
        };

        Ok(candidates
            .into_iter()
            .filter(|n| region.is_none_or(|r| n.region == r))
            .filter(|n| pool.is_none_or(|p| n.pool == p))
            .filter(|n| state.is_none_or(|s| n.state == s))
            .collect())
    }

    /// Nodes in a region that are in any of `states`.
    pub fn list_in_states(
        &self,
        region: &str,
        states: &[NodeState],
    ) -> RegistryResult<Vec<NodeRecord>> {
        Ok(self
            .list(Some(region), None, None)?
            .into_iter()
            .filter(|n| states.contains(&n.state))
            .collect())
    }

    /// AVAILABLE or DRAINING nodes whose last heartbeat is older than `timeout`.
    pub fn stale_nodes(&self, region: &str, timeout: Duration) -> RegistryResult<Vec<NodeRecord>> {
        let cutoff = self.now_ms().saturating_sub(timeout.as_millis() as u64);
        Ok(self
            .list_in_states(region, &[NodeState::Available, NodeState::Draining])?
            .into_iter()
            .filter(|n| n.last_heartbeat_ms < cutoff)
            .collect())
    }

    /// Provisioned capacity (LAUNCHING + AVAILABLE) of a pool in a region.
    pub fn capacity(&self, region: &str, pool: &str) -> RegistryResult<u32> {
        Ok(self
            .list(Some(region), Some(pool), None)?
            .iter()
            .filter(|n| n.state.counts_as_capacity())
            .count() as u32)
    }

    /// Non-retired node counts of a pool, per region.
    pub fn capacity_by_region(&self, pool: &str) -> RegistryResult<BTreeMap<String, u32>> {
        let mut counts = BTreeMap::new();
        for node in self.list(None, Some(pool), None)? {
            if !node.state.is_terminal() {
                *counts.entry(node.region).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

/// Collapse the store's nested update result into a registry result.
fn flatten(
    node_id: &str,
    outcome: StateResult<Result<NodeRecord, RegistryError>>,
) -> RegistryResult<NodeRecord> {
    match outcome {
        Ok(result) => result,
        Err(StateError::NotFound(_)) => Err(RegistryError::NotFound(node_id.to_string())),
        Err(e) => Err(e.into()),
    }
}
