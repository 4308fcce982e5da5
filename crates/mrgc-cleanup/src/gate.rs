//! The cleanup gate.

use std::time::Duration;

use mrgc_metrics::MetricsRecorder;
use mrgc_registry::NodeRegistry;
use mrgc_state::*;
use tracing::{debug, error, info, warn};

use crate::error::{GateError, GateResult};
use crate::integrity::{seal, verify};
use crate::validator::{CleanupChecks, CleanupValidator};

/// Guards every DRAINING→AVAILABLE and →TERMINATED move on a sealed,
/// passed cleanup record.
#[derive(Clone)]
pub struct CleanupGate {
    registry: NodeRegistry,
    store: StateStore,
    metrics: MetricsRecorder,
    region: String,
    retry: RetryPolicy,
}

impl CleanupGate {
    pub fn new(registry: NodeRegistry, metrics: MetricsRecorder, region: impl Into<String>) -> Self {
        let store = registry.store().clone();
        Self {
            registry,
            store,
            metrics,
            region: region.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn now_ms(&self) -> u64 {
        self.store.clock().now_ms()
    }

    /// Mark a validation as started. Blocks release until a result lands.
    pub async fn record_pending(&self, node_id: &str) -> GateResult<CleanupRecord> {
        let record = seal(CleanupRecord {
            node_id: node_id.to_string(),
            timestamp_ms: self.now_ms(),
            status: CleanupStatus::Pending,
            compute_memory_wiped: false,
            system_memory_wiped: false,
            secure_compute_restarted: false,
            failure_reason: None,
            integrity: String::new(),
        });
        retry(&self.retry, "put cleanup record", || self.store.put(record.clone())).await?;
        debug!(%node_id, "cleanup validation pending");
        Ok(record)
    }

    /// Persist the outcome of a validation.
    ///
    /// Any failed check quarantines the node before this returns.
    pub async fn record_validation(
        &self,
        node_id: &str,
        checks: CleanupChecks,
    ) -> GateResult<CleanupRecord> {
        let passed = checks.passed();
        let failure_reason = if passed {
            None
        } else {
            Some(checks.failure_reason.clone().unwrap_or_else(|| {
                format!("failed checks: {}", checks.failed_checks().join(", "))
            }))
        };
        let record = seal(CleanupRecord {
            node_id: node_id.to_string(),
            timestamp_ms: self.now_ms(),
            status: if passed {
                CleanupStatus::Passed
            } else {
                CleanupStatus::Failed
            },
            compute_memory_wiped: checks.compute_memory_wiped,
            system_memory_wiped: checks.system_memory_wiped,
            secure_compute_restarted: checks.secure_compute_restarted,
            failure_reason: failure_reason.clone(),
            integrity: String::new(),
        });

        // The quarantine must not depend on the record write succeeding.
        if let Some(reason) = &failure_reason {
            self.quarantine(node_id, &format!("cleanup failed: {reason}"))
                .await?;
        }

        retry(&self.retry, "put cleanup record", || self.store.put(record.clone())).await?;

        if let Err(e) = self.metrics.record_cleanup(&self.region, node_id, passed).await {
            warn!(%node_id, error = %e, "cleanup metric not recorded");
        }
        if passed {
            info!(%node_id, "cleanup validation passed");
        }
        Ok(record)
    }

    /// Run `validator` against `node` and record the result.
    ///
    /// A validator that cannot run counts as a failed validation.
    pub async fn validate(
        &self,
        node: &NodeRecord,
        validator: &dyn CleanupValidator,
    ) -> GateResult<CleanupRecord> {
        self.record_pending(&node.node_id).await?;
        let checks = match validator.validate(node).await {
            Ok(checks) => checks,
            Err(e) => CleanupChecks {
                failure_reason: Some(format!("validator error: {e}")),
                ..Default::default()
            },
        };
        self.record_validation(&node.node_id, checks).await
    }

    /// Validate a drained node and, if it passes, put it back in service.
    pub async fn validate_and_release(
        &self,
        node: &NodeRecord,
        validator: &dyn CleanupValidator,
    ) -> GateResult<NodeRecord> {
        let record = self.validate(node, validator).await?;
        if record.status != CleanupStatus::Passed {
            return Err(GateError::Quarantined {
                node_id: node.node_id.clone(),
                reason: record.failure_reason.unwrap_or_default(),
            });
        }
        self.release(&node.node_id).await
    }

    /// The most recent cleanup record for `node_id`.
    pub async fn latest(&self, node_id: &str) -> GateResult<Option<CleanupRecord>> {
        let query = Query::on(index::NODE_TIME, node_id).descending().limit(1);
        let mut records = retry(&self.retry, "read cleanup record", || {
            self.store.query::<CleanupRecord>(&query)
        })
        .await?;
        Ok(records.pop())
    }

    /// Decide whether `node_id` may leave the gate.
    ///
    /// Returns the passing record. Every other outcome except PENDING
    /// quarantines the node. Only a record taken at or after the node's most
    /// recent entry into DRAINING counts.
    pub async fn check(&self, node_id: &str) -> GateResult<CleanupRecord> {
        let drained_at = retry(&self.retry, "read node", || self.registry.get(node_id))
            .await?
            .map(|n| n.drained_at_ms)
            .unwrap_or_default();
        let refusal = match self.latest(node_id).await? {
            None => "no cleanup record".to_string(),
            Some(record) if record.timestamp_ms < drained_at => {
                format!("no cleanup record since drain at {drained_at}")
            }
            Some(record) if !verify(&record) => {
                format!("cleanup record {} failed integrity check", record.timestamp_ms)
            }
            Some(record) => match record.status {
                CleanupStatus::Pending => return Err(GateError::Pending(node_id.to_string())),
                CleanupStatus::Failed => format!(
                    "cleanup failed: {}",
                    record.failure_reason.as_deref().unwrap_or("unspecified")
                ),
                CleanupStatus::Passed if !record.all_checks_passed() => {
                    "cleanup record marked passed with failed checks".to_string()
                }
                CleanupStatus::Passed => return Ok(record),
            },
        };
        self.quarantine(node_id, &refusal).await?;
        Err(GateError::Quarantined {
            node_id: node_id.to_string(),
            reason: refusal,
        })
    }

    /// DRAINING → AVAILABLE behind a passed record.
    pub async fn release(&self, node_id: &str) -> GateResult<NodeRecord> {
        let record = self.check(node_id).await?;
        let node = retry(&self.retry, "reinstate node", || {
            self.registry.reinstate(node_id, &record)
        })
        .await?;
        info!(%node_id, region = %node.region, "node released back to service");
        Ok(node)
    }

    /// Retire a node behind a passed record.
    ///
    /// Already terminated nodes are returned unchanged.
    pub async fn decommission(&self, node_id: &str) -> GateResult<NodeRecord> {
        let Some(node) = retry(&self.retry, "read node", || self.registry.get(node_id)).await? else {
            return Err(mrgc_registry::RegistryError::NotFound(node_id.to_string()).into());
        };
        match node.state {
            NodeState::Terminated => return Ok(node),
            NodeState::Quarantined => {
                return Err(GateError::Quarantined {
                    node_id: node_id.to_string(),
                    reason: node.state_reason.unwrap_or_default(),
                });
            }
            _ => {}
        }
        self.check(node_id).await?;
        let node = retry(&self.retry, "decommission node", || {
            self.registry.transition_with_reason(
                node_id,
                node.state,
                NodeState::Terminated,
                Some("decommissioned after cleanup"),
            )
        })
        .await?;
        info!(%node_id, "node decommissioned");
        Ok(node)
    }

    /// FAILED records written at or after `since_ms`.
    pub async fn failed_validations(&self, since_ms: u64) -> GateResult<Vec<CleanupRecord>> {
        let query = Query::on(index::STATUS_TIME, CleanupStatus::Failed.as_str())
            .since(since_ms)
            .descending();
        Ok(retry(&self.retry, "read failed cleanups", || {
            self.store.query::<CleanupRecord>(&query)
        })
        .await?)
    }

    /// Fraction of finished validations in the last `window` that passed.
    pub async fn success_rate(&self, window: Duration) -> GateResult<Option<f64>> {
        let since = self.now_ms().saturating_sub(window.as_millis() as u64);
        let mut finished = 0usize;
        let mut passed = 0usize;
        for status in [CleanupStatus::Passed, CleanupStatus::Failed] {
            let query = Query::on(index::STATUS_TIME, status.as_str()).since(since);
            let n = retry(&self.retry, "read cleanup outcomes", || {
                self.store.query::<CleanupRecord>(&query)
            })
            .await?
            .len();
            finished += n;
            if status == CleanupStatus::Passed {
                passed += n;
            }
        }
        if finished == 0 {
            return Ok(None);
        }
        Ok(Some(passed as f64 / finished as f64))
    }

    async fn quarantine(&self, node_id: &str, reason: &str) -> GateResult<()> {
        error!(%node_id, region = %self.region, %reason, "cleanup gate quarantining node");
        retry(&self.retry, "quarantine node", || {
            self.registry.quarantine(node_id, reason)
        })
        .await?;
        Ok(())
    }
}
