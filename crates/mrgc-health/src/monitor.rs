//! Health monitor — the per-region probe cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mrgc_core::ControlPlaneConfig;
use mrgc_registry::{NodeRegistry, RegistryError};
use mrgc_routing::routing_score;
use mrgc_state::*;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::checker::{BoxFuture, HealthTracker, ProbeResult, Prober};

/// Callback invoked when a node's health status changes.
pub type HealthCallback = Arc<dyn Fn(String, HealthStatus) -> BoxFuture<'static, ()> + Send + Sync>;

/// Knobs for one region's monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub region: String,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub max_in_flight: usize,
    pub stale_heartbeat: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self {
            region: config.region.clone(),
            probe_timeout: config.health_timeout(),
            failure_threshold: config.failure_threshold,
            max_in_flight: config.probe_max_in_flight,
            stale_heartbeat: config.stale_heartbeat(),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub probed: usize,
    /// HEALTHY nodes whose fact was written.
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    /// Nodes moved AVAILABLE → DRAINING for a stale heartbeat.
    pub stale_drained: Vec<NodeId>,
    pub write_failures: usize,
}

/// Probes every monitored node of one region and writes routing facts.
pub struct HealthMonitor {
    registry: NodeRegistry,
    store: StateStore,
    prober: Arc<dyn Prober>,
    settings: MonitorSettings,
    retry: RetryPolicy,
    trackers: Mutex<HashMap<NodeId, HealthTracker>>,
    on_status_change: Option<HealthCallback>,
}

impl HealthMonitor {
    pub fn new(registry: NodeRegistry, prober: Arc<dyn Prober>, settings: MonitorSettings) -> Self {
        let store = registry.store().clone();
        Self {
            registry,
            store,
            prober,
            settings,
            retry: RetryPolicy::default(),
            trackers: Mutex::new(HashMap::new()),
            on_status_change: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set a callback for node health status changes.
    pub fn with_callback(mut self, callback: HealthCallback) -> Self {
        self.on_status_change = Some(callback);
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Run one full health pass over the region.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        let region = self.settings.region.as_str();
        let mut report = CycleReport {
            stale_drained: self.sweep_stale().await,
            ..Default::default()
        };

        let nodes: Vec<NodeRecord> = retry(&self.retry, "list monitored nodes", || {
            self.store
                .query::<NodeRecord>(&Query::on(index::REGION, region))
        })
        .await?
        .into_iter()
        .filter(|n| matches!(n.state, NodeState::Available | NodeState::Draining))
        .filter(|n| !report.stale_drained.contains(&n.node_id))
        .collect();

        let mut results = self.probe_all(&nodes).await;
        results.sort_by(|a, b| a.0.node_id.cmp(&b.0.node_id));
        report.probed = results.len();

        let now = self.store.clock().now_ms();
        let mut changes = Vec::new();
        {
            let mut trackers = self.trackers.lock().await;
            let monitored: HashSet<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
            trackers.retain(|id, _| monitored.contains(id.as_str()));

            for (node, result, elapsed) in &results {
                let tracker = trackers
                    .entry(node.node_id.clone())
                    .or_insert_with(|| HealthTracker::new(self.settings.failure_threshold));
                let previous = tracker.status();
                let status = tracker.record(result);
                let fact = build_fact(
                    node,
                    result,
                    status,
                    tracker.consecutive_failures(),
                    *elapsed,
                    now,
                );

                let written = retry(&self.retry, "put routing fact", || {
                    self.store.put(fact.clone())
                })
                .await;
                if let Err(e) = written {
                    error!(node_id = %node.node_id, error = %e, "failed to write routing fact");
                    report.write_failures += 1;
                    continue;
                }

                match status {
                    HealthStatus::Healthy => report.healthy += 1,
                    HealthStatus::Degraded => report.degraded += 1,
                    HealthStatus::Unhealthy => report.unhealthy += 1,
                }
                if previous != Some(status) {
                    changes.push((node.node_id.clone(), status));
                }
            }
        }

        if let Some(cb) = &self.on_status_change {
            for (node_id, status) in changes {
                cb(node_id, status).await;
            }
        }

        debug!(
            %region,
            probed = report.probed,
            healthy = report.healthy,
            degraded = report.degraded,
            unhealthy = report.unhealthy,
            "health cycle complete"
        );
        Ok(report)
    }

    /// Probe nodes concurrently, at most `max_in_flight` at a time.
    async fn probe_all(&self, nodes: &[NodeRecord]) -> Vec<(NodeRecord, ProbeResult, Duration)> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_in_flight.max(1)));
        let mut tasks = JoinSet::new();

        for node in nodes.iter().cloned() {
            let prober = self.prober.clone();
            let semaphore = semaphore.clone();
            let timeout = self.settings.probe_timeout;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let started = Instant::now();
                let result = match tokio::time::timeout(timeout, prober.probe(&node)).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(node_id = %node.node_id, ?timeout, "health probe timed out");
                        ProbeResult::failure(format!("timed out after {timeout:?}"))
                    }
                };
                (node, result, started.elapsed())
            });
        }

        let mut results = Vec::with_capacity(nodes.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }
        results
    }

    /// Move AVAILABLE nodes with a stale heartbeat to DRAINING and stop
    /// routing to them.
    ///
    /// A failed read skips the sweep for this cycle; probing still runs.
    async fn sweep_stale(&self) -> Vec<NodeId> {
        let region = self.settings.region.as_str();
        let stale = match retry(&self.retry, "list stale nodes", || {
            self.registry.stale_nodes(region, self.settings.stale_heartbeat)
        })
        .await
        {
            Ok(stale) => stale,
            Err(e) => {
                error!(%region, error = %e, "stale heartbeat sweep skipped");
                return Vec::new();
            }
        };

        let mut drained = Vec::new();
        for node in stale.into_iter().filter(|n| n.state == NodeState::Available) {
            let moved = retry(&self.retry, "drain stale node", || {
                self.registry.transition_with_reason(
                    &node.node_id,
                    NodeState::Available,
                    NodeState::Draining,
                    Some("heartbeat stale"),
                )
            })
            .await;
            match moved {
                Ok(_) => {}
                Err(RegistryError::InvalidTransition { actual, .. }) => {
                    debug!(node_id = %node.node_id, %actual, "stale node already moved");
                    continue;
                }
                Err(e) => {
                    warn!(node_id = %node.node_id, error = %e, "failed to drain stale node");
                    continue;
                }
            }

            let now = self.store.clock().now_ms();
            let fact = RoutingFact {
                node_id: node.node_id.clone(),
                region: node.region.clone(),
                pool: node.pool.clone(),
                routing_score: 0.0,
                queue_depth: node.queue_depth,
                avg_latency_ms: 0.0,
                health_status: HealthStatus::Unhealthy,
                consecutive_failures: 0,
                last_updated_ms: now,
            };
            if let Err(e) = retry(&self.retry, "put routing fact", || self.store.put(fact.clone())).await {
                error!(node_id = %node.node_id, error = %e, "failed to write stale routing fact");
            }
            warn!(node_id = %node.node_id, last_heartbeat_ms = node.last_heartbeat_ms, "stale heartbeat, node draining");
            drained.push(node.node_id);
        }
        drained
    }

    /// Run the monitor loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            region = %self.settings.region,
            interval_secs = interval.as_secs(),
            "health monitor started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "health cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }
}

fn build_fact(
    node: &NodeRecord,
    result: &ProbeResult,
    status: HealthStatus,
    consecutive_failures: u32,
    elapsed: Duration,
    now_ms: u64,
) -> RoutingFact {
    let (queue_depth, avg_latency_ms) = match result {
        ProbeResult::Success {
            latency_ms,
            queue_depth,
            ..
        } => (*queue_depth, *latency_ms),
        ProbeResult::Failure { .. } => (node.queue_depth, elapsed.as_secs_f64() * 1000.0),
    };
    let score = match status {
        HealthStatus::Unhealthy => 0.0,
        _ => routing_score(queue_depth, avg_latency_ms, status),
    };
    RoutingFact {
        node_id: node.node_id.clone(),
        region: node.region.clone(),
        pool: node.pool.clone(),
        routing_score: score,
        queue_depth,
        avg_latency_ms,
        health_status: status,
        consecutive_failures,
        last_updated_ms: now_ms,
    }
}
