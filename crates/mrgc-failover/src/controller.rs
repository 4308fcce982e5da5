//! Failover controller — one region's failover loop.

use std::time::Duration;

use mrgc_core::ControlPlaneConfig;
use mrgc_health::RegionHealth;
use mrgc_metrics::{MetricsRecorder, names};
use mrgc_registry::NodeRegistry;
use mrgc_state::*;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::machine::{FailoverMachine, FailoverThresholds, Transition};
use crate::traffic::{DEFAULT_PEER_LATENCY_MS, PeerStatus, rank_targets, traffic_preference};

#[derive(Debug, Clone, PartialEq)]
pub struct FailoverSettings {
    pub region: String,
    /// Peer regions with their latency from this region.
    pub peers: Vec<(String, u32)>,
    pub thresholds: FailoverThresholds,
    pub settle: Duration,
    /// Routing facts older than this count as unknown.
    pub fact_max_age: Duration,
    /// Capacity multiplier requested from failover targets.
    pub scale_factor: f64,
}

impl FailoverSettings {
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self {
            region: config.region.clone(),
            peers: config
                .peer_regions()
                .map(|peer| {
                    let latency = config
                        .latency_ms(&config.region, peer)
                        .unwrap_or(DEFAULT_PEER_LATENCY_MS);
                    (peer.to_string(), latency)
                })
                .collect(),
            thresholds: FailoverThresholds::from_config(config),
            settle: config.recovery_settle(),
            fact_max_age: config.stale_heartbeat(),
            scale_factor: config.failover_scale_factor,
        }
    }
}

/// Runs the failover state machine for one region and publishes its
/// decisions as `RegionSnapshot`s.
pub struct FailoverController {
    registry: NodeRegistry,
    store: StateStore,
    metrics: MetricsRecorder,
    settings: FailoverSettings,
    machine: FailoverMachine,
    last_good: Option<RegionSnapshot>,
    retry: RetryPolicy,
}

impl FailoverController {
    pub fn new(registry: NodeRegistry, metrics: MetricsRecorder, settings: FailoverSettings) -> Self {
        let store = registry.store().clone();
        let machine = FailoverMachine::new(
            settings.thresholds,
            settings.settle,
            store.clock().now_ms(),
        );
        Self {
            registry,
            store,
            metrics,
            settings,
            machine,
            last_good: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Pick up where a previous process left off.
    pub fn restore(&mut self) -> StateResult<Option<FailoverState>> {
        let Some(snapshot) = self.store.get::<RegionSnapshot>(&self.settings.region)? else {
            return Ok(None);
        };
        info!(
            region = %self.settings.region,
            state = %snapshot.state,
            "resuming failover state"
        );
        self.machine.resume(snapshot.state, snapshot.state_since_ms);
        let state = snapshot.state;
        self.last_good = Some(snapshot);
        Ok(Some(state))
    }

    pub fn state(&self) -> FailoverState {
        self.machine.state()
    }

    pub fn last_known_good(&self) -> Option<&RegionSnapshot> {
        self.last_good.as_ref()
    }

    /// Evaluate the region once and publish the decision.
    pub async fn run_cycle(&mut self) -> anyhow::Result<RegionSnapshot> {
        let region = self.settings.region.clone();

        let health = match retry(&self.retry, "read region health", || {
            RegionHealth::from_store(&self.store, &region, self.settings.fact_max_age)
        })
        .await
        {
            Ok(health) => health,
            Err(e) => {
                warn!(%region, error = %e, "region health unavailable, keeping last decision");
                let Some(last) = self.last_good.clone() else {
                    return Err(e.into());
                };
                self.publish(&last).await;
                return Ok(last);
            }
        };

        let now = self.store.clock().now_ms();
        let transition = self.machine.observe(health.healthy_ratio, now);
        let state = self.machine.state();

        let targets = rank_targets(&self.peer_statuses());
        let traffic = traffic_preference(state, &targets);

        let snapshot = RegionSnapshot {
            region: region.clone(),
            state,
            healthy_nodes: health.healthy_nodes,
            total_nodes: health.total_nodes,
            healthy_ratio: health.healthy_ratio,
            traffic,
            state_since_ms: self.machine.since_ms(),
            updated_at_ms: now,
        };

        if let Some(transition) = transition {
            self.on_transition(transition, &snapshot).await;
        }
        if let Err(e) = self
            .metrics
            .record_healthy_ratio(&region, health.healthy_ratio)
            .await
        {
            debug!(%region, error = %e, "failed to record healthy ratio");
        }

        self.publish(&snapshot).await;
        self.last_good = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn publish(&self, snapshot: &RegionSnapshot) {
        if let Err(e) = retry(&self.retry, "put region snapshot", || {
            self.store.put(snapshot.clone())
        })
        .await
        {
            error!(region = %snapshot.region, error = %e, "failed to publish region snapshot");
        }
    }

    /// Capacity and published state of each peer. A peer we cannot read
    /// is treated as having no capacity.
    fn peer_statuses(&self) -> Vec<PeerStatus> {
        self.settings
            .peers
            .iter()
            .map(|(peer, latency_ms)| {
                let available_nodes = match self
                    .registry
                    .list_in_states(peer, &[NodeState::Available])
                {
                    Ok(nodes) => nodes.len() as u32,
                    Err(e) => {
                        warn!(%peer, error = %e, "failed to read peer capacity");
                        0
                    }
                };
                let state = match self.store.get::<RegionSnapshot>(peer) {
                    Ok(snapshot) => snapshot.map(|s| s.state),
                    Err(e) => {
                        warn!(%peer, error = %e, "failed to read peer snapshot");
                        None
                    }
                };
                PeerStatus {
                    region: peer.clone(),
                    latency_ms: *latency_ms,
                    available_nodes,
                    state,
                }
            })
            .collect()
    }

    async fn on_transition(&self, transition: Transition, snapshot: &RegionSnapshot) {
        let region = snapshot.region.as_str();
        let Transition { from, to, .. } = transition;

        if to == FailoverState::FailoverActive {
            warn!(
                %region,
                %from,
                healthy = snapshot.healthy_nodes,
                total = snapshot.total_nodes,
                "failover active"
            );
        } else {
            info!(%region, %from, %to, ratio = snapshot.healthy_ratio, "failover state changed");
        }

        let metric = match (from, to) {
            (_, FailoverState::FailoverActive) => Some(names::FAILOVER_EVENT),
            (FailoverState::FailoverActive, FailoverState::Recovering) => {
                Some(names::FAILOVER_RECOVERY)
            }
            (FailoverState::Recovering, FailoverState::Normal) => Some(names::FAILOVER_COMPLETE),
            _ => None,
        };
        if let Some(name) = metric
            && let Err(e) = self
                .metrics
                .record_failover(name, region, from, to, snapshot.healthy_ratio)
                .await
        {
            warn!(%region, error = %e, "failed to record failover metric");
        }

        if !matches!(to, FailoverState::FailoverActive | FailoverState::Recovering) {
            return;
        }
        if snapshot.traffic.peers.is_empty() {
            error!(%region, "no healthy failover targets available");
            return;
        }
        for peer in &snapshot.traffic.peers {
            let intent = ScaleIntent {
                target_region: peer.region.clone(),
                source_region: region.to_string(),
                timestamp_ms: transition.at_ms,
                factor: self.settings.scale_factor,
                reason: format!("{region} entered {to}"),
            };
            match retry(&self.retry, "put scale intent", || self.store.put(intent.clone())).await {
                Ok(()) => info!(
                    %region,
                    target = %peer.region,
                    factor = self.settings.scale_factor,
                    "requested failover scale-up"
                ),
                Err(e) => error!(%region, target = %peer.region, error = %e, "failed to write scale intent"),
            }
        }
    }

    /// Run the failover loop until shutdown.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            region = %self.settings.region,
            interval_secs = interval.as_secs(),
            "failover controller started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "failover cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("failover controller shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrgc_core::{Clock, ManualClock};
    use std::sync::Arc;

    const T0: u64 = 1_700_000_000_000;
    const LOCAL: &str = "us-east-1";

    struct Harness {
        clock: Arc<ManualClock>,
        store: StateStore,
        controller: FailoverController,
    }

    fn harness() -> Harness {
        let (clock, shared) = ManualClock::shared(T0);
        let store = StateStore::open_in_memory().unwrap().with_clock(shared);
        let registry = NodeRegistry::new(store.clone());
        let metrics = MetricsRecorder::new(store.clone());
        let settings = FailoverSettings {
            region: LOCAL.into(),
            peers: vec![("us-west-2".into(), 70), ("us-east-2".into(), 15)],
            thresholds: FailoverThresholds::default(),
            settle: Duration::from_secs(300),
            fact_max_age: Duration::from_secs(90),
            scale_factor: 1.5,
        };
        let controller = FailoverController::new(registry, metrics, settings)
            .with_retry_policy(RetryPolicy::exponential(1, Duration::ZERO));
        Harness {
            clock,
            store,
            controller,
        }
    }

    fn put_node(store: &StateStore, region: &str, id: &str) {
        let mut node = NodeRecord::launching(id, region, "model-a", "x:1");
        node.state = NodeState::Available;
        store.put(node).unwrap();
    }

    /// `healthy` of `total` local nodes report HEALTHY right now.
    fn set_local_health(h: &Harness, healthy: u32, total: u32) {
        let now = h.clock.now_ms();
        for i in 0..total {
            let id = format!("local-{i}");
            put_node(&h.store, LOCAL, &id);
            let status = if i < healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            };
            h.store
                .put(RoutingFact {
                    node_id: id,
                    region: LOCAL.into(),
                    pool: "model-a".into(),
                    routing_score: if i < healthy { 90.0 } else { 0.0 },
                    queue_depth: 0,
                    avg_latency_ms: 10.0,
                    health_status: status,
                    consecutive_failures: 0,
                    last_updated_ms: now,
                })
                .unwrap();
        }
    }

    fn seed_peers(h: &Harness) {
        put_node(&h.store, "us-east-2", "east2-a");
        put_node(&h.store, "us-west-2", "west2-a");
    }

    fn intents(store: &StateStore, target: &str) -> Vec<ScaleIntent> {
        store
            .query(&Query::on(index::TARGET_TIME, target))
            .unwrap()
    }

    #[tokio::test]
    async fn healthy_region_stays_local() {
        let mut h = harness();
        seed_peers(&h);
        set_local_health(&h, 9, 10);

        let snapshot = h.controller.run_cycle().await.unwrap();
        assert_eq!(snapshot.state, FailoverState::Normal);
        assert_eq!(snapshot.traffic, TrafficPreference::all_local());
        assert_eq!(snapshot.healthy_ratio, 0.9);

        let stored = h.store.get::<RegionSnapshot>(LOCAL).unwrap().unwrap();
        assert_eq!(stored, snapshot);
    }

    #[tokio::test]
    async fn collapse_triggers_failover_and_scale_intents() {
        let mut h = harness();
        seed_peers(&h);
        set_local_health(&h, 2, 10);

        let snapshot = h.controller.run_cycle().await.unwrap();
        assert_eq!(snapshot.state, FailoverState::FailoverActive);
        assert_eq!(snapshot.traffic.local_percent, 5.0);
        assert_eq!(snapshot.traffic.peers[0].region, "us-east-2");
        assert_eq!(snapshot.traffic.peers[0].percent, 80.0);
        assert_eq!(snapshot.traffic.peers[1].region, "us-west-2");
        assert_eq!(snapshot.traffic.peers[1].percent, 15.0);

        for target in ["us-east-2", "us-west-2"] {
            let found = intents(&h.store, target);
            assert_eq!(found.len(), 1, "{target}");
            assert_eq!(found[0].source_region, LOCAL);
            assert_eq!(found[0].factor, 1.5);
        }

        let events =
            mrgc_metrics::samples(&h.store, names::FAILOVER_EVENT, LOCAL, 0).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn degraded_band_and_hysteresis() {
        let mut h = harness();
        seed_peers(&h);
        set_local_health(&h, 4, 10);
        let s = h.controller.run_cycle().await.unwrap();
        assert_eq!(s.state, FailoverState::Degraded);
        assert_eq!(s.traffic.local_percent, 70.0);
        assert!(intents(&h.store, "us-east-2").is_empty());

        h.clock.advance(Duration::from_secs(60));
        set_local_health(&h, 6, 10);
        let s = h.controller.run_cycle().await.unwrap();
        assert_eq!(s.state, FailoverState::Degraded);
    }

    #[tokio::test]
    async fn recovery_settles_before_normal() {
        let mut h = harness();
        seed_peers(&h);
        set_local_health(&h, 1, 10);
        h.controller.run_cycle().await.unwrap();

        h.clock.advance(Duration::from_secs(60));
        set_local_health(&h, 9, 10);
        let s = h.controller.run_cycle().await.unwrap();
        assert_eq!(s.state, FailoverState::Recovering);
        assert_eq!(s.traffic.local_percent, 50.0);
        assert_eq!(intents(&h.store, "us-east-2").len(), 2);

        h.clock.advance(Duration::from_secs(60));
        set_local_health(&h, 9, 10);
        let s = h.controller.run_cycle().await.unwrap();
        assert_eq!(s.state, FailoverState::Recovering);

        h.clock.advance(Duration::from_secs(240));
        set_local_health(&h, 9, 10);
        let s = h.controller.run_cycle().await.unwrap();
        assert_eq!(s.state, FailoverState::Normal);
        assert_eq!(s.traffic, TrafficPreference::all_local());

        let complete =
            mrgc_metrics::samples(&h.store, names::FAILOVER_COMPLETE, LOCAL, 0).unwrap();
        assert_eq!(complete.len(), 1);
    }

    #[tokio::test]
    async fn failing_peer_is_not_a_target() {
        let mut h = harness();
        seed_peers(&h);
        h.store
            .put(RegionSnapshot {
                region: "us-east-2".into(),
                state: FailoverState::FailoverActive,
                healthy_nodes: 0,
                total_nodes: 1,
                healthy_ratio: 0.0,
                traffic: TrafficPreference::all_local(),
                state_since_ms: T0,
                updated_at_ms: T0,
            })
            .unwrap();
        set_local_health(&h, 0, 10);

        let s = h.controller.run_cycle().await.unwrap();
        assert_eq!(s.traffic.peers.len(), 1);
        assert_eq!(s.traffic.peers[0].region, "us-west-2");
        assert_eq!(s.traffic.peers[0].percent, 95.0);
        assert!(intents(&h.store, "us-east-2").is_empty());
    }

    #[tokio::test]
    async fn empty_region_fails_over() {
        let mut h = harness();
        seed_peers(&h);
        let s = h.controller.run_cycle().await.unwrap();
        assert_eq!(s.total_nodes, 0);
        assert_eq!(s.state, FailoverState::FailoverActive);
    }

    #[tokio::test]
    async fn no_targets_keeps_traffic_local() {
        let mut h = harness();
        set_local_health(&h, 1, 10);
        let s = h.controller.run_cycle().await.unwrap();
        assert_eq!(s.state, FailoverState::FailoverActive);
        assert_eq!(s.traffic, TrafficPreference::all_local());
    }

    #[tokio::test]
    async fn restore_resumes_published_state() {
        let mut h = harness();
        seed_peers(&h);
        set_local_health(&h, 1, 10);
        h.controller.run_cycle().await.unwrap();

        let registry = NodeRegistry::new(h.store.clone());
        let metrics = MetricsRecorder::new(h.store.clone());
        let mut fresh = FailoverController::new(registry, metrics, h.controller.settings.clone());
        assert_eq!(fresh.restore().unwrap(), Some(FailoverState::FailoverActive));
        assert_eq!(fresh.state(), FailoverState::FailoverActive);
        assert!(fresh.last_known_good().is_some());
    }
}
