//! Record types persisted in the global state store.
//!
//! Every type has exactly one writer role. All are JSON-serialized into
//! redb value columns inside a [`Stored`](crate::Stored) envelope.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identifier for a worker node.
pub type NodeId = String;

// ── Nodes ──────────────────────────────────────────────────────────

/// Lifecycle state of a worker node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Launching,
    Available,
    Draining,
    Quarantined,
    Terminated,
}

impl NodeState {
    pub const ALL: [NodeState; 5] = [
        NodeState::Launching,
        NodeState::Available,
        NodeState::Draining,
        NodeState::Quarantined,
        NodeState::Terminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Launching => "LAUNCHING",
            NodeState::Available => "AVAILABLE",
            NodeState::Draining => "DRAINING",
            NodeState::Quarantined => "QUARANTINED",
            NodeState::Terminated => "TERMINATED",
        }
    }

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Quarantined | NodeState::Terminated)
    }

    /// States that count toward provisioned capacity.
    pub fn counts_as_capacity(&self) -> bool {
        matches!(self, NodeState::Launching | NodeState::Available)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown node state: {s}"))
    }
}

/// A worker node as tracked by the node registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub region: String,
    pub pool: String,
    /// `host:port` the health probe connects to.
    pub address: String,
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub zone: String,
    pub state: NodeState,
    /// Requests currently in flight on the node.
    pub queue_depth: u32,
    /// Unix milliseconds of the last accepted heartbeat.
    pub last_heartbeat_ms: u64,
    pub launch_time_ms: u64,
    /// Unix milliseconds of the most recent entry into `DRAINING`. A cleanup
    /// record older than this does not cover the current drain.
    #[serde(default)]
    pub drained_at_ms: u64,
    /// Why the node entered its current state, when known.
    #[serde(default)]
    pub state_reason: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl NodeRecord {
    /// A freshly launched node.
    pub fn launching(
        node_id: impl Into<String>,
        region: impl Into<String>,
        pool: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            region: region.into(),
            pool: pool.into(),
            address: address.into(),
            subnet: String::new(),
            zone: String::new(),
            state: NodeState::Launching,
            queue_depth: 0,
            last_heartbeat_ms: 0,
            launch_time_ms: 0,
            drained_at_ms: 0,
            state_reason: None,
            metadata: HashMap::new(),
        }
    }
}

// ── Routing facts ──────────────────────────────────────────────────

/// Health classification written by the health monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unhealthy => "UNHEALTHY",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node snapshot used for routing decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingFact {
    pub node_id: NodeId,
    pub region: String,
    pub pool: String,
    /// 0–100; 0 means "send no traffic".
    pub routing_score: f64,
    pub queue_depth: u32,
    pub avg_latency_ms: f64,
    pub health_status: HealthStatus,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub last_updated_ms: u64,
}

// ── Scaling ────────────────────────────────────────────────────────

/// Action chosen by one autoscaler evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
    None,
}

impl ScaleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleAction::ScaleUp => "SCALE_UP",
            ScaleAction::ScaleDown => "SCALE_DOWN",
            ScaleAction::None => "NONE",
        }
    }
}

impl fmt::Display for ScaleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One autoscaler decision, appended for audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingRecord {
    pub pool: String,
    pub region: String,
    pub timestamp_ms: u64,
    pub current_capacity: u32,
    pub desired_capacity: u32,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub current_rps: f64,
    pub target_rps_per_node: f64,
    pub action: ScaleAction,
    pub reason: String,
    /// Set when the decision came from a failover scale intent.
    #[serde(default)]
    pub failover_triggered: bool,
}

// ── Cleanup ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanupStatus {
    Pending,
    Passed,
    Failed,
}

impl CleanupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupStatus::Pending => "PENDING",
            CleanupStatus::Passed => "PASSED",
            CleanupStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CleanupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a node cleanup validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanupRecord {
    pub node_id: NodeId,
    pub timestamp_ms: u64,
    pub status: CleanupStatus,
    pub compute_memory_wiped: bool,
    pub system_memory_wiped: bool,
    pub secure_compute_restarted: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Hex SHA-256 over the identifying fields and check results.
    #[serde(default)]
    pub integrity: String,
}

impl CleanupRecord {
    pub fn all_checks_passed(&self) -> bool {
        self.compute_memory_wiped && self.system_memory_wiped && self.secure_compute_restarted
    }
}

// ── Metrics ────────────────────────────────────────────────────────

/// A single numeric observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub timestamp_ms: u64,
    pub region: String,
    pub value: f64,
    pub unit: String,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

impl MetricSample {
    pub fn dimension(&self, key: &str) -> Option<&str> {
        self.dimensions.get(key).map(String::as_str)
    }
}

// ── Region decisions ───────────────────────────────────────────────

/// Failover state of a region.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailoverState {
    #[default]
    Normal,
    Degraded,
    FailoverActive,
    Recovering,
}

impl FailoverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverState::Normal => "NORMAL",
            FailoverState::Degraded => "DEGRADED",
            FailoverState::FailoverActive => "FAILOVER_ACTIVE",
            FailoverState::Recovering => "RECOVERING",
        }
    }

    /// Numeric code for the Prometheus gauge.
    pub fn code(&self) -> u8 {
        match self {
            FailoverState::Normal => 0,
            FailoverState::Degraded => 1,
            FailoverState::FailoverActive => 2,
            FailoverState::Recovering => 3,
        }
    }
}

impl fmt::Display for FailoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Share of traffic sent to one peer region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerShare {
    pub region: String,
    pub percent: f64,
}

/// How much of a region's traffic it should keep, and where the rest goes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficPreference {
    pub local_percent: f64,
    #[serde(default)]
    pub peers: Vec<PeerShare>,
}

impl TrafficPreference {
    pub fn all_local() -> Self {
        Self {
            local_percent: 100.0,
            peers: Vec::new(),
        }
    }

    pub fn total_percent(&self) -> f64 {
        self.local_percent + self.peers.iter().map(|p| p.percent).sum::<f64>()
    }
}

impl Default for TrafficPreference {
    fn default() -> Self {
        Self::all_local()
    }
}

/// Latest failover decision for a region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionSnapshot {
    pub region: String,
    pub state: FailoverState,
    pub healthy_nodes: u32,
    pub total_nodes: u32,
    pub healthy_ratio: f64,
    pub traffic: TrafficPreference,
    /// When the region entered `state`.
    pub state_since_ms: u64,
    pub updated_at_ms: u64,
}

/// Request from a failing region for a peer to add capacity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScaleIntent {
    pub target_region: String,
    pub source_region: String,
    pub timestamp_ms: u64,
    /// Capacity multiplier, e.g. 1.5.
    pub factor: f64,
    pub reason: String,
}
