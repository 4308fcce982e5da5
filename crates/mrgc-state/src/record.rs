//! The `Record` trait ties each record type to its tables, primary key,
//! secondary indexes and retention.

use std::time::Duration;

use mrgc_core::ControlPlaneConfig;
use redb::TableDefinition;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::tables::*;
use crate::types::*;

/// One secondary index entry of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub index: &'static str,
    pub partition: String,
    pub sort: u64,
}

impl IndexEntry {
    pub fn new(index: &'static str, partition: impl Into<String>, sort: u64) -> Self {
        Self {
            index,
            partition: partition.into(),
            sort,
        }
    }
}

/// Store-assigned metadata carried alongside every record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordMeta {
    /// Writer clock at the time of the write; the last-writer-wins key.
    pub written_at_ms: u64,
    pub expires_at_ms: Option<u64>,
    /// Region whose control plane performed the write.
    pub origin_region: String,
}

impl RecordMeta {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }

    /// Whether a write carrying `self` supersedes one carrying `other`.
    pub fn supersedes(&self, other: &RecordMeta) -> bool {
        (self.written_at_ms, self.origin_region.as_str())
            > (other.written_at_ms, other.origin_region.as_str())
    }
}

/// The envelope persisted in every primary table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stored<R> {
    pub record: R,
    pub meta: RecordMeta,
}

/// Retention applied at write time.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlPolicy {
    pub node: Duration,
    pub terminated_grace: Duration,
    pub routing_fact: Duration,
    pub scaling: Duration,
    pub cleanup: Duration,
    pub metric: Duration,
    pub scale_intent: Duration,
}

const DAY: Duration = Duration::from_secs(24 * 3600);

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            node: DAY * 7,
            terminated_grace: Duration::from_secs(3600),
            routing_fact: Duration::from_secs(3600),
            scaling: DAY * 30,
            cleanup: DAY * 90,
            metric: DAY * 30,
            scale_intent: Duration::from_secs(15 * 60),
        }
    }
}

impl TtlPolicy {
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self {
            terminated_grace: Duration::from_secs(config.terminated_grace_s),
            routing_fact: Duration::from_secs(config.routing_fact_ttl_s),
            ..Self::default()
        }
    }
}

/// A record type the store knows how to persist and index.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Human-readable type name for logs and errors.
    const KIND: &'static str;
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]>;
    const INDEX_TABLE: TableDefinition<'static, &'static str, &'static str>;

    fn key(&self) -> String;

    fn index_entries(&self) -> Vec<IndexEntry> {
        Vec::new()
    }

    /// Time to live from the moment of writing; `None` never expires.
    fn ttl(&self, policy: &TtlPolicy) -> Option<Duration>;

    /// Whether `self` must win a replication merge against `other`
    /// whatever their write order.
    fn dominates(&self, _other: &Self) -> bool {
        false
    }
}

/// Secondary index names.
pub mod index {
    pub const REGION: &str = "region";
    pub const POOL: &str = "pool";
    pub const STATE: &str = "state";
    pub const REGION_SCORE: &str = "region_score";
    pub const REGION_TIME: &str = "region_time";
    pub const POOL_TIME: &str = "pool_time";
    pub const NODE_TIME: &str = "node_time";
    pub const STATUS_TIME: &str = "status_time";
    pub const NAME_REGION: &str = "name_region";
    pub const TARGET_TIME: &str = "target_time";
}

impl Record for NodeRecord {
    const KIND: &'static str = "node";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = NODES;
    const INDEX_TABLE: TableDefinition<'static, &'static str, &'static str> = NODES_IDX;

    fn key(&self) -> String {
        self.node_id.clone()
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![
            IndexEntry::new(index::REGION, &self.region, self.launch_time_ms),
            IndexEntry::new(index::POOL, &self.pool, self.launch_time_ms),
            IndexEntry::new(index::STATE, self.state.as_str(), self.launch_time_ms),
        ]
    }

    fn ttl(&self, policy: &TtlPolicy) -> Option<Duration> {
        match self.state {
            // A quarantined id must stay visible forever so it is never reused.
            NodeState::Quarantined => None,
            NodeState::Terminated => Some(policy.terminated_grace),
            _ => Some(policy.node),
        }
    }

    /// Quarantine is absorbing across replicas too.
    fn dominates(&self, other: &Self) -> bool {
        self.state == NodeState::Quarantined && other.state != NodeState::Quarantined
    }
}

impl Record for RoutingFact {
    const KIND: &'static str = "routing_fact";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = ROUTING_FACTS;
    const INDEX_TABLE: TableDefinition<'static, &'static str, &'static str> = ROUTING_FACTS_IDX;

    fn key(&self) -> String {
        self.node_id.clone()
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        // Two decimal places of the score, so descending scans rank nodes.
        let sort = (self.routing_score.clamp(0.0, 100.0) * 100.0).round() as u64;
        vec![IndexEntry::new(index::REGION_SCORE, &self.region, sort)]
    }

    fn ttl(&self, policy: &TtlPolicy) -> Option<Duration> {
        Some(policy.routing_fact)
    }
}

impl Record for ScalingRecord {
    const KIND: &'static str = "scaling";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = SCALING;
    const INDEX_TABLE: TableDefinition<'static, &'static str, &'static str> = SCALING_IDX;

    fn key(&self) -> String {
        format!("{}:{:020}:{}", self.pool, self.timestamp_ms, self.region)
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![
            IndexEntry::new(index::REGION_TIME, &self.region, self.timestamp_ms),
            IndexEntry::new(index::POOL_TIME, &self.pool, self.timestamp_ms),
        ]
    }

    fn ttl(&self, policy: &TtlPolicy) -> Option<Duration> {
        Some(policy.scaling)
    }
}

impl Record for CleanupRecord {
    const KIND: &'static str = "cleanup";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = CLEANUP;
    const INDEX_TABLE: TableDefinition<'static, &'static str, &'static str> = CLEANUP_IDX;

    fn key(&self) -> String {
        format!("{}:{:020}", self.node_id, self.timestamp_ms)
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![
            IndexEntry::new(index::STATUS_TIME, self.status.as_str(), self.timestamp_ms),
            IndexEntry::new(index::NODE_TIME, &self.node_id, self.timestamp_ms),
        ]
    }

    fn ttl(&self, policy: &TtlPolicy) -> Option<Duration> {
        Some(policy.cleanup)
    }
}

impl Record for MetricSample {
    const KIND: &'static str = "metric";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = METRICS;
    const INDEX_TABLE: TableDefinition<'static, &'static str, &'static str> = METRICS_IDX;

    fn key(&self) -> String {
        let dims: Vec<String> = self
            .dimensions
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!(
            "{}:{:020}:{}:{}",
            self.name,
            self.timestamp_ms,
            self.region,
            dims.join(",")
        )
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![
            IndexEntry::new(index::REGION_TIME, &self.region, self.timestamp_ms),
            IndexEntry::new(
                index::NAME_REGION,
                metric_partition(&self.name, &self.region),
                self.timestamp_ms,
            ),
        ]
    }

    fn ttl(&self, policy: &TtlPolicy) -> Option<Duration> {
        Some(policy.metric)
    }
}

/// Partition of the `name_region` metric index.
pub fn metric_partition(name: &str, region: &str) -> String {
    format!("{name}@{region}")
}

impl Record for RegionSnapshot {
    const KIND: &'static str = "region";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = REGIONS;
    const INDEX_TABLE: TableDefinition<'static, &'static str, &'static str> = REGIONS_IDX;

    fn key(&self) -> String {
        self.region.clone()
    }

    fn ttl(&self, _policy: &TtlPolicy) -> Option<Duration> {
        None
    }
}

impl Record for ScaleIntent {
    const KIND: &'static str = "scale_intent";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = SCALE_INTENTS;
    const INDEX_TABLE: TableDefinition<'static, &'static str, &'static str> = SCALE_INTENTS_IDX;

    fn key(&self) -> String {
        format!(
            "{}:{:020}:{}",
            self.target_region, self.timestamp_ms, self.source_region
        )
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![IndexEntry::new(
            index::TARGET_TIME,
            &self.target_region,
            self.timestamp_ms,
        )]
    }

    fn ttl(&self, policy: &TtlPolicy) -> Option<Duration> {
        Some(policy.scale_intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lww_ordering_breaks_ties_by_region() {
        let a = RecordMeta {
            written_at_ms: 10,
            expires_at_ms: None,
            origin_region: "us-east-1".into(),
        };
        let mut b = a.clone();
        b.origin_region = "us-west-2".into();
        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));
        assert!(!a.supersedes(&a.clone()));

        let mut later = a.clone();
        later.written_at_ms = 11;
        assert!(later.supersedes(&b));
    }

    #[test]
    fn node_ttl_depends_on_state() {
        let policy = TtlPolicy::default();
        let mut node = NodeRecord::launching("n1", "r", "p", "10.0.0.1:8080");
        assert_eq!(node.ttl(&policy), Some(DAY * 7));
        node.state = NodeState::Terminated;
        assert_eq!(node.ttl(&policy), Some(Duration::from_secs(3600)));
        node.state = NodeState::Quarantined;
        assert_eq!(node.ttl(&policy), None);
    }

    #[test]
    fn quarantined_node_dominates_other_states() {
        let mut quarantined = NodeRecord::launching("n1", "r", "p", "10.0.0.1:8080");
        quarantined.state = NodeState::Quarantined;
        for state in NodeState::ALL {
            let mut other = quarantined.clone();
            other.state = state;
            assert_eq!(quarantined.dominates(&other), state != NodeState::Quarantined);
            assert!(!other.dominates(&quarantined));
        }
    }

    #[test]
    fn metric_keys_distinguish_dimensions() {
        let mut a = MetricSample {
            name: "rps".into(),
            timestamp_ms: 5,
            region: "r".into(),
            value: 1.0,
            unit: "count/s".into(),
            dimensions: Default::default(),
        };
        let mut b = a.clone();
        a.dimensions.insert("pool".into(), "a".into());
        b.dimensions.insert("pool".into(), "b".into());
        assert_ne!(a.key(), b.key());
    }
}
