//! Region health aggregation.
//!
//! The monitored set of a region is its AVAILABLE and DRAINING nodes. A node
//! counts as healthy only with a fresh HEALTHY routing fact; a node with no
//! fact, or one older than the freshness window, is unknown and therefore
//! not healthy.

use std::collections::HashMap;
use std::time::Duration;

use mrgc_state::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionHealth {
    pub region: String,
    pub total_nodes: u32,
    pub healthy_nodes: u32,
    pub degraded_nodes: u32,
    pub unhealthy_nodes: u32,
    pub unknown_nodes: u32,
    /// `healthy / total`; 0.0 when the region has no monitored nodes.
    pub healthy_ratio: f64,
}

impl RegionHealth {
    /// Aggregate from already-loaded nodes and facts.
    pub fn from_facts(
        region: &str,
        nodes: &[NodeRecord],
        facts: &[RoutingFact],
        now_ms: u64,
        max_fact_age: Duration,
    ) -> Self {
        let oldest = now_ms.saturating_sub(max_fact_age.as_millis() as u64);
        let fresh: HashMap<&str, HealthStatus> = facts
            .iter()
            .filter(|f| f.last_updated_ms >= oldest)
            .map(|f| (f.node_id.as_str(), f.health_status))
            .collect();

        let mut health = RegionHealth {
            region: region.to_string(),
            total_nodes: 0,
            healthy_nodes: 0,
            degraded_nodes: 0,
            unhealthy_nodes: 0,
            unknown_nodes: 0,
            healthy_ratio: 0.0,
        };

        for node in nodes.iter().filter(|n| {
            n.region == region && matches!(n.state, NodeState::Available | NodeState::Draining)
        }) {
            health.total_nodes += 1;
            match fresh.get(node.node_id.as_str()) {
                Some(HealthStatus::Healthy) => health.healthy_nodes += 1,
                Some(HealthStatus::Degraded) => health.degraded_nodes += 1,
                Some(HealthStatus::Unhealthy) => health.unhealthy_nodes += 1,
                None => health.unknown_nodes += 1,
            }
        }

        if health.total_nodes > 0 {
            health.healthy_ratio = f64::from(health.healthy_nodes) / f64::from(health.total_nodes);
        }
        health
    }

    /// Aggregate from whatever the store currently holds for `region`.
    pub fn from_store(
        store: &StateStore,
        region: &str,
        max_fact_age: Duration,
    ) -> StateResult<Self> {
        let nodes: Vec<NodeRecord> = store.query(&Query::on(index::REGION, region))?;
        let facts: Vec<RoutingFact> = store.query(&Query::on(index::REGION_SCORE, region))?;
        Ok(Self::from_facts(
            region,
            &nodes,
            &facts,
            store.clock().now_ms(),
            max_fact_age,
        ))
    }
}
