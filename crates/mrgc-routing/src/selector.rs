//! Best-N node selection.
//!
//! A node is a candidate only if it is AVAILABLE, in the requested pool,
//! and has a fresh routing fact that is not UNHEALTHY. A missing or expired
//! fact means "unknown", and unknown nodes are never selected.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use mrgc_state::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A node the router may send the next request to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCandidate {
    pub node_id: NodeId,
    pub region: String,
    pub pool: String,
    pub address: String,
    pub routing_score: f64,
    pub queue_depth: u32,
    pub avg_latency_ms: f64,
    pub health_status: HealthStatus,
}

/// Rank candidates best first.
///
/// Order: score descending, then queue depth ascending, then latency
/// ascending, then node id for a stable result.
pub fn rank_candidates(
    nodes: &[NodeRecord],
    facts: &[RoutingFact],
    pool: &str,
    now_ms: u64,
    max_fact_age: Duration,
    limit: usize,
) -> Vec<RouteCandidate> {
    let oldest = now_ms.saturating_sub(max_fact_age.as_millis() as u64);
    let facts: HashMap<&str, &RoutingFact> = facts
        .iter()
        .filter(|f| f.last_updated_ms >= oldest)
        .filter(|f| f.health_status != HealthStatus::Unhealthy && f.routing_score > 0.0)
        .map(|f| (f.node_id.as_str(), f))
        .collect();

    let mut candidates: Vec<RouteCandidate> = nodes
        .iter()
        .filter(|n| n.state == NodeState::Available && n.pool == pool)
        .filter_map(|n| {
            let fact = facts.get(n.node_id.as_str())?;
            Some(RouteCandidate {
                node_id: n.node_id.clone(),
                region: n.region.clone(),
                pool: n.pool.clone(),
                address: n.address.clone(),
                routing_score: fact.routing_score,
                queue_depth: fact.queue_depth,
                avg_latency_ms: fact.avg_latency_ms,
                health_status: fact.health_status,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.routing_score
            .partial_cmp(&a.routing_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.queue_depth.cmp(&b.queue_depth))
            .then_with(|| {
                a.avg_latency_ms
                    .partial_cmp(&b.avg_latency_ms)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    candidates.truncate(limit);
    candidates
}

/// Runs [`rank_candidates`] over the facts currently in the store.
#[derive(Clone)]
pub struct RouteSelector {
    store: StateStore,
    max_fact_age: Duration,
}

impl RouteSelector {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            max_fact_age: Duration::from_secs(3600),
        }
    }

    /// Treat facts older than this as missing, even if not yet expired.
    pub fn with_max_fact_age(mut self, age: Duration) -> Self {
        self.max_fact_age = age;
        self
    }

    /// The `limit` best nodes of `pool` in `region`.
    pub fn best_nodes(
        &self,
        region: &str,
        pool: &str,
        limit: usize,
    ) -> StateResult<Vec<RouteCandidate>> {
        let nodes: Vec<NodeRecord> = self.store.query(&Query::on(index::REGION, region))?;
        let facts: Vec<RoutingFact> = self
            .store
            .query(&Query::on(index::REGION_SCORE, region).descending())?;
        let now = self.store.clock().now_ms();
        let ranked = rank_candidates(&nodes, &facts, pool, now, self.max_fact_age, limit);
        debug!(%region, %pool, limit, returned = ranked.len(), "best nodes selected");
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::routing_score;
    use mrgc_core::ManualClock;

    const T0: u64 = 1_700_000_000_000;

    fn node(id: &str, state: NodeState) -> NodeRecord {
        let mut n = NodeRecord::launching(id, "us-east-1", "model-a", format!("{id}:8080"));
        n.state = state;
        n
    }

    fn fact(id: &str, depth: u32, latency: f64, status: HealthStatus, at: u64) -> RoutingFact {
        RoutingFact {
            node_id: id.into(),
            region: "us-east-1".into(),
            pool: "model-a".into(),
            routing_score: routing_score(depth, latency, status),
            queue_depth: depth,
            avg_latency_ms: latency,
            health_status: status,
            consecutive_failures: 0,
            last_updated_ms: at,
        }
    }

    fn ids(c: &[RouteCandidate]) -> Vec<&str> {
        c.iter().map(|c| c.node_id.as_str()).collect()
    }

    #[test]
    fn sorted_by_score_then_queue_then_latency() {
        let nodes = vec![
            node("a", NodeState::Available),
            node("b", NodeState::Available),
            node("c", NodeState::Available),
        ];
        let mut facts = vec![
            fact("a", 4, 100.0, HealthStatus::Healthy, T0),
            fact("b", 2, 100.0, HealthStatus::Healthy, T0),
            fact("c", 3, 100.0, HealthStatus::Healthy, T0),
        ];
        // Force a score tie between a and c.
        facts[0].routing_score = 70.0;
        facts[2].routing_score = 70.0;

        let ranked = rank_candidates(&nodes, &facts, "model-a", T0, Duration::from_secs(60), 10);
        assert_eq!(ids(&ranked), vec!["b", "c", "a"]);
    }

    #[test]
    fn latency_breaks_equal_queue_ties() {
        let nodes = vec![node("a", NodeState::Available), node("b", NodeState::Available)];
        let mut facts = vec![
            fact("a", 2, 300.0, HealthStatus::Healthy, T0),
            fact("b", 2, 100.0, HealthStatus::Healthy, T0),
        ];
        facts[0].routing_score = 50.0;
        facts[1].routing_score = 50.0;
        let ranked = rank_candidates(&nodes, &facts, "model-a", T0, Duration::from_secs(60), 10);
        assert_eq!(ids(&ranked), vec!["b", "a"]);
    }

    #[test]
    fn excludes_unknown_stale_unhealthy_and_unavailable() {
        let nodes = vec![
            node("ok", NodeState::Available),
            node("missing", NodeState::Available),
            node("stale", NodeState::Available),
            node("sick", NodeState::Available),
            node("draining", NodeState::Draining),
        ];
        let facts = vec![
            fact("ok", 1, 50.0, HealthStatus::Degraded, T0),
            fact("stale", 0, 0.0, HealthStatus::Healthy, T0 - 120_000),
            fact("sick", 0, 0.0, HealthStatus::Unhealthy, T0),
            fact("draining", 0, 0.0, HealthStatus::Healthy, T0),
        ];
        let ranked = rank_candidates(&nodes, &facts, "model-a", T0, Duration::from_secs(60), 10);
        assert_eq!(ids(&ranked), vec!["ok"]);
    }

    #[test]
    fn pool_must_match() {
        let nodes = vec![node("a", NodeState::Available)];
        let facts = vec![fact("a", 0, 0.0, HealthStatus::Healthy, T0)];
        let ranked = rank_candidates(&nodes, &facts, "model-b", T0, Duration::from_secs(60), 10);
        assert!(ranked.is_empty());
    }

    #[test]
    fn best_five_of_fifty_from_store() {
        let (_clock, shared) = ManualClock::shared(T0);
        let store = StateStore::open_in_memory().unwrap().with_clock(shared);

        for i in 0..50u32 {
            let id = format!("n{i:02}");
            store.put(node(&id, NodeState::Available)).unwrap();
            if i < 45 {
                store
                    .put(fact(&id, i % 10, 100.0 + f64::from(i) * 10.0, HealthStatus::Healthy, T0))
                    .unwrap();
            }
        }
        // n45..n49 have no routing fact and are never candidates.
        let selector = RouteSelector::new(store);
        let best = selector.best_nodes("us-east-1", "model-a", 5).unwrap();

        assert_eq!(best.len(), 5);
        assert_eq!(ids(&best), vec!["n00", "n10", "n01", "n20", "n11"]);
        assert!(best.iter().all(|c| c.node_id.as_str() < "n45"));
        for pair in best.windows(2) {
            assert!(pair[0].routing_score >= pair[1].routing_score);
        }
    }

    #[test]
    fn expired_facts_are_never_selected() {
        let (clock, shared) = ManualClock::shared(T0);
        let store = StateStore::open_in_memory().unwrap().with_clock(shared);
        store.put(node("a", NodeState::Available)).unwrap();
        store.put(fact("a", 0, 10.0, HealthStatus::Healthy, T0)).unwrap();

        let selector = RouteSelector::new(store);
        assert_eq!(selector.best_nodes("us-east-1", "model-a", 1).unwrap().len(), 1);

        clock.advance(Duration::from_secs(3600));
        assert!(selector.best_nodes("us-east-1", "model-a", 1).unwrap().is_empty());
    }
}
