//! Metric sample writer.

use std::collections::BTreeMap;

use mrgc_state::*;
use tracing::debug;

/// Well-known metric names.
pub mod names {
    /// Requests per second served by a pool; dimension `pool`.
    pub const RPS: &str = "rps";
    /// In-flight requests on a node; dimensions `pool`, `node_id`.
    pub const QUEUE_DEPTH: &str = "queue_depth";
    pub const HEALTHY_RATIO: &str = "healthy_ratio";
    pub const CLEANUP_PASSED: &str = "cleanup_passed";
    pub const CLEANUP_FAILED: &str = "cleanup_failed";
    /// Region entered FAILOVER_ACTIVE.
    pub const FAILOVER_EVENT: &str = "failover_event";
    /// Region left FAILOVER_ACTIVE for RECOVERING.
    pub const FAILOVER_RECOVERY: &str = "failover_recovery";
    /// Region returned to NORMAL after a failover.
    pub const FAILOVER_COMPLETE: &str = "failover_complete";
}

/// Appends metric samples to the store.
#[derive(Clone)]
pub struct MetricsRecorder {
    store: StateStore,
    retry: RetryPolicy,
}

impl MetricsRecorder {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Record one observation, timestamped by the store clock.
    pub async fn record(
        &self,
        name: &str,
        region: &str,
        value: f64,
        unit: &str,
        dimensions: &[(&str, &str)],
    ) -> StateResult<MetricSample> {
        let sample = MetricSample {
            name: name.to_string(),
            timestamp_ms: self.store.clock().now_ms(),
            region: region.to_string(),
            value,
            unit: unit.to_string(),
            dimensions: dimensions
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        };
        retry(&self.retry, "put metric", || self.store.put(sample.clone())).await?;
        debug!(%name, %region, value, "metric recorded");
        Ok(sample)
    }

    pub async fn record_rps(&self, region: &str, pool: &str, rps: f64) -> StateResult<MetricSample> {
        self.record(names::RPS, region, rps, "Count/Second", &[("pool", pool)])
            .await
    }

    pub async fn record_queue_depth(
        &self,
        region: &str,
        pool: &str,
        node_id: &str,
        depth: u32,
    ) -> StateResult<MetricSample> {
        self.record(
            names::QUEUE_DEPTH,
            region,
            f64::from(depth),
            "Count",
            &[("pool", pool), ("node_id", node_id)],
        )
        .await
    }

    pub async fn record_healthy_ratio(&self, region: &str, ratio: f64) -> StateResult<MetricSample> {
        self.record(names::HEALTHY_RATIO, region, ratio, "Ratio", &[])
            .await
    }

    /// One cleanup validation outcome.
    pub async fn record_cleanup(
        &self,
        region: &str,
        node_id: &str,
        passed: bool,
    ) -> StateResult<MetricSample> {
        let name = if passed {
            names::CLEANUP_PASSED
        } else {
            names::CLEANUP_FAILED
        };
        self.record(name, region, 1.0, "Count", &[("node_id", node_id)])
            .await
    }

    /// A failover state change worth alerting on.
    pub async fn record_failover(
        &self,
        name: &str,
        region: &str,
        from: FailoverState,
        to: FailoverState,
        healthy_ratio: f64,
    ) -> StateResult<MetricSample> {
        self.record(
            name,
            region,
            healthy_ratio,
            "Ratio",
            &[("from", from.as_str()), ("to", to.as_str())],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrgc_core::ManualClock;

    const T0: u64 = 1_700_000_000_000;

    fn recorder() -> MetricsRecorder {
        let (_clock, shared) = ManualClock::shared(T0);
        let store = StateStore::open_in_memory().unwrap().with_clock(shared);
        MetricsRecorder::new(store)
    }

    #[tokio::test]
    async fn record_stamps_and_tags() {
        let recorder = recorder();
        let sample = recorder.record_rps("us-east-1", "model-a", 12.5).await.unwrap();
        assert_eq!(sample.timestamp_ms, T0);
        assert_eq!(sample.dimension("pool"), Some("model-a"));

        let stored: Vec<MetricSample> = recorder
            .store()
            .query(&Query::on(
                index::NAME_REGION,
                metric_partition(names::RPS, "us-east-1"),
            ))
            .unwrap();
        assert_eq!(stored, vec![sample]);
    }

    #[tokio::test]
    async fn cleanup_outcome_picks_series() {
        let recorder = recorder();
        let failed = recorder.record_cleanup("r", "n1", false).await.unwrap();
        assert_eq!(failed.name, names::CLEANUP_FAILED);
        let passed = recorder.record_cleanup("r", "n2", true).await.unwrap();
        assert_eq!(passed.name, names::CLEANUP_PASSED);
    }

    #[tokio::test]
    async fn failover_sample_carries_transition() {
        let recorder = recorder();
        let s = recorder
            .record_failover(
                names::FAILOVER_EVENT,
                "r",
                FailoverState::Degraded,
                FailoverState::FailoverActive,
                0.2,
            )
            .await
            .unwrap();
        assert_eq!(s.dimension("from"), Some("DEGRADED"));
        assert_eq!(s.dimension("to"), Some("FAILOVER_ACTIVE"));
        assert_eq!(s.value, 0.2);
    }
}
