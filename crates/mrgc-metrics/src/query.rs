//! Read-side metric queries.
//!
//! All windows are measured back from the store clock.

use std::collections::HashMap;
use std::time::Duration;

use mrgc_state::*;

use crate::recorder::names;

/// Samples of `name` in `region` at or after `since_ms`, oldest first.
pub fn samples(
    store: &StateStore,
    name: &str,
    region: &str,
    since_ms: u64,
) -> StateResult<Vec<MetricSample>> {
    store.query(&Query::on(index::NAME_REGION, metric_partition(name, region)).since(since_ms))
}

fn window_start(store: &StateStore, window: Duration) -> u64 {
    store
        .clock()
        .now_ms()
        .saturating_sub(window.as_millis() as u64)
}

fn matches(sample: &MetricSample, filter: &[(&str, &str)]) -> bool {
    filter
        .iter()
        .all(|(k, v)| sample.dimension(k) == Some(*v))
}

/// Mean of the samples in the trailing `window` whose dimensions match
/// `filter`. `None` when there are no such samples.
pub fn rolling_average(
    store: &StateStore,
    name: &str,
    region: &str,
    window: Duration,
    filter: &[(&str, &str)],
) -> StateResult<Option<f64>> {
    let values: Vec<f64> = samples(store, name, region, window_start(store, window))?
        .into_iter()
        .filter(|s| matches(s, filter))
        .map(|s| s.value)
        .collect();
    if values.is_empty() {
        return Ok(None);
    }
    Ok(Some(values.iter().sum::<f64>() / values.len() as f64))
}

/// Latest value per distinct `key` dimension in the window.
fn latest_by(samples: Vec<MetricSample>, key: &str) -> HashMap<String, f64> {
    let mut latest: HashMap<String, (u64, f64)> = HashMap::new();
    for s in samples {
        let Some(k) = s.dimension(key) else { continue };
        let entry = latest.entry(k.to_string()).or_insert((s.timestamp_ms, s.value));
        if s.timestamp_ms >= entry.0 {
            *entry = (s.timestamp_ms, s.value);
        }
    }
    latest.into_iter().map(|(k, (_, v))| (k, v)).collect()
}

/// Region-wide RPS: the sum of each pool's latest reading in the window.
pub fn cluster_rps(store: &StateStore, region: &str, window: Duration) -> StateResult<f64> {
    let recent = samples(store, names::RPS, region, window_start(store, window))?;
    Ok(latest_by(recent, "pool").values().sum())
}

/// Mean of each node's latest queue depth in the window.
pub fn average_queue_depth(
    store: &StateStore,
    region: &str,
    window: Duration,
) -> StateResult<Option<f64>> {
    let recent = samples(store, names::QUEUE_DEPTH, region, window_start(store, window))?;
    let per_node = latest_by(recent, "node_id");
    if per_node.is_empty() {
        return Ok(None);
    }
    Ok(Some(per_node.values().sum::<f64>() / per_node.len() as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::MetricsRecorder;
    use mrgc_core::ManualClock;

    const T0: u64 = 1_700_000_000_000;

    fn setup() -> (std::sync::Arc<ManualClock>, MetricsRecorder) {
        let (clock, shared) = ManualClock::shared(T0);
        let store = StateStore::open_in_memory().unwrap().with_clock(shared);
        (clock, MetricsRecorder::new(store))
    }

    #[tokio::test]
    async fn rolling_average_respects_window_and_filter() {
        let (clock, recorder) = setup();
        recorder.record_rps("r", "a", 100.0).await.unwrap();
        clock.advance(Duration::from_secs(400));
        recorder.record_rps("r", "a", 10.0).await.unwrap();
        clock.advance(Duration::from_secs(60));
        recorder.record_rps("r", "a", 20.0).await.unwrap();
        recorder.record_rps("r", "b", 500.0).await.unwrap();
        recorder.record_rps("other", "a", 900.0).await.unwrap();

        let store = recorder.store();
        let avg = rolling_average(store, names::RPS, "r", Duration::from_secs(300), &[("pool", "a")])
            .unwrap();
        assert_eq!(avg, Some(15.0));

        let none = rolling_average(store, names::RPS, "r", Duration::from_secs(300), &[("pool", "c")])
            .unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn cluster_rps_sums_latest_per_pool() {
        let (clock, recorder) = setup();
        recorder.record_rps("r", "a", 5.0).await.unwrap();
        recorder.record_rps("r", "b", 7.0).await.unwrap();
        clock.advance(Duration::from_secs(30));
        recorder.record_rps("r", "a", 6.0).await.unwrap();

        let total = cluster_rps(recorder.store(), "r", Duration::from_secs(300)).unwrap();
        assert_eq!(total, 13.0);
    }

    #[tokio::test]
    async fn average_queue_depth_uses_latest_per_node() {
        let (clock, recorder) = setup();
        recorder.record_queue_depth("r", "p", "n1", 10).await.unwrap();
        clock.advance(Duration::from_secs(5));
        recorder.record_queue_depth("r", "p", "n1", 2).await.unwrap();
        recorder.record_queue_depth("r", "p", "n2", 4).await.unwrap();

        let avg = average_queue_depth(recorder.store(), "r", Duration::from_secs(60)).unwrap();
        assert_eq!(avg, Some(3.0));
        let empty = average_queue_depth(recorder.store(), "nowhere", Duration::from_secs(60)).unwrap();
        assert_eq!(empty, None);
    }
}
