//! Prometheus text exposition format.
//!
//! Renders region snapshots and the latest scaling decision per pool for
//! scraping by a Prometheus server or compatible agent.

use std::collections::BTreeMap;

use mrgc_state::{RegionSnapshot, ScalingRecord};

fn header(out: &mut String, name: &str, help: &str) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} gauge\n"));
}

/// Render region snapshots and scaling records into Prometheus text format.
///
/// Only the newest scaling record per `(region, pool)` is exported.
pub fn render_prometheus(regions: &[RegionSnapshot], scaling: &[ScalingRecord]) -> String {
    let mut out = String::new();

    header(&mut out, "mrgc_region_healthy_ratio", "Fraction of monitored nodes reporting HEALTHY.");
    for r in regions {
        out.push_str(&format!(
            "mrgc_region_healthy_ratio{{region=\"{}\"}} {:.4}\n",
            r.region, r.healthy_ratio
        ));
    }

    header(&mut out, "mrgc_region_healthy_nodes", "Nodes reporting HEALTHY.");
    for r in regions {
        out.push_str(&format!(
            "mrgc_region_healthy_nodes{{region=\"{}\"}} {}\n",
            r.region, r.healthy_nodes
        ));
    }

    header(&mut out, "mrgc_region_total_nodes", "Monitored nodes (AVAILABLE and DRAINING).");
    for r in regions {
        out.push_str(&format!(
            "mrgc_region_total_nodes{{region=\"{}\"}} {}\n",
            r.region, r.total_nodes
        ));
    }

    header(
        &mut out,
        "mrgc_region_failover_state",
        "Failover state (0 normal, 1 degraded, 2 failover active, 3 recovering).",
    );
    for r in regions {
        out.push_str(&format!(
            "mrgc_region_failover_state{{region=\"{}\",state=\"{}\"}} {}\n",
            r.region,
            r.state,
            r.state.code()
        ));
    }

    header(&mut out, "mrgc_region_local_traffic_percent", "Share of traffic kept in the region.");
    for r in regions {
        out.push_str(&format!(
            "mrgc_region_local_traffic_percent{{region=\"{}\"}} {:.2}\n",
            r.region, r.traffic.local_percent
        ));
    }

    let mut latest: BTreeMap<(&str, &str), &ScalingRecord> = BTreeMap::new();
    for s in scaling {
        let key = (s.region.as_str(), s.pool.as_str());
        match latest.get(&key) {
            Some(existing) if existing.timestamp_ms >= s.timestamp_ms => {}
            _ => {
                latest.insert(key, s);
            }
        }
    }

    header(&mut out, "mrgc_pool_capacity", "Current pool capacity (LAUNCHING and AVAILABLE nodes).");
    for ((region, pool), s) in &latest {
        out.push_str(&format!(
            "mrgc_pool_capacity{{region=\"{region}\",pool=\"{pool}\"}} {}\n",
            s.current_capacity
        ));
    }

    header(&mut out, "mrgc_pool_desired_capacity", "Capacity requested by the last scaling decision.");
    for ((region, pool), s) in &latest {
        out.push_str(&format!(
            "mrgc_pool_desired_capacity{{region=\"{region}\",pool=\"{pool}\"}} {}\n",
            s.desired_capacity
        ));
    }

    header(&mut out, "mrgc_pool_requests_per_second", "Rolling average RPS seen by the autoscaler.");
    for ((region, pool), s) in &latest {
        out.push_str(&format!(
            "mrgc_pool_requests_per_second{{region=\"{region}\",pool=\"{pool}\"}} {:.2}\n",
            s.current_rps
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrgc_state::{FailoverState, ScaleAction, TrafficPreference};

    fn snapshot(region: &str) -> RegionSnapshot {
        RegionSnapshot {
            region: region.to_string(),
            state: FailoverState::Degraded,
            healthy_nodes: 4,
            total_nodes: 10,
            healthy_ratio: 0.4,
            traffic: TrafficPreference {
                local_percent: 70.0,
                peers: Vec::new(),
            },
            state_since_ms: 1,
            updated_at_ms: 2,
        }
    }

    fn scaling(pool: &str, ts: u64, current: u32) -> ScalingRecord {
        ScalingRecord {
            pool: pool.to_string(),
            region: "us-east-1".into(),
            timestamp_ms: ts,
            current_capacity: current,
            desired_capacity: current + 1,
            min_capacity: 1,
            max_capacity: 10,
            current_rps: 12.5,
            target_rps_per_node: 1.25,
            action: ScaleAction::ScaleUp,
            reason: "test".into(),
            failover_triggered: false,
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&[], &[]);
        assert!(output.contains("# HELP mrgc_region_healthy_ratio"));
        assert!(output.contains("# TYPE mrgc_pool_capacity gauge"));
    }

    #[test]
    fn render_region() {
        let output = render_prometheus(&[snapshot("us-east-1")], &[]);
        assert!(output.contains("mrgc_region_healthy_ratio{region=\"us-east-1\"} 0.4000"));
        assert!(output.contains("mrgc_region_total_nodes{region=\"us-east-1\"} 10"));
        assert!(output.contains(
            "mrgc_region_failover_state{region=\"us-east-1\",state=\"DEGRADED\"} 1"
        ));
        assert!(output.contains("mrgc_region_local_traffic_percent{region=\"us-east-1\"} 70.00"));
    }

    #[test]
    fn only_latest_scaling_record_is_exported() {
        let output = render_prometheus(&[], &[scaling("a", 2, 5), scaling("a", 1, 3)]);
        assert!(output.contains("mrgc_pool_capacity{region=\"us-east-1\",pool=\"a\"} 5"));
        assert!(!output.contains("pool=\"a\"} 3\n"));
        assert!(output.contains("mrgc_pool_requests_per_second{region=\"us-east-1\",pool=\"a\"} 12.50"));
    }

    #[test]
    fn every_sample_line_has_labels() {
        let output = render_prometheus(&[snapshot("r")], &[scaling("a", 1, 1)]);
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            assert!(line.contains('{') && line.contains('}'), "line should have labels: {line}");
        }
    }
}
