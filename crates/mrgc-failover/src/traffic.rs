//! Traffic preference per failover state.

use mrgc_state::{FailoverState, PeerShare, TrafficPreference};
use serde::{Deserialize, Serialize};

/// Latency assumed for a region pair missing from the matrix.
pub const DEFAULT_PEER_LATENCY_MS: u32 = 100;

/// What this region knows about a peer when choosing failover targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub region: String,
    pub latency_ms: u32,
    pub available_nodes: u32,
    /// The peer's last published state, if any.
    pub state: Option<FailoverState>,
}

impl PeerStatus {
    /// A peer can absorb traffic if it has capacity and is not itself
    /// failing over.
    pub fn is_eligible(&self) -> bool {
        self.available_nodes > 0 && self.state != Some(FailoverState::FailoverActive)
    }
}

/// Eligible peers, nearest first, ties broken by region name.
pub fn rank_targets(peers: &[PeerStatus]) -> Vec<String> {
    let mut eligible: Vec<&PeerStatus> = peers.iter().filter(|p| p.is_eligible()).collect();
    eligible.sort_by(|a, b| {
        a.latency_ms
            .cmp(&b.latency_ms)
            .then_with(|| a.region.cmp(&b.region))
    });
    eligible.into_iter().map(|p| p.region.clone()).collect()
}

fn split_evenly(total: f64, targets: &[String]) -> Vec<PeerShare> {
    let each = total / targets.len() as f64;
    targets
        .iter()
        .map(|region| PeerShare {
            region: region.clone(),
            percent: each,
        })
        .collect()
}

/// The dial for `state` given ranked `targets`.
///
/// Without any eligible target the region keeps all of its traffic.
pub fn traffic_preference(state: FailoverState, targets: &[String]) -> TrafficPreference {
    if targets.is_empty() {
        return TrafficPreference::all_local();
    }
    match state {
        FailoverState::Normal => TrafficPreference::all_local(),
        FailoverState::Degraded => TrafficPreference {
            local_percent: 70.0,
            peers: split_evenly(30.0, targets),
        },
        FailoverState::FailoverActive => {
            let peers = match targets {
                [only] => vec![PeerShare {
                    region: only.clone(),
                    percent: 95.0,
                }],
                [first, second, ..] => vec![
                    PeerShare {
                        region: first.clone(),
                        percent: 80.0,
                    },
                    PeerShare {
                        region: second.clone(),
                        percent: 15.0,
                    },
                ],
                [] => Vec::new(),
            };
            TrafficPreference {
                local_percent: 5.0,
                peers,
            }
        }
        FailoverState::Recovering => TrafficPreference {
            local_percent: 50.0,
            peers: split_evenly(50.0, targets),
        },
    }
}
