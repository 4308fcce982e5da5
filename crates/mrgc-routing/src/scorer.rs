//! Node scoring for routing decisions.
//!
//! Combines three components, each on a 0–100 scale:
//! - **Queue**: `100 − queue_depth × 10`, floored at 0
//! - **Latency**: `100 − avg_latency_ms / 10`, floored at 0
//! - **Health**: 100 healthy, 50 degraded, 0 unhealthy
//!
//! The weighted sum is clamped to `[0, 100]`.

use mrgc_state::HealthStatus;
use serde::{Deserialize, Serialize};

/// Weights for the scoring components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub queue: f64,
    pub latency: f64,
    pub health: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            queue: 0.5,
            latency: 0.3,
            health: 0.2,
        }
    }
}

/// Individual score components for debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub queue: f64,
    pub latency: f64,
    pub health: f64,
    pub total: f64,
}

pub fn queue_score(queue_depth: u32) -> f64 {
    (100.0 - f64::from(queue_depth) * 10.0).max(0.0)
}

pub fn latency_score(avg_latency_ms: f64) -> f64 {
    // A latency we cannot interpret earns nothing.
    if !avg_latency_ms.is_finite() {
        return 0.0;
    }
    (100.0 - avg_latency_ms.max(0.0) / 10.0).max(0.0)
}

pub fn health_score(status: HealthStatus) -> f64 {
    match status {
        HealthStatus::Healthy => 100.0,
        HealthStatus::Degraded => 50.0,
        HealthStatus::Unhealthy => 0.0,
    }
}

/// Score with a component breakdown.
pub fn score_breakdown(
    queue_depth: u32,
    avg_latency_ms: f64,
    status: HealthStatus,
    weights: &ScoringWeights,
) -> ScoreBreakdown {
    let queue = queue_score(queue_depth);
    let latency = latency_score(avg_latency_ms);
    let health = health_score(status);
    let total = (weights.queue * queue + weights.latency * latency + weights.health * health)
        .clamp(0.0, 100.0);
    ScoreBreakdown {
        queue,
        latency,
        health,
        total,
    }
}

/// Routing score with the default weights.
pub fn routing_score(queue_depth: u32, avg_latency_ms: f64, status: HealthStatus) -> f64 {
    score_breakdown(queue_depth, avg_latency_ms, status, &ScoringWeights::default()).total
}
