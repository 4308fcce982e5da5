//! Scaling decision logic, free of I/O.
//!
//! All durations are measured on the clock timestamps passed in, never on
//! the number of ticks observed.

use std::time::Duration;

use mrgc_core::PoolConfig;
use mrgc_state::ScaleAction;

/// Bounds and timings for one pool.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub target_rps_per_node: f64,
    pub scale_up_window: Duration,
    pub scale_down_window: Duration,
    pub cooldown: Duration,
}

impl ScalingPolicy {
    pub fn for_pool(
        pool: &PoolConfig,
        scale_up_window: Duration,
        scale_down_window: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            min_capacity: pool.min_capacity,
            max_capacity: pool.max_capacity,
            target_rps_per_node: pool.target_rps_per_node,
            scale_up_window,
            scale_down_window,
            cooldown,
        }
    }
}

/// Inputs of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub now_ms: u64,
    pub current_capacity: u32,
    /// Rolling average RPS of the pool; `None` when it could not be read.
    pub avg_rps: Option<f64>,
    /// Capacity multiplier requested by a failing peer region.
    pub intent_factor: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: ScaleAction,
    pub desired_capacity: u32,
    pub reason: String,
    pub failover_triggered: bool,
}

impl Decision {
    fn none(current: u32, reason: impl Into<String>) -> Self {
        Self {
            action: ScaleAction::None,
            desired_capacity: current,
            reason: reason.into(),
            failover_triggered: false,
        }
    }

    fn up(desired: u32, reason: impl Into<String>) -> Self {
        Self {
            action: ScaleAction::ScaleUp,
            desired_capacity: desired,
            reason: reason.into(),
            failover_triggered: false,
        }
    }

    fn down(desired: u32, reason: impl Into<String>) -> Self {
        Self {
            action: ScaleAction::ScaleDown,
            desired_capacity: desired,
            reason: reason.into(),
            failover_triggered: false,
        }
    }

    fn from_failover(mut self) -> Self {
        self.failover_triggered = true;
        self
    }
}

/// Per-pool memory between evaluations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolScaler {
    /// Start of the current above-target stretch.
    pub high_since_ms: Option<u64>,
    /// Start of the current below-target stretch.
    pub low_since_ms: Option<u64>,
    pub last_up_ms: Option<u64>,
    pub last_down_ms: Option<u64>,
    /// Newest failover intent already acted on.
    pub intent_watermark_ms: u64,
}

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn secs(ms: u64) -> u64 {
    ms / 1000
}

/// Milliseconds of cooldown left after an action at `last`.
fn cooldown_left(last: Option<u64>, now_ms: u64, cooldown: Duration) -> Option<u64> {
    let elapsed = now_ms.saturating_sub(last?);
    (elapsed < ms(cooldown)).then(|| ms(cooldown) - elapsed)
}

impl PoolScaler {
    /// Decide what to do about one pool.
    ///
    /// A pool below its minimum is raised to it in one step. A pool above its
    /// maximum, e.g. after the maximum was lowered, sheds one node per call
    /// without waiting for the sustain window or cooldown.
    pub fn decide(&mut self, policy: &ScalingPolicy, obs: &Observation) -> Decision {
        let now = obs.now_ms;
        let current = obs.current_capacity;
        let (min, max) = (policy.min_capacity, policy.max_capacity);

        if let Some(factor) = obs.intent_factor.filter(|f| f.is_finite() && *f > 0.0) {
            let scaled = (f64::from(current) * factor).ceil() as u32;
            let desired = scaled.max(min.max(1)).min(max);
            if desired > current {
                self.last_up_ms = Some(now);
                self.high_since_ms = None;
                return Decision::up(
                    desired,
                    format!("failover intent x{factor}: {current} -> {desired} nodes"),
                )
                .from_failover();
            }
            return Decision::none(
                current,
                format!("failover intent x{factor}: already at maximum capacity {max}"),
            )
            .from_failover();
        }

        if current < min {
            self.last_up_ms = Some(now);
            self.high_since_ms = None;
            return Decision::up(min, format!("capacity {current} below minimum {min}"));
        }
        if current > max {
            let desired = current - 1;
            self.last_down_ms = Some(now);
            self.low_since_ms = None;
            return Decision::down(
                desired,
                format!("capacity {current} above maximum {max}: {current} -> {desired} nodes"),
            );
        }

        let Some(avg_rps) = obs.avg_rps else {
            self.high_since_ms = None;
            self.low_since_ms = None;
            return Decision::none(current, "metrics unavailable");
        };

        let target = policy.target_rps_per_node;
        let per_node = avg_rps / f64::from(current.max(1));

        if per_node > target {
            self.low_since_ms = None;
            let held = now.saturating_sub(*self.high_since_ms.get_or_insert(now));
            if held < ms(policy.scale_up_window) {
                return Decision::none(
                    current,
                    format!(
                        "per-node rps {per_node:.2} above target {target:.2} for {}s, need {}s",
                        secs(held),
                        policy.scale_up_window.as_secs()
                    ),
                );
            }
            if current >= max {
                return Decision::none(current, format!("at maximum capacity {max}"));
            }
            if let Some(left) = cooldown_left(self.last_up_ms, now, policy.cooldown) {
                return Decision::none(current, format!("scale-up cooldown, {}s remaining", secs(left)));
            }
            let needed = (avg_rps / target).ceil() as u32;
            let desired = needed.max(current + 1).min(max);
            self.last_up_ms = Some(now);
            self.high_since_ms = None;
            return Decision::up(
                desired,
                format!(
                    "per-node rps {per_node:.2} above target {target:.2} for {}s: {current} -> {desired} nodes",
                    secs(held)
                ),
            );
        }

        if per_node < target {
            self.high_since_ms = None;
            let held = now.saturating_sub(*self.low_since_ms.get_or_insert(now));
            if held < ms(policy.scale_down_window) {
                return Decision::none(
                    current,
                    format!(
                        "per-node rps {per_node:.2} below target {target:.2} for {}s, need {}s",
                        secs(held),
                        policy.scale_down_window.as_secs()
                    ),
                );
            }
            if current <= min {
                return Decision::none(current, format!("at minimum capacity {min}"));
            }
            if let Some(left) = cooldown_left(self.last_down_ms, now, policy.cooldown) {
                return Decision::none(
                    current,
                    format!("scale-down cooldown, {}s remaining", secs(left)),
                );
            }
            let desired = current - 1;
            self.last_down_ms = Some(now);
            self.low_since_ms = None;
            return Decision::down(
                desired,
                format!(
                    "per-node rps {per_node:.2} below target {target:.2} for {}s: {current} -> {desired} nodes",
                    secs(held)
                ),
            );
        }

        self.high_since_ms = None;
        self.low_since_ms = None;
        Decision::none(current, format!("per-node rps {per_node:.2} at target"))
    }
}
