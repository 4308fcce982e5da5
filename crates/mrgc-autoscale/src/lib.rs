//! mrgc-autoscale — demand-driven capacity for each (region, pool).
//!
//! Reads the rolling average RPS of a pool from metric samples and its
//! capacity from the registry, then decides whether to add or remove nodes.
//! Every decision, including "no change", is appended as a `ScalingRecord`.
//!
//! # Scaling Algorithm
//!
//! ```text
//! per_node = avg_rps / capacity
//!
//! if capacity < min:                          ScaleUp(min)
//! if failover intent (factor f):              ScaleUp(min(ceil(capacity × f), max))
//! if per_node > target for scale_up_window
//!    and capacity < max and not cooling down: ScaleUp(min(ceil(avg_rps / target), max))
//! if per_node < target for scale_down_window
//!    and capacity > min and not cooling down: ScaleDown(capacity - 1)
//! ```
//!
//! Cooldowns are per direction. Failover intents and the minimum floor
//! bypass both the cooldown and the sustain window.

pub mod policy;
pub mod scaler;

pub use policy::{Decision, Observation, PoolScaler, ScalingPolicy};
pub use scaler::{AutoscaleSettings, Autoscaler, ScaleCallback};
