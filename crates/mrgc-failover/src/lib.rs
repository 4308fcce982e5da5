//! mrgc-failover — per-region failover decisions.
//!
//! Each cycle reads the region's healthy ratio, steps the state machine,
//! and publishes a `RegionSnapshot` carrying the traffic preference the
//! router should apply.
//!
//! ```text
//!              ratio < 0.30
//!   NORMAL ───────────────────────► FAILOVER_ACTIVE
//!     │  ▲   ratio < 0.50               │
//!     ▼  │ ≥ 0.80                       │ ≥ 0.80
//!   DEGRADED                            ▼
//!                ≥ 0.80, settled    RECOVERING
//!   NORMAL ◄────────────────────────────┘
//! ```
//!
//! Ratios between 0.50 and 0.80 hold the current state. Entering
//! FAILOVER_ACTIVE or RECOVERING asks the target regions to scale up by
//! writing a `ScaleIntent` each.

pub mod controller;
pub mod machine;
pub mod traffic;

pub use controller::{FailoverController, FailoverSettings};
pub use machine::{FailoverMachine, FailoverThresholds, Transition, next_state};
pub use traffic::{PeerStatus, rank_targets, traffic_preference};
