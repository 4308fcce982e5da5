//! mrgc-health — health monitoring for one region.
//!
//! Probes every AVAILABLE and DRAINING node of the region, tracks
//! consecutive failures, and writes a `RoutingFact` per node. The facts are
//! the only thing other components read: routing ranks them, failover
//! aggregates them into a region health ratio.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor (one cycle every health_check_interval_s)
//!   ├── stale-heartbeat sweep (AVAILABLE → DRAINING)
//!   ├── probes, at most probe_max_in_flight concurrently
//!   │   └── Prober::probe() with a hard timeout → ProbeResult
//!   ├── HealthTracker per node (consecutive failures)
//!   └── RoutingFact per node → StateStore
//! RegionHealth::from_store (any reader)
//! ```
//!
//! A probe that times out is abandoned and counted as a failure; it is not
//! retried within the same cycle.

pub mod aggregate;
pub mod checker;
pub mod monitor;

pub use aggregate::RegionHealth;
pub use checker::{HealthPayload, HealthTracker, HttpProber, ProbeResult, Prober, classify};
pub use monitor::{CycleReport, HealthCallback, HealthMonitor, MonitorSettings};
