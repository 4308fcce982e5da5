//! mrgc-metrics — observability for the control plane.
//!
//! Metric samples are ordinary store records (`MetricSample`), so every
//! region's dashboards and control loops read the same series.
//!
//! # Architecture
//!
//! ```text
//! MetricsRecorder
//!   ├── record() ← called by health, failover, autoscale and cleanup
//!   └── rps / queue_depth / healthy_ratio / cleanup / failover helpers
//!
//! Queries (read-only)
//!   ├── rolling_average() → autoscaler demand signal
//!   └── cluster_rps(), average_queue_depth()
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod prometheus;
pub mod query;
pub mod recorder;

pub use prometheus::render_prometheus;
pub use query::{average_queue_depth, cluster_rps, rolling_average, samples};
pub use recorder::{MetricsRecorder, names};
