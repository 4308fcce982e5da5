//! mrgc-api — REST API for the control plane.
//!
//! Provides axum route handlers over one region's registry, cleanup gate
//! and state store.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/nodes` | Register a launched node |
//! | GET | `/api/v1/nodes?region&pool&state` | List nodes |
//! | GET | `/api/v1/nodes/{id}` | Get one node |
//! | POST | `/api/v1/nodes/{id}/heartbeat` | Accept a heartbeat |
//! | POST | `/api/v1/nodes/{id}/transition` | Guarded state change |
//! | POST | `/api/v1/nodes/{id}/quarantine` | Quarantine a node |
//! | POST | `/api/v1/nodes/{id}/cleanup` | Record a cleanup validation |
//! | GET | `/api/v1/regions/{region}` | Latest failover snapshot |
//! | GET | `/api/v1/regions/{region}/route?pool&limit` | Best nodes to route to |
//! | GET | `/api/v1/scaling/{pool}?minutes` | Recent scaling decisions |
//! | GET | `/api/v1/cleanup/failed?hours` | Failed cleanup validations |
//! | POST | `/api/v1/metrics` | Ingest a metric sample |
//! | GET | `/metrics` | Prometheus exposition |
//!
//! Region snapshots and scaling history fall back to the last value served
//! when the store cannot be read; such responses carry `"stale": true`.

pub mod cache;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use mrgc_cleanup::CleanupGate;
use mrgc_metrics::MetricsRecorder;
use mrgc_registry::NodeRegistry;
use mrgc_state::{RetryPolicy, StateStore};

pub use cache::{LastKnownGood, Served};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub region: String,
    pub store: StateStore,
    pub registry: NodeRegistry,
    pub gate: CleanupGate,
    pub metrics: MetricsRecorder,
    pub retry: RetryPolicy,
    /// Routing facts older than this are ignored by the route endpoint.
    pub max_fact_age: Duration,
    pub last_good: Arc<LastKnownGood>,
}

impl ApiState {
    pub fn new(region: impl Into<String>, registry: NodeRegistry) -> Self {
        let region = region.into();
        let store = registry.store().clone();
        let metrics = MetricsRecorder::new(store.clone());
        let gate = CleanupGate::new(registry.clone(), metrics.clone(), region.clone());
        Self {
            region,
            store,
            registry,
            gate,
            metrics,
            retry: RetryPolicy::default(),
            max_fact_age: Duration::from_secs(90),
            last_good: Arc::new(LastKnownGood::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.gate = self.gate.with_retry_policy(retry.clone());
        self.metrics = self.metrics.with_retry_policy(retry.clone());
        self.retry = retry;
        self
    }

    pub fn with_max_fact_age(mut self, age: Duration) -> Self {
        self.max_fact_age = age;
        self
    }
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/nodes", get(handlers::list_nodes).post(handlers::register_node))
        .route("/nodes/{id}", get(handlers::get_node))
        .route("/nodes/{id}/heartbeat", post(handlers::heartbeat))
        .route("/nodes/{id}/transition", post(handlers::transition_node))
        .route("/nodes/{id}/quarantine", post(handlers::quarantine_node))
        .route("/nodes/{id}/cleanup", post(handlers::record_cleanup))
        .route("/regions/{region}", get(handlers::get_region))
        .route("/regions/{region}/route", get(handlers::route_nodes))
        .route("/scaling/{pool}", get(handlers::scaling_history))
        .route("/cleanup/failed", get(handlers::failed_cleanups))
        .route("/metrics", post(handlers::ingest_metric))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
