//! REST API handlers.
//!
//! Node writes go through the registry and cleanup gate with the store
//! retry policy; reads come from the store. Every response uses the `{success, data, error}` envelope.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query as QueryParams, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mrgc_cleanup::{CleanupChecks, GateError};
use mrgc_registry::RegistryError;
use mrgc_routing::RouteSelector;
use mrgc_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn state_status(e: &StateError) -> StatusCode {
    match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::AlreadyExists(_) => StatusCode::CONFLICT,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        StateError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn state_error(e: StateError) -> axum::response::Response {
    error_response(&e.to_string(), state_status(&e))
}

fn registry_error(e: RegistryError) -> axum::response::Response {
    let status = match &e {
        RegistryError::State(inner) => state_status(inner),
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::IllegalTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RegistryError::AlreadyExists(_)
        | RegistryError::InvalidTransition { .. }
        | RegistryError::Retired { .. }
        | RegistryError::CleanupRequired { .. } => StatusCode::CONFLICT,
    };
    error_response(&e.to_string(), status)
}

fn gate_error(e: GateError) -> axum::response::Response {
    match e {
        GateError::Registry(inner) => registry_error(inner),
        GateError::State(inner) => state_error(inner),
        GateError::Quarantined { .. } | GateError::Pending(_) => {
            error_response(&e.to_string(), StatusCode::CONFLICT)
        }
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// Register request body. `region` defaults to this control plane's.
#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterRequest {
    pub node_id: String,
    #[serde(default)]
    pub region: Option<String>,
    pub pool: String,
    pub address: String,
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// POST /api/v1/nodes
pub async fn register_node(
    State(state): State<ApiState>,
    Json(req): Json<RegisterRequest>,
) -> impl IntoResponse {
    let region = req.region.unwrap_or_else(|| state.region.clone());
    let mut node = NodeRecord::launching(req.node_id, region, req.pool, req.address);
    node.subnet = req.subnet;
    node.zone = req.zone;
    node.metadata = req.metadata;
    match retry(&state.retry, "register node", || state.registry.register(node.clone())).await {
        Ok(node) => (StatusCode::CREATED, ApiResponse::ok(node)).into_response(),
        Err(e) => registry_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct NodeFilter {
    pub region: Option<String>,
    pub pool: Option<String>,
    pub state: Option<String>,
}

/// GET /api/v1/nodes
pub async fn list_nodes(
    State(state): State<ApiState>,
    QueryParams(filter): QueryParams<NodeFilter>,
) -> impl IntoResponse {
    let node_state = match filter.state.as_deref().map(str::parse::<NodeState>) {
        Some(Ok(s)) => Some(s),
        Some(Err(e)) => return error_response(&e, StatusCode::BAD_REQUEST),
        None => None,
    };
    match state
        .registry
        .list(filter.region.as_deref(), filter.pool.as_deref(), node_state)
    {
        Ok(nodes) => ApiResponse::ok(nodes).into_response(),
        Err(e) => registry_error(e),
    }
}

/// GET /api/v1/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.registry.get(&id) {
        Ok(Some(node)) => ApiResponse::ok(node).into_response(),
        Ok(None) => error_response("node not found", StatusCode::NOT_FOUND),
        Err(e) => registry_error(e),
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub queue_depth: u32,
}

/// POST /api/v1/nodes/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    match retry(&state.retry, "heartbeat", || {
        state.registry.heartbeat(&id, req.queue_depth)
    })
    .await
    {
        Ok(node) => ApiResponse::ok(node).into_response(),
        Err(e) => registry_error(e),
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TransitionRequest {
    pub from: NodeState,
    pub to: NodeState,
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/v1/nodes/{id}/transition
pub async fn transition_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> impl IntoResponse {
    match retry(&state.retry, "transition node", || {
        state
            .registry
            .transition_with_reason(&id, req.from, req.to, req.reason.as_deref())
    })
    .await
    {
        Ok(node) => ApiResponse::ok(node).into_response(),
        Err(e) => registry_error(e),
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct QuarantineRequest {
    pub reason: String,
}

/// POST /api/v1/nodes/{id}/quarantine
pub async fn quarantine_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<QuarantineRequest>,
) -> impl IntoResponse {
    match retry(&state.retry, "quarantine node", || {
        state.registry.quarantine(&id, &req.reason)
    })
    .await
    {
        Ok(node) => ApiResponse::ok(node).into_response(),
        Err(e) => registry_error(e),
    }
}

/// What to do with the node once a passing result is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupAction {
    Release,
    Decommission,
}

/// A node's self-reported cleanup result.
#[derive(Debug, Deserialize, Serialize)]
pub struct CleanupRequest {
    pub compute_memory_wiped: bool,
    pub system_memory_wiped: bool,
    pub secure_compute_restarted: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub action: Option<CleanupAction>,
}

#[derive(Debug, Serialize)]
struct CleanupOutcome {
    record: CleanupRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<NodeRecord>,
}

/// POST /api/v1/nodes/{id}/cleanup
///
/// A failed result quarantines the node and answers 409 with the record.
pub async fn record_cleanup(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<CleanupRequest>,
) -> impl IntoResponse {
    let checks = CleanupChecks {
        compute_memory_wiped: req.compute_memory_wiped,
        system_memory_wiped: req.system_memory_wiped,
        secure_compute_restarted: req.secure_compute_restarted,
        failure_reason: req.failure_reason,
    };
    let record = match state.gate.record_validation(&id, checks).await {
        Ok(record) => record,
        Err(e) => return gate_error(e),
    };
    if record.status != CleanupStatus::Passed {
        return (
            StatusCode::CONFLICT,
            Json(ApiResponse {
                success: false,
                data: Some(CleanupOutcome { record, node: None }),
                error: Some(format!("node {id} quarantined")),
            }),
        )
            .into_response();
    }
    let node = match req.action {
        None => None,
        Some(CleanupAction::Release) => match state.gate.release(&id).await {
            Ok(node) => Some(node),
            Err(e) => return gate_error(e),
        },
        Some(CleanupAction::Decommission) => match state.gate.decommission(&id).await {
            Ok(node) => Some(node),
            Err(e) => return gate_error(e),
        },
    };
    ApiResponse::ok(CleanupOutcome { record, node }).into_response()
}

// ── Regions ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RegionView {
    #[serde(flatten)]
    snapshot: RegionSnapshot,
    stale: bool,
}

/// GET /api/v1/regions/{region}
pub async fn get_region(
    State(state): State<ApiState>,
    Path(region): Path<String>,
) -> impl IntoResponse {
    let read = retry(&state.retry, "read region snapshot", || {
        state.store.get::<RegionSnapshot>(&region)
    })
    .await;
    match state.last_good.region(&region, read).await {
        Ok(Some(served)) => ApiResponse::ok(RegionView {
            snapshot: served.value,
            stale: served.stale,
        })
        .into_response(),
        Ok(None) => error_response("region not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RouteParams {
    pub pool: String,
    pub limit: Option<usize>,
}

/// GET /api/v1/regions/{region}/route
pub async fn route_nodes(
    State(state): State<ApiState>,
    Path(region): Path<String>,
    QueryParams(params): QueryParams<RouteParams>,
) -> impl IntoResponse {
    let selector = RouteSelector::new(state.store.clone()).with_max_fact_age(state.max_fact_age);
    let limit = params.limit.unwrap_or(3);
    match selector.best_nodes(&region, &params.pool, limit) {
        Ok(candidates) => ApiResponse::ok(candidates).into_response(),
        Err(e) => state_error(e),
    }
}

// ── Scaling ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WindowParams {
    pub minutes: Option<u64>,
    pub hours: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ScalingView {
    records: Vec<ScalingRecord>,
    stale: bool,
}

/// GET /api/v1/scaling/{pool}
pub async fn scaling_history(
    State(state): State<ApiState>,
    Path(pool): Path<String>,
    QueryParams(params): QueryParams<WindowParams>,
) -> impl IntoResponse {
    let window = Duration::from_secs(params.minutes.unwrap_or(60) * 60);
    let since = state
        .store
        .clock()
        .now_ms()
        .saturating_sub(window.as_millis() as u64);
    let query = Query::on(index::POOL_TIME, &pool).since(since).descending();
    let read = retry(&state.retry, "read scaling history", || {
        state.store.query::<ScalingRecord>(&query)
    })
    .await;
    match state.last_good.scaling(&pool, read).await {
        Ok(served) => ApiResponse::ok(ScalingView {
            records: served.value,
            stale: served.stale,
        })
        .into_response(),
        Err(e) => state_error(e),
    }
}

// ── Cleanup ────────────────────────────────────────────────────

/// GET /api/v1/cleanup/failed
pub async fn failed_cleanups(
    State(state): State<ApiState>,
    QueryParams(params): QueryParams<WindowParams>,
) -> impl IntoResponse {
    let window = Duration::from_secs(params.hours.unwrap_or(24) * 3600);
    let since = state
        .store
        .clock()
        .now_ms()
        .saturating_sub(window.as_millis() as u64);
    match state.gate.failed_validations(since).await {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => gate_error(e),
    }
}

// ── Metrics ────────────────────────────────────────────────────

/// Ingest body. `region` defaults to this control plane's.
#[derive(Debug, Deserialize, Serialize)]
pub struct MetricRequest {
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

/// POST /api/v1/metrics
pub async fn ingest_metric(
    State(state): State<ApiState>,
    Json(req): Json<MetricRequest>,
) -> impl IntoResponse {
    if req.name.is_empty() || !req.value.is_finite() {
        return error_response("metric needs a name and a finite value", StatusCode::BAD_REQUEST);
    }
    let region = req.region.as_deref().unwrap_or(&state.region);
    let dims: Vec<(&str, &str)> = req
        .dimensions
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    match state
        .metrics
        .record(&req.name, region, req.value, &req.unit, &dims)
        .await
    {
        Ok(sample) => (StatusCode::CREATED, ApiResponse::ok(sample)).into_response(),
        Err(e) => state_error(e),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshots: Vec<RegionSnapshot> = match state.store.list_all() {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "region snapshots unavailable for exposition");
            Vec::new()
        }
    };

    let mut regions: BTreeSet<&str> = snapshots.iter().map(|s| s.region.as_str()).collect();
    regions.insert(state.region.as_str());

    let since = state.store.clock().now_ms().saturating_sub(3_600_000);
    let mut scaling = Vec::new();
    for region in regions {
        match state
            .store
            .query::<ScalingRecord>(&Query::on(index::REGION_TIME, region).since(since))
        {
            Ok(records) => scaling.extend(records),
            Err(e) => debug!(%region, error = %e, "scaling records unavailable for exposition"),
        }
    }

    let body = mrgc_metrics::render_prometheus(&snapshots, &scaling);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrgc_core::ManualClock;
    use mrgc_registry::NodeRegistry;

    const T0: u64 = 1_700_000_000_000;

    fn test_state() -> ApiState {
        let (_, shared) = ManualClock::shared(T0);
        let store = StateStore::open_in_memory().unwrap().with_clock(shared);
        ApiState::new("us-east-1", NodeRegistry::new(store))
            .with_retry_policy(RetryPolicy::exponential(1, Duration::ZERO))
    }

    fn register_req(id: &str) -> RegisterRequest {
        RegisterRequest {
            node_id: id.into(),
            region: None,
            pool: "model-a".into(),
            address: "10.0.0.1:8080".into(),
            subnet: String::new(),
            zone: String::new(),
            metadata: HashMap::new(),
        }
    }

    fn draining(state: &ApiState, id: &str) {
        state.registry.register(NodeRecord::launching(id, "us-east-1", "model-a", "a:1")).unwrap();
        state.registry.transition(id, NodeState::Launching, NodeState::Available).unwrap();
        state.registry.transition(id, NodeState::Available, NodeState::Draining).unwrap();
    }

    #[tokio::test]
    async fn register_defaults_region() {
        let state = test_state();
        let resp = register_node(State(state.clone()), Json(register_req("n1"))).await;
        assert_eq!(resp.into_response().status(), StatusCode::CREATED);

        let node = state.registry.get("n1").unwrap().unwrap();
        assert_eq!(node.region, "us-east-1");
        assert_eq!(node.state, NodeState::Launching);

        let resp = register_node(State(state), Json(register_req("n1"))).await;
        assert_eq!(resp.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn get_nonexistent_node() {
        let state = test_state();
        let resp = get_node(State(state), Path("nope".to_string())).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_rejects_unknown_state() {
        let state = test_state();
        let filter = NodeFilter {
            state: Some("SLEEPING".into()),
            ..Default::default()
        };
        let resp = list_nodes(State(state), QueryParams(filter)).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stale_guard_is_a_conflict() {
        let state = test_state();
        register_node(State(state.clone()), Json(register_req("n1"))).await;
        let req = TransitionRequest {
            from: NodeState::Available,
            to: NodeState::Draining,
            reason: None,
        };
        let resp = transition_node(State(state), Path("n1".into()), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn draining_to_available_needs_cleanup() {
        let state = test_state();
        draining(&state, "n1");
        let req = TransitionRequest {
            from: NodeState::Draining,
            to: NodeState::Available,
            reason: None,
        };
        let resp = transition_node(State(state.clone()), Path("n1".into()), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);

        let req = CleanupRequest {
            compute_memory_wiped: true,
            system_memory_wiped: true,
            secure_compute_restarted: true,
            failure_reason: None,
            action: Some(CleanupAction::Release),
        };
        let resp = record_cleanup(State(state.clone()), Path("n1".into()), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
        assert_eq!(
            state.registry.get("n1").unwrap().unwrap().state,
            NodeState::Available
        );
    }

    #[tokio::test]
    async fn failed_cleanup_quarantines() {
        let state = test_state();
        draining(&state, "n1");
        let req = CleanupRequest {
            compute_memory_wiped: false,
            system_memory_wiped: true,
            secure_compute_restarted: true,
            failure_reason: Some("HBM scrub timed out".into()),
            action: Some(CleanupAction::Release),
        };
        let resp = record_cleanup(State(state.clone()), Path("n1".into()), Json(req)).await;
        assert_eq!(resp.into_response().status(), StatusCode::CONFLICT);
        assert_eq!(
            state.registry.get("n1").unwrap().unwrap().state,
            NodeState::Quarantined
        );

        let params = WindowParams {
            minutes: None,
            hours: Some(1),
        };
        let resp = failed_cleanups(State(state), QueryParams(params)).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_region_is_not_found() {
        let state = test_state();
        let resp = get_region(State(state), Path("mars-1".into())).await;
        assert_eq!(resp.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metric_ingest_validates() {
        let state = test_state();
        let bad = MetricRequest {
            name: "rps".into(),
            region: None,
            value: f64::NAN,
            unit: String::new(),
            dimensions: BTreeMap::new(),
        };
        let resp = ingest_metric(State(state.clone()), Json(bad)).await;
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);

        let good = MetricRequest {
            name: "rps".into(),
            region: None,
            value: 120.0,
            unit: "Count/Second".into(),
            dimensions: BTreeMap::from([("pool".to_string(), "model-a".to_string())]),
        };
        let resp = ingest_metric(State(state.clone()), Json(good)).await;
        assert_eq!(resp.into_response().status(), StatusCode::CREATED);
        let samples = mrgc_metrics::samples(&state.store, "rps", "us-east-1", 0).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].dimension("pool"), Some("model-a"));
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let state = test_state();
        let resp = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }
}
