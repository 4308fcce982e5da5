//! Region control plane — opens the store and wires the control loops.
//!
//! One `ControlPlane` per region process:
//! 1. Opens the local state store replica
//! 2. Builds the registry, health monitor, failover controller and autoscaler
//! 3. Spawns each loop against a shared shutdown signal
//! 4. Serves the REST API until shutdown

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mrgc_api::ApiState;
use mrgc_autoscale::{AutoscaleSettings, Autoscaler};
use mrgc_core::{ControlPlaneConfig, SharedClock};
use mrgc_failover::{FailoverController, FailoverSettings};
use mrgc_health::{HealthMonitor, HttpProber, MonitorSettings, Prober};
use mrgc_metrics::MetricsRecorder;
use mrgc_registry::NodeRegistry;
use mrgc_state::{RetryPolicy, StateStore, TtlPolicy};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How often expired records are physically removed.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(600);

pub struct ControlPlane {
    config: ControlPlaneConfig,
    store: StateStore,
    registry: NodeRegistry,
    retry: RetryPolicy,
    prober: Arc<dyn Prober>,
}

impl ControlPlane {
    /// Open (or create) the region's store under `data_dir`.
    pub fn open(config: ControlPlaneConfig, data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(format!("mrgc-{}.redb", config.region));
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, region = %config.region, "state store opened");
        Ok(Self::from_store(config, store))
    }

    /// An in-memory control plane driven by `clock`.
    pub fn in_memory(config: ControlPlaneConfig, clock: SharedClock) -> anyhow::Result<Self> {
        let store = StateStore::open_in_memory()?.with_clock(clock);
        Ok(Self::from_store(config, store))
    }

    /// Build over an existing store handle, e.g. one shared with other
    /// regions in tests. The handle is re-tagged with this region as origin.
    pub fn from_store(config: ControlPlaneConfig, store: StateStore) -> Self {
        let store = store
            .with_origin(config.region.clone())
            .with_ttl_policy(TtlPolicy::from_config(&config));
        let prober: Arc<dyn Prober> = Arc::new(HttpProber::new(config.probe_path.clone()));
        Self {
            retry: RetryPolicy::from_config(&config),
            registry: NodeRegistry::new(store.clone()),
            store,
            prober,
            config,
        }
    }

    /// Replace the HTTP prober.
    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsRecorder {
        MetricsRecorder::new(self.store.clone()).with_retry_policy(self.retry.clone())
    }

    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            self.registry.clone(),
            self.prober.clone(),
            MonitorSettings::from_config(&self.config),
        )
        .with_retry_policy(self.retry.clone())
    }

    /// A failover controller resumed from the last published snapshot.
    pub fn failover_controller(&self) -> FailoverController {
        let mut controller = FailoverController::new(
            self.registry.clone(),
            self.metrics(),
            FailoverSettings::from_config(&self.config),
        )
        .with_retry_policy(self.retry.clone());
        match controller.restore() {
            Ok(Some(state)) => info!(region = %self.config.region, %state, "failover state restored"),
            Ok(None) => {}
            Err(e) => warn!(region = %self.config.region, error = %e, "failover state not restored"),
        }
        controller
    }

    pub fn autoscaler(&self) -> Autoscaler {
        Autoscaler::new(self.registry.clone(), AutoscaleSettings::from_config(&self.config))
            .with_retry_policy(self.retry.clone())
    }

    pub fn api_state(&self) -> ApiState {
        ApiState::new(self.config.region.clone(), self.registry.clone())
            .with_retry_policy(self.retry.clone())
            .with_max_fact_age(self.config.stale_heartbeat())
    }

    pub fn router(&self) -> axum::Router {
        mrgc_api::build_router(self.api_state())
    }

    /// Spawn every background loop. They all stop when `shutdown` flips.
    pub fn spawn_loops(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let monitor = self.health_monitor();
        let interval = self.config.health_check_interval();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            monitor.run(interval, rx).await;
        }));

        let mut controller = self.failover_controller();
        let interval = self.config.failover_check_interval();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            controller.run(interval, rx).await;
        }));

        let mut autoscaler = self.autoscaler();
        let interval = self.config.autoscale_interval();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            autoscaler.run(interval, rx).await;
        }));

        let store = self.store.clone();
        handles.push(tokio::spawn(async move {
            purge_loop(store, PURGE_INTERVAL, shutdown).await;
        }));

        info!(region = %self.config.region, loops = handles.len(), "control loops started");
        handles
    }
}

/// Periodically drop expired records from the local replica.
pub async fn purge_loop(store: StateStore, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match store.purge_all_expired() {
                    Ok(0) => {}
                    Ok(purged) => info!(purged, "expired records purged"),
                    Err(e) => warn!(error = %e, "purge failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("purge loop shutting down");
                break;
            }
        }
    }
}

/// Run the region control plane until Ctrl-C.
pub async fn run(config: ControlPlaneConfig, data_dir: &Path, port: u16) -> anyhow::Result<()> {
    info!(region = %config.region, "MRGC daemon starting");
    let plane = ControlPlane::open(config, data_dir)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = plane.spawn_loops(shutdown_rx);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, plane.router())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    for handle in handles {
        let _ = handle.await;
    }
    info!("MRGC daemon stopped");
    Ok(())
}
