//! Autoscaler — one region's pool scaling loop.
//!
//! Each tick evaluates every configured pool, appends a `ScalingRecord`,
//! and hands non-NONE decisions to an optional actuator callback. The
//! actual node launches and terminations happen outside this crate.

use std::collections::HashMap;
use std::time::Duration;

use mrgc_core::{ControlPlaneConfig, PoolConfig};
use mrgc_metrics::{names, rolling_average};
use mrgc_registry::NodeRegistry;
use mrgc_state::*;
use tracing::{debug, info, warn};

use crate::policy::{Observation, PoolScaler, ScalingPolicy};

/// Callback type for performing scaling actions.
///
/// The autoscaler calls this with the decision it just recorded.
pub type ScaleCallback = Box<dyn Fn(&ScalingRecord) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<
    Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
>;

#[derive(Debug, Clone, PartialEq)]
pub struct AutoscaleSettings {
    pub region: String,
    pub pools: Vec<PoolConfig>,
    pub scale_up_window: Duration,
    pub scale_down_window: Duration,
    pub cooldown: Duration,
    pub rps_window: Duration,
}

impl AutoscaleSettings {
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self {
            region: config.region.clone(),
            pools: config.pools.clone(),
            scale_up_window: config.scale_up_window(),
            scale_down_window: config.scale_down_window(),
            cooldown: config.cooldown(),
            rps_window: config.rps_window(),
        }
    }

    fn policy(&self, pool: &PoolConfig) -> ScalingPolicy {
        ScalingPolicy::for_pool(
            pool,
            self.scale_up_window,
            self.scale_down_window,
            self.cooldown,
        )
    }
}

/// The autoscaler evaluates demand and decides whether to scale pools up
/// or down.
pub struct Autoscaler {
    registry: NodeRegistry,
    store: StateStore,
    settings: AutoscaleSettings,
    /// Per-pool sustain timers and cooldowns.
    scalers: HashMap<String, PoolScaler>,
    /// Callback to perform scaling.
    scale_fn: Option<ScaleCallback>,
    retry: RetryPolicy,
}

impl Autoscaler {
    pub fn new(registry: NodeRegistry, settings: AutoscaleSettings) -> Self {
        let store = registry.store().clone();
        Self {
            registry,
            store,
            settings,
            scalers: HashMap::new(),
            scale_fn: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the callback used to perform scaling.
    pub fn with_scale_fn(mut self, f: ScaleCallback) -> Self {
        self.scale_fn = Some(f);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Rebuild cooldowns and the intent watermark from this region's
    /// recorded decisions, so a restart does not repeat an action.
    ///
    /// Decisions older than both the cooldown and the intent lifetime cannot
    /// affect the next one and are not read.
    fn restore(&self, pool: &str) -> StateResult<PoolScaler> {
        let lookback = self
            .settings
            .cooldown
            .max(self.store.ttl_policy().scale_intent);
        let since = self
            .store
            .clock()
            .now_ms()
            .saturating_sub(lookback.as_millis() as u64);
        let recent: Vec<ScalingRecord> = self.store.query(
            &Query::on(index::REGION_TIME, &self.settings.region)
                .since(since)
                .descending(),
        )?;
        let mut scaler = PoolScaler::default();
        for record in recent.iter().filter(|r| r.pool == pool) {
            match record.action {
                ScaleAction::ScaleUp if scaler.last_up_ms.is_none() => {
                    scaler.last_up_ms = Some(record.timestamp_ms);
                }
                ScaleAction::ScaleDown if scaler.last_down_ms.is_none() => {
                    scaler.last_down_ms = Some(record.timestamp_ms);
                }
                _ => {}
            }
            if record.failover_triggered {
                scaler.intent_watermark_ms = scaler.intent_watermark_ms.max(record.timestamp_ms);
            }
        }
        Ok(scaler)
    }

    /// Failover intents for this region newer than `watermark`; returns the
    /// largest factor and the newest timestamp.
    fn pending_intent(&self, watermark: u64) -> StateResult<Option<(f64, u64)>> {
        let intents: Vec<ScaleIntent> = self.store.query(
            &Query::on(index::TARGET_TIME, &self.settings.region).since(watermark.saturating_add(1)),
        )?;
        Ok(intents.iter().fold(None, |acc, intent| {
            let (factor, newest) = acc.unwrap_or((0.0, 0));
            Some((factor.max(intent.factor), newest.max(intent.timestamp_ms)))
        }))
    }

    /// Evaluate one pool and append the decision.
    pub async fn evaluate_pool(&mut self, pool: &PoolConfig) -> anyhow::Result<ScalingRecord> {
        let region = self.settings.region.clone();

        if !self.scalers.contains_key(&pool.name) {
            let restored = self.restore(&pool.name)?;
            self.scalers.insert(pool.name.clone(), restored);
        }

        let current_capacity = self.registry.capacity(&region, &pool.name)?;
        let avg_rps = match rolling_average(
            &self.store,
            names::RPS,
            &region,
            self.settings.rps_window,
            &[("pool", pool.name.as_str())],
        ) {
            Ok(avg) => avg,
            Err(e) => {
                warn!(%region, pool = %pool.name, error = %e, "failed to read rps");
                None
            }
        };

        let watermark = self
            .scalers
            .get(&pool.name)
            .map(|s| s.intent_watermark_ms)
            .unwrap_or_default();
        let intent = match self.pending_intent(watermark) {
            Ok(intent) => intent,
            Err(e) => {
                warn!(%region, error = %e, "failed to read scale intents");
                None
            }
        };

        let now = self.store.clock().now_ms();
        let policy = self.settings.policy(pool);
        let scaler = self.scalers.entry(pool.name.clone()).or_default();
        let before = scaler.clone();
        let decision = scaler.decide(
            &policy,
            &Observation {
                now_ms: now,
                current_capacity,
                avg_rps,
                intent_factor: intent.map(|(factor, _)| factor),
            },
        );
        if let Some((_, newest)) = intent {
            scaler.intent_watermark_ms = scaler.intent_watermark_ms.max(newest);
        }

        let record = ScalingRecord {
            pool: pool.name.clone(),
            region: region.clone(),
            timestamp_ms: now,
            current_capacity,
            desired_capacity: decision.desired_capacity,
            min_capacity: pool.min_capacity,
            max_capacity: pool.max_capacity,
            current_rps: avg_rps.unwrap_or(0.0),
            target_rps_per_node: pool.target_rps_per_node,
            action: decision.action,
            reason: decision.reason,
            failover_triggered: decision.failover_triggered,
        };

        if let Err(e) = retry(&self.retry, "put scaling record", || self.store.put(record.clone())).await {
            // Not recorded means not decided; try again next tick.
            self.scalers.insert(pool.name.clone(), before);
            return Err(e.into());
        }

        if record.action == ScaleAction::None {
            debug!(%region, pool = %record.pool, reason = %record.reason, "no scaling action");
        } else {
            info!(
                %region,
                pool = %record.pool,
                action = %record.action,
                from = record.current_capacity,
                to = record.desired_capacity,
                reason = %record.reason,
                "scaling decision"
            );
            if let Some(ref scale_fn) = self.scale_fn
                && let Err(e) = scale_fn(&record).await
            {
                warn!(
                    pool = %record.pool,
                    target = record.desired_capacity,
                    error = %e,
                    "scaling action failed"
                );
            }
        }

        Ok(record)
    }

    /// Evaluate every configured pool. A failing pool does not stop the
    /// others; its decision is retried next tick.
    pub async fn evaluate_all(&mut self) -> Vec<ScalingRecord> {
        let pools = self.settings.pools.clone();
        let mut records = Vec::with_capacity(pools.len());
        for pool in &pools {
            match self.evaluate_pool(pool).await {
                Ok(record) => records.push(record),
                Err(e) => warn!(pool = %pool.name, error = %e, "autoscaler evaluation failed"),
            }
        }
        records
    }

    /// Run the autoscaler loop.
    pub async fn run(
        &mut self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(
            region = %self.settings.region,
            interval_secs = interval.as_secs(),
            "autoscaler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.evaluate_all().await;
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}
