//! Control plane configuration.
//!
//! Loaded from a TOML file; every scalar key can be overridden with an
//! `MRGC_<KEY>` environment variable. Invalid configuration is fatal: the
//! daemon refuses to start rather than run with inconsistent thresholds.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid value for {key}: {value:?}")]
    Override { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Capacity bounds and demand target for one model pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    pub name: String,
    pub min_capacity: u32,
    pub max_capacity: u32,
    /// Requests per second one node is expected to sustain.
    #[serde(default = "defaults::target_rps_per_node")]
    pub target_rps_per_node: f64,
}

/// One directed entry of the inter-region latency matrix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionLatency {
    pub from: String,
    pub to: String,
    pub latency_ms: u32,
}

/// Full configuration for one region's control plane instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// The region this instance runs in.
    pub region: String,
    /// Every region in the cluster, including the local one.
    pub regions: Vec<String>,

    // ── Health monitor ────────────────────────────────────────────
    pub health_check_interval_s: u64,
    pub health_timeout_s: u64,
    pub failure_threshold: u32,
    pub probe_max_in_flight: usize,
    pub probe_path: String,
    pub stale_heartbeat_s: u64,

    // ── Failover ──────────────────────────────────────────────────
    pub degraded_threshold: f64,
    pub failover_threshold: f64,
    pub recovery_threshold: f64,
    pub recovery_settle_s: u64,
    pub failover_check_interval_s: u64,
    pub failover_scale_factor: f64,

    // ── Autoscaler ────────────────────────────────────────────────
    pub autoscale_interval_s: u64,
    pub scale_up_minutes: u64,
    pub scale_down_minutes: u64,
    pub cooldown_s: u64,
    pub rps_window_s: u64,

    // ── Store ─────────────────────────────────────────────────────
    pub routing_fact_ttl_s: u64,
    pub terminated_grace_s: u64,
    pub store_retry_base_ms: u64,
    pub store_retry_cap_ms: u64,
    pub store_retry_max_attempts: usize,

    pub pools: Vec<PoolConfig>,
    pub region_latency: Vec<RegionLatency>,
}

mod defaults {
    pub fn target_rps_per_node() -> f64 {
        1.25
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            regions: vec![
                "us-east-1".to_string(),
                "us-east-2".to_string(),
                "us-west-2".to_string(),
            ],
            health_check_interval_s: 30,
            health_timeout_s: 10,
            failure_threshold: 3,
            probe_max_in_flight: 20,
            probe_path: "/health".to_string(),
            stale_heartbeat_s: 90,
            degraded_threshold: 0.50,
            failover_threshold: 0.30,
            recovery_threshold: 0.80,
            recovery_settle_s: 300,
            failover_check_interval_s: 60,
            failover_scale_factor: 1.5,
            autoscale_interval_s: 60,
            scale_up_minutes: 2,
            scale_down_minutes: 10,
            cooldown_s: 300,
            rps_window_s: 300,
            routing_fact_ttl_s: 3600,
            terminated_grace_s: 3600,
            store_retry_base_ms: 100,
            store_retry_cap_ms: 2000,
            store_retry_max_attempts: 3,
            pools: Vec::new(),
            region_latency: default_latency_matrix(),
        }
    }
}

fn default_latency_matrix() -> Vec<RegionLatency> {
    [
        ("us-east-1", "us-east-2", 15),
        ("us-east-1", "us-west-2", 70),
        ("us-east-2", "us-east-1", 15),
        ("us-east-2", "us-west-2", 55),
        ("us-west-2", "us-east-1", 70),
        ("us-west-2", "us-east-2", 55),
    ]
    .into_iter()
    .map(|(from, to, latency_ms)| RegionLatency {
        from: from.to_string(),
        to: to.to_string(),
        latency_ms,
    })
    .collect()
}

/// Apply `MRGC_<KEY>` overrides for the listed scalar fields.
macro_rules! env_overrides {
    ($cfg:expr, $lookup:expr, [$($field:ident),* $(,)?]) => {
        $(
            let key = concat!("MRGC_", stringify!($field)).to_ascii_uppercase();
            if let Some(raw) = $lookup(&key) {
                $cfg.$field = raw.trim().parse().map_err(|_| ConfigError::Override {
                    key: key.clone(),
                    value: raw.clone(),
                })?;
            }
        )*
    };
}

impl ControlPlaneConfig {
    /// Load from a TOML file, apply process environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        debug!(path = %path.display(), region = %config.region, "loaded control plane configuration");
        Ok(config)
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `MRGC_*` overrides read through `lookup`.
    ///
    /// `MRGC_REGIONS` is a comma-separated list.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        env_overrides!(self, lookup, [
            region,
            health_check_interval_s,
            health_timeout_s,
            failure_threshold,
            probe_max_in_flight,
            probe_path,
            stale_heartbeat_s,
            degraded_threshold,
            failover_threshold,
            recovery_threshold,
            recovery_settle_s,
            failover_check_interval_s,
            failover_scale_factor,
            autoscale_interval_s,
            scale_up_minutes,
            scale_down_minutes,
            cooldown_s,
            rps_window_s,
            routing_fact_ttl_s,
            terminated_grace_s,
            store_retry_base_ms,
            store_retry_cap_ms,
            store_retry_max_attempts,
        ]);

        if let Some(raw) = lookup("MRGC_REGIONS") {
            self.regions = raw
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    /// Reject configurations the control loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.region.is_empty() {
            return invalid("region must not be empty".into());
        }
        if !self.regions.contains(&self.region) {
            return invalid(format!(
                "local region {} is not listed in regions {:?}",
                self.region, self.regions
            ));
        }

        for (name, value) in [
            ("failover_threshold", self.failover_threshold),
            ("degraded_threshold", self.degraded_threshold),
            ("recovery_threshold", self.recovery_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return invalid(format!("{name} must be in (0, 1], got {value}"));
            }
        }
        if self.failover_threshold >= self.degraded_threshold {
            return invalid(format!(
                "failover_threshold ({}) must be below degraded_threshold ({})",
                self.failover_threshold, self.degraded_threshold
            ));
        }
        if self.degraded_threshold >= self.recovery_threshold {
            return invalid(format!(
                "degraded_threshold ({}) must be below recovery_threshold ({})",
                self.degraded_threshold, self.recovery_threshold
            ));
        }
        if self.failover_scale_factor < 1.0 {
            return invalid(format!(
                "failover_scale_factor must be >= 1.0, got {}",
                self.failover_scale_factor
            ));
        }

        for (name, value) in [
            ("health_check_interval_s", self.health_check_interval_s),
            ("health_timeout_s", self.health_timeout_s),
            ("failover_check_interval_s", self.failover_check_interval_s),
            ("autoscale_interval_s", self.autoscale_interval_s),
            ("rps_window_s", self.rps_window_s),
            ("routing_fact_ttl_s", self.routing_fact_ttl_s),
            ("stale_heartbeat_s", self.stale_heartbeat_s),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be greater than zero"));
            }
        }
        if self.failure_threshold == 0 {
            return invalid("failure_threshold must be at least 1".into());
        }
        if self.probe_max_in_flight == 0 {
            return invalid("probe_max_in_flight must be at least 1".into());
        }
        if self.store_retry_max_attempts == 0 {
            return invalid("store_retry_max_attempts must be at least 1".into());
        }
        if !self.probe_path.starts_with('/') {
            return invalid(format!("probe_path must start with '/', got {}", self.probe_path));
        }

        let mut seen = HashSet::new();
        for pool in &self.pools {
            if !seen.insert(pool.name.as_str()) {
                return invalid(format!("duplicate pool {}", pool.name));
            }
            if pool.min_capacity > pool.max_capacity {
                return invalid(format!(
                    "pool {}: min_capacity ({}) exceeds max_capacity ({})",
                    pool.name, pool.min_capacity, pool.max_capacity
                ));
            }
            if !(pool.target_rps_per_node > 0.0) {
                return invalid(format!(
                    "pool {}: target_rps_per_node must be positive",
                    pool.name
                ));
            }
        }

        Ok(())
    }

    /// Look up a pool by name.
    pub fn pool(&self, name: &str) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| p.name == name)
    }

    /// Latency from `from` to `to`, if the matrix has an entry.
    pub fn latency_ms(&self, from: &str, to: &str) -> Option<u32> {
        self.region_latency
            .iter()
            .find(|l| l.from == from && l.to == to)
            .map(|l| l.latency_ms)
    }

    /// Every configured region except the local one.
    pub fn peer_regions(&self) -> impl Iterator<Item = &str> {
        self.regions
            .iter()
            .map(String::as_str)
            .filter(move |r| *r != self.region)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_s)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_s)
    }

    pub fn recovery_settle(&self) -> Duration {
        Duration::from_secs(self.recovery_settle_s)
    }

    pub fn failover_check_interval(&self) -> Duration {
        Duration::from_secs(self.failover_check_interval_s)
    }

    pub fn autoscale_interval(&self) -> Duration {
        Duration::from_secs(self.autoscale_interval_s)
    }

    pub fn scale_up_window(&self) -> Duration {
        Duration::from_secs(self.scale_up_minutes * 60)
    }

    pub fn scale_down_window(&self) -> Duration {
        Duration::from_secs(self.scale_down_minutes * 60)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_s)
    }

    pub fn rps_window(&self) -> Duration {
        Duration::from_secs(self.rps_window_s)
    }

    pub fn stale_heartbeat(&self) -> Duration {
        Duration::from_secs(self.stale_heartbeat_s)
    }
}
