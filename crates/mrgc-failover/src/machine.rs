//! The failover state machine.

use std::time::Duration;

use mrgc_core::ControlPlaneConfig;
use mrgc_state::FailoverState;
use serde::{Deserialize, Serialize};

/// Healthy-ratio boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailoverThresholds {
    pub failover: f64,
    pub degraded: f64,
    pub recovery: f64,
}

impl Default for FailoverThresholds {
    fn default() -> Self {
        Self {
            failover: 0.30,
            degraded: 0.50,
            recovery: 0.80,
        }
    }
}

impl FailoverThresholds {
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self {
            failover: config.failover_threshold,
            degraded: config.degraded_threshold,
            recovery: config.recovery_threshold,
        }
    }
}

/// The transition rule, without the settle window.
///
/// A ratio inside `[degraded, recovery)` holds the current state.
pub fn next_state(current: FailoverState, ratio: f64, t: &FailoverThresholds) -> FailoverState {
    let ratio = if ratio.is_nan() { 0.0 } else { ratio };
    if ratio < t.failover {
        FailoverState::FailoverActive
    } else if ratio < t.degraded {
        FailoverState::Degraded
    } else if ratio >= t.recovery {
        match current {
            FailoverState::Recovering => FailoverState::Normal,
            FailoverState::FailoverActive => FailoverState::Recovering,
            _ => FailoverState::Normal,
        }
    } else {
        current
    }
}

/// A state change produced by [`FailoverMachine::observe`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub from: FailoverState,
    pub to: FailoverState,
    pub at_ms: u64,
}

/// One region's failover state plus the time it was entered.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverMachine {
    state: FailoverState,
    since_ms: u64,
    thresholds: FailoverThresholds,
    settle: Duration,
}

impl FailoverMachine {
    pub fn new(thresholds: FailoverThresholds, settle: Duration, now_ms: u64) -> Self {
        Self {
            state: FailoverState::Normal,
            since_ms: now_ms,
            thresholds,
            settle,
        }
    }

    /// Resume from a previously published decision.
    pub fn resume(&mut self, state: FailoverState, since_ms: u64) {
        self.state = state;
        self.since_ms = since_ms;
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    pub fn since_ms(&self) -> u64 {
        self.since_ms
    }

    /// Feed one healthy-ratio reading.
    ///
    /// RECOVERING only collapses to NORMAL once it has been held for the
    /// settle window, measured on the clock.
    pub fn observe(&mut self, ratio: f64, now_ms: u64) -> Option<Transition> {
        let mut next = next_state(self.state, ratio, &self.thresholds);
        if self.state == FailoverState::Recovering
            && next == FailoverState::Normal
            && now_ms.saturating_sub(self.since_ms) < self.settle.as_millis() as u64
        {
            next = FailoverState::Recovering;
        }
        if next == self.state {
            return None;
        }
        let transition = Transition {
            from: self.state,
            to: next,
            at_ms: now_ms,
        };
        self.state = next;
        self.since_ms = now_ms;
        Some(transition)
    }
}
