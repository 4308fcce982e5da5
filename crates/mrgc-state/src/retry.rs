//! Bounded exponential backoff for store operations.
//!
//! Only transient errors are retried. Once the attempts are exhausted the
//! failure is surfaced as [`StateError::Unavailable`]; it is never dropped.

use std::time::Duration;

use mrgc_core::ControlPlaneConfig;
use tracing::{debug, warn};

use crate::error::StateError;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = if max_delay.is_zero() {
            None
        } else {
            Some(max_delay)
        };
        self
    }

    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self::exponential(
            config.store_retry_max_attempts,
            Duration::from_millis(config.store_retry_base_ms),
        )
        .with_max_delay(Duration::from_millis(config.store_retry_cap_ms))
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let scaled = self.base_delay.as_millis().saturating_mul(1u128 << shift);
        let raw = Duration::from_millis(scaled.min(u128::from(u64::MAX)) as u64);
        match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(100)).with_max_delay(Duration::from_secs(2))
    }
}

/// An error that can tell a transient store failure from a permanent one.
///
/// Implemented by every error type that wraps [`StateError`], so writes
/// made through higher layers share the same backoff.
pub trait Transient: std::fmt::Display + From<StateError> {
    fn is_transient(&self) -> bool;
}

impl Transient for StateError {
    fn is_transient(&self) -> bool {
        StateError::is_transient(self)
    }
}

/// Run `f` until it succeeds, fails permanently, or runs out of attempts.
pub async fn retry<T, E, F>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T, E>
where
    E: Transient,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                warn!(%op, attempts = attempt, error = %e, "store operation exhausted retries");
                return Err(StateError::Unavailable {
                    op: op.to_string(),
                    attempts: attempt,
                    last: e.to_string(),
                }
                .into());
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                debug!(%op, attempt, ?delay, error = %e, "transient store error, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(250));
    }

    #[test]
    fn from_config_uses_store_keys() {
        let policy = RetryPolicy::from_config(&ControlPlaneConfig::default());
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.max_attempts(), 3);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1));
        let mut calls = 0;
        let result = retry(&policy, "put", || {
            calls += 1;
            if calls < 3 {
                Err(StateError::Transaction("throttled".into()))
            } else {
                Ok(calls)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_unavailable() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1));
        let mut calls = 0;
        let err = retry::<(), StateError, _>(&policy, "put node", || {
            calls += 1;
            Err(StateError::Write("throttled".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(calls, 3);
        match err {
            StateError::Unavailable { op, attempts, last } => {
                assert_eq!(op, "put node");
                assert_eq!(attempts, 3);
                assert!(last.contains("throttled"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1));
        let mut calls = 0;
        let err = retry::<(), StateError, _>(&policy, "get", || {
            calls += 1;
            Err(StateError::NotFound("n1".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, StateError::NotFound(_)));
    }
}
