//! Retry schedule shared by every device query
//!
//! A [`BackoffPolicy`] produces a finite, restartable sequence of
//! [`Attempt`]s. Each attempt carries the delay to wait before it and the
//! timeout to give the underlying request. Delays grow exponentially from
//! `initial_delay_ms` up to `max_delay_ms`; the first attempt never waits.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, PartialEq)]
pub enum BackoffError {
    #[error("max_attempts must be at least 1")]
    NoAttempts,
    #[error("timeout_ms must be greater than zero")]
    ZeroTimeout,
    #[error("multiplier must be >= 1.0, got {0}")]
    InvalidMultiplier(f64),
    #[error("max_delay_ms ({max}) is smaller than initial_delay_ms ({initial})")]
    DelayRange { initial: u64, max: u64 },
}

/// One step of a retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number
    pub number: u32,
    /// Time to wait before issuing this attempt
    pub delay: Duration,
    /// Time the request may take
    pub timeout: Duration,
}

/// Retry/timeout schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-attempt request timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Delay before the second attempt
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    4000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::battery()
    }
}

impl BackoffPolicy {
    /// Battery status queries
    pub fn battery() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timeout_ms: default_timeout_ms(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }

    /// Initial ping of a freshly connected device (receivers wake slowly)
    pub fn init() -> Self {
        Self {
            max_attempts: 5,
            timeout_ms: 1000,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
            multiplier: 2.0,
        }
    }

    /// Feature table enumeration
    pub fn feature_enumeration() -> Self {
        Self {
            max_attempts: 3,
            timeout_ms: 1000,
            initial_delay_ms: 200,
            max_delay_ms: 1000,
            multiplier: 2.0,
        }
    }

    /// Reject schedules that could never produce a useful attempt
    pub fn validate(&self) -> Result<(), BackoffError> {
        if self.max_attempts == 0 {
            return Err(BackoffError::NoAttempts);
        }
        if self.timeout_ms == 0 {
            return Err(BackoffError::ZeroTimeout);
        }
        if !(self.multiplier >= 1.0) {
            return Err(BackoffError::InvalidMultiplier(self.multiplier));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(BackoffError::DelayRange {
                initial: self.initial_delay_ms,
                max: self.max_delay_ms,
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before the given 1-based attempt
    pub fn delay_for(&self, number: u32) -> Duration {
        if number <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(number.saturating_sub(2) as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Fresh attempt sequence; calling again restarts the schedule
    pub fn attempts(&self) -> impl Iterator<Item = Attempt> + '_ {
        (1..=self.max_attempts).map(move |number| Attempt {
            number,
            delay: self.delay_for(number),
            timeout: self.timeout(),
        })
    }

    /// Run `op` under this schedule until it yields a value.
    ///
    /// Delays only suspend the calling task. Returns `None` once every attempt
    /// has come back empty.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Option<T>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for attempt in self.attempts() {
            if attempt.number > 1 {
                debug!(
                    what,
                    attempt = attempt.number,
                    max_attempts = self.max_attempts,
                    delay_ms = attempt.delay.as_millis() as u64,
                    "Retrying"
                );
                tokio::time::sleep(attempt.delay).await;
            }

            if let Some(value) = op(attempt).await {
                return Some(value);
            }
        }

        warn!(what, attempts = self.max_attempts, "Giving up after all attempts");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_attempt_schedule() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            timeout_ms: 250,
            initial_delay_ms: 100,
            max_delay_ms: 300,
            multiplier: 2.0,
        };

        let delays: Vec<u64> = policy
            .attempts()
            .map(|a| a.delay.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 100, 200, 300, 300]);

        let numbers: Vec<u32> = policy.attempts().map(|a| a.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert!(policy
            .attempts()
            .all(|a| a.timeout == Duration::from_millis(250)));
    }

    #[test]
    fn test_schedule_is_restartable() {
        let policy = BackoffPolicy::battery();
        let first: Vec<Attempt> = policy.attempts().collect();
        let second: Vec<Attempt> = policy.attempts().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_validate() {
        assert!(BackoffPolicy::battery().validate().is_ok());
        assert!(BackoffPolicy::init().validate().is_ok());
        assert!(BackoffPolicy::feature_enumeration().validate().is_ok());

        let mut policy = BackoffPolicy::battery();
        policy.max_attempts = 0;
        assert_eq!(policy.validate(), Err(BackoffError::NoAttempts));

        let mut policy = BackoffPolicy::battery();
        policy.multiplier = 0.5;
        assert_eq!(policy.validate(), Err(BackoffError::InvalidMultiplier(0.5)));

        let mut policy = BackoffPolicy::battery();
        policy.max_delay_ms = 10;
        assert!(matches!(policy.validate(), Err(BackoffError::DelayRange { .. })));
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let policy: BackoffPolicy = serde_json::from_str(r#"{"max_attempts": 7}"#).unwrap();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.timeout_ms, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_at_first_value() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::battery();

        let result = policy
            .retry("test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { (attempt.number == 2).then_some(attempt.number) }
            })
            .await;

        assert_eq!(result, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::battery();

        let result: Option<()> = policy
            .retry("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { None }
            })
            .await;

        assert_eq!(result, None);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
