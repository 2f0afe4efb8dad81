//! # Retry Backoff
//!
//! Exponential backoff plus the retry policy that decides, per error class,
//! whether a failed reconcile is retried, requeued immediately or escalated.
//!
//! Delays grow as `base * multiplier^(attempt - 1)` and are capped at `max`.
//! With the defaults (1s, x2, 300s cap): 1s, 2s, 4s, 8s, ... 256s, 300s.

use std::time::Duration;

use chrono::{DateTime, Utc};
use crds::ErrorClass;

use crate::config::RetryConfig;

/// Exponential backoff calculator
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self { base, multiplier, max }
    }

    /// Delay before retry number `attempt` (1-based, stateless)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.base.min(self.max);
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

/// What to do after a failed reconcile attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-reconcile right away without consuming retry budget
    RequeueNow,
    /// Retry after the given delay
    RetryAfter(Duration),
    /// Give up; the failure escalates to a state transition
    Exhausted,
}

/// Maps error classes onto retry decisions
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: ExponentialBackoff,
    max_attempts: u32,
    quota_floor: Duration,
    quota_escalation: chrono::Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            backoff: ExponentialBackoff::new(
                Duration::from_millis(config.base_delay_ms),
                config.multiplier,
                Duration::from_secs(config.max_delay_secs),
            ),
            max_attempts: config.max_attempts,
            quota_floor: Duration::from_secs(config.quota_floor_secs),
            quota_escalation: chrono::Duration::seconds(
                i64::try_from(config.quota_escalation_secs).unwrap_or(i64::MAX),
            ),
        }
    }

    /// Decide how to continue after the `attempt`-th consecutive failure
    ///
    /// `quota_since` is when the current run of quota rejections started.
    pub fn decide(
        &self,
        class: ErrorClass,
        attempt: u32,
        quota_since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        match class {
            ErrorClass::Conflict => RetryDecision::RequeueNow,
            ErrorClass::SpecInvalid | ErrorClass::PermissionDenied => RetryDecision::Exhausted,
            ErrorClass::Transient | ErrorClass::NotFound => {
                if attempt >= self.max_attempts {
                    RetryDecision::Exhausted
                } else {
                    RetryDecision::RetryAfter(self.backoff.delay_for_attempt(attempt))
                }
            }
            ErrorClass::QuotaExceeded => {
                let since = quota_since.unwrap_or(now);
                if now - since >= self.quota_escalation {
                    RetryDecision::Exhausted
                } else {
                    RetryDecision::RetryAfter(self.backoff.delay_for_attempt(attempt).max(self.quota_floor))
                }
            }
        }
    }

    /// Backoff for failures that are retried forever (teardown)
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}
