//! Retry policy configuration
//!
//! A [`RetryPolicy`] is plain data attached to a task at registration time and
//! snapshotted onto every task run. The decision logic lives in the engine's
//! retry policy engine; this module only computes pre-jitter delays.

use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    pub delay: DelayStrategy,
    pub retry_on: RetryCondition,
}

impl RetryPolicy {
    /// Single attempt, never retried
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: DelayStrategy::None,
            retry_on: RetryCondition::Any,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay: DelayStrategy::Fixed { delay },
            retry_on: RetryCondition::Any,
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            delay: DelayStrategy::Exponential {
                base,
                max,
                jitter: 0.0,
            },
            retry_on: RetryCondition::Any,
        }
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        if let DelayStrategy::Exponential { jitter, .. } = &mut self.delay {
            *jitter = fraction;
        }
        self
    }

    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_on = condition;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidRetryPolicy(
                "max_attempts must be at least 1".into(),
            ));
        }
        match &self.delay {
            DelayStrategy::Exponential { base, max, jitter } => {
                if base > max {
                    return Err(ValidationError::InvalidRetryPolicy(format!(
                        "exponential base {:?} exceeds cap {:?}",
                        base, max
                    )));
                }
                if !(0.0..=1.0).contains(jitter) {
                    return Err(ValidationError::InvalidRetryPolicy(format!(
                        "jitter fraction {} outside [0, 1]",
                        jitter
                    )));
                }
            }
            DelayStrategy::Schedule { delays } if delays.is_empty() => {
                return Err(ValidationError::InvalidRetryPolicy(
                    "explicit delay schedule is empty".into(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// How long to wait before the next attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DelayStrategy {
    /// Retry immediately
    None,
    Fixed {
        delay: Duration,
    },
    /// `base * 2^(attempt-1)` capped at `max`, jittered by ±`jitter` fraction
    Exponential {
        base: Duration,
        max: Duration,
        #[serde(default)]
        jitter: f64,
    },
    /// Explicit per-attempt delays; the last entry repeats
    Schedule {
        delays: Vec<Duration>,
    },
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

impl DelayStrategy {
    /// Delay before retrying after failed attempt `attempt` (1-based), before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            DelayStrategy::None => Duration::ZERO,
            DelayStrategy::Fixed { delay } => *delay,
            DelayStrategy::Exponential { base, max, .. } => {
                let exponent = (attempt - 1).min(63);
                let factor = 1u64 << exponent;
                let nanos = base.as_nanos().saturating_mul(u128::from(factor));
                if nanos >= max.as_nanos() {
                    *max
                } else {
                    // Below `max`, so the whole seconds fit in a u64
                    let secs = (nanos / NANOS_PER_SEC) as u64;
                    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
                }
            }
            DelayStrategy::Schedule { delays } => {
                let index = (attempt as usize - 1).min(delays.len().saturating_sub(1));
                delays.get(index).copied().unwrap_or(Duration::ZERO)
            }
        }
    }

    /// Jitter fraction applied on top of [`base_delay`](Self::base_delay)
    pub fn jitter(&self) -> f64 {
        match self {
            DelayStrategy::Exponential { jitter, .. } => *jitter,
            _ => 0.0,
        }
    }
}

/// Which failure kinds are eligible for retry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "kinds", rename_all = "snake_case")]
pub enum RetryCondition {
    Any,
    Only(Vec<String>),
    Except(Vec<String>),
}

impl RetryCondition {
    pub fn allows(&self, kind: &str) -> bool {
        match self {
            RetryCondition::Any => true,
            RetryCondition::Only(kinds) => kinds.iter().any(|k| k == kind),
            RetryCondition::Except(kinds) => !kinds.iter().any(|k| k == kind),
        }
    }
}

/// Outcome of consulting the retry policy engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry(_))
    }
}
