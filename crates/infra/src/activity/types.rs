//! Activity kinds, retry policy and errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use billflow_core::DomainError;

use crate::ledger_store::LedgerError;

/// The durable mutations a controller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    CreateBill,
    LoadBill,
    AppendLineItem,
    CloseBill,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::CreateBill => "create_bill",
            ActivityKind::LoadBill => "load_bill",
            ActivityKind::AppendLineItem => "append_line_item",
            ActivityKind::CloseBill => "close_bill",
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy for one durable mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (values below 1 behave as 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so concurrent bills don't retry in lockstep.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts have failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Executor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityConfig {
    pub retry: RetryPolicy,
    /// Upper bound for one attempt, so a slow write cannot hold back the deadline.
    pub max_attempt_timeout: Duration,
    /// Lower bound, used once the bill's period has already ended.
    pub min_attempt_timeout: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_attempt_timeout: Duration::from_secs(30),
            min_attempt_timeout: Duration::from_secs(1),
        }
    }
}

impl ActivityConfig {
    /// Per-attempt timeout given the time left until the bill's period end.
    pub fn attempt_timeout(&self, remaining: Duration) -> Duration {
        let floor = self.min_attempt_timeout.min(self.max_attempt_timeout);
        remaining.clamp(floor, self.max_attempt_timeout)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActivityError {
    /// Deterministic failure; surfaced without retry.
    #[error("{kind} rejected: {error}")]
    Rejected { kind: ActivityKind, error: LedgerError },

    /// Transient failures outlasted the retry policy.
    #[error("{kind} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        kind: ActivityKind,
        attempts: u32,
        last_error: LedgerError,
    },
}

impl ActivityError {
    pub fn kind(&self) -> ActivityKind {
        match self {
            ActivityError::Rejected { kind, .. } | ActivityError::Exhausted { kind, .. } => *kind,
        }
    }

    pub fn ledger_error(&self) -> &LedgerError {
        match self {
            ActivityError::Rejected { error, .. } => error,
            ActivityError::Exhausted { last_error, .. } => last_error,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, ActivityError::Exhausted { .. })
    }

    /// Domain error for a rejection; `None` when retries were exhausted.
    pub fn rejection(&self) -> Option<DomainError> {
        match self {
            ActivityError::Rejected { error, .. } => Some(error.to_domain()),
            ActivityError::Exhausted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(500))
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(50));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(50));

        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
            ..RetryPolicy::fixed(3, Duration::from_millis(50))
        };
        assert_eq!(linear.delay_for_attempt(2), Duration::from_millis(50));

        let linear = RetryPolicy {
            max_delay: Duration::from_secs(1),
            ..linear
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(150));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1000), Duration::from_secs(10));
        for attempt in 1..=4 {
            let base = 1000.0 * 2_f64.powi(attempt as i32 - 1);
            let ms = policy.delay_for_attempt(attempt).as_millis() as f64;
            assert!(ms >= base * 0.9 - 1.0 && ms <= base * 1.1 + 1.0, "attempt {attempt}: {ms}");
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        assert!(!RetryPolicy::no_retry().should_retry(1));
        let zero = RetryPolicy { max_attempts: 0, ..RetryPolicy::no_retry() };
        assert!(!zero.should_retry(1));
    }

    #[test]
    fn attempt_timeout_tracks_remaining_period() {
        let config = ActivityConfig {
            retry: RetryPolicy::no_retry(),
            max_attempt_timeout: Duration::from_secs(30),
            min_attempt_timeout: Duration::from_secs(1),
        };
        assert_eq!(config.attempt_timeout(Duration::from_secs(3600)), Duration::from_secs(30));
        assert_eq!(config.attempt_timeout(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(config.attempt_timeout(Duration::ZERO), Duration::from_secs(1));
    }

    #[test]
    fn rejection_maps_to_domain_error() {
        let err = ActivityError::Rejected {
            kind: ActivityKind::AppendLineItem,
            error: LedgerError::BillClosed(billflow_core::BillId::new()),
        };
        assert!(matches!(err.rejection(), Some(DomainError::PreconditionFailed(_))));

        let exhausted = ActivityError::Exhausted {
            kind: ActivityKind::CloseBill,
            attempts: 5,
            last_error: LedgerError::Unavailable("down".into()),
        };
        assert!(exhausted.rejection().is_none());
        assert!(exhausted.is_exhausted());
    }
}
