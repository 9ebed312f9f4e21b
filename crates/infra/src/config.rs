//! Configuration loading and representation.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::activity::{ActivityConfig, RetryPolicy};
use crate::lifecycle::ControllerSettings;

/// Runtime settings, read from `BILLFLOW_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub retry: RetryPolicy,
    pub activity_max_timeout: Duration,
    pub activity_min_timeout: Duration,
    pub mailbox_capacity: usize,
    pub deadline_retry: Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            database_url: None,
            db_max_connections: 10,
            retry,
            activity_max_timeout: Duration::from_secs(30),
            activity_min_timeout: Duration::from_secs(1),
            mailbox_capacity: 256,
            deadline_retry: Duration::from_secs(5),
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Malformed values fall back to the default
    /// with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let retry = RetryPolicy {
            max_attempts: parse_or(&lookup, "BILLFLOW_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
            base_delay: millis_or(&lookup, "BILLFLOW_RETRY_BASE_DELAY_MS", defaults.retry.base_delay),
            max_delay: millis_or(&lookup, "BILLFLOW_RETRY_MAX_DELAY_MS", defaults.retry.max_delay),
            ..defaults.retry.clone()
        };

        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            db_max_connections: parse_or(&lookup, "BILLFLOW_DB_MAX_CONNECTIONS", defaults.db_max_connections),
            retry,
            activity_max_timeout: millis_or(
                &lookup,
                "BILLFLOW_ACTIVITY_MAX_TIMEOUT_MS",
                defaults.activity_max_timeout,
            ),
            activity_min_timeout: millis_or(
                &lookup,
                "BILLFLOW_ACTIVITY_MIN_TIMEOUT_MS",
                defaults.activity_min_timeout,
            ),
            mailbox_capacity: parse_or(&lookup, "BILLFLOW_MAILBOX_CAPACITY", defaults.mailbox_capacity),
            deadline_retry: millis_or(&lookup, "BILLFLOW_DEADLINE_RETRY_MS", defaults.deadline_retry),
        }
    }

    pub fn activity_config(&self) -> ActivityConfig {
        ActivityConfig {
            retry: self.retry.clone(),
            max_attempt_timeout: self.activity_max_timeout,
            min_attempt_timeout: self.activity_min_timeout,
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            deadline_retry: self.deadline_retry,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default = ?default, "malformed config value, using default");
                default
            }
        },
    }
}

fn millis_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    Duration::from_millis(parse_or(lookup, key, default.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = BillingConfig::from_lookup(lookup(&[]));
        assert_eq!(config, BillingConfig::default());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(200));
        assert_eq!(config.mailbox_capacity, 256);
    }

    #[test]
    fn values_are_read_from_lookup() {
        let config = BillingConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/billing"),
            ("BILLFLOW_RETRY_MAX_ATTEMPTS", "3"),
            ("BILLFLOW_ACTIVITY_MAX_TIMEOUT_MS", "2500"),
            ("BILLFLOW_DEADLINE_RETRY_MS", "100"),
        ]));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/billing"));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.activity_config().max_attempt_timeout, Duration::from_millis(2500));
        assert_eq!(config.controller_settings().deadline_retry, Duration::from_millis(100));
    }

    #[test]
    fn malformed_values_fall_back() {
        let config = BillingConfig::from_lookup(lookup(&[
            ("BILLFLOW_DB_MAX_CONNECTIONS", "lots"),
            ("BILLFLOW_MAILBOX_CAPACITY", "-4"),
            ("DATABASE_URL", "  "),
        ]));
        assert_eq!(config.db_max_connections, 10);
        assert_eq!(config.mailbox_capacity, 256);
        assert!(config.database_url.is_none());
    }
}
