//! Engine configuration, overridable from the environment.

use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub const LEDGER_LOCK_TIMEOUT_MS: &str = "STOCKFLOW_LEDGER_LOCK_TIMEOUT_MS";
pub const LEDGER_RETRY_ATTEMPTS: &str = "STOCKFLOW_LEDGER_RETRY_ATTEMPTS";
pub const LEDGER_RETRY_BASE_MS: &str = "STOCKFLOW_LEDGER_RETRY_BASE_MS";
pub const LEDGER_RETRY_MAX_MS: &str = "STOCKFLOW_LEDGER_RETRY_MAX_MS";
pub const TRANSFER_AUTO_ISSUE: &str = "STOCKFLOW_TRANSFER_AUTO_ISSUE";

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// How long to wait for a ledger key's critical section before `LedgerBusy`.
    pub ledger_lock_timeout: Duration,
    pub ledger_retry: RetryPolicy,
    /// Spawn the export issue as soon as a transfer is created.
    pub transfer_auto_issue: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger_lock_timeout: Duration::from_millis(250),
            ledger_retry: RetryPolicy::default(),
            transfer_auto_issue: true,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source. Missing keys keep the default; invalid
    /// values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let retry = &defaults.ledger_retry;

        let lock_default = defaults.ledger_lock_timeout.as_millis() as u64;
        let lock_ms = parse_or(&lookup, LEDGER_LOCK_TIMEOUT_MS, lock_default);
        let attempts = parse_or(&lookup, LEDGER_RETRY_ATTEMPTS, retry.max_attempts);
        let base_ms = parse_or(&lookup, LEDGER_RETRY_BASE_MS, retry.base_delay.as_millis() as u64);
        let max_ms = parse_or(&lookup, LEDGER_RETRY_MAX_MS, retry.max_delay.as_millis() as u64);
        let auto_issue = parse_or(&lookup, TRANSFER_AUTO_ISSUE, defaults.transfer_auto_issue);

        Self {
            ledger_lock_timeout: Duration::from_millis(lock_ms),
            ledger_retry: RetryPolicy::exponential(
                attempts,
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms.max(base_ms)),
            ),
            transfer_auto_issue: auto_issue,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.ledger_lock_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.ledger_retry = policy;
        self
    }

    pub fn with_transfer_auto_issue(mut self, enabled: bool) -> Self {
        self.transfer_auto_issue = enabled;
        self
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + core::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    key,
                    value = %raw,
                    ?default,
                    "invalid configuration value; using default"
                );
                default
            }
        },
    }
}
