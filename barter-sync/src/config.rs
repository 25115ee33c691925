//! Runtime configuration with `SYNC_*` environment overrides.

use crate::{
    cache::TtlPolicy,
    coordinator::{ClassTag, CoordinatorConfig, DEFAULT_REQUEST_TIMEOUT},
    debounce::DEFAULT_DEBOUNCE,
    error::SyncError,
    render::{DEFAULT_TEARDOWN_FALLBACK, DEFAULT_TEARDOWN_TIMEOUT, RenderConfig},
    scheduler::{DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD, DEFAULT_POLL_INTERVAL, PollingConfig},
};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};
use tracing::warn;

/// Default TTL of the primary (history) data class.
pub const DEFAULT_PRIMARY_TTL: Duration = Duration::from_secs(30);

/// Default TTL of the secondary (analytics) data class.
pub const DEFAULT_SECONDARY_TTL: Duration = Duration::from_secs(5 * 60);

/// Configuration for a [`Controller`](crate::controller::Controller) and the components it wires.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SyncConfig {
    pub debounce: Duration,
    pub poll_interval: Duration,
    /// Consecutive Timeout/Failure outcomes before polling halts. 0 disables the breaker.
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub request_timeout: Duration,
    pub primary_ttl: Duration,
    pub secondary_ttl: Duration,
    pub teardown_fallback: Duration,
    pub teardown_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            primary_ttl: DEFAULT_PRIMARY_TTL,
            secondary_ttl: DEFAULT_SECONDARY_TTL,
            teardown_fallback: DEFAULT_TEARDOWN_FALLBACK,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

impl SyncConfig {
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_primary_ttl(mut self, ttl: Duration) -> Self {
        self.primary_ttl = ttl;
        self
    }

    pub fn with_secondary_ttl(mut self, ttl: Duration) -> Self {
        self.secondary_ttl = ttl;
        self
    }

    pub fn with_teardown_fallback(mut self, delay: Duration) -> Self {
        self.teardown_fallback = delay;
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    /// Defaults overlaid with `SYNC_*` environment variables. Unparseable or invalid values are
    /// logged and ignored.
    ///
    /// | Variable | Unit |
    /// |---|---|
    /// | `SYNC_DEBOUNCE_MS` | ms |
    /// | `SYNC_POLL_INTERVAL_SECS` | s |
    /// | `SYNC_FAILURE_THRESHOLD` | count |
    /// | `SYNC_COOLDOWN_SECS` | s |
    /// | `SYNC_REQUEST_TIMEOUT_SECS` | s |
    /// | `SYNC_PRIMARY_TTL_SECS` | s |
    /// | `SYNC_SECONDARY_TTL_SECS` | s |
    /// | `SYNC_TEARDOWN_FALLBACK_MS` | ms |
    /// | `SYNC_TEARDOWN_TIMEOUT_MS` | ms |
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// As [`Self::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| {
            parse_var::<u64, _>(&lookup, name).map_or(default, Duration::from_millis)
        };
        let secs = |name: &str, default: Duration| {
            parse_var::<u64, _>(&lookup, name).map_or(default, Duration::from_secs)
        };

        let config = Self {
            debounce: millis("SYNC_DEBOUNCE_MS", defaults.debounce),
            poll_interval: secs("SYNC_POLL_INTERVAL_SECS", defaults.poll_interval),
            failure_threshold: parse_var(&lookup, "SYNC_FAILURE_THRESHOLD")
                .unwrap_or(defaults.failure_threshold),
            cooldown: secs("SYNC_COOLDOWN_SECS", defaults.cooldown),
            request_timeout: secs("SYNC_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            primary_ttl: secs("SYNC_PRIMARY_TTL_SECS", defaults.primary_ttl),
            secondary_ttl: secs("SYNC_SECONDARY_TTL_SECS", defaults.secondary_ttl),
            teardown_fallback: millis("SYNC_TEARDOWN_FALLBACK_MS", defaults.teardown_fallback),
            teardown_timeout: millis("SYNC_TEARDOWN_TIMEOUT_MS", defaults.teardown_timeout),
        };

        match config.validate() {
            Ok(()) => config,
            Err(error) => {
                warn!(%error, "invalid SYNC_* configuration, using defaults");
                defaults
            }
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.poll_interval.is_zero() {
            return Err(SyncError::Config("poll interval must be non-zero".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(SyncError::Config("request timeout must be non-zero".to_string()));
        }
        if self.failure_threshold > 0 && self.cooldown.is_zero() {
            return Err(SyncError::Config(
                "cooldown must be non-zero when the failure breaker is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::default().with_default_timeout(self.request_timeout)
    }

    pub fn polling_config(&self) -> PollingConfig {
        PollingConfig {
            failure_threshold: self.failure_threshold,
            cooldown: self.cooldown,
        }
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy::new(self.primary_ttl)
            .with_ttl(ClassTag::primary(), self.primary_ttl)
            .with_ttl(ClassTag::secondary(), self.secondary_ttl)
    }

    pub fn render_config(&self) -> RenderConfig {
        RenderConfig {
            teardown_fallback: self.teardown_fallback,
            teardown_timeout: self.teardown_timeout,
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, value = %raw, "ignoring unparseable environment variable");
            None
        }
    }
}
