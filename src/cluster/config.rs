//! Cluster configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::utils::retry::RetryConfig;

/// Timing and naming shared by the registry, the elector and the watcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Prefix for every coordination key (`<prefix>/nodes/<id>`, `<prefix>/leader`)
    pub key_prefix: String,

    /// Node lease TTL in milliseconds
    pub lease_ttl_ms: u64,

    /// Consecutive failed renewals tolerated before a lease is given up
    pub renew_retry_budget: u32,

    /// Leader lock TTL in milliseconds
    pub leader_ttl_ms: u64,

    /// Long-poll wait of the node watch in milliseconds
    pub watch_wait_ms: u64,

    /// Pause after a failed watch call in milliseconds
    pub watch_retry_delay_ms: u64,

    /// Deadline of a single store call in milliseconds
    pub call_timeout_ms: u64,

    /// Local retry policy for transient store failures
    pub retry: RetryConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            key_prefix: "crawlmesh".to_string(),
            lease_ttl_ms: 30_000,
            renew_retry_budget: 3,
            leader_ttl_ms: 15_000,
            watch_wait_ms: 30_000,
            watch_retry_delay_ms: 5_000,
            call_timeout_ms: 5_000,
            retry: RetryConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Create a new config builder
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Node lease renewal period (TTL/3)
    pub fn renew_interval(&self) -> Duration {
        self.lease_ttl() / 3
    }

    pub fn leader_ttl(&self) -> Duration {
        Duration::from_millis(self.leader_ttl_ms)
    }

    /// Leader lock renewal and campaign period (lock TTL/3)
    pub fn leader_renew_interval(&self) -> Duration {
        self.leader_ttl() / 3
    }

    pub fn watch_wait(&self) -> Duration {
        Duration::from_millis(self.watch_wait_ms)
    }

    pub fn watch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.watch_retry_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::MissingField {
                field: "key_prefix".to_string(),
            });
        }

        if self.lease_ttl_ms < 3 {
            return Err(ConfigError::InvalidValue {
                field: "lease_ttl_ms".to_string(),
                reason: "TTL must leave room for renewal at TTL/3".to_string(),
            });
        }

        if self.leader_ttl_ms < 3 {
            return Err(ConfigError::InvalidValue {
                field: "leader_ttl_ms".to_string(),
                reason: "TTL must leave room for renewal at TTL/3".to_string(),
            });
        }

        if self.call_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "call_timeout_ms".to_string(),
                reason: "Store calls need a non-zero deadline".to_string(),
            });
        }

        if self.call_timeout_ms >= self.lease_ttl_ms {
            return Err(ConfigError::InvalidValue {
                field: "call_timeout_ms".to_string(),
                reason: "Call timeout must be shorter than the lease TTL".to_string(),
            });
        }

        Ok(())
    }
}

/// Builder for ClusterConfig
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    key_prefix: Option<String>,
    lease_ttl: Option<Duration>,
    renew_retry_budget: Option<u32>,
    leader_ttl: Option<Duration>,
    watch_wait: Option<Duration>,
    watch_retry_delay: Option<Duration>,
    call_timeout: Option<Duration>,
    retry: Option<RetryConfig>,
}

impl ClusterConfigBuilder {
    /// Set the key prefix
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Set the node lease TTL
    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    /// Set the renewal retry budget
    pub fn renew_retry_budget(mut self, budget: u32) -> Self {
        self.renew_retry_budget = Some(budget);
        self
    }

    /// Set the leader lock TTL
    pub fn leader_ttl(mut self, ttl: Duration) -> Self {
        self.leader_ttl = Some(ttl);
        self
    }

    /// Set the watch long-poll wait
    pub fn watch_wait(mut self, wait: Duration) -> Self {
        self.watch_wait = Some(wait);
        self
    }

    /// Set the pause after a failed watch call
    pub fn watch_retry_delay(mut self, delay: Duration) -> Self {
        self.watch_retry_delay = Some(delay);
        self
    }

    /// Set the per-call store deadline
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Set the retry policy for transient store failures
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Build the config
    pub fn build(self) -> Result<ClusterConfig, ConfigError> {
        let defaults = ClusterConfig::default();
        let millis = |d: Option<Duration>, default: u64| {
            d.map_or(default, |d| d.as_millis() as u64)
        };

        let config = ClusterConfig {
            key_prefix: self.key_prefix.unwrap_or(defaults.key_prefix),
            lease_ttl_ms: millis(self.lease_ttl, defaults.lease_ttl_ms),
            renew_retry_budget: self
                .renew_retry_budget
                .unwrap_or(defaults.renew_retry_budget),
            leader_ttl_ms: millis(self.leader_ttl, defaults.leader_ttl_ms),
            watch_wait_ms: millis(self.watch_wait, defaults.watch_wait_ms),
            watch_retry_delay_ms: millis(self.watch_retry_delay, defaults.watch_retry_delay_ms),
            call_timeout_ms: millis(self.call_timeout, defaults.call_timeout_ms),
            retry: self.retry.unwrap_or(defaults.retry),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue { field: String, reason: String },
    MissingField { field: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
            Self::MissingField { field } => {
                write!(f, "Missing required field: {}", field)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
