//! Priority-tiered job queue
//!
//! One broker topic per integer priority (`<prefix>-p0` ..= `<prefix>-p10`)
//! plus a dead-letter topic (`<prefix>-dead-letter`). Consumers take from the
//! highest non-empty tier on every cycle; a failed job is republished with
//! backoff until its retry budget runs out and then dead-lettered.

pub mod error;
pub mod job;
pub mod priority;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cluster::config::ConfigError;
use crate::utils::retry::RetryConfig;

pub use self::error::{QueueError, QueueResult};
pub use self::job::{Job, DEFAULT_MAX_RETRIES, MAX_PRIORITY};
pub use self::priority::{CycleOutcome, DeadLetter, PriorityJobQueue};

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Prefix of every tier topic
    pub topic_prefix: String,

    /// Idle wait between empty consumption cycles in milliseconds
    pub poll_timeout_ms: u64,

    /// Total depth across tiers at which enqueue starts shedding
    pub max_depth: usize,

    /// Retry budget of jobs built with `PriorityJobQueue::new_job`
    pub default_max_retries: u32,

    /// Delay before a failed job is republished
    pub backoff: RetryConfig,

    /// Local retry policy for transient broker failures
    pub broker_retry: RetryConfig,

    /// Every N-th cycle scans tiers from lowest to highest; 0 disables
    pub starvation_interval: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "scraping-jobs".to_string(),
            poll_timeout_ms: 1_000,
            max_depth: 10_000,
            default_max_retries: DEFAULT_MAX_RETRIES,
            backoff: RetryConfig::with_delays(DEFAULT_MAX_RETRIES, 1_000, 10_000),
            broker_retry: RetryConfig::default(),
            starvation_interval: 0,
        }
    }
}

impl QueueConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn tier_topic(&self, priority: u8) -> String {
        format!("{}-p{}", self.topic_prefix, priority)
    }

    pub fn dead_letter_topic(&self) -> String {
        format!("{}-dead-letter", self.topic_prefix)
    }

    /// Inbox topic a node receives its assignments on
    pub fn node_topic(&self, node_id: &str) -> String {
        format!("{}-node-{}", self.topic_prefix, node_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic_prefix.is_empty() {
            return Err(ConfigError::MissingField {
                field: "queue.topic_prefix".to_string(),
            });
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.poll_timeout_ms".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.max_depth".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}
