//! Durable broker boundary
//!
//! The priority queue only needs topics with publish, a bounded pull with
//! manual acknowledgement, and a depth probe. Anything delivered but not
//! acknowledged is eventually delivered again, which is what makes the queue
//! at-least-once.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub use self::memory::MemoryBroker;
pub use self::redis::{RedisBroker, RedisBrokerConfig};

/// A message as published to a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Broker-independent message id
    pub id: String,
    /// Ordering key
    pub key: String,
    pub value: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh id and the current timestamp
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.into(),
            value,
            headers: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A message handed to a consumer, to be acknowledged by `delivery_id`
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_id: String,
    pub message: Message,
    /// 1 on first delivery, higher on redelivery
    pub delivery_count: u32,
}

/// Broker errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker error: {0}")]
    Backend(String),

    #[error("Malformed message on {topic}: {reason}")]
    Malformed { topic: String, reason: String },
}

impl BrokerError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Topic-based durable message broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a message to a topic
    async fn publish(&self, topic: &str, message: Message) -> BrokerResult<()>;

    /// Pull up to `max` messages, waiting at most `wait` when the topic is empty
    async fn fetch(&self, topic: &str, max: usize, wait: Duration) -> BrokerResult<Vec<Delivery>>;

    /// Acknowledge a delivery; returns whether it was still outstanding
    async fn ack(&self, topic: &str, delivery_id: &str) -> BrokerResult<bool>;

    /// Messages in the topic that are not yet acknowledged
    async fn depth(&self, topic: &str) -> BrokerResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builder() {
        let message = Message::new("job-1", b"{}".to_vec()).with_header("retry", "2");
        assert_eq!(message.key, "job-1");
        assert_eq!(message.headers.get("retry").map(String::as_str), Some("2"));
        assert!(!message.id.is_empty());
    }

    #[test]
    fn test_broker_error_transience() {
        assert!(BrokerError::Unavailable("down".into()).is_transient());
        assert!(!BrokerError::Backend("bad".into()).is_transient());
    }
}
