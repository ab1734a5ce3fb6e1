//! Error types for the queue module

use thiserror::Error;

use crate::broker::BrokerError;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    /// Queue is full and nothing of lower priority could be shed
    #[error("Queue backpressure: priority {priority} rejected at depth {depth}/{max_depth}")]
    Backpressure {
        priority: u8,
        depth: usize,
        max_depth: usize,
    },

    #[error("Invalid priority {0}, expected 0..=10")]
    InvalidPriority(u8),

    /// Broker unreachable after the local retry budget
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Backpressure { .. } | Self::BrokerUnavailable(_))
    }
}

impl From<BrokerError> for QueueError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unavailable(reason) => Self::BrokerUnavailable(reason),
            BrokerError::Backend(reason) => Self::Broker(reason),
            BrokerError::Malformed { topic, reason } => {
                Self::Serialization(format!("{topic}: {reason}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_mapping() {
        let err: QueueError = BrokerError::Unavailable("refused".into()).into();
        assert_eq!(err, QueueError::BrokerUnavailable("refused".into()));
        assert!(err.is_recoverable());

        let err: QueueError = BrokerError::Backend("WRONGTYPE".into()).into();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_backpressure_message() {
        let err = QueueError::Backpressure {
            priority: 3,
            depth: 100,
            max_depth: 100,
        };
        assert!(err.to_string().contains("100/100"));
        assert!(err.is_recoverable());
    }
}
