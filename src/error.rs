//! Unified error handling for the crawlmesh crate
//!
//! Every module keeps its own error enum; this module folds them into a
//! single [`Error`] for code that crosses module boundaries (job handlers,
//! the runtime, the binary).
//!
//! # Architecture
//!
//! - [`CrawlmeshErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust
//! use crawlmesh::error::{CrawlmeshErrorTrait, Error, ErrorCategory};
//! use crawlmesh::cluster::ClusterError;
//!
//! let err: Error = ClusterError::no_suitable_node("job-1", &["browser_scraping".to_string()]).into();
//! assert!(err.is_recoverable());
//! assert_eq!(err.category(), ErrorCategory::Scheduling);
//! ```

use std::io;
use thiserror::Error;

pub use crate::broker::BrokerError;
pub use crate::cluster::config::ConfigError;
pub use crate::cluster::error::ClusterError;
pub use crate::coordination::StoreError;
pub use crate::queue::error::QueueError;

/// Common trait for all crawlmesh error types
pub trait CrawlmeshErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Coordination store and lease errors
    Coordination,
    /// Assignment and leadership errors
    Scheduling,
    /// Queue and broker errors
    Queue,
    /// Configuration and validation errors
    Config,
    /// Encoding and decoding errors
    Serialization,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordination => "coordination",
            Self::Scheduling => "scheduling",
            Self::Queue => "queue",
            Self::Config => "config",
            Self::Serialization => "serialization",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the crawlmesh crate
#[derive(Error, Debug)]
pub enum Error {
    /// Coordination store errors outside the cluster wrappers
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Broker errors outside the queue wrappers
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Registry, election and scheduling errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CrawlmeshErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Broker(e) => e.is_transient(),
            Self::Cluster(e) => e.is_recoverable(),
            Self::Queue(e) => e.is_recoverable(),
            Self::Config(_) => false,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Store(_) => ErrorCategory::Coordination,
            Self::Broker(_) => ErrorCategory::Queue,
            Self::Cluster(e) => match e {
                ClusterError::CoordinationUnavailable { .. } | ClusterError::LeaseExpired { .. } => {
                    ErrorCategory::Coordination
                }
                ClusterError::Corrupt { .. } => ErrorCategory::Serialization,
                ClusterError::InvalidNode { .. } => ErrorCategory::Config,
                _ => ErrorCategory::Scheduling,
            },
            Self::Queue(e) => match e {
                QueueError::Serialization(_) => ErrorCategory::Serialization,
                QueueError::InvalidPriority(_) => ErrorCategory::Config,
                _ => ErrorCategory::Queue,
            },
            Self::Config(_) => ErrorCategory::Config,
            Self::Io(_) => ErrorCategory::Other,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// The handler declined the job because this process no longer leads
    pub fn is_leadership_lost(&self) -> bool {
        matches!(self, Self::Cluster(ClusterError::NotLeader { .. }))
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
