//! crawlmesh - coordination and scheduling core for a scraping cluster
//!
//! Worker nodes register under renewable leases, one of them holds a
//! lease-based leader lock, and the leader assigns queued jobs to live,
//! capable, lightly loaded nodes. Jobs flow through strict-priority tiers with
//! retry, backoff and dead-letter routing; a node that disappears has its
//! in-flight jobs requeued.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`coordination`] - Coordination store boundary (memory and Redis backends)
//! - [`broker`] - Durable broker boundary (memory and Redis streams backends)
//! - [`cluster`] - Node registry, change watcher, leader election, scheduler
//! - [`queue`] - Job wire type and the priority-tiered job queue
//! - [`runtime`] - Wiring of every flow for one node process
//! - [`config`] - Configuration management and settings
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use crawlmesh::config::Config;
//! use crawlmesh::queue::Job;
//! use crawlmesh::runtime::{Backends, NodeRuntime};
//!
//! #[tokio::main]
//! async fn main() -> crawlmesh::Result<()> {
//!     let config = Config::from_env()?;
//!     let backends = Backends::connect(&config).await?;
//!     let runtime = NodeRuntime::start_with_backends(config, backends).await?;
//!
//!     runtime
//!         .submit(Job::new("scrape", 5).with_requirements(["http_scraping"]))
//!         .await?;
//!
//!     runtime.leave().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod cluster;
pub mod config;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod runtime;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::broker::{Broker, MemoryBroker};
    pub use crate::cluster::{
        ChangeWatcher, ClusterConfig, ClusterError, JobDispatcher, JobScheduler, LeaderElector,
        Node, NodeEvent, NodeEventKind, NodeLoad, NodeRegistry, NodeStatus,
    };
    pub use crate::config::Config;
    pub use crate::coordination::{CoordinationStore, MemoryStore};
    pub use crate::error::{CrawlmeshErrorTrait, Error, ErrorCategory, Result};
    pub use crate::queue::{Job, PriorityJobQueue, QueueConfig, QueueError};
    pub use crate::runtime::{Backends, NodeRuntime};
}

// Direct re-exports for convenience
pub use error::{Error, Result};
