//! Cluster coordination: membership, leadership and scheduling
//!
//! - [`NodeRegistry`] keeps a lease-backed directory of worker nodes
//! - [`ChangeWatcher`] turns registry snapshots into [`NodeEvent`]s
//! - [`LeaderElector`] holds the cluster-wide scheduling lock
//! - [`JobScheduler`] assigns queued jobs while this process leads
//!
//! Everything authoritative lives in the coordination store; the in-process
//! maps here are read-through caches.

pub mod client;
pub mod config;
pub mod error;
pub mod leader;
pub mod lease;
pub mod registry;
pub mod scheduler;
pub mod types;
pub mod watcher;

pub use client::StoreClient;
pub use config::{ClusterConfig, ClusterConfigBuilder, ConfigError};
pub use error::{ClusterError, ClusterResult};
pub use leader::{Election, LeaderClaim, LeaderElector, LeaderState};
pub use lease::{KeepAlive, LeaseOutcome};
pub use registry::NodeRegistry;
pub use scheduler::{
    Assignment, AssignmentLedger, AssignmentRecord, BrokerDispatcher, JobDispatcher, JobScheduler,
    ScoreWeights, Scorer,
};
pub use types::{
    Node, NodeEvent, NodeEventKind, NodeLoad, NodeStatus, CAP_AI_EXTRACTION, CAP_BROWSER_SCRAPING,
    CAP_HTTP_SCRAPING,
};
pub use watcher::{diff_snapshots, ChangeWatcher};
