//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crawlmesh::broker::MemoryBroker;
use crawlmesh::cluster::{
    ClusterConfig, JobDispatcher, JobScheduler, LeaderElector, Node, NodeLoad, NodeRegistry,
    CAP_HTTP_SCRAPING,
};
use crawlmesh::coordination::MemoryStore;
use crawlmesh::error::{Error, Result};
use crawlmesh::queue::{Job, PriorityJobQueue, QueueConfig};
use crawlmesh::utils::retry::RetryConfig;

/// Cluster timing with the default TTLs and a short local retry budget
pub fn cluster_config(prefix: &str) -> ClusterConfig {
    ClusterConfig {
        key_prefix: prefix.to_string(),
        retry: RetryConfig::with_delays(1, 10, 10),
        ..Default::default()
    }
}

/// Queue with a fast backoff so retry tests stay short
pub fn queue_config() -> QueueConfig {
    QueueConfig {
        backoff: RetryConfig::with_delays(3, 1_000, 1_000),
        broker_retry: RetryConfig::with_delays(1, 10, 10),
        ..Default::default()
    }
}

/// HTTP-capable node with the given load
pub fn http_node(id: &str, cpu: f64, memory: f64, active_jobs: u32) -> Node {
    Node::new(id, "127.0.0.1", 9000)
        .with_capabilities([CAP_HTTP_SCRAPING])
        .with_load(NodeLoad::new(cpu, memory, active_jobs))
}

pub fn http_job(id: &str, priority: u8) -> Job {
    Job::new("scrape", priority)
        .with_id(id)
        .with_requirements([CAP_HTTP_SCRAPING])
}

/// Dispatcher that remembers every hand-off and can be told to fail
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<(String, Job)>>,
    failing: AtomicBool,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// `(node_id, job)` pairs in dispatch order
    pub fn dispatched(&self) -> Vec<(String, Job)> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn dispatched_ids(&self) -> Vec<String> {
        self.dispatched()
            .into_iter()
            .map(|(_, job)| job.id)
            .collect()
    }
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn dispatch(&self, node: &Node, job: &Job) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::other(format!("node {} unreachable", node.id)));
        }
        self.dispatched
            .lock()
            .unwrap()
            .push((node.id.clone(), job.clone()));
        Ok(())
    }
}

/// One scheduling process: registry, elector, queue and scheduler on shared backends
pub struct SchedulerHarness {
    pub registry: Arc<NodeRegistry>,
    pub elector: Arc<LeaderElector>,
    pub queue: Arc<PriorityJobQueue>,
    pub scheduler: Arc<JobScheduler>,
    pub dispatcher: Arc<RecordingDispatcher>,
}

impl SchedulerHarness {
    pub fn new(
        node_id: &str,
        prefix: &str,
        store: &Arc<MemoryStore>,
        broker: &Arc<MemoryBroker>,
    ) -> Self {
        let registry = Arc::new(NodeRegistry::new(store.clone(), cluster_config(prefix)));
        let elector = Arc::new(LeaderElector::new(
            node_id,
            store.clone(),
            cluster_config(prefix),
        ));
        let queue = Arc::new(PriorityJobQueue::new(broker.clone(), queue_config()));
        let dispatcher = RecordingDispatcher::new();
        let scheduler = Arc::new(JobScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&elector),
            Arc::clone(&queue),
            store.clone(),
            dispatcher.clone(),
        ));

        Self {
            registry,
            elector,
            queue,
            scheduler,
            dispatcher,
        }
    }
}

/// Poll `check` every 100ms until it holds or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
