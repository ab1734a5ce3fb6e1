//! Process wiring for one cluster node
//!
//! [`NodeRuntime`] registers this node, reports its load, campaigns for
//! leadership and runs the leader-gated scheduling loop. Every background
//! flow hangs off one cancellation token: [`NodeRuntime::shutdown`] stops
//! them and lets the node lease and the leader lock expire on their own,
//! while [`NodeRuntime::leave`] unregisters first so peers see an orderly
//! departure instead of a failure.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, MemoryBroker, RedisBroker, RedisBrokerConfig};
use crate::cluster::{
    AssignmentLedger, AssignmentRecord, BrokerDispatcher, JobDispatcher, JobScheduler,
    LeaderElector, Node, NodeLoad, NodeRegistry, NodeStatus,
};
use crate::config::{Backend, Config};
use crate::coordination::{CoordinationStore, MemoryStore, RedisStore, RedisStoreConfig};
use crate::error::{Error, Result};
use crate::queue::{Job, PriorityJobQueue};

// ============================================================================
// Backends
// ============================================================================

/// Coordination store and broker shared by every component of a process
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn CoordinationStore>,
    pub broker: Arc<dyn Broker>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

impl Backends {
    /// Fresh in-process store and broker
    pub fn memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            broker: Arc::new(MemoryBroker::new()),
        }
    }

    /// Connect the backends named by the configuration
    pub async fn connect(config: &Config) -> Result<Self> {
        let coordination = &config.coordination;
        match coordination.backend {
            Backend::Memory => Ok(Self::memory()),
            Backend::Redis => {
                let store = RedisStore::connect(RedisStoreConfig {
                    url: coordination.redis_url.clone(),
                    pool_size: coordination.redis_pool_size,
                    namespace: coordination.cluster.key_prefix.clone(),
                    ..Default::default()
                })
                .await?;

                let broker = RedisBroker::connect(RedisBrokerConfig {
                    url: coordination.redis_url.clone(),
                    pool_size: coordination.redis_pool_size,
                    consumer: format!("consumer-{}", config.node.id),
                    ..Default::default()
                })
                .await?;

                Ok(Self {
                    store: Arc::new(store),
                    broker: Arc::new(broker),
                })
            }
        }
    }
}

// ============================================================================
// Load probing
// ============================================================================

/// Source of the utilisation this node reports
#[async_trait]
pub trait LoadProbe: Send + Sync {
    /// Current cpu and memory utilisation in [0, 1]; `active_jobs` is ignored
    async fn sample(&self) -> NodeLoad;
}

/// Fixed utilisation, for tests and hosts without `/proc`
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticLoad(pub NodeLoad);

#[async_trait]
impl LoadProbe for StaticLoad {
    async fn sample(&self) -> NodeLoad {
        self.0
    }
}

/// Linux probe: 1-minute load average per core and used memory share
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcLoadProbe;

impl ProcLoadProbe {
    fn parse_loadavg(content: &str, cores: usize) -> Option<f64> {
        let one_minute: f64 = content.split_whitespace().next()?.parse().ok()?;
        Some(one_minute / cores.max(1) as f64)
    }

    fn parse_meminfo(content: &str) -> Option<f64> {
        let field = |name: &str| {
            content
                .lines()
                .find(|line| line.starts_with(name))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<f64>().ok())
        };

        let total = field("MemTotal:")?;
        let available = field("MemAvailable:")?;
        if total <= 0.0 {
            return None;
        }
        Some(1.0 - available / total)
    }
}

#[async_trait]
impl LoadProbe for ProcLoadProbe {
    async fn sample(&self) -> NodeLoad {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());

        let cpu = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .ok()
            .and_then(|content| Self::parse_loadavg(&content, cores))
            .unwrap_or(0.0);
        let memory = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .ok()
            .and_then(|content| Self::parse_meminfo(&content))
            .unwrap_or(0.0);

        NodeLoad::new(cpu, memory, 0)
    }
}

// ============================================================================
// Status
// ============================================================================

/// Read-only view of the cluster, as printed by `crawlmesh status`
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub leader: Option<String>,
    pub nodes: Vec<Node>,
    /// Depth per priority tier, lowest first
    pub depths: Vec<(u8, usize)>,
    pub dead_letters: usize,
    pub assignments: Vec<AssignmentRecord>,
}

impl ClusterStatus {
    /// Collect a snapshot without registering or campaigning
    pub async fn collect(config: &Config, backends: &Backends) -> Result<Self> {
        let cluster = config.coordination.cluster.clone();
        let registry = NodeRegistry::new(Arc::clone(&backends.store), cluster.clone());
        let elector = LeaderElector::new(&config.node.id, Arc::clone(&backends.store), cluster);
        let queue = PriorityJobQueue::new(Arc::clone(&backends.broker), config.queue.clone());
        let ledger = AssignmentLedger::new(Arc::clone(&backends.store), registry.config());

        Ok(Self {
            leader: elector.current_leader().await?,
            nodes: registry.get_nodes().await?,
            depths: queue.depths().await?,
            dead_letters: queue.dead_letter_depth().await?,
            assignments: ledger.all().await?,
        })
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Every cluster flow of one node process
pub struct NodeRuntime {
    node: Node,
    broker: Arc<dyn Broker>,
    registry: Arc<NodeRegistry>,
    elector: Arc<LeaderElector>,
    queue: Arc<PriorityJobQueue>,
    scheduler: Arc<JobScheduler>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("node_id", &self.node.id)
            .field("is_leader", &self.elector.is_leader())
            .finish()
    }
}

impl NodeRuntime {
    /// Start with assignments published to node inbox topics and `/proc` load
    pub async fn start_with_backends(config: Config, backends: Backends) -> Result<Self> {
        let dispatcher = Arc::new(BrokerDispatcher::new(
            Arc::clone(&backends.broker),
            &config.queue,
        ));
        Self::start(config, backends.store, backends.broker, dispatcher).await
    }

    /// Register this node and start load reporting, the leader campaign and
    /// the scheduling loop
    pub async fn start(
        config: Config,
        store: Arc<dyn CoordinationStore>,
        broker: Arc<dyn Broker>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Result<Self> {
        Self::start_with_probe(config, store, broker, dispatcher, Arc::new(ProcLoadProbe)).await
    }

    pub async fn start_with_probe(
        config: Config,
        store: Arc<dyn CoordinationStore>,
        broker: Arc<dyn Broker>,
        dispatcher: Arc<dyn JobDispatcher>,
        probe: Arc<dyn LoadProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let cluster = config.coordination.cluster.clone();

        let registry = Arc::new(
            NodeRegistry::new(Arc::clone(&store), cluster.clone())
                .with_cancellation(shutdown.child_token()),
        );
        let mut node = config.node.to_node();
        node.load = probe.sample().await;
        let node = registry.register_node(node).await?;

        let elector = Arc::new(
            LeaderElector::new(&node.id, Arc::clone(&store), cluster)
                .with_cancellation(shutdown.child_token()),
        );
        let queue = Arc::new(
            PriorityJobQueue::new(Arc::clone(&broker), config.queue.clone())
                .with_cancellation(shutdown.child_token()),
        );
        let scheduler = Arc::new(
            JobScheduler::new(
                Arc::clone(&registry),
                Arc::clone(&elector),
                Arc::clone(&queue),
                store,
                dispatcher,
            )
            .with_weights(config.scheduler),
        );

        let mut tasks = Vec::with_capacity(3);

        let campaign = Arc::clone(&elector);
        let token = shutdown.child_token();
        tasks.push(tokio::spawn(async move { campaign.run_campaign(token).await }));

        tasks.push(tokio::spawn(
            Arc::clone(&scheduler).run(shutdown.child_token()),
        ));

        tasks.push(tokio::spawn(report_load(
            Arc::clone(&registry),
            node.id.clone(),
            probe,
            config.node.load_report_interval(),
            shutdown.child_token(),
        )));

        info!(
            node_id = %node.id,
            endpoint = %node.endpoint(),
            capabilities = ?node.capabilities,
            "Node runtime started"
        );

        Ok(Self {
            node,
            broker,
            registry,
            elector,
            queue,
            scheduler,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn elector(&self) -> &Arc<LeaderElector> {
        &self.elector
    }

    pub fn queue(&self) -> &Arc<PriorityJobQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    /// Submit a job into its priority tier
    pub async fn submit(&self, job: Job) -> Result<()> {
        self.queue.enqueue(job).await?;
        Ok(())
    }

    /// Pull up to `max` assignments from this node's inbox
    ///
    /// The batch is acknowledged only after every message was decoded or
    /// dead-lettered. A node that dies before finishing its jobs is recovered
    /// through the assignment ledger. A failed acknowledgement is logged and
    /// the decoded jobs are still returned; the broker may deliver them again.
    pub async fn take_assignments(&self, max: usize, wait: Duration) -> Result<Vec<Job>> {
        let topic = self.queue.config().node_topic(&self.node.id);
        let deliveries = self.broker.fetch(&topic, max, wait).await?;

        let mut jobs = Vec::with_capacity(deliveries.len());
        for delivery in &deliveries {
            match Job::from_bytes(&delivery.message.value) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!(
                        node_id = %self.node.id,
                        delivery_id = %delivery.delivery_id,
                        error = %e,
                        "Dead-lettering malformed assignment"
                    );
                    self.queue
                        .dead_letter_malformed(&delivery.message, e.to_string())
                        .await?;
                }
            }
        }

        for delivery in &deliveries {
            if let Err(e) = self.broker.ack(&topic, &delivery.delivery_id).await {
                warn!(
                    node_id = %self.node.id,
                    delivery_id = %delivery.delivery_id,
                    error = %e,
                    "Assignment not acknowledged"
                );
            }
        }
        Ok(jobs)
    }

    /// Report that this node finished `job_id`
    pub async fn complete_job(&self, job_id: &str) -> Result<bool> {
        Ok(self.scheduler.complete_job(job_id).await?.is_some())
    }

    /// Stop accepting new assignments while keeping the lease
    pub async fn drain(&self) -> Result<()> {
        self.registry
            .set_status(&self.node.id, NodeStatus::Draining)
            .await?;
        info!(node_id = %self.node.id, "Node draining");
        Ok(())
    }

    /// Cancel every background flow and wait for them
    ///
    /// The node entry and the leader lock are left to expire.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(node_id = %self.node.id, error = %e, "Runtime task ended abnormally");
            }
        }
        info!(node_id = %self.node.id, "Node runtime stopped");
    }

    /// Orderly departure: unregister, then shut down
    pub async fn leave(&self) -> Result<()> {
        let unregistered = self
            .registry
            .unregister_node(&self.node.id)
            .await
            .map_err(Error::from);
        self.shutdown().await;
        unregistered
    }
}

/// Periodic utilisation report until `cancel` fires
async fn report_load(
    registry: Arc<NodeRegistry>,
    node_id: String,
    probe: Arc<dyn LoadProbe>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let sample = probe.sample().await;
        match registry.report_utilization(&node_id, sample).await {
            Ok(node) => debug!(
                node_id = %node_id,
                cpu = node.load.cpu,
                memory = node.load.memory,
                active_jobs = node.load.active_jobs,
                "Load reported"
            ),
            Err(e) => warn!(node_id = %node_id, error = %e, "Load report failed"),
        }
    }
}
