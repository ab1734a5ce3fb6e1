//! Capability and load aware job scheduling
//!
//! Only the elected leader assigns work. A job goes to the best scoring node
//! among the active ones whose capabilities cover the job's requirements:
//!
//! ```text
//! score = ((1 - cpu) + (1 - memory) + 1 / (active_jobs + 1)) * (1 + priority / 10)
//! ```
//!
//! Ties go to the node with fewer active jobs, then to the lowest id.
//!
//! Every assignment is recorded in the store at `<prefix>/assignments/<job>`
//! together with the leader's fencing token. A record written under a newer
//! token cannot be overwritten by an older one, which bounds what a deposed
//! leader can still do to a single leaked decision. The ledger is also what
//! failure recovery reads: when a node fails or leaves, every job recorded
//! against it is requeued with its retry count incremented.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::StoreClient;
use super::config::ClusterConfig;
use super::error::{ClusterError, ClusterResult};
use super::leader::LeaderElector;
use super::registry::NodeRegistry;
use super::types::{Node, NodeEvent};
use crate::broker::{Broker, Message};
use crate::coordination::{CoordinationStore, KeyValue};
use crate::error::Result;
use crate::metrics;
use crate::queue::{Job, PriorityJobQueue, QueueConfig, MAX_PRIORITY};

/// Scores closer than this are treated as equal
const SCORE_EPSILON: f64 = 1e-9;

/// Attempts of an optimistic ledger write
const MAX_LEDGER_ATTEMPTS: u32 = 16;

// ============================================================================
// Scoring
// ============================================================================

/// Weights of the load score; the defaults weigh all three terms equally
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub cpu: f64,
    pub memory: f64,
    pub jobs: f64,
    /// Score multiplier per priority level
    pub priority_scale: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory: 1.0,
            jobs: 1.0,
            priority_scale: 0.1,
        }
    }
}

/// Ranks candidate nodes for a job
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Scorer {
    weights: ScoreWeights,
}

impl Scorer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    pub fn score(&self, node: &Node, priority: u8) -> f64 {
        let load = node.load.clamped();
        let w = &self.weights;
        let base = w.cpu * (1.0 - load.cpu)
            + w.memory * (1.0 - load.memory)
            + w.jobs / (f64::from(load.active_jobs) + 1.0);
        base * (1.0 + f64::from(priority.min(MAX_PRIORITY)) * w.priority_scale)
    }

    /// Whether `node` may run `job` at all
    pub fn is_candidate(node: &Node, job: &Job) -> bool {
        node.status.is_schedulable() && node.has_capabilities(&job.requirements)
    }

    /// Best candidate for `job`, `None` when nothing qualifies
    pub fn pick<'a>(&self, nodes: &'a [Node], job: &Job) -> Option<&'a Node> {
        nodes
            .iter()
            .filter(|node| Self::is_candidate(node, job))
            .fold(None, |best: Option<&Node>, node| match best {
                Some(current) if !self.beats(node, current, job.priority) => Some(current),
                _ => Some(node),
            })
    }

    fn beats(&self, a: &Node, b: &Node, priority: u8) -> bool {
        let (sa, sb) = (self.score(a, priority), self.score(b, priority));
        if (sa - sb).abs() > SCORE_EPSILON {
            return sa > sb;
        }
        (a.load.active_jobs, &a.id) < (b.load.active_jobs, &b.id)
    }
}

// ============================================================================
// Assignment Ledger
// ============================================================================

/// A job bound to a node under a leader's fencing token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub job: Job,
    pub node_id: String,
    pub fencing_token: u64,
    pub assigned_at: DateTime<Utc>,
    /// Store revision this record was read at, 0 when not read from the store
    #[serde(skip)]
    pub revision: u64,
}

/// Fenced record of current assignments in the coordination store
#[derive(Debug, Clone)]
pub struct AssignmentLedger {
    client: StoreClient,
    prefix: String,
}

impl AssignmentLedger {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &ClusterConfig) -> Self {
        Self {
            client: StoreClient::new(store, config),
            prefix: format!("{}/assignments/", config.key_prefix),
        }
    }

    fn key(&self, job_id: &str) -> String {
        format!("{}{}", self.prefix, job_id)
    }

    /// Record `job` on `node_id`; returns the record it replaced
    ///
    /// Fails with [`ClusterError::AssignmentConflict`] when the stored record
    /// carries a newer fencing token.
    pub async fn record(
        &self,
        job: &Job,
        node_id: &str,
        fencing_token: u64,
    ) -> ClusterResult<Option<AssignmentRecord>> {
        let store = self.client.store();
        let key = self.key(&job.id);
        let record = AssignmentRecord {
            job: job.clone(),
            node_id: node_id.to_string(),
            fencing_token,
            assigned_at: Utc::now(),
            revision: 0,
        };
        let value = serde_json::to_vec(&record).map_err(|e| ClusterError::corrupt(&key, e))?;

        for _ in 0..MAX_LEDGER_ATTEMPTS {
            let existing = self.client.call("get", || store.get(&key)).await?;

            let (expected, previous) = match existing {
                None => (None, None),
                Some(kv) => {
                    let previous = decode_record(&kv)?;
                    if previous.fencing_token > fencing_token {
                        return Err(ClusterError::AssignmentConflict {
                            job_id: job.id.clone(),
                            held_by: previous.node_id,
                            fencing_token: previous.fencing_token,
                        });
                    }
                    (Some(kv.mod_revision), Some(previous))
                }
            };

            let written = self
                .client
                .call("compare_and_swap", || {
                    store.compare_and_swap(&key, expected, value.clone(), None)
                })
                .await?;
            if written {
                return Ok(previous);
            }
        }

        Err(ClusterError::CoordinationUnavailable {
            operation: "compare_and_swap".to_string(),
            reason: format!("assignment of {} kept changing", job.id),
        })
    }

    pub async fn get(&self, job_id: &str) -> ClusterResult<Option<AssignmentRecord>> {
        let store = self.client.store();
        let key = self.key(job_id);
        match self.client.call("get", || store.get(&key)).await? {
            Some(kv) => decode_record(&kv).map(Some),
            None => Ok(None),
        }
    }

    /// Drop the record of a finished job, whichever node holds it
    pub async fn release(&self, job_id: &str) -> ClusterResult<Option<AssignmentRecord>> {
        let store = self.client.store();
        let key = self.key(job_id);
        let Some(kv) = self.client.call("get", || store.get(&key)).await? else {
            return Ok(None);
        };

        let record = decode_record(&kv)?;
        let deleted = self
            .client
            .call("compare_and_delete", || {
                store.compare_and_delete(&key, kv.mod_revision)
            })
            .await?;
        Ok(deleted.then_some(record))
    }

    /// Drop `job_id` only while it is still held by `node_id`
    pub async fn release_held_by(
        &self,
        job_id: &str,
        node_id: &str,
    ) -> ClusterResult<Option<AssignmentRecord>> {
        match self.get(job_id).await? {
            Some(record) if record.node_id == node_id => {
                Ok(self.release_exact(&record).await?.then_some(record))
            }
            _ => Ok(None),
        }
    }

    /// Drop the record at exactly the revision it was read at
    ///
    /// Returns false when the job was reassigned or released since, leaving
    /// the newer record in place.
    pub async fn release_exact(&self, record: &AssignmentRecord) -> ClusterResult<bool> {
        let store = self.client.store();
        let key = self.key(&record.job.id);
        self.client
            .call("compare_and_delete", || {
                store.compare_and_delete(&key, record.revision)
            })
            .await
    }

    pub async fn all(&self) -> ClusterResult<Vec<AssignmentRecord>> {
        let store = self.client.store();
        let snapshot = self
            .client
            .call("list", || store.list(&self.prefix))
            .await?;

        Ok(snapshot
            .entries
            .iter()
            .filter_map(|kv| match decode_record(kv) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(key = %kv.key, error = %e, "Skipping undecodable assignment");
                    None
                }
            })
            .collect())
    }

    pub async fn assignments_for(&self, node_id: &str) -> ClusterResult<Vec<AssignmentRecord>> {
        let mut records = self.all().await?;
        records.retain(|record| record.node_id == node_id);
        Ok(records)
    }
}

fn decode_record(kv: &KeyValue) -> ClusterResult<AssignmentRecord> {
    let mut record: AssignmentRecord =
        serde_json::from_slice(&kv.value).map_err(|e| ClusterError::corrupt(&kv.key, e))?;
    record.revision = kv.mod_revision;
    Ok(record)
}

// ============================================================================
// Dispatch
// ============================================================================

/// Hands an assigned job to the node that will execute it
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, node: &Node, job: &Job) -> Result<()>;
}

/// Publishes assignments to the node's inbox topic `<prefix>-node-<id>`
pub struct BrokerDispatcher {
    broker: Arc<dyn Broker>,
    config: QueueConfig,
}

impl BrokerDispatcher {
    pub fn new(broker: Arc<dyn Broker>, config: &QueueConfig) -> Self {
        Self {
            broker,
            config: config.clone(),
        }
    }
}

#[async_trait]
impl JobDispatcher for BrokerDispatcher {
    async fn dispatch(&self, node: &Node, job: &Job) -> Result<()> {
        let topic = self.config.node_topic(&node.id);
        let message = Message::new(job.id.clone(), job.to_bytes()?)
            .with_header("node_id", node.id.clone())
            .with_header("endpoint", node.endpoint());
        self.broker.publish(&topic, message).await?;
        Ok(())
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Outcome of a successful assignment
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// The job with `assigned_to` set
    pub job: Job,
    pub node: Node,
    pub fencing_token: u64,
}

/// Leader-only assignment loop plus failure-triggered requeue
pub struct JobScheduler {
    registry: Arc<NodeRegistry>,
    elector: Arc<LeaderElector>,
    queue: Arc<PriorityJobQueue>,
    ledger: AssignmentLedger,
    scorer: Scorer,
    dispatcher: Arc<dyn JobDispatcher>,
    recovery: Mutex<()>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("node_id", &self.elector.node_id())
            .field("scorer", &self.scorer)
            .finish()
    }
}

impl JobScheduler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        elector: Arc<LeaderElector>,
        queue: Arc<PriorityJobQueue>,
        store: Arc<dyn CoordinationStore>,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        let ledger = AssignmentLedger::new(store, registry.config());
        Self {
            registry,
            elector,
            queue,
            ledger,
            scorer: Scorer::default(),
            dispatcher,
            recovery: Mutex::new(()),
        }
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.scorer = Scorer::new(weights);
        self
    }

    pub fn ledger(&self) -> &AssignmentLedger {
        &self.ledger
    }

    fn require_leader(&self) -> ClusterResult<u64> {
        self.elector
            .fencing_token()
            .ok_or_else(|| ClusterError::NotLeader {
                node_id: self.elector.node_id().to_string(),
            })
    }

    /// Read-only pick of the best node for `job`
    pub async fn select_node(&self, job: &Job) -> ClusterResult<Node> {
        let nodes = self.registry.get_nodes().await?;
        self.scorer
            .pick(&nodes, job)
            .cloned()
            .ok_or_else(|| ClusterError::no_suitable_node(&job.id, &job.requirements))
    }

    /// Assign `job` to the best node and record the assignment
    pub async fn distribute_job(&self, job: Job) -> ClusterResult<Assignment> {
        let timer = metrics::start_assignment_timer();

        let fencing_token = match self.require_leader() {
            Ok(token) => token,
            Err(e) => {
                timer.discard();
                return Err(e);
            }
        };

        let node = match self.select_node(&job).await {
            Ok(node) => node,
            Err(e) => {
                timer.discard();
                return Err(e);
            }
        };

        let mut job = job;
        job.assigned_to = Some(node.id.clone());

        let previous = match self.ledger.record(&job, &node.id, fencing_token).await {
            Ok(previous) => previous,
            Err(e) => {
                timer.discard();
                return Err(e);
            }
        };

        match previous {
            Some(previous) if previous.node_id == node.id => {}
            Some(previous) => {
                self.adjust_load(&previous.node_id, -1).await;
                self.adjust_load(&node.id, 1).await;
            }
            None => self.adjust_load(&node.id, 1).await,
        }

        info!(
            job_id = %job.id,
            node_id = %node.id,
            priority = job.priority,
            fencing_token,
            "Job assigned"
        );
        drop(timer);

        Ok(Assignment {
            job,
            node,
            fencing_token,
        })
    }

    /// The active job counter is advisory; a failed update is only logged
    async fn adjust_load(&self, node_id: &str, delta: i64) {
        if let Err(e) = self.registry.adjust_active_jobs(node_id, delta).await {
            debug!(node_id = %node_id, delta, error = %e, "Active job counter not updated");
        }
    }

    /// Assign and hand the job to its node; undone if the hand-off fails
    pub async fn dispatch_job(&self, job: Job) -> Result<Assignment> {
        let assignment = self.distribute_job(job).await?;

        if let Err(e) = self
            .dispatcher
            .dispatch(&assignment.node, &assignment.job)
            .await
        {
            warn!(
                job_id = %assignment.job.id,
                node_id = %assignment.node.id,
                error = %e,
                "Dispatch failed, releasing assignment"
            );
            if self
                .ledger
                .release_held_by(&assignment.job.id, &assignment.node.id)
                .await?
                .is_some()
            {
                self.adjust_load(&assignment.node.id, -1).await;
            }
            return Err(e);
        }

        Ok(assignment)
    }

    /// Node-side report that a job finished
    pub async fn complete_job(&self, job_id: &str) -> ClusterResult<Option<AssignmentRecord>> {
        let released = self.ledger.release(job_id).await?;
        if let Some(record) = &released {
            self.adjust_load(&record.node_id, -1).await;
            debug!(job_id = %job_id, node_id = %record.node_id, "Job completed");
        }
        Ok(released)
    }

    /// Requeue every job recorded against `node_id`
    ///
    /// Each job goes back to its own priority with `assigned_to` cleared and
    /// `retry` incremented. Returns how many jobs were recovered.
    pub async fn requeue_jobs_for(&self, node_id: &str) -> Result<usize> {
        self.require_leader()?;
        let _guard = self.recovery.lock().await;

        let records = self.ledger.assignments_for(node_id).await?;
        self.requeue_records(records).await
    }

    async fn requeue_records(&self, records: Vec<AssignmentRecord>) -> Result<usize> {
        let mut recovered = 0;
        for record in records {
            let mut job = record.job.clone();
            job.assigned_to = None;
            job.retry += 1;

            // requeue before release: a crash in between duplicates, never loses.
            // The requeued job may already be reassigned by now, so only the
            // record read here is released.
            let requeued = self.queue.requeue(job).await?;
            let released = self.ledger.release_exact(&record).await?;
            recovered += 1;

            info!(
                job_id = %record.job.id,
                node_id = %record.node_id,
                requeued,
                released,
                "Recovered job from departed node"
            );
        }
        Ok(recovered)
    }

    /// Requeue assignments whose node is no longer registered
    ///
    /// Covers departures that happened while no leader was watching.
    pub async fn reconcile_orphans(&self) -> Result<usize> {
        self.require_leader()?;
        let _guard = self.recovery.lock().await;

        let live: HashSet<String> = self
            .registry
            .get_nodes()
            .await?
            .into_iter()
            .map(|node| node.id)
            .collect();

        let orphans: Vec<AssignmentRecord> = self
            .ledger
            .all()
            .await?
            .into_iter()
            .filter(|record| !live.contains(&record.node_id))
            .collect();

        self.requeue_records(orphans).await
    }

    async fn handle_departure(&self, event: &NodeEvent) {
        if !event.kind.is_departure() || !self.elector.is_leader() {
            return;
        }

        match self.requeue_jobs_for(event.node_id()).await {
            Ok(0) => {}
            Ok(count) => info!(node_id = %event.node_id(), count, "Requeued jobs of departed node"),
            Err(e) => warn!(node_id = %event.node_id(), error = %e, "Requeue after departure failed"),
        }
    }

    /// Watch membership and recover the work of departed nodes
    async fn watch_departures(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = Box::pin(self.registry.watch_nodes(cancel.clone()));
        let mut local = self.registry.subscribe_lease_failures();
        let mut local_open = true;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = local.recv(), if local_open => match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed local lease failures");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        local_open = false;
                        continue;
                    }
                },
                next = events.next() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            self.handle_departure(&event).await;
        }
    }

    /// Leader-gated scheduling loop; returns when `cancel` fires
    ///
    /// While this process leads, jobs are taken from the queue in strict
    /// priority order and dispatched one at a time. A failed assignment goes
    /// back through the queue's retry and dead-letter path.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let watcher = tokio::spawn(Arc::clone(&self).watch_departures(cancel.child_token()));
        let mut leadership = self.elector.subscribe();
        let poll = self.queue.config().poll_timeout();
        let mut leading = false;

        let handler = |job: Job| {
            let scheduler = Arc::clone(&self);
            async move { scheduler.dispatch_job(job).await.map(|_| ()) }
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if !self.elector.is_leader() {
                leading = false;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = leadership.changed() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
                continue;
            }

            if !leading {
                leading = true;
                info!(node_id = %self.elector.node_id(), "Scheduling loop active");
                match self.reconcile_orphans().await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "Requeued orphaned assignments"),
                    Err(e) => warn!(error = %e, "Orphan reconciliation failed"),
                }
            }

            match self.queue.consume_cycle(&handler).await {
                Ok(Some(outcome)) => debug!(?outcome, "Scheduling cycle"),
                Ok(None) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.queue.wait_for_work(poll) => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Scheduling cycle failed");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }
        }

        let _ = watcher.await;
        debug!(node_id = %self.elector.node_id(), "Scheduling loop stopped");
    }
}
