//! Lease-backed node registry
//!
//! Each node is stored at `<prefix>/nodes/<id>` bound to a lease that a
//! background task renews every TTL/3. The store is the only authority: the
//! local map is a read-through cache refreshed by reads and by this
//! process's own writes.
//!
//! An explicit unregister leaves a short-lived departure marker at
//! `<prefix>/departed/<id>` so watchers can tell an orderly leave from a crash
//! even when they miss the intermediate `inactive` write.

use chrono::Utc;
use futures::Stream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::StoreClient;
use super::config::ClusterConfig;
use super::error::{ClusterError, ClusterResult};
use super::lease::{KeepAlive, LeaseOutcome};
use super::types::{Node, NodeEvent, NodeEventKind, NodeLoad, NodeStatus};
use super::watcher::ChangeWatcher;
use crate::coordination::{CoordinationStore, KeyValue, LeaseId, Snapshot};
use crate::metrics;

/// Attempts of an optimistic read-merge-write before giving up
const MAX_CAS_ATTEMPTS: u32 = 16;

/// Capacity of the local lease-failure channel
const FAILURE_CHANNEL_CAPACITY: usize = 64;

struct LocalLease {
    lease: LeaseId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Registry of worker nodes
pub struct NodeRegistry {
    client: StoreClient,
    config: ClusterConfig,
    cache: Arc<RwLock<HashMap<String, Node>>>,
    leases: Mutex<HashMap<String, LocalLease>>,
    failures: broadcast::Sender<NodeEvent>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("key_prefix", &self.config.key_prefix)
            .finish()
    }
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, config: ClusterConfig) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            client: StoreClient::new(store, &config),
            config,
            cache: Arc::new(RwLock::new(HashMap::new())),
            leases: Mutex::new(HashMap::new()),
            failures,
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie every renewal task to `token`; cancelling it stops renewal and
    /// leaves the leases to expire
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn nodes_prefix(&self) -> String {
        format!("{}/nodes/", self.config.key_prefix)
    }

    fn node_key(&self, id: &str) -> String {
        format!("{}/nodes/{}", self.config.key_prefix, id)
    }

    fn departed_key(&self, id: &str) -> String {
        format!("{}/departed/{}", self.config.key_prefix, id)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Idempotent upsert bound to a lease renewed in the background
    ///
    /// Re-registering a node this process already holds a live lease for
    /// reuses that lease.
    pub async fn register_node(&self, node: Node) -> ClusterResult<Node> {
        validate(&node)?;

        let mut node = node;
        node.load = node.load.clamped();
        node.last_seen = Utc::now();

        let key = self.node_key(&node.id);
        let value = encode(&key, &node)?;
        let store = self.client.store();

        let mut leases = self.leases.lock().await;

        if let Some(local) = leases.get(&node.id) {
            if !local.task.is_finished() {
                let lease = local.lease;
                match self
                    .client
                    .call("put", || store.put(&key, value.clone(), Some(lease)))
                    .await
                {
                    Ok(_) => {
                        drop(leases);
                        self.cache.write().await.insert(node.id.clone(), node.clone());
                        debug!(node_id = %node.id, %lease, "Node re-registered");
                        return Ok(node);
                    }
                    Err(ClusterError::LeaseExpired { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            if let Some(stale) = leases.remove(&node.id) {
                stale.cancel.cancel();
            }
        }

        let ttl = self.config.lease_ttl();
        let lease = self
            .client
            .call("grant_lease", || store.grant_lease(ttl))
            .await?;

        if let Err(e) = self
            .client
            .call("put", || store.put(&key, value.clone(), Some(lease)))
            .await
        {
            if let Err(revoke_err) = store.revoke_lease(lease).await {
                debug!(%lease, error = %revoke_err, "Failed to revoke unused lease");
            }
            return Err(e);
        }

        let cancel = self.shutdown.child_token();
        let task = self.spawn_renewal(node.id.clone(), key, lease, cancel.clone());
        leases.insert(node.id.clone(), LocalLease { lease, cancel, task });
        drop(leases);

        self.cache.write().await.insert(node.id.clone(), node.clone());

        info!(
            node_id = %node.id,
            %lease,
            ttl_ms = ttl.as_millis() as u64,
            capabilities = ?node.capabilities,
            "Node registered"
        );
        Ok(node)
    }

    fn spawn_renewal(
        &self,
        node_id: String,
        key: String,
        lease: LeaseId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self.client.store());
        let cache = Arc::clone(&self.cache);
        let failures = self.failures.clone();
        let call_timeout = self.config.call_timeout();
        let keep_alive = KeepAlive {
            lease,
            interval: self.config.renew_interval(),
            retry_budget: self.config.renew_retry_budget,
            call_timeout,
        };

        tokio::spawn(async move {
            let outcome = keep_alive.run(Arc::clone(&store), cancel, |_| {}).await;
            let LeaseOutcome::Lost { reason } = outcome else {
                return;
            };

            warn!(node_id = %node_id, %lease, %reason, "Node lease lost");
            let last = cache.write().await.remove(&node_id);

            // drop the entry now if it is still ours; otherwise it expires with the lease
            if let Ok(Ok(Some(kv))) = tokio::time::timeout(call_timeout, store.get(&key)).await {
                if kv.lease == Some(lease) {
                    let _ = tokio::time::timeout(
                        call_timeout,
                        store.compare_and_delete(&key, kv.mod_revision),
                    )
                    .await;
                }
            }

            let mut node = last.unwrap_or_else(|| Node::new(node_id.clone(), "", 0));
            node.status = NodeStatus::Failed;
            // no receivers is fine
            let _ = failures.send(NodeEvent::new(NodeEventKind::Failed, node));
        })
    }

    /// Explicit removal: stops renewal, leaves a departure marker, deletes the entry
    pub async fn unregister_node(&self, id: &str) -> ClusterResult<()> {
        let local = self.leases.lock().await.remove(id);
        if let Some(local) = &local {
            local.cancel.cancel();
        }

        let store = self.client.store();
        let key = self.node_key(id);

        let current = match self.set_status(id, NodeStatus::Inactive).await {
            Ok(node) => Some(node),
            Err(ClusterError::NodeNotFound { .. }) | Err(ClusterError::LeaseExpired { .. }) => None,
            Err(e) => return Err(e),
        };

        if let Some(node) = &current {
            if let Err(e) = self.write_departure(node).await {
                warn!(node_id = %id, error = %e, "Failed to record departure marker");
            }
        }

        self.client.call("delete", || store.delete(&key)).await?;

        if let Some(local) = local {
            if let Err(e) = self
                .client
                .call("revoke_lease", || store.revoke_lease(local.lease))
                .await
            {
                debug!(node_id = %id, error = %e, "Lease revoke failed, it will expire");
            }
            let _ = local.task.await;
        }

        self.cache.write().await.remove(id);
        info!(node_id = %id, "Node unregistered");
        Ok(())
    }

    async fn write_departure(&self, node: &Node) -> ClusterResult<()> {
        let store = self.client.store();
        let key = self.departed_key(&node.id);
        let value = encode(&key, node)?;
        let ttl = self.config.lease_ttl();

        let lease = self
            .client
            .call("grant_lease", || store.grant_lease(ttl))
            .await?;
        self.client
            .call("put", || store.put(&key, value.clone(), Some(lease)))
            .await?;
        Ok(())
    }

    /// Whether `id` recently left through [`NodeRegistry::unregister_node`]
    pub async fn has_departed(&self, id: &str) -> ClusterResult<bool> {
        let store = self.client.store();
        let key = self.departed_key(id);
        Ok(self.client.call("get", || store.get(&key)).await?.is_some())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Point-in-time listing of every registered node, sorted by id
    pub async fn get_nodes(&self) -> ClusterResult<Vec<Node>> {
        let store = self.client.store();
        let prefix = self.nodes_prefix();
        let snapshot = self.client.call("list", || store.list(&prefix)).await?;

        let nodes = decode_snapshot(&snapshot);
        self.refresh_cache(&nodes).await;
        Ok(nodes)
    }

    pub async fn get_node(&self, id: &str) -> ClusterResult<Option<Node>> {
        let store = self.client.store();
        let key = self.node_key(id);
        let Some(kv) = self.client.call("get", || store.get(&key)).await? else {
            self.cache.write().await.remove(id);
            return Ok(None);
        };

        let node = decode(&kv)?;
        self.cache.write().await.insert(node.id.clone(), node.clone());
        Ok(Some(node))
    }

    /// Last known nodes without touching the store
    pub async fn cached_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.cache.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Whether this process holds a live lease for `id`
    pub async fn is_local(&self, id: &str) -> bool {
        self.leases
            .lock()
            .await
            .get(id)
            .is_some_and(|local| !local.task.is_finished())
    }

    async fn refresh_cache(&self, nodes: &[Node]) {
        let mut cache = self.cache.write().await;
        *cache = nodes.iter().map(|n| (n.id.clone(), n.clone())).collect();
        metrics::set_registered_nodes(cache.len());
    }

    /// Long-poll the node prefix; returns decoded nodes and the prefix version
    pub(crate) async fn watch_snapshot(
        &self,
        known_version: u64,
        wait: Duration,
    ) -> ClusterResult<(Vec<Node>, u64)> {
        let store = self.client.store();
        let prefix = self.nodes_prefix();
        let deadline = wait + self.client.call_timeout();

        let snapshot = self
            .client
            .call_with_timeout("watch", deadline, || {
                store.watch_prefix(&prefix, known_version, wait)
            })
            .await?;

        let nodes = decode_snapshot(&snapshot);
        self.refresh_cache(&nodes).await;
        Ok((nodes, snapshot.version))
    }

    /// Lazy, cancellable stream of membership events
    pub fn watch_nodes(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = NodeEvent> + Send + 'static {
        ChangeWatcher::new(Arc::clone(self)).into_stream(cancel)
    }

    /// Local `Failed` events for leases this process gave up on
    pub fn subscribe_lease_failures(&self) -> broadcast::Receiver<NodeEvent> {
        self.failures.subscribe()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Replace the load snapshot; capabilities and status are kept
    pub async fn update_node_load(&self, id: &str, load: NodeLoad) -> ClusterResult<Node> {
        let load = load.clamped();
        self.modify_node(id, |node| node.load = load).await
    }

    /// Self-reported utilisation; `active_jobs` stays as the scheduler counted it
    pub async fn report_utilization(&self, id: &str, sample: NodeLoad) -> ClusterResult<Node> {
        let sample = sample.clamped();
        self.modify_node(id, |node| {
            node.load.cpu = sample.cpu;
            node.load.memory = sample.memory;
            node.load.queue_size = sample.queue_size;
        })
        .await
    }

    pub async fn set_status(&self, id: &str, status: NodeStatus) -> ClusterResult<Node> {
        self.modify_node(id, |node| node.status = status).await
    }

    /// Add `delta` to the node's active job count, saturating at zero
    pub async fn adjust_active_jobs(&self, id: &str, delta: i64) -> ClusterResult<Node> {
        self.modify_node(id, |node| {
            let next = i64::from(node.load.active_jobs).saturating_add(delta);
            node.load.active_jobs = next.clamp(0, i64::from(u32::MAX)) as u32;
        })
        .await
    }

    /// Optimistic read-merge-write that keeps the entry's lease binding
    async fn modify_node<F>(&self, id: &str, mutate: F) -> ClusterResult<Node>
    where
        F: Fn(&mut Node),
    {
        let store = self.client.store();
        let key = self.node_key(id);

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let kv = self
                .client
                .call("get", || store.get(&key))
                .await?
                .ok_or_else(|| ClusterError::NodeNotFound {
                    node_id: id.to_string(),
                })?;

            let mut node = decode(&kv)?;
            mutate(&mut node);
            node.last_seen = Utc::now();
            let value = encode(&key, &node)?;

            let swapped = self
                .client
                .call("compare_and_swap", || {
                    store.compare_and_swap(&key, Some(kv.mod_revision), value.clone(), kv.lease)
                })
                .await?;

            if swapped {
                self.cache.write().await.insert(node.id.clone(), node.clone());
                return Ok(node);
            }
            debug!(node_id = %id, attempt, "Concurrent node update, retrying");
        }

        Err(ClusterError::CoordinationUnavailable {
            operation: "compare_and_swap".to_string(),
            reason: format!("node {id} kept changing during update"),
        })
    }
}

fn validate(node: &Node) -> ClusterResult<()> {
    let invalid = |reason: &str| ClusterError::InvalidNode {
        node_id: node.id.clone(),
        reason: reason.to_string(),
    };

    if node.id.trim().is_empty() {
        return Err(invalid("id must not be empty"));
    }
    if node.id.contains('/') {
        return Err(invalid("id must not contain '/'"));
    }
    Ok(())
}

fn encode(key: &str, node: &Node) -> ClusterResult<Vec<u8>> {
    serde_json::to_vec(node).map_err(|e| ClusterError::corrupt(key, e))
}

fn decode(kv: &KeyValue) -> ClusterResult<Node> {
    serde_json::from_slice(&kv.value).map_err(|e| ClusterError::corrupt(&kv.key, e))
}

fn decode_snapshot(snapshot: &Snapshot) -> Vec<Node> {
    let mut nodes: Vec<Node> = snapshot
        .entries
        .iter()
        .filter_map(|kv| match decode(kv) {
            Ok(node) => Some(node),
            Err(e) => {
                warn!(key = %kv.key, error = %e, "Skipping undecodable node entry");
                None
            }
        })
        .collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::CAP_HTTP_SCRAPING;
    use crate::coordination::MemoryStore;
    use crate::utils::retry::RetryConfig;

    fn config() -> ClusterConfig {
        ClusterConfig {
            key_prefix: "test".to_string(),
            retry: RetryConfig::with_delays(1, 10, 10),
            ..Default::default()
        }
    }

    fn registry() -> (Arc<MemoryStore>, NodeRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = NodeRegistry::new(store.clone(), config());
        (store, registry)
    }

    fn node(id: &str) -> Node {
        Node::new(id, "127.0.0.1", 9000).with_capabilities([CAP_HTTP_SCRAPING])
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_and_get() {
        let (_store, registry) = registry();
        registry
            .register_node(node("n1").with_load(NodeLoad::new(1.5, 0.2, 1)))
            .await
            .unwrap();

        let nodes = registry.get_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].load.cpu, 1.0);
        assert!(registry.is_local("n1").await);

        let fetched = registry.get_node("n1").await.unwrap().unwrap();
        assert_eq!(fetched.endpoint(), "127.0.0.1:9000");
        assert!(registry.get_node("missing").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_is_idempotent() {
        let (store, registry) = registry();
        registry.register_node(node("n1")).await.unwrap();
        registry
            .register_node(node("n1").with_metadata("zone", "a"))
            .await
            .unwrap();

        assert_eq!(store.lease_count().await, 1);
        let fetched = registry.get_node("n1").await.unwrap().unwrap();
        assert_eq!(fetched.metadata.get("zone").map(String::as_str), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_node_rejected() {
        let (_store, registry) = registry();
        let err = registry.register_node(node("a/b")).await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidNode { .. }));
        let err = registry.register_node(node(" ")).await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidNode { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_load_keeps_capabilities_and_status() {
        let (_store, registry) = registry();
        registry
            .register_node(node("n1").with_status(NodeStatus::Draining))
            .await
            .unwrap();

        let load = NodeLoad::new(0.4, 0.5, 2);
        let first = registry.update_node_load("n1", load).await.unwrap();
        let second = registry.update_node_load("n1", load).await.unwrap();

        assert_eq!(second.status, NodeStatus::Draining);
        assert!(second.capabilities.contains(CAP_HTTP_SCRAPING));
        assert_eq!(second.load, load);

        // replaying the same load changes nothing but last_seen
        let mut normalized = second.clone();
        normalized.last_seen = first.last_seen;
        assert_eq!(normalized, first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_missing_node() {
        let (_store, registry) = registry();
        let err = registry
            .update_node_load("ghost", NodeLoad::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NodeNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adjust_active_jobs_saturates() {
        let (_store, registry) = registry();
        registry.register_node(node("n1")).await.unwrap();

        let updated = registry.adjust_active_jobs("n1", 2).await.unwrap();
        assert_eq!(updated.load.active_jobs, 2);
        let updated = registry.adjust_active_jobs("n1", -5).await.unwrap();
        assert_eq!(updated.load.active_jobs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_utilization_keeps_job_count() {
        let (_store, registry) = registry();
        registry.register_node(node("n1")).await.unwrap();
        registry.adjust_active_jobs("n1", 3).await.unwrap();

        let updated = registry
            .report_utilization("n1", NodeLoad::new(1.7, 0.25, 0))
            .await
            .unwrap();
        assert_eq!(updated.load.cpu, 1.0);
        assert_eq!(updated.load.memory, 0.25);
        assert_eq!(updated.load.active_jobs, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_leaves_departure_marker() {
        let (_store, registry) = registry();
        registry.register_node(node("n1")).await.unwrap();

        registry.unregister_node("n1").await.unwrap();

        assert!(registry.get_nodes().await.unwrap().is_empty());
        assert!(registry.has_departed("n1").await.unwrap());
        assert!(!registry.is_local("n1").await);

        // the marker only lives for one lease TTL
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!registry.has_departed("n1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_node_registered() {
        let (_store, registry) = registry();
        registry.register_node(node("n1")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(registry.get_nodes().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_renewal_expires_within_ttl() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        let registry = NodeRegistry::new(store.clone(), config()).with_cancellation(token.clone());
        registry.register_node(node("n1")).await.unwrap();

        token.cancel();
        tokio::time::sleep(Duration::from_secs(40)).await;

        assert!(registry.get_nodes().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lease_emits_failed() {
        let (store, registry) = registry();
        let mut failures = registry.subscribe_lease_failures();
        registry.register_node(node("n1")).await.unwrap();

        store.set_available(false);
        let event = tokio::time::timeout(Duration::from_secs(30), failures.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.kind, NodeEventKind::Failed);
        assert_eq!(event.node.id, "n1");
        assert_eq!(event.node.status, NodeStatus::Failed);
        assert!(!registry.is_local("n1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_store_surfaces_error() {
        let (store, registry) = registry();
        store.set_available(false);

        let err = registry.get_nodes().await.unwrap_err();
        assert!(matches!(err, ClusterError::CoordinationUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_entry_skipped() {
        let (store, registry) = registry();
        registry.register_node(node("n1")).await.unwrap();
        store
            .put("test/nodes/broken", b"not json".to_vec(), None)
            .await
            .unwrap();

        let nodes = registry.get_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "n1");
    }
}
