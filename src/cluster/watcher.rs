//! Membership change stream derived from registry snapshots
//!
//! The watcher long-polls the node prefix and diffs each snapshot against the
//! previous one. The resulting stream is lazy, restartable per call and ends
//! only when the caller's cancellation token fires; store outages are logged
//! and retried after `watch_retry_delay`.
//!
//! Events for one node id follow the order in which its snapshots changed.
//! Nothing is promised across node ids.

use futures::stream::{self, Stream};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::registry::NodeRegistry;
use super::types::{Node, NodeEvent, NodeEventKind, NodeStatus};
use crate::metrics;

/// Diffs consecutive registry snapshots into [`NodeEvent`]s
#[derive(Debug, Clone)]
pub struct ChangeWatcher {
    registry: Arc<NodeRegistry>,
    wait: Duration,
    retry_delay: Duration,
}

struct WatchState {
    watcher: ChangeWatcher,
    cancel: CancellationToken,
    version: u64,
    known: HashMap<String, Node>,
    pending: VecDeque<NodeEvent>,
}

impl ChangeWatcher {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        let wait = registry.config().watch_wait();
        let retry_delay = registry.config().watch_retry_delay();
        Self {
            registry,
            wait,
            retry_delay,
        }
    }

    /// Override the long-poll wait
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Start watching; the first snapshot reports every present node as joined
    pub fn into_stream(self, cancel: CancellationToken) -> impl Stream<Item = NodeEvent> + Send + 'static {
        let state = WatchState {
            watcher: self,
            cancel,
            version: 0,
            known: HashMap::new(),
            pending: VecDeque::new(),
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }

                let cancel = state.cancel.clone();
                let registry = Arc::clone(&state.watcher.registry);
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    result = registry.watch_snapshot(state.version, state.watcher.wait) => result,
                };

                match result {
                    Ok((nodes, version)) => {
                        if version == state.version {
                            continue;
                        }
                        state.apply(nodes, version).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "Node watch failed, retrying");
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return None,
                            _ = tokio::time::sleep(state.watcher.retry_delay) => {}
                        }
                    }
                }
            }
        })
    }
}

impl WatchState {
    async fn apply(&mut self, nodes: Vec<Node>, version: u64) {
        let current: HashMap<String, Node> =
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect();

        // an orderly leave may have skipped straight past the inactive write
        let mut departed = HashSet::new();
        for (id, node) in &self.known {
            if current.contains_key(id) || node.status.is_departing() {
                continue;
            }
            match self.watcher.registry.has_departed(id).await {
                Ok(true) => {
                    departed.insert(id.clone());
                }
                Ok(false) => {}
                Err(e) => debug!(node_id = %id, error = %e, "Departure lookup failed"),
            }
        }

        for event in diff_snapshots(&self.known, &current, &departed) {
            metrics::record_node_event(event.kind.as_str());
            debug!(node_id = %event.node_id(), kind = event.kind.as_str(), "Node event");
            self.pending.push_back(event);
        }

        self.known = current;
        self.version = version;
    }
}

/// Membership events turning `prev` into `current`, ordered by node id
///
/// A vanished node counts as `Left` when its last status was inactive or
/// draining or when it is listed in `departed`. A node that was already
/// reported failed produces no second event when its entry disappears.
pub fn diff_snapshots(
    prev: &HashMap<String, Node>,
    current: &HashMap<String, Node>,
    departed: &HashSet<String>,
) -> Vec<NodeEvent> {
    let mut events = Vec::new();

    for (id, node) in current {
        match prev.get(id) {
            None => events.push(NodeEvent::new(NodeEventKind::Joined, node.clone())),
            Some(old) if !same_state(old, node) => {
                let kind = if node.status == NodeStatus::Failed && old.status != NodeStatus::Failed {
                    NodeEventKind::Failed
                } else {
                    NodeEventKind::Updated
                };
                events.push(NodeEvent::new(kind, node.clone()));
            }
            Some(_) => {}
        }
    }

    for (id, node) in prev {
        if current.contains_key(id) || node.status == NodeStatus::Failed {
            continue;
        }
        let kind = if node.status.is_departing() || departed.contains(id) {
            NodeEventKind::Left
        } else {
            NodeEventKind::Failed
        };
        events.push(NodeEvent::new(kind, node.clone()));
    }

    events.sort_by(|a, b| a.node.id.cmp(&b.node.id));
    events
}

/// Equality ignoring `last_seen`
fn same_state(a: &Node, b: &Node) -> bool {
    a.address == b.address
        && a.port == b.port
        && a.status == b.status
        && a.capabilities == b.capabilities
        && a.load == b.load
        && a.metadata == b.metadata
}
