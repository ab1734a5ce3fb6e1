//! Lease-based leader election
//!
//! One named key (`<prefix>/leader`) acts as the cluster-wide lock. It is
//! created if absent and bound to the winner's lease, which is renewed by the
//! same keep-alive loop node registrations use. A crashed or partitioned
//! leader simply stops renewing; the key expires and the next campaign round
//! elsewhere wins.
//!
//! This is mutual exclusion on top of a single strongly-consistent store, not
//! quorum consensus. Every successful acquisition yields a fencing token that
//! is strictly greater than all tokens issued before it, which downstream
//! writes use to reject a stale leader during the hand-off window.
//!
//! [`LeaderElector::is_leader`] is a local check: it is true only while this
//! process holds the claim and the last renewal is known to still cover the
//! current instant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::StoreClient;
use super::config::ClusterConfig;
use super::error::{ClusterError, ClusterResult};
use super::lease::{KeepAlive, LeaseOutcome};
use crate::coordination::{AcquireOutcome, CoordinationStore, LeaseId};
use crate::metrics;

/// Value stored under the leader key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderClaim {
    pub node_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// Locally observed leadership
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaderState {
    /// Last known holder of the claim
    pub holder: Option<String>,
    /// Token of the claim while this process holds it
    pub fencing_token: Option<u64>,
    /// Instant until which this process's claim is known to be alive
    pub valid_until: Option<Instant>,
}

impl LeaderState {
    pub fn is_held_by(&self, node_id: &str) -> bool {
        self.holder.as_deref() == Some(node_id)
            && self.valid_until.is_some_and(|until| Instant::now() < until)
    }
}

/// Result of one election attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Election {
    Leader { fencing_token: u64 },
    Follower { leader: Option<String> },
}

impl Election {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader { .. })
    }
}

struct Renewal {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Campaigns for and holds the leader claim on behalf of one node
pub struct LeaderElector {
    node_id: String,
    client: StoreClient,
    config: ClusterConfig,
    state: Arc<watch::Sender<LeaderState>>,
    renewal: Mutex<Option<Renewal>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("node_id", &self.node_id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl LeaderElector {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        config: ClusterConfig,
    ) -> Self {
        let (state, _) = watch::channel(LeaderState::default());
        Self {
            node_id: node_id.into(),
            client: StoreClient::new(store, &config),
            config,
            state: Arc::new(state),
            renewal: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie the renewal loop to `token`
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn leader_key(&self) -> String {
        format!("{}/leader", self.config.key_prefix)
    }

    /// Cheap local check, no store round trip
    pub fn is_leader(&self) -> bool {
        self.state.borrow().is_held_by(&self.node_id)
    }

    /// Token of the claim while this process is leader
    pub fn fencing_token(&self) -> Option<u64> {
        let state = self.state.borrow();
        if state.is_held_by(&self.node_id) {
            state.fencing_token
        } else {
            None
        }
    }

    /// Leadership changes as seen by this process
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    /// Try to take the lock once
    ///
    /// On success a renewal loop keeps the claim alive until cancelled or
    /// lost. On failure the current holder is returned.
    pub async fn elect_leader(&self) -> ClusterResult<Election> {
        if let Some(fencing_token) = self.fencing_token() {
            return Ok(Election::Leader { fencing_token });
        }

        let store = self.client.store();
        let key = self.leader_key();
        let ttl = self.config.leader_ttl();
        let claim = LeaderClaim {
            node_id: self.node_id.clone(),
            acquired_at: Utc::now(),
        };
        let value = serde_json::to_vec(&claim).map_err(|e| ClusterError::corrupt(&key, e))?;

        // granted before the attempt, so started + ttl never overstates the lease
        let started = Instant::now();
        let lease = self
            .client
            .call("grant_lease", || store.grant_lease(ttl))
            .await?;

        let outcome = match self
            .client
            .call("try_acquire", || store.try_acquire(&key, value.clone(), lease))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release_lease(lease).await;
                return Err(e);
            }
        };

        match outcome {
            AcquireOutcome::Acquired { fencing_token } => {
                self.start_renewal(lease, fencing_token, started + ttl).await;
                metrics::record_leader_change();
                info!(node_id = %self.node_id, fencing_token, %lease, "Acquired leadership");
                Ok(Election::Leader { fencing_token })
            }
            AcquireOutcome::Held { holder } => {
                self.release_lease(lease).await;
                let leader = decode_claim(&key, &holder).map(|claim| claim.node_id);
                self.observe_holder(leader.clone());
                debug!(node_id = %self.node_id, leader = ?leader, "Leadership held elsewhere");
                Ok(Election::Follower { leader })
            }
        }
    }

    async fn release_lease(&self, lease: LeaseId) {
        if let Err(e) = self.client.store().revoke_lease(lease).await {
            debug!(%lease, error = %e, "Failed to revoke unused election lease");
        }
    }

    fn observe_holder(&self, leader: Option<String>) {
        let node_id = self.node_id.clone();
        self.state.send_if_modified(|state| {
            if state.is_held_by(&node_id) || state.holder == leader {
                return false;
            }
            *state = LeaderState {
                holder: leader,
                fencing_token: None,
                valid_until: None,
            };
            true
        });
    }

    async fn start_renewal(&self, lease: LeaseId, fencing_token: u64, valid_until: Instant) {
        let mut renewal = self.renewal.lock().await;
        if let Some(previous) = renewal.take() {
            previous.cancel.cancel();
        }

        self.state.send_replace(LeaderState {
            holder: Some(self.node_id.clone()),
            fencing_token: Some(fencing_token),
            valid_until: Some(valid_until),
        });

        let ttl = self.config.leader_ttl();
        let keep_alive = KeepAlive {
            lease,
            interval: self.config.leader_renew_interval(),
            retry_budget: self.config.renew_retry_budget,
            call_timeout: self.config.call_timeout(),
        };
        let store = Arc::clone(self.client.store());
        let state = Arc::clone(&self.state);
        let node_id = self.node_id.clone();
        let cancel = self.shutdown.child_token();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let renewed = Arc::clone(&state);
            let outcome = keep_alive
                .run(store, task_cancel, move |sent_at| {
                    renewed.send_if_modified(|s| {
                        if s.fencing_token != Some(fencing_token) {
                            return false;
                        }
                        s.valid_until = Some(sent_at + ttl);
                        true
                    });
                })
                .await;

            if let LeaseOutcome::Lost { reason } = outcome {
                warn!(node_id = %node_id, fencing_token, %reason, "Lost leadership");
                let cleared = state.send_if_modified(|s| {
                    if s.fencing_token != Some(fencing_token) {
                        return false;
                    }
                    *s = LeaderState::default();
                    true
                });
                if cleared {
                    metrics::record_leader_change();
                }
            }
        });

        *renewal = Some(Renewal { cancel, task });
    }

    /// Stop renewing and forget the claim locally; the lock expires on its own
    pub async fn step_down(&self) {
        let renewal = self.renewal.lock().await.take();
        let Some(renewal) = renewal else {
            return;
        };

        renewal.cancel.cancel();
        let _ = renewal.task.await;

        let was_leader = self.is_leader();
        self.state.send_replace(LeaderState::default());
        if was_leader {
            metrics::record_leader_change();
            info!(node_id = %self.node_id, "Stepped down from leadership");
        }
    }

    /// Current holder as recorded in the store
    pub async fn current_leader(&self) -> ClusterResult<Option<String>> {
        let store = self.client.store();
        let key = self.leader_key();
        let leader = self
            .client
            .call("get", || store.get(&key))
            .await?
            .and_then(|kv| decode_claim(&key, &kv.value))
            .map(|claim| claim.node_id);

        if leader.as_deref() != Some(self.node_id.as_str()) {
            self.observe_holder(leader.clone());
        }
        Ok(leader)
    }

    /// Keep campaigning every lock TTL/3 until `cancel` fires, then step down
    pub async fn run_campaign(&self, cancel: CancellationToken) {
        let interval = self.config.leader_renew_interval();

        loop {
            if !self.is_leader() {
                match self.elect_leader().await {
                    Ok(Election::Leader { .. }) => {}
                    Ok(Election::Follower { .. }) => {}
                    Err(e) => warn!(node_id = %self.node_id, error = %e, "Election attempt failed"),
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.step_down().await;
    }
}

fn decode_claim(key: &str, bytes: &[u8]) -> Option<LeaderClaim> {
    match serde_json::from_slice(bytes) {
        Ok(claim) => Some(claim),
        Err(e) => {
            warn!(key = %key, error = %e, "Undecodable leader claim");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;
    use std::time::Duration;

    fn config() -> ClusterConfig {
        ClusterConfig {
            key_prefix: "elect".to_string(),
            ..Default::default()
        }
    }

    fn elector(id: &str, store: &Arc<MemoryStore>) -> LeaderElector {
        LeaderElector::new(id, store.clone(), config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let l1 = elector("l1", &store);
        let l2 = elector("l2", &store);

        assert_eq!(l1.elect_leader().await.unwrap(), Election::Leader { fencing_token: 1 });
        assert_eq!(
            l2.elect_leader().await.unwrap(),
            Election::Follower {
                leader: Some("l1".to_string())
            }
        );

        assert!(l1.is_leader());
        assert!(!l2.is_leader());
        assert_eq!(l1.fencing_token(), Some(1));
        assert_eq!(l2.fencing_token(), None);
        assert_eq!(l2.current_leader().await.unwrap().as_deref(), Some("l1"));

        // the losing attempt leaves no lease behind
        assert_eq!(store.lease_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_leadership() {
        let store = Arc::new(MemoryStore::new());
        let l1 = elector("l1", &store);
        let l2 = elector("l2", &store);
        l1.elect_leader().await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(l1.is_leader());
        assert!(!l2.elect_leader().await.unwrap().is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_renewal_hands_over() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        let l1 = LeaderElector::new("l1", store.clone(), config()).with_cancellation(token.clone());
        let l2 = elector("l2", &store);

        l1.elect_leader().await.unwrap();
        token.cancel();

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(!l1.is_leader());
        assert_eq!(l2.elect_leader().await.unwrap(), Election::Leader { fencing_token: 2 });
        assert!(l2.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_down_keeps_lock_until_expiry() {
        let store = Arc::new(MemoryStore::new());
        let l1 = elector("l1", &store);
        let l2 = elector("l2", &store);
        l1.elect_leader().await.unwrap();

        l1.step_down().await;
        assert!(!l1.is_leader());
        assert!(!l2.elect_leader().await.unwrap().is_leader());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(l2.elect_leader().await.unwrap().is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_drops_leadership() {
        let store = Arc::new(MemoryStore::new());
        let l1 = elector("l1", &store);
        let mut changes = l1.subscribe();
        l1.elect_leader().await.unwrap();
        changes.borrow_and_update();

        store.set_available(false);
        tokio::time::timeout(Duration::from_secs(15), changes.changed())
            .await
            .unwrap()
            .unwrap();

        assert!(!l1.is_leader());
        assert_eq!(changes.borrow().holder, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaign_takes_over() {
        let store = Arc::new(MemoryStore::new());
        let l1 = elector("l1", &store);
        l1.elect_leader().await.unwrap();
        l1.step_down().await;

        let l2 = Arc::new(elector("l2", &store));
        let cancel = CancellationToken::new();
        let campaign = tokio::spawn({
            let l2 = Arc::clone(&l2);
            let cancel = cancel.clone();
            async move { l2.run_campaign(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(l2.is_leader());
        assert_eq!(l2.fencing_token(), Some(2));

        cancel.cancel();
        campaign.await.unwrap();
        assert!(!l2.is_leader());
    }
}
