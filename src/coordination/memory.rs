//! In-process coordination store
//!
//! Strongly consistent by construction: every operation runs under one lock.
//! Lease deadlines use [`tokio::time::Instant`] so paused-clock tests can step
//! through TTLs deterministically. Expiry is applied lazily on every call, and
//! long-polls wake up at the next lease deadline so that an expiry is observed
//! as a change without any background task.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{
    AcquireOutcome, CoordinationStore, KeyValue, LeaseId, Snapshot, StoreError, StoreResult,
};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    mod_revision: u64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseState {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
    revision: u64,
    next_lease: u64,
    fencing: HashMap<String, u64>,
}

impl Inner {
    /// Drop expired leases and their keys; returns whether anything changed
    fn purge_expired(&mut self, now: Instant) -> bool {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, state)| state.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut changed = false;
        for lease in expired {
            if let Some(state) = self.leases.remove(&lease) {
                tracing::debug!(%lease, keys = state.keys.len(), "Lease expired");
                changed |= self.remove_lease_keys(lease, state.keys);
            }
        }
        changed
    }

    fn remove_lease_keys(&mut self, lease: LeaseId, keys: HashSet<String>) -> bool {
        let mut changed = false;
        for key in keys {
            let bound = self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.lease == Some(lease));
            if bound {
                self.entries.remove(&key);
                self.revision += 1;
                changed = true;
            }
        }
        changed
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.leases.values().map(|state| state.deadline).min()
    }

    fn write(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<u64> {
        if let Some(lease) = lease {
            if !self.leases.contains_key(&lease) {
                return Err(StoreError::LeaseExpired(lease));
            }
        }

        self.revision += 1;
        let revision = self.revision;

        let previous = self.entries.insert(
            key.to_string(),
            Entry {
                value,
                mod_revision: revision,
                lease,
            },
        );

        if let Some(old_lease) = previous.and_then(|entry| entry.lease) {
            if Some(old_lease) != lease {
                if let Some(state) = self.leases.get_mut(&old_lease) {
                    state.keys.remove(key);
                }
            }
        }

        if let Some(lease) = lease {
            if let Some(state) = self.leases.get_mut(&lease) {
                state.keys.insert(key.to_string());
            }
        }

        Ok(revision)
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                if let Some(state) = entry.lease.and_then(|lease| self.leases.get_mut(&lease)) {
                    state.keys.remove(key);
                }
                self.revision += 1;
                true
            }
            None => false,
        }
    }

    fn snapshot(&self, prefix: &str) -> Snapshot {
        let entries = self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
                mod_revision: entry.mod_revision,
                lease: entry.lease,
            })
            .collect();
        Snapshot::from_entries(entries)
    }
}

/// In-memory [`CoordinationStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    changed: Notify,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`]
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Current global revision
    pub async fn revision(&self) -> u64 {
        self.inner.lock().await.revision
    }

    /// Number of live leases
    pub async fn lease_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        if inner.purge_expired(Instant::now()) {
            self.changed.notify_waiters();
        }
        inner.leases.len()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    /// Lock the state with expired leases already applied
    async fn lock(&self) -> StoreResult<tokio::sync::MutexGuard<'_, Inner>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if inner.purge_expired(Instant::now()) {
            self.changed.notify_waiters();
        }
        Ok(inner)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let inner = self.lock().await?;
        Ok(inner.entries.get(key).map(|entry| KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            mod_revision: entry.mod_revision,
            lease: entry.lease,
        }))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Snapshot> {
        let inner = self.lock().await?;
        Ok(inner.snapshot(prefix))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<u64> {
        let mut inner = self.lock().await?;
        let revision = inner.write(key, value, lease)?;
        self.changed.notify_waiters();
        Ok(revision)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> StoreResult<bool> {
        let mut inner = self.lock().await?;
        let current = inner.entries.get(key).map(|entry| entry.mod_revision);
        if current != expected {
            return Ok(false);
        }
        inner.write(key, value, lease)?;
        self.changed.notify_waiters();
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.lock().await?;
        let existed = inner.remove(key);
        if existed {
            self.changed.notify_waiters();
        }
        Ok(existed)
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> StoreResult<bool> {
        let mut inner = self.lock().await?;
        let matches = inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.mod_revision == expected);
        if !matches {
            return Ok(false);
        }
        inner.remove(key);
        self.changed.notify_waiters();
        Ok(true)
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut inner = self.lock().await?;
        inner.next_lease += 1;
        let lease = LeaseId(inner.next_lease);
        inner.leases.insert(
            lease,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        // a new deadline may be earlier than what sleeping watchers wait for
        self.changed.notify_waiters();
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        let mut inner = self.lock().await?;
        match inner.leases.get_mut(&lease) {
            Some(state) => {
                state.deadline = Instant::now() + state.ttl;
                Ok(())
            }
            None => Err(StoreError::LeaseExpired(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        let mut inner = self.lock().await?;
        if let Some(state) = inner.leases.remove(&lease) {
            if inner.remove_lease_keys(lease, state.keys) {
                self.changed.notify_waiters();
            }
        }
        Ok(())
    }

    async fn try_acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> StoreResult<AcquireOutcome> {
        let mut inner = self.lock().await?;

        if let Some(entry) = inner.entries.get(key) {
            return Ok(AcquireOutcome::Held {
                holder: entry.value.clone(),
            });
        }

        inner.write(key, value, Some(lease))?;
        let token = inner.fencing.entry(key.to_string()).or_insert(0);
        *token += 1;
        let fencing_token = *token;

        self.changed.notify_waiters();
        Ok(AcquireOutcome::Acquired { fencing_token })
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        known_version: u64,
        wait: Duration,
    ) -> StoreResult<Snapshot> {
        let give_up = Instant::now() + wait;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (snapshot, next_expiry) = {
                let inner = self.lock().await?;
                (inner.snapshot(prefix), inner.next_deadline())
            };

            if snapshot.version != known_version || Instant::now() >= give_up {
                return Ok(snapshot);
            }

            let wake_at = next_expiry.map_or(give_up, |deadline| deadline.min(give_up));

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        let rev = store.put("a/1", b"one".to_vec(), None).await.unwrap();

        let kv = store.get("a/1").await.unwrap().unwrap();
        assert_eq!(kv.value, b"one");
        assert_eq!(kv.mod_revision, rev);

        assert!(store.delete("a/1").await.unwrap());
        assert!(!store.delete("a/1").await.unwrap());
        assert!(store.get("a/1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_by_prefix() {
        let store = MemoryStore::new();
        store.put("nodes/a", vec![1], None).await.unwrap();
        store.put("nodes/b", vec![2], None).await.unwrap();
        store.put("leader", vec![3], None).await.unwrap();

        let snapshot = store.list("nodes/").await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.entries[0].key, "nodes/a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        assert!(store.compare_and_swap("k", None, vec![1], None).await.unwrap());
        assert!(!store.compare_and_swap("k", None, vec![2], None).await.unwrap());

        let rev = store.get("k").await.unwrap().unwrap().mod_revision;
        assert!(!store.compare_and_swap("k", Some(rev + 10), vec![3], None).await.unwrap());
        assert!(store.compare_and_swap("k", Some(rev), vec![4], None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().value, vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_removes_keys() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        store.put("nodes/a", vec![1], Some(lease)).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        store.keep_alive(lease).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get("nodes/a").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("nodes/a").await.unwrap().is_none());
        assert_eq!(
            store.keep_alive(lease).await,
            Err(StoreError::LeaseExpired(lease))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_with_dead_lease_fails() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(Duration::from_secs(1)).await.unwrap();
        store.revoke_lease(lease).await.unwrap();

        let result = store.put("k", vec![], Some(lease)).await;
        assert_eq!(result, Err(StoreError::LeaseExpired(lease)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_fencing_increases() {
        let store = MemoryStore::new();
        let first = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        let second = store.grant_lease(Duration::from_secs(5)).await.unwrap();

        let outcome = store.try_acquire("leader", b"n1".to_vec(), first).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Acquired { fencing_token: 1 });

        let outcome = store.try_acquire("leader", b"n2".to_vec(), second).await.unwrap();
        assert_eq!(
            outcome,
            AcquireOutcome::Held {
                holder: b"n1".to_vec()
            }
        );

        store.revoke_lease(first).await.unwrap();
        let outcome = store.try_acquire("leader", b"n2".to_vec(), second).await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Acquired { fencing_token: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_returns_on_change() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let initial = store.list("nodes/").await.unwrap();

        let writer = std::sync::Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            writer.put("nodes/a", vec![1], None).await.unwrap();
        });

        let snapshot = store
            .watch_prefix("nodes/", initial.version, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_times_out_unchanged() {
        let store = MemoryStore::new();
        let initial = store.list("nodes/").await.unwrap();
        let started = Instant::now();

        let snapshot = store
            .watch_prefix("nodes/", initial.version, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(snapshot.version, initial.version);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_observes_lease_expiry() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        store.put("nodes/a", vec![1], Some(lease)).await.unwrap();
        let initial = store.list("nodes/").await.unwrap();

        let snapshot = store
            .watch_prefix("nodes/", initial.version, Duration::from_secs(30))
            .await
            .unwrap();

        assert!(snapshot.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_store_fails_calls() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.list("nodes/").await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_available(true);
        assert!(store.list("nodes/").await.is_ok());
    }
}
