//! Store access with deadlines and local retries
//!
//! Every registry, election and ledger call goes through [`StoreClient`]:
//! each attempt carries the configured deadline, transient failures are
//! retried with backoff, and only an exhausted budget reaches the caller as
//! [`ClusterError::CoordinationUnavailable`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::config::ClusterConfig;
use super::error::{ClusterError, ClusterResult};
use crate::coordination::{CoordinationStore, StoreError, StoreResult};
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Shared handle on the coordination store
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn CoordinationStore>,
    call_timeout: Duration,
    retry: RetryConfig,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("call_timeout", &self.call_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl StoreClient {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &ClusterConfig) -> Self {
        Self {
            store,
            call_timeout: config.call_timeout(),
            retry: config.retry.clone(),
        }
    }

    /// Underlying store, for calls that manage their own deadline
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Run a store call under the default deadline
    pub async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> ClusterResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        self.call_with_timeout(operation, self.call_timeout, f).await
    }

    /// Run a store call with an explicit per-attempt deadline
    pub async fn call_with_timeout<T, F, Fut>(
        &self,
        operation: &'static str,
        deadline: Duration,
        f: F,
    ) -> ClusterResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        with_retry_if(
            &self.retry,
            || {
                let attempt = f();
                async move {
                    match tokio::time::timeout(deadline, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(StoreError::Unavailable(format!(
                            "{operation} timed out after {}ms",
                            deadline.as_millis()
                        ))),
                    }
                }
            },
            StoreError::is_transient,
        )
        .await
        .map_err(|e| ClusterError::from_store(operation, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn client(store: Arc<MemoryStore>) -> StoreClient {
        let config = ClusterConfig {
            retry: RetryConfig::with_delays(2, 10, 100),
            ..Default::default()
        };
        StoreClient::new(store, &config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_passes_through() {
        let store = Arc::new(MemoryStore::new());
        let client = client(Arc::clone(&store));

        let rev = client
            .call("put", || store.put("k", vec![1], None))
            .await
            .unwrap();
        assert!(rev > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_exhausts_budget() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let client = client(Arc::clone(&store));
        let attempts = AtomicU32::new(0);

        let err = client
            .call("list", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                store.list("nodes/")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::CoordinationUnavailable { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let client = client(store);

        let err = client
            .call_with_timeout("slow", Duration::from_millis(50), || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap_err();

        match err {
            ClusterError::CoordinationUnavailable { operation, reason } => {
                assert_eq!(operation, "slow");
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expired_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let client = client(Arc::clone(&store));
        let lease = store.grant_lease(Duration::from_secs(1)).await.unwrap();
        store.revoke_lease(lease).await.unwrap();

        let err = client
            .call("keep_alive", || store.keep_alive(lease))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::LeaseExpired { .. }));
    }
}
