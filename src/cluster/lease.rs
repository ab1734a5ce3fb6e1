//! Lease renewal loop shared by node registrations and the leader claim

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordination::{CoordinationStore, LeaseId, StoreError};

/// How a renewal loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// Stopped by the cancellation token; the lease is left to expire
    Cancelled,
    /// Lease is gone or could not be renewed within the retry budget
    Lost { reason: String },
}

/// Renewal schedule for one lease
#[derive(Debug, Clone)]
pub struct KeepAlive {
    pub lease: LeaseId,
    /// Period between successful renewals
    pub interval: Duration,
    /// Consecutive failed renewals tolerated before giving up
    pub retry_budget: u32,
    /// Deadline of each renewal call
    pub call_timeout: Duration,
}

impl KeepAlive {
    /// Delay before retrying a failed renewal; the whole budget fits in one interval
    fn retry_delay(&self) -> Duration {
        self.interval / (self.retry_budget + 1)
    }

    /// Renew until cancelled or lost
    ///
    /// `on_renewed` receives the instant the successful renewal was sent, which
    /// is a safe lower bound for the start of the renewed TTL.
    pub async fn run<F>(
        self,
        store: Arc<dyn CoordinationStore>,
        cancel: CancellationToken,
        mut on_renewed: F,
    ) -> LeaseOutcome
    where
        F: FnMut(Instant) + Send,
    {
        let mut next = Instant::now() + self.interval;
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(lease = %self.lease, "Lease renewal cancelled");
                    return LeaseOutcome::Cancelled;
                }
                _ = tokio::time::sleep_until(next) => {}
            }

            let sent_at = Instant::now();
            let result = match tokio::time::timeout(self.call_timeout, store.keep_alive(self.lease)).await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Unavailable(format!(
                    "keep_alive timed out after {}ms",
                    self.call_timeout.as_millis()
                ))),
            };

            match result {
                Ok(()) => {
                    if failures > 0 {
                        debug!(lease = %self.lease, failures, "Lease renewal recovered");
                    }
                    failures = 0;
                    on_renewed(sent_at);
                    next = sent_at + self.interval;
                }
                Err(StoreError::LeaseExpired(_)) => {
                    return LeaseOutcome::Lost {
                        reason: "lease expired".to_string(),
                    };
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.retry_budget {
                        return LeaseOutcome::Lost {
                            reason: format!("renewal failed {failures} times: {e}"),
                        };
                    }
                    warn!(
                        lease = %self.lease,
                        failures,
                        budget = self.retry_budget,
                        error = %e,
                        "Lease renewal failed, will retry"
                    );
                    next = Instant::now() + self.retry_delay();
                }
            }
        }
    }
}
