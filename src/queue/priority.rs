//! Strict-priority consumption with retry and dead-letter routing
//!
//! Every consumption cycle looks at the tiers from 10 down to 0 and handles
//! the first job it finds, so a lower tier is only touched when every higher
//! tier was empty at that instant. With `starvation_interval = N > 0` every
//! N-th cycle scans from 0 upwards instead.
//!
//! A handler error keeps the delivery unacknowledged while a timer waits out
//! the backoff; the job is then republished with `retry + 1` and only after
//! that is the original delivery acknowledged. A crash during the backoff
//! therefore ends in broker redelivery, never in loss. Jobs past their retry
//! budget go to the dead-letter topic. A handler that gives up because its
//! process lost leadership hands the job back to its tier without spending a
//! retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{QueueError, QueueResult};
use super::job::{Job, MAX_PRIORITY};
use super::QueueConfig;
use crate::broker::{Broker, BrokerError, BrokerResult, Delivery, Message};
use crate::metrics;
use crate::utils::retry::with_retry_if;

pub const REASON_RETRIES_EXHAUSTED: &str = "retries_exhausted";
pub const REASON_SHED: &str = "shed";
pub const REASON_MALFORMED: &str = "malformed";

/// A job that will not be delivered again
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// `None` when the original message could not be decoded
    pub job: Option<Job>,
    /// Original message body when `job` is missing
    #[serde(default)]
    pub raw: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub last_error: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(job: Job, reason: &str, last_error: Option<String>) -> Self {
        Self {
            job: Some(job),
            raw: None,
            reason: reason.to_string(),
            last_error,
            failed_at: Utc::now(),
        }
    }

    fn malformed(message: &Message, error: String) -> Self {
        Self {
            job: None,
            raw: Some(String::from_utf8_lossy(&message.value).into_owned()),
            reason: REASON_MALFORMED.to_string(),
            last_error: Some(error),
            failed_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job.as_ref().map(|job| job.id.as_str())
    }
}

/// What one consumption cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Processed { job_id: String, priority: u8 },
    Retrying { job_id: String, retry: u32, delay: Duration },
    DeadLettered { job_id: String, reason: String },
    /// Declined after a leadership loss and republished unchanged
    HandedBack { job_id: String, priority: u8 },
}

/// State shared with background retry timers
struct Shared {
    broker: Arc<dyn Broker>,
    config: QueueConfig,
    ready: Notify,
    pending_retries: AtomicUsize,
}

impl Shared {
    async fn call<T, F, Fut>(&self, f: F) -> QueueResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        with_retry_if(&self.config.broker_retry, f, BrokerError::is_transient)
            .await
            .map_err(QueueError::from)
    }

    async fn fetch_one(&self, topic: &str) -> QueueResult<Option<Delivery>> {
        let mut deliveries = self
            .call(|| self.broker.fetch(topic, 1, Duration::ZERO))
            .await?;
        Ok(deliveries.pop())
    }

    async fn ack(&self, topic: &str, delivery_id: &str) -> QueueResult<()> {
        let acked = self.call(|| self.broker.ack(topic, delivery_id)).await?;
        if !acked {
            debug!(topic = %topic, delivery_id = %delivery_id, "Delivery already settled");
        }
        Ok(())
    }

    async fn publish_job(&self, job: &Job) -> QueueResult<()> {
        let topic = self.config.tier_topic(job.priority);
        let message = Message::new(job.id.clone(), job.to_bytes()?)
            .with_header("type", job.job_type.clone())
            .with_header("priority", job.priority.to_string())
            .with_header("retry", job.retry.to_string());

        self.call(|| self.broker.publish(&topic, message.clone()))
            .await?;
        self.ready.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, letter: DeadLetter) -> QueueResult<()> {
        let topic = self.config.dead_letter_topic();
        let key = letter.job_id().unwrap_or(REASON_MALFORMED).to_string();
        let value =
            serde_json::to_vec(&letter).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let message = Message::new(key.clone(), value).with_header("reason", letter.reason.clone());

        self.call(|| self.broker.publish(&topic, message.clone()))
            .await?;

        metrics::record_dead_letter(&letter.reason);
        warn!(
            job_id = %key,
            reason = %letter.reason,
            last_error = ?letter.last_error,
            "Job dead-lettered"
        );
        Ok(())
    }
}

/// Priority-tiered job queue on top of a [`Broker`]
pub struct PriorityJobQueue {
    shared: Arc<Shared>,
    cycles: AtomicU64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for PriorityJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityJobQueue")
            .field("config", &self.shared.config)
            .field("pending_retries", &self.pending_retries())
            .finish()
    }
}

impl PriorityJobQueue {
    pub fn new(broker: Arc<dyn Broker>, config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                broker,
                config,
                ready: Notify::new(),
                pending_retries: AtomicUsize::new(0),
            }),
            cycles: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie backoff timers to `token`; cancelled timers leave their delivery
    /// to broker redelivery
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Job with this queue's default retry budget
    pub fn new_job(&self, job_type: impl Into<String>, priority: u8) -> Job {
        Job::new(job_type, priority).with_max_retries(self.shared.config.default_max_retries)
    }

    /// Failed deliveries currently waiting out their backoff
    pub fn pending_retries(&self) -> usize {
        self.shared.pending_retries.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Ingress
    // =========================================================================

    /// Route a job to its priority tier
    ///
    /// At `max_depth` the oldest job of the lowest non-empty tier below the
    /// incoming one is shed to the dead-letter topic; with nothing lower to
    /// shed the call fails with [`QueueError::Backpressure`].
    pub async fn enqueue(&self, job: Job) -> QueueResult<()> {
        job.validate()?;

        let max_depth = self.shared.config.max_depth;
        let total: usize = self.depths().await?.iter().map(|(_, depth)| depth).sum();
        if total >= max_depth {
            self.shed_below(job.priority, total).await?;
        }

        self.shared.publish_job(&job).await?;
        metrics::record_enqueued(job.priority);
        debug!(job_id = %job.id, priority = job.priority, "Job enqueued");
        Ok(())
    }

    async fn shed_below(&self, priority: u8, total: usize) -> QueueResult<()> {
        for tier in 0..priority {
            let topic = self.shared.config.tier_topic(tier);
            let Some(delivery) = self.shared.fetch_one(&topic).await? else {
                continue;
            };

            let letter = match Job::from_bytes(&delivery.message.value) {
                Ok(job) => DeadLetter::new(
                    job,
                    REASON_SHED,
                    Some(format!("shed for priority {priority} at depth {total}")),
                ),
                Err(e) => DeadLetter::malformed(&delivery.message, e.to_string()),
            };
            self.shared.dead_letter(letter).await?;
            self.shared.ack(&topic, &delivery.delivery_id).await?;

            info!(
                shed_priority = tier,
                incoming_priority = priority,
                depth = total,
                "Shed lower-priority job under backpressure"
            );
            return Ok(());
        }

        Err(QueueError::Backpressure {
            priority,
            depth: total,
            max_depth: self.shared.config.max_depth,
        })
    }

    /// Put a job back at its own priority, bypassing backpressure
    ///
    /// Returns `false` when the job was past its retry budget and went to the
    /// dead-letter topic instead.
    pub async fn requeue(&self, mut job: Job) -> QueueResult<bool> {
        job.validate()?;
        job.scheduled_at = Utc::now();

        if job.retry > job.max_retries {
            let error = format!("requeued after {} attempts", job.retry);
            self.shared
                .dead_letter(DeadLetter::new(job, REASON_RETRIES_EXHAUSTED, Some(error)))
                .await?;
            return Ok(false);
        }

        self.shared.publish_job(&job).await?;
        info!(job_id = %job.id, priority = job.priority, retry = job.retry, "Job requeued");
        Ok(true)
    }

    // =========================================================================
    // Egress
    // =========================================================================

    fn scan_order(&self) -> Vec<u8> {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let interval = u64::from(self.shared.config.starvation_interval);

        if interval > 0 && cycle % interval == 0 {
            (0..=MAX_PRIORITY).collect()
        } else {
            (0..=MAX_PRIORITY).rev().collect()
        }
    }

    /// One strict-priority pass: handle at most one job
    ///
    /// Returns `None` when every tier was empty.
    pub async fn consume_cycle<F, Fut>(&self, handler: &F) -> QueueResult<Option<CycleOutcome>>
    where
        F: Fn(Job) -> Fut,
        Fut: Future<Output = crate::error::Result<()>>,
    {
        for priority in self.scan_order() {
            let topic = self.shared.config.tier_topic(priority);
            if let Some(delivery) = self.shared.fetch_one(&topic).await? {
                return self
                    .process(priority, &topic, delivery, handler)
                    .await
                    .map(Some);
            }
        }
        Ok(None)
    }

    async fn process<F, Fut>(
        &self,
        priority: u8,
        topic: &str,
        delivery: Delivery,
        handler: &F,
    ) -> QueueResult<CycleOutcome>
    where
        F: Fn(Job) -> Fut,
        Fut: Future<Output = crate::error::Result<()>>,
    {
        let job = match Job::from_bytes(&delivery.message.value) {
            Ok(job) => job,
            Err(e) => {
                self.shared
                    .dead_letter(DeadLetter::malformed(&delivery.message, e.to_string()))
                    .await?;
                self.shared.ack(topic, &delivery.delivery_id).await?;
                return Ok(CycleOutcome::DeadLettered {
                    job_id: delivery.message.key,
                    reason: REASON_MALFORMED.to_string(),
                });
            }
        };

        if delivery.delivery_count > 1 {
            debug!(job_id = %job.id, delivery_count = delivery.delivery_count, "Redelivered job");
        }

        let job_id = job.id.clone();
        match handler(job.clone()).await {
            Ok(()) => {
                self.shared.ack(topic, &delivery.delivery_id).await?;
                metrics::record_processed(priority);
                Ok(CycleOutcome::Processed { job_id, priority })
            }
            Err(e) if e.is_leadership_lost() => {
                self.hand_back(topic, &delivery.delivery_id, job).await
            }
            Err(e) => self.fail(topic, delivery.delivery_id, job, e.to_string()).await,
        }
    }

    /// Republish `job` as it was, then settle the delivery
    async fn hand_back(
        &self,
        topic: &str,
        delivery_id: &str,
        mut job: Job,
    ) -> QueueResult<CycleOutcome> {
        job.assigned_to = None;
        self.shared.publish_job(&job).await?;
        self.shared.ack(topic, delivery_id).await?;
        debug!(job_id = %job.id, retry = job.retry, "Job handed back after leadership loss");
        Ok(CycleOutcome::HandedBack {
            job_id: job.id,
            priority: job.priority,
        })
    }

    async fn fail(
        &self,
        topic: &str,
        delivery_id: String,
        job: Job,
        error: String,
    ) -> QueueResult<CycleOutcome> {
        let job_id = job.id.clone();

        if !job.can_retry() {
            self.shared
                .dead_letter(DeadLetter::new(job, REASON_RETRIES_EXHAUSTED, Some(error)))
                .await?;
            self.shared.ack(topic, &delivery_id).await?;
            return Ok(CycleOutcome::DeadLettered {
                job_id,
                reason: REASON_RETRIES_EXHAUSTED.to_string(),
            });
        }

        let retry = job.retry + 1;
        let delay = self.shared.config.backoff.calculate_delay(retry);
        metrics::record_retry();
        warn!(
            job_id = %job_id,
            retry,
            max_retries = job.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Job failed, retrying after backoff"
        );

        self.shared.pending_retries.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let cancel = self.shutdown.clone();
        let topic = topic.to_string();

        tokio::spawn(async move {
            let resumed = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };

            if resumed {
                let mut job = job;
                job.retry = retry;
                job.assigned_to = None;
                job.scheduled_at = Utc::now();

                match shared.publish_job(&job).await {
                    Ok(()) => {
                        if let Err(e) = shared.ack(&topic, &delivery_id).await {
                            warn!(job_id = %job.id, error = %e, "Ack after retry publish failed");
                        }
                    }
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "Retry publish failed, broker will redeliver");
                    }
                }
            }

            shared.pending_retries.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(CycleOutcome::Retrying {
            job_id,
            retry,
            delay,
        })
    }

    /// Wait for a local enqueue or `timeout`, whichever comes first
    pub async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.shared.ready.notified()).await;
    }

    /// Consume until `cancel` fires
    ///
    /// Between empty cycles the loop waits for a local enqueue or
    /// `poll_timeout`, whichever comes first.
    pub async fn subscribe<F, Fut>(&self, handler: F, cancel: CancellationToken)
    where
        F: Fn(Job) -> Fut,
        Fut: Future<Output = crate::error::Result<()>>,
    {
        let idle = self.shared.config.poll_timeout();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.consume_cycle(&handler).await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Queue consumption failed");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
            }
        }

        debug!("Queue subscription stopped");
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Depth of every tier, lowest priority first
    pub async fn depths(&self) -> QueueResult<Vec<(u8, usize)>> {
        let mut depths = Vec::with_capacity(usize::from(MAX_PRIORITY) + 1);
        for priority in 0..=MAX_PRIORITY {
            let topic = self.shared.config.tier_topic(priority);
            let depth = self.shared.call(|| self.shared.broker.depth(&topic)).await?;
            metrics::set_queue_depth(priority, depth);
            depths.push((priority, depth));
        }
        Ok(depths)
    }

    pub async fn dead_letter_depth(&self) -> QueueResult<usize> {
        let topic = self.shared.config.dead_letter_topic();
        self.shared.call(|| self.shared.broker.depth(&topic)).await
    }

    /// Dead-letter a message that does not decode as a job
    pub async fn dead_letter_malformed(&self, message: &Message, error: String) -> QueueResult<()> {
        self.shared
            .dead_letter(DeadLetter::malformed(message, error))
            .await
    }

    /// Remove and return up to `max` dead letters
    pub async fn take_dead_letters(&self, max: usize) -> QueueResult<Vec<DeadLetter>> {
        let topic = self.shared.config.dead_letter_topic();
        let deliveries = self
            .shared
            .call(|| self.shared.broker.fetch(&topic, max, Duration::ZERO))
            .await?;

        let mut letters = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            let letter = serde_json::from_slice(&delivery.message.value)
                .unwrap_or_else(|e: serde_json::Error| {
                    DeadLetter::malformed(&delivery.message, e.to_string())
                });
            letters.push(letter);
            self.shared.ack(&topic, &delivery.delivery_id).await?;
        }
        Ok(letters)
    }
}
