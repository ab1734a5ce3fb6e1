//! Integration tests for the priority job queue
//!
//! These tests verify:
//! - Strict priority consumption across tiers
//! - Retry with backoff and dead-letter routing
//! - Backpressure shedding
//! - Redelivery of unacknowledged jobs

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{http_job, queue_config};
use crawlmesh::broker::{Broker, MemoryBroker};
use crawlmesh::queue::{CycleOutcome, Job, PriorityJobQueue, QueueConfig, QueueError};
use crawlmesh::Error;

fn queue(config: QueueConfig) -> (Arc<MemoryBroker>, PriorityJobQueue) {
    let broker = Arc::new(MemoryBroker::new());
    let queue = PriorityJobQueue::new(broker.clone(), config);
    (broker, queue)
}

fn processed_id(outcome: Option<CycleOutcome>) -> String {
    match outcome {
        Some(CycleOutcome::Processed { job_id, .. }) => job_id,
        other => panic!("expected a processed job, got {other:?}"),
    }
}

// ============================================================================
// Priority Ordering
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scenario_d_high_priority_first() {
    let (_broker, queue) = queue(queue_config());

    for i in 1..=3 {
        queue.enqueue(http_job(&format!("low-{i}"), 1)).await.unwrap();
    }
    queue.enqueue(http_job("high", 9)).await.unwrap();

    let handler = |_job: Job| async { Ok::<(), Error>(()) };
    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(processed_id(queue.consume_cycle(&handler).await.unwrap()));
    }

    assert_eq!(order, vec!["high", "low-1", "low-2"]);
    assert_eq!(processed_id(queue.consume_cycle(&handler).await.unwrap()), "low-3");
    assert!(queue.consume_cycle(&handler).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_higher_tier_arriving_mid_drain_jumps_ahead() {
    let (_broker, queue) = queue(queue_config());
    for i in 1..=3 {
        queue.enqueue(http_job(&format!("mid-{i}"), 5)).await.unwrap();
    }

    let handler = |_job: Job| async { Ok::<(), Error>(()) };
    assert_eq!(processed_id(queue.consume_cycle(&handler).await.unwrap()), "mid-1");

    queue.enqueue(http_job("urgent", 10)).await.unwrap();
    assert_eq!(processed_id(queue.consume_cycle(&handler).await.unwrap()), "urgent");
    assert_eq!(processed_id(queue.consume_cycle(&handler).await.unwrap()), "mid-2");
}

// ============================================================================
// Retry and Dead Letters
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_retries_then_dead_letter() {
    let (_broker, queue) = queue(queue_config());
    let attempts = Arc::new(Mutex::new(Vec::new()));

    queue
        .enqueue(http_job("flaky", 4).with_max_retries(2))
        .await
        .unwrap();

    let handler = {
        let attempts = Arc::clone(&attempts);
        move |job: Job| {
            attempts.lock().unwrap().push(job.retry);
            async { Err::<(), Error>(Error::other("target returned 503")) }
        }
    };

    let mut dead_lettered = false;
    for _ in 0..30 {
        match queue.consume_cycle(&handler).await.unwrap() {
            Some(CycleOutcome::DeadLettered { job_id, reason }) => {
                assert_eq!(job_id, "flaky");
                assert_eq!(reason, "retries_exhausted");
                dead_lettered = true;
                break;
            }
            Some(CycleOutcome::Retrying { .. }) | None => {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Some(other) => panic!("unexpected outcome {other:?}"),
        }
    }

    assert!(dead_lettered);
    assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2]);

    let letters = queue.take_dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    let job = letters[0].job.as_ref().unwrap();
    assert_eq!(job.retry, 2);
    assert_eq!(letters[0].last_error.as_deref(), Some("target returned 503"));

    // nothing left anywhere
    assert_eq!(queue.dead_letter_depth().await.unwrap(), 0);
    assert!(queue.depths().await.unwrap().iter().all(|(_, d)| *d == 0));
}

#[tokio::test(start_paused = true)]
async fn test_recovered_handler_acks_retry() {
    let (broker, queue) = queue(queue_config());
    queue.enqueue(http_job("once", 6)).await.unwrap();

    let failed_once = Arc::new(Mutex::new(false));
    let handler = {
        let failed_once = Arc::clone(&failed_once);
        move |_job: Job| {
            let first = !std::mem::replace(&mut *failed_once.lock().unwrap(), true);
            async move {
                if first {
                    Err(Error::other("transient"))
                } else {
                    Ok(())
                }
            }
        }
    };

    assert!(matches!(
        queue.consume_cycle(&handler).await.unwrap(),
        Some(CycleOutcome::Retrying { retry: 1, .. })
    ));
    // held un-acknowledged while the backoff runs
    assert_eq!(broker.in_flight("scraping-jobs-p6").await, 1);
    assert_eq!(queue.pending_retries(), 1);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(queue.pending_retries(), 0);

    assert_eq!(processed_id(queue.consume_cycle(&handler).await.unwrap()), "once");
    assert_eq!(broker.depth("scraping-jobs-p6").await.unwrap(), 0);
}

// ============================================================================
// Backpressure
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_backpressure_sheds_lowest_tier_first() {
    let (_broker, queue) = queue(QueueConfig {
        max_depth: 3,
        ..queue_config()
    });

    queue.enqueue(http_job("p2", 2)).await.unwrap();
    queue.enqueue(http_job("p1", 1)).await.unwrap();
    queue.enqueue(http_job("p5", 5)).await.unwrap();

    // full: an equal or lower priority job has nothing below it to shed
    let err = queue.enqueue(http_job("p0", 0)).await.unwrap_err();
    assert!(matches!(err, QueueError::Backpressure { depth: 3, max_depth: 3, .. }));
    assert!(err.is_recoverable());

    // a higher priority job displaces the lowest tier
    queue.enqueue(http_job("p8", 8)).await.unwrap();
    let letters = queue.take_dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].job_id(), Some("p1"));
    assert_eq!(letters[0].reason, "shed");

    let depths = queue.depths().await.unwrap();
    assert_eq!(depths.iter().map(|(_, d)| d).sum::<usize>(), 3);
    assert_eq!(depths[1], (1, 0));
    assert_eq!(depths[2], (2, 1));
    assert_eq!(depths[8], (8, 1));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_priority_rejected() {
    let (_broker, queue) = queue(queue_config());
    let err = queue.enqueue(Job::new("scrape", 11)).await.unwrap_err();
    assert_eq!(err, QueueError::InvalidPriority(11));
}

// ============================================================================
// Redelivery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_job_is_redelivered() {
    let broker = Arc::new(MemoryBroker::with_visibility_timeout(Duration::from_secs(5)));
    let queue = PriorityJobQueue::new(broker.clone(), queue_config());
    queue.enqueue(http_job("crashy", 3)).await.unwrap();

    // a consumer takes the job and dies before acknowledging it
    let taken = broker
        .fetch("scraping-jobs-p3", 1, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(taken.len(), 1);

    let handler = |_job: Job| async { Ok::<(), Error>(()) };
    assert!(queue.consume_cycle(&handler).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(processed_id(queue.consume_cycle(&handler).await.unwrap()), "crashy");
    assert_eq!(broker.depth("scraping-jobs-p3").await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_broker_outage_surfaces_after_retries() {
    let (broker, queue) = queue(queue_config());
    broker.set_available(false);

    let err = queue.enqueue(http_job("down", 5)).await.unwrap_err();
    assert!(matches!(err, QueueError::BrokerUnavailable(_)));

    broker.set_available(true);
    queue.enqueue(http_job("up", 5)).await.unwrap();
}
