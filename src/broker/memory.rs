//! In-process broker with visibility-timeout redelivery

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{Broker, BrokerError, BrokerResult, Delivery, Message};

/// Default time an unacknowledged delivery stays invisible
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Pending {
    message: Message,
    delivery_count: u32,
    seq: u64,
}

#[derive(Debug)]
struct InFlight {
    pending: Pending,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Topic {
    ready: VecDeque<Pending>,
    in_flight: HashMap<String, InFlight>,
}

impl Topic {
    /// Move expired in-flight messages back to the front, oldest first
    fn reclaim(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }

        for id in expired {
            if let Some(flight) = self.in_flight.remove(&id) {
                self.ready.push_back(flight.pending);
            }
        }
        // publish order across reclaimed and untouched messages
        self.ready.make_contiguous().sort_by_key(|pending| pending.seq);
    }
}

#[derive(Debug, Default)]
struct Inner {
    topics: HashMap<String, Topic>,
    next_seq: u64,
    next_delivery: u64,
}

/// In-memory [`Broker`]
#[derive(Debug)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    published: Notify,
    visibility_timeout: Duration,
    unavailable: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// Create a broker that redelivers unacknowledged messages after `timeout`
    pub fn with_visibility_timeout(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            published: Notify::new(),
            visibility_timeout: timeout,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Deliveries handed out but not yet acknowledged
    pub async fn in_flight(&self, topic: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .topics
            .get(topic)
            .map_or(0, |topic| topic.in_flight.len())
    }

    fn check_available(&self) -> BrokerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(BrokerError::Unavailable("memory broker marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    async fn take(&self, topic: &str, max: usize) -> (Vec<Delivery>, Option<Instant>) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let visibility = self.visibility_timeout;

        let Inner {
            topics,
            next_delivery,
            ..
        } = &mut *inner;
        let state = topics.entry(topic.to_string()).or_default();
        state.reclaim(now);

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(mut pending) = state.ready.pop_front() else {
                break;
            };
            *next_delivery += 1;
            let delivery_id = format!("d-{next_delivery}");
            pending.delivery_count += 1;
            deliveries.push(Delivery {
                delivery_id: delivery_id.clone(),
                message: pending.message.clone(),
                delivery_count: pending.delivery_count,
            });
            state.in_flight.insert(
                delivery_id,
                InFlight {
                    pending,
                    deadline: now + visibility,
                },
            );
        }

        let next_reclaim = state.in_flight.values().map(|flight| flight.deadline).min();
        (deliveries, next_reclaim)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, message: Message) -> BrokerResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .ready
            .push_back(Pending {
                message,
                delivery_count: 0,
                seq,
            });
        drop(inner);

        self.published.notify_waiters();
        Ok(())
    }

    async fn fetch(&self, topic: &str, max: usize, wait: Duration) -> BrokerResult<Vec<Delivery>> {
        self.check_available()?;
        if max == 0 {
            return Ok(Vec::new());
        }

        let give_up = Instant::now() + wait;
        loop {
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (deliveries, next_reclaim) = self.take(topic, max).await;
            if !deliveries.is_empty() || Instant::now() >= give_up {
                return Ok(deliveries);
            }

            let wake_at = next_reclaim.map_or(give_up, |deadline| deadline.min(give_up));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, topic: &str, delivery_id: &str) -> BrokerResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner
            .topics
            .get_mut(topic)
            .and_then(|state| state.in_flight.remove(delivery_id))
            .is_some())
    }

    async fn depth(&self, topic: &str) -> BrokerResult<usize> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .topics
            .get(topic)
            .map_or(0, |state| state.ready.len() + state.in_flight.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str) -> Message {
        Message::new(key, key.as_bytes().to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_per_topic() {
        let broker = MemoryBroker::new();
        broker.publish("t", message("a")).await.unwrap();
        broker.publish("t", message("b")).await.unwrap();

        let deliveries = broker.fetch("t", 10, Duration::ZERO).await.unwrap();
        let keys: Vec<_> = deliveries.iter().map(|d| d.message.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(deliveries[0].delivery_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_removes_from_depth() {
        let broker = MemoryBroker::new();
        broker.publish("t", message("a")).await.unwrap();

        let delivery = broker.fetch("t", 1, Duration::ZERO).await.unwrap().remove(0);
        assert_eq!(broker.depth("t").await.unwrap(), 1);

        assert!(broker.ack("t", &delivery.delivery_id).await.unwrap());
        assert!(!broker.ack("t", &delivery.delivery_id).await.unwrap());
        assert_eq!(broker.depth("t").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_redelivered() {
        let broker = MemoryBroker::with_visibility_timeout(Duration::from_secs(5));
        broker.publish("t", message("a")).await.unwrap();

        let first = broker.fetch("t", 1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(broker.fetch("t", 1, Duration::ZERO).await.unwrap().is_empty());

        let again = broker.fetch("t", 1, Duration::from_secs(10)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message.id, first[0].message.id);
        assert_eq!(again[0].delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_waits_for_publish() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        let publisher = std::sync::Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            publisher.publish("t", message("late")).await.unwrap();
        });

        let deliveries = broker.fetch("t", 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message.key, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_times_out_empty() {
        let broker = MemoryBroker::new();
        let deliveries = broker.fetch("t", 1, Duration::from_secs(1)).await.unwrap();
        assert!(deliveries.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        assert!(broker.publish("t", message("a")).await.is_err());
        broker.set_available(true);
        assert!(broker.publish("t", message("a")).await.is_ok());
    }
}
