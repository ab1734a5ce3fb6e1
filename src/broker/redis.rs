//! Redis Streams broker
//!
//! Each topic is a stream consumed through one consumer group. Fetch first
//! drains this consumer's pending entries left over from a previous run, then
//! claims entries another consumer left unacknowledged for longer than
//! `claim_idle_ms`, then reads new entries. Acknowledged entries are removed
//! from the stream so `XLEN` reports the unacknowledged depth.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamPendingCountReply,
    StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{Broker, BrokerError, BrokerResult, Delivery, Message};

pub const DEFAULT_CLAIM_IDLE_MS: u64 = 60_000;

/// Redis broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisBrokerConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,

    /// Connection pool size
    pub pool_size: usize,

    /// Consumer group shared by every node
    pub group: String,

    /// Consumer name, unique per process
    pub consumer: String,

    /// Idle time after which another consumer's pending entry is taken over;
    /// must exceed the longest retry backoff
    pub claim_idle_ms: u64,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            group: "crawlmesh".to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::new_v4()),
            claim_idle_ms: DEFAULT_CLAIM_IDLE_MS,
        }
    }
}

#[derive(Debug, Default)]
struct ConsumerState {
    groups: HashSet<String>,
    /// Topics still replaying pending entries, with the last id replayed
    recovering: HashMap<String, String>,
    recovered: HashSet<String>,
}

/// Redis Streams implementation of [`Broker`]
pub struct RedisBroker {
    pool: Pool,
    config: RedisBrokerConfig,
    state: Mutex<ConsumerState>,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("url", &self.config.url)
            .field("group", &self.config.group)
            .field("consumer", &self.config.consumer)
            .finish()
    }
}

impl RedisBroker {
    /// Connect and verify the server answers PING
    pub async fn connect(config: RedisBrokerConfig) -> BrokerResult<Self> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| BrokerError::Backend(format!("Failed to create pool builder: {e}")))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| BrokerError::Backend(format!("Failed to create Redis pool: {e}")))?;

        let broker = Self {
            pool,
            config,
            state: Mutex::new(ConsumerState::default()),
        };

        let mut conn = broker.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;

        tracing::info!(
            url = %broker.config.url,
            group = %broker.config.group,
            consumer = %broker.config.consumer,
            "Connected to Redis broker"
        );

        Ok(broker)
    }

    async fn conn(&self) -> BrokerResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Redis pool: {e}")))
    }

    async fn ensure_group(&self, topic: &str) -> BrokerResult<()> {
        if self.state.lock().await.groups.contains(topic) {
            return Ok(());
        }

        let mut conn = self.conn().await?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut *conn)
            .await;

        match created {
            Ok(_) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(map_redis_error(e)),
        }

        self.state.lock().await.groups.insert(topic.to_string());
        Ok(())
    }

    /// Next pending-replay cursor for `topic`, or `None` once replay finished
    async fn recovery_cursor(&self, topic: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        if state.recovered.contains(topic) {
            return None;
        }
        Some(
            state
                .recovering
                .entry(topic.to_string())
                .or_insert_with(|| "0".to_string())
                .clone(),
        )
    }

    async fn read_group(
        &self,
        topic: &str,
        start: &str,
        max: usize,
        block: Option<Duration>,
    ) -> BrokerResult<Vec<StreamId>> {
        let mut options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(max);
        if let Some(block) = block {
            // BLOCK 0 would wait forever
            options = options.block(block.as_millis().max(1) as usize);
        }

        let mut conn = self.conn().await?;
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[topic], &[start], &options)
            .await
            .map_err(map_redis_error)?;

        Ok(reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default())
    }

    /// Take over entries left pending by consumers that stopped acknowledging
    async fn claim_idle(&self, topic: &str, max: usize) -> BrokerResult<Vec<StreamId>> {
        let mut conn = self.conn().await?;
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                topic,
                &self.config.group,
                &self.config.consumer,
                self.config.claim_idle_ms,
                "0-0",
                StreamAutoClaimOptions::default().count(max),
            )
            .await
            .map_err(map_redis_error)?;

        if !reply.deleted_ids.is_empty() {
            tracing::debug!(topic, count = reply.deleted_ids.len(), "Dropped pending ids of deleted entries");
        }
        Ok(reply.claimed)
    }

    /// Delivery counts of this consumer's pending `entries`, keyed by id
    async fn delivery_counts(
        &self,
        topic: &str,
        entries: &[StreamId],
    ) -> BrokerResult<HashMap<String, u32>> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(HashMap::new());
        };

        let mut conn = self.conn().await?;
        let reply: StreamPendingCountReply = conn
            .xpending_consumer_count(
                topic,
                &self.config.group,
                &first.id,
                &last.id,
                entries.len(),
                &self.config.consumer,
            )
            .await
            .map_err(map_redis_error)?;

        Ok(reply
            .ids
            .into_iter()
            .map(|pending| {
                let count = u32::try_from(pending.times_delivered).unwrap_or(u32::MAX);
                (pending.id, count)
            })
            .collect())
    }

    /// Decode redelivered entries with their real delivery counts
    async fn redeliver(&self, topic: &str, entries: &[StreamId]) -> BrokerResult<Vec<Delivery>> {
        let counts = self.delivery_counts(topic, entries).await?;
        entries
            .iter()
            .map(|entry| {
                let count = counts.get(&entry.id).copied().unwrap_or(2);
                decode_entry(topic, entry, count)
            })
            .collect()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, message: Message) -> BrokerResult<()> {
        let headers = serde_json::to_vec(&message.headers).map_err(|e| BrokerError::Malformed {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        let fields: Vec<(&str, Vec<u8>)> = vec![
            ("id", message.id.into_bytes()),
            ("key", message.key.into_bytes()),
            ("value", message.value),
            ("headers", headers),
            ("ts", message.timestamp.to_rfc3339().into_bytes()),
        ];

        let mut conn = self.conn().await?;
        let _: String = conn
            .xadd(topic, "*", &fields)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn fetch(&self, topic: &str, max: usize, wait: Duration) -> BrokerResult<Vec<Delivery>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        self.ensure_group(topic).await?;

        if let Some(cursor) = self.recovery_cursor(topic).await {
            let entries = self.read_group(topic, &cursor, max, None).await?;
            let mut state = self.state.lock().await;
            match entries.last() {
                Some(last) => {
                    state.recovering.insert(topic.to_string(), last.id.clone());
                }
                None => {
                    state.recovering.remove(topic);
                    state.recovered.insert(topic.to_string());
                }
            }
            drop(state);

            if !entries.is_empty() {
                tracing::info!(topic, count = entries.len(), "Replaying pending stream entries");
                return self.redeliver(topic, &entries).await;
            }
        }

        let claimed = self.claim_idle(topic, max).await?;
        if !claimed.is_empty() {
            tracing::info!(
                topic,
                count = claimed.len(),
                consumer = %self.config.consumer,
                "Claimed stream entries idle on another consumer"
            );
            return self.redeliver(topic, &claimed).await;
        }

        let block = (!wait.is_zero()).then_some(wait);
        let entries = self.read_group(topic, ">", max, block).await?;
        entries
            .iter()
            .map(|entry| decode_entry(topic, entry, 1))
            .collect()
    }

    async fn ack(&self, topic: &str, delivery_id: &str) -> BrokerResult<bool> {
        let mut conn = self.conn().await?;
        let acked: i64 = conn
            .xack(topic, &self.config.group, &[delivery_id])
            .await
            .map_err(map_redis_error)?;
        let _: i64 = conn
            .xdel(topic, &[delivery_id])
            .await
            .map_err(map_redis_error)?;
        Ok(acked > 0)
    }

    async fn depth(&self, topic: &str) -> BrokerResult<usize> {
        let mut conn = self.conn().await?;
        let len: usize = conn.xlen(topic).await.map_err(map_redis_error)?;
        Ok(len)
    }
}

fn decode_entry(topic: &str, entry: &StreamId, delivery_count: u32) -> BrokerResult<Delivery> {
    let malformed = |reason: &str| BrokerError::Malformed {
        topic: topic.to_string(),
        reason: format!("entry {}: {reason}", entry.id),
    };

    let id: String = entry.get("id").ok_or_else(|| malformed("missing id"))?;
    let key: String = entry.get("key").ok_or_else(|| malformed("missing key"))?;
    let value: Vec<u8> = entry.get("value").ok_or_else(|| malformed("missing value"))?;
    let headers: Vec<u8> = entry.get("headers").unwrap_or_else(|| b"{}".to_vec());
    let headers: HashMap<String, String> =
        serde_json::from_slice(&headers).map_err(|e| malformed(&e.to_string()))?;
    let timestamp = entry
        .get::<String>("ts")
        .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(Delivery {
        delivery_id: entry.id.clone(),
        message: Message {
            id,
            key,
            value,
            headers,
            timestamp,
        },
        delivery_count,
    })
}

fn map_redis_error(e: redis::RedisError) -> BrokerError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
    {
        BrokerError::Unavailable(e.to_string())
    } else {
        BrokerError::Backend(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_consumer_is_unique() {
        let a = RedisBrokerConfig::default();
        let b = RedisBrokerConfig::default();
        assert_ne!(a.consumer, b.consumer);
        assert_eq!(a.group, "crawlmesh");
        assert_eq!(a.claim_idle_ms, DEFAULT_CLAIM_IDLE_MS);
    }

    #[test]
    fn test_decode_entry_keeps_delivery_count() {
        let entry = StreamId {
            id: "1-0".to_string(),
            map: HashMap::from([
                ("id".to_string(), redis::Value::BulkString(b"m-1".to_vec())),
                ("key".to_string(), redis::Value::BulkString(b"job-1".to_vec())),
                ("value".to_string(), redis::Value::BulkString(b"{}".to_vec())),
            ]),
        };

        let delivery = decode_entry("t", &entry, 4).unwrap();
        assert_eq!(delivery.delivery_id, "1-0");
        assert_eq!(delivery.delivery_count, 4);
        assert_eq!(delivery.message.key, "job-1");
        assert!(delivery.message.headers.is_empty());
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_unavailable() {
        let config = RedisBrokerConfig {
            url: "redis://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let err = RedisBroker::connect(config).await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }

    // Integration tests require running Redis
    #[tokio::test]
    #[ignore = "Requires running Redis"]
    async fn test_idle_entry_taken_over_by_another_consumer() {
        let config = |consumer: &str| RedisBrokerConfig {
            consumer: consumer.to_string(),
            claim_idle_ms: 100,
            ..Default::default()
        };
        let crashed = RedisBroker::connect(config("consumer-a")).await.unwrap();
        let survivor = RedisBroker::connect(config("consumer-b")).await.unwrap();
        let topic = format!("crawlmesh-test-{}", uuid::Uuid::new_v4());

        crashed
            .publish(&topic, Message::new("job-1", b"{}".to_vec()))
            .await
            .unwrap();
        let held = crashed.fetch(&topic, 1, Duration::ZERO).await.unwrap();
        assert_eq!(held.len(), 1);

        // not idle long enough yet
        assert!(survivor.fetch(&topic, 1, Duration::ZERO).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let claimed = survivor.fetch(&topic, 1, Duration::ZERO).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].delivery_id, held[0].delivery_id);
        assert_eq!(claimed[0].delivery_count, 2);

        assert!(survivor.ack(&topic, &claimed[0].delivery_id).await.unwrap());
        assert_eq!(survivor.depth(&topic).await.unwrap(), 0);
    }
}
