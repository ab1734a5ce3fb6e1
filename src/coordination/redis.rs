//! Redis-backed coordination store
//!
//! Layout under a namespace `ns`:
//!
//! - `ns:kv:<key>` - hash `{v, r, l}` holding the value, mod-revision and lease id
//! - `ns:rev` - global revision counter
//! - `ns:lease:<id>` - lease marker whose value is the TTL in milliseconds
//! - `ns:lease:<id>:keys` - set of keys bound to the lease
//! - `ns:lease-seq` - lease id sequence
//! - `ns:fence:<key>` - fencing token counter for lock keys
//!
//! Leased keys carry the same PEXPIRE as their lease, so Redis expires them
//! together. Every conditional operation is a Lua script.

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::Script;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::{
    AcquireOutcome, CoordinationStore, KeyValue, LeaseId, Snapshot, StoreError, StoreResult,
};

const PUT_SCRIPT: &str = r#"
local mode = ARGV[1]
if mode == 'absent' then
  if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
elseif mode ~= 'any' then
  local cur = redis.call('HGET', KEYS[1], 'r')
  if (not cur) or cur ~= mode then return 0 end
end
local ttl = nil
if ARGV[3] ~= '' then
  ttl = redis.call('PTTL', KEYS[3])
  if ttl <= 0 then return -1 end
end
local rev = redis.call('INCR', KEYS[2])
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'v', ARGV[2], 'r', rev, 'l', ARGV[3])
if ttl then
  redis.call('PEXPIRE', KEYS[1], ttl)
  redis.call('SADD', KEYS[4], ARGV[4])
  redis.call('PEXPIRE', KEYS[4], ttl)
end
return rev
"#;

const ACQUIRE_SCRIPT: &str = r#"
local holder = redis.call('HGET', KEYS[1], 'v')
if holder then return {0, holder} end
local ttl = redis.call('PTTL', KEYS[3])
if ttl <= 0 then return {-1, ''} end
local rev = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'v', ARGV[1], 'r', rev, 'l', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ttl)
redis.call('SADD', KEYS[4], ARGV[3])
redis.call('PEXPIRE', KEYS[4], ttl)
local token = redis.call('INCR', KEYS[5])
return {1, tostring(token)}
"#;

const DELETE_SCRIPT: &str = r#"
if ARGV[1] ~= '' then
  local cur = redis.call('HGET', KEYS[1], 'r')
  if (not cur) or cur ~= ARGV[1] then return 0 end
end
return redis.call('DEL', KEYS[1])
"#;

const KEEP_ALIVE_SCRIPT: &str = r#"
local ttl = redis.call('GET', KEYS[1])
if not ttl then return 0 end
redis.call('PEXPIRE', KEYS[1], ttl)
local members = redis.call('SMEMBERS', KEYS[2])
for _, name in ipairs(members) do
  local data = ARGV[2] .. name
  if redis.call('HGET', data, 'l') == ARGV[1] then
    redis.call('PEXPIRE', data, ttl)
  else
    redis.call('SREM', KEYS[2], name)
  end
end
if #members > 0 then redis.call('PEXPIRE', KEYS[2], ttl) end
return 1
"#;

const REVOKE_SCRIPT: &str = r#"
local members = redis.call('SMEMBERS', KEYS[2])
for _, name in ipairs(members) do
  local data = ARGV[2] .. name
  if redis.call('HGET', data, 'l') == ARGV[1] then
    redis.call('DEL', data)
  end
end
redis.call('DEL', KEYS[1], KEYS[2])
return #members
"#;

const GRANT_SCRIPT: &str = r#"
local id = redis.call('INCR', KEYS[1])
redis.call('SET', ARGV[2] .. id, ARGV[1], 'PX', ARGV[1])
return id
"#;

const LIST_SCRIPT: &str = r#"
local out = {}
for _, k in ipairs(redis.call('KEYS', ARGV[1])) do
  local f = redis.call('HMGET', k, 'v', 'r', 'l')
  if f[1] then table.insert(out, {k, f[1], f[2], f[3] or ''}) end
end
return out
"#;

/// Redis store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,

    /// Connection pool size
    pub pool_size: usize,

    /// Key namespace
    pub namespace: String,

    /// Interval between polls while a watch is waiting, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            namespace: "crawlmesh".to_string(),
            poll_interval_ms: 500,
        }
    }
}

impl RedisStoreConfig {
    /// Create a config for the given URL with default pool and namespace
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the key namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

struct Scripts {
    put: Script,
    acquire: Script,
    delete: Script,
    keep_alive: Script,
    revoke: Script,
    grant: Script,
    list: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            put: Script::new(PUT_SCRIPT),
            acquire: Script::new(ACQUIRE_SCRIPT),
            delete: Script::new(DELETE_SCRIPT),
            keep_alive: Script::new(KEEP_ALIVE_SCRIPT),
            revoke: Script::new(REVOKE_SCRIPT),
            grant: Script::new(GRANT_SCRIPT),
            list: Script::new(LIST_SCRIPT),
        }
    }
}

/// Redis implementation of [`CoordinationStore`]
pub struct RedisStore {
    pool: Pool,
    config: RedisStoreConfig,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.config.url)
            .field("namespace", &self.config.namespace)
            .finish()
    }
}

impl RedisStore {
    /// Connect and verify the server answers PING
    pub async fn connect(config: RedisStoreConfig) -> StoreResult<Self> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| StoreError::Backend(format!("Failed to create pool builder: {e}")))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Backend(format!("Failed to create Redis pool: {e}")))?;

        let store = Self {
            pool,
            config,
            scripts: Scripts::load(),
        };

        let mut conn = store.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;

        tracing::info!(
            url = %store.config.url,
            namespace = %store.config.namespace,
            "Connected to Redis coordination store"
        );

        Ok(store)
    }

    async fn conn(&self) -> StoreResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Redis pool: {e}")))
    }

    // =========================================================================
    // Key Generation
    // =========================================================================

    fn data_prefix(&self) -> String {
        format!("{}:kv:", self.config.namespace)
    }

    fn data_key(&self, key: &str) -> String {
        format!("{}:kv:{}", self.config.namespace, key)
    }

    fn revision_key(&self) -> String {
        format!("{}:rev", self.config.namespace)
    }

    fn lease_prefix(&self) -> String {
        format!("{}:lease:", self.config.namespace)
    }

    fn lease_key(&self, lease: LeaseId) -> String {
        format!("{}:lease:{}", self.config.namespace, lease.0)
    }

    fn lease_keys_key(&self, lease: LeaseId) -> String {
        format!("{}:lease:{}:keys", self.config.namespace, lease.0)
    }

    fn lease_seq_key(&self) -> String {
        format!("{}:lease-seq", self.config.namespace)
    }

    fn fence_key(&self, key: &str) -> String {
        format!("{}:fence:{}", self.config.namespace, key)
    }

    /// Run the put script; `mode` is `any`, `absent` or an expected revision
    async fn write(
        &self,
        key: &str,
        mode: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> StoreResult<i64> {
        let lease_id = lease.map(|l| l.0.to_string()).unwrap_or_default();
        let lease_for_keys = lease.unwrap_or(LeaseId(0));

        let mut invocation = self.scripts.put.prepare_invoke();
        invocation
            .key(self.data_key(key))
            .key(self.revision_key())
            .key(self.lease_key(lease_for_keys))
            .key(self.lease_keys_key(lease_for_keys))
            .arg(mode)
            .arg(value)
            .arg(lease_id)
            .arg(key);

        let mut conn = self.conn().await?;
        let result: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;

        match (result, lease) {
            (-1, Some(lease)) => Err(StoreError::LeaseExpired(lease)),
            _ => Ok(result),
        }
    }

    async fn remove(&self, key: &str, expected: Option<u64>) -> StoreResult<bool> {
        let mut invocation = self.scripts.delete.prepare_invoke();
        invocation
            .key(self.data_key(key))
            .arg(expected.map(|r| r.to_string()).unwrap_or_default());

        let mut conn = self.conn().await?;
        let removed: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let mut conn = self.conn().await?;
        let (value, revision, lease): (Option<Vec<u8>>, Option<String>, Option<String>) =
            redis::cmd("HMGET")
                .arg(self.data_key(key))
                .arg("v")
                .arg("r")
                .arg("l")
                .query_async(&mut *conn)
                .await
                .map_err(map_redis_error)?;

        match value {
            Some(value) => Ok(Some(KeyValue {
                key: key.to_string(),
                value,
                mod_revision: parse_revision(revision.as_deref())?,
                lease: parse_lease(lease.as_deref()),
            })),
            None => Ok(None),
        }
    }

    async fn list(&self, prefix: &str) -> StoreResult<Snapshot> {
        let data_prefix = self.data_prefix();
        let pattern = format!("{}{}*", escape_glob(&data_prefix), escape_glob(prefix));

        let mut invocation = self.scripts.list.prepare_invoke();
        invocation.arg(pattern);

        let mut conn = self.conn().await?;
        let rows: Vec<(String, Vec<u8>, String, String)> = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;

        let entries = rows
            .into_iter()
            .map(|(raw_key, value, revision, lease)| {
                Ok(KeyValue {
                    key: raw_key
                        .strip_prefix(&data_prefix)
                        .unwrap_or(&raw_key)
                        .to_string(),
                    value,
                    mod_revision: parse_revision(Some(&revision))?,
                    lease: parse_lease(Some(&lease)),
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Snapshot::from_entries(entries))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<u64> {
        let revision = self.write(key, "any".to_string(), value, lease).await?;
        Ok(revision.max(0) as u64)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> StoreResult<bool> {
        let mode = match expected {
            Some(revision) => revision.to_string(),
            None => "absent".to_string(),
        };
        let revision = self.write(key, mode, value, lease).await?;
        Ok(revision > 0)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.remove(key, None).await
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> StoreResult<bool> {
        self.remove(key, Some(expected)).await
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let mut invocation = self.scripts.grant.prepare_invoke();
        invocation
            .key(self.lease_seq_key())
            .arg(ttl_ms)
            .arg(self.lease_prefix());

        let mut conn = self.conn().await?;
        let id: u64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        Ok(LeaseId(id))
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        let mut invocation = self.scripts.keep_alive.prepare_invoke();
        invocation
            .key(self.lease_key(lease))
            .key(self.lease_keys_key(lease))
            .arg(lease.0.to_string())
            .arg(self.data_prefix());

        let mut conn = self.conn().await?;
        let alive: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;

        if alive == 1 {
            Ok(())
        } else {
            Err(StoreError::LeaseExpired(lease))
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        let mut invocation = self.scripts.revoke.prepare_invoke();
        invocation
            .key(self.lease_key(lease))
            .key(self.lease_keys_key(lease))
            .arg(lease.0.to_string())
            .arg(self.data_prefix());

        let mut conn = self.conn().await?;
        let _: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn try_acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> StoreResult<AcquireOutcome> {
        let mut invocation = self.scripts.acquire.prepare_invoke();
        invocation
            .key(self.data_key(key))
            .key(self.revision_key())
            .key(self.lease_key(lease))
            .key(self.lease_keys_key(lease))
            .key(self.fence_key(key))
            .arg(value)
            .arg(lease.0.to_string())
            .arg(key);

        let mut conn = self.conn().await?;
        let (status, payload): (i64, Vec<u8>) = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;

        match status {
            1 => {
                let token = std::str::from_utf8(&payload)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| StoreError::Backend("invalid fencing token".to_string()))?;
                Ok(AcquireOutcome::Acquired {
                    fencing_token: token,
                })
            }
            0 => Ok(AcquireOutcome::Held { holder: payload }),
            _ => Err(StoreError::LeaseExpired(lease)),
        }
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        known_version: u64,
        wait: Duration,
    ) -> StoreResult<Snapshot> {
        let give_up = Instant::now() + wait;

        loop {
            let snapshot = self.list(prefix).await?;
            let now = Instant::now();
            if snapshot.version != known_version || now >= give_up {
                return Ok(snapshot);
            }
            let nap = self.config.poll_interval().min(give_up - now);
            tokio::time::sleep(nap).await;
        }
    }
}

fn map_redis_error(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
    {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

fn parse_revision(raw: Option<&str>) -> StoreResult<u64> {
    raw.and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::Backend(format!("invalid revision: {raw:?}")))
}

fn parse_lease(raw: Option<&str>) -> Option<LeaseId> {
    raw.and_then(|s| s.parse().ok()).map(LeaseId)
}

/// Escape Redis glob metacharacters
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("nodes/"), "nodes/");
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_revision(Some("42")).unwrap(), 42);
        assert!(parse_revision(Some("x")).is_err());
        assert!(parse_revision(None).is_err());
        assert_eq!(parse_lease(Some("7")), Some(LeaseId(7)));
        assert_eq!(parse_lease(Some("")), None);
    }

    #[test]
    fn test_default_config() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.namespace, "crawlmesh");
        assert_eq!(config.pool_size, 10);
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_unavailable() {
        let config = RedisStoreConfig {
            url: "redis://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let err = RedisStore::connect(config).await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }
}
