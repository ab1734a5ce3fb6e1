//! Coordination store boundary
//!
//! The node registry and the leader elector depend only on the capability set
//! defined here: atomic key/value operations, prefix listing, TTL-bound leases,
//! a create-if-absent lock primitive and a bounded long-poll watch.
//!
//! The store is the single source of truth for node entries and the leader
//! claim. Leadership built on top of it is lease-based mutual exclusion, not
//! quorum consensus: correctness assumes the store itself is strongly
//! consistent.
//!
//! # Backends
//!
//! - [`MemoryStore`] - strongly-consistent in-process store (single process
//!   clusters and tests)
//! - [`RedisStore`] - Redis-backed store shared by every node

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, RedisStoreConfig};

// ============================================================================
// Core Types
// ============================================================================

/// Identifier of a TTL-bound lease (session)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// A stored key with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Store revision of the last write to this key
    pub mod_revision: u64,
    /// Lease the key is bound to, if any
    pub lease: Option<LeaseId>,
}

/// Point-in-time listing of a key prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Entries sorted by key
    pub entries: Vec<KeyValue>,
    /// Opaque change marker for the prefix; differs whenever any entry was
    /// written, deleted or expired
    pub version: u64,
}

impl Snapshot {
    /// Build a snapshot, sorting entries and computing the version
    pub fn from_entries(mut entries: Vec<KeyValue>) -> Self {
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let version = fingerprint(&entries);
        Self { entries, version }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Result of a lock acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller now holds the key; the token is strictly greater than every
    /// token previously issued for this key
    Acquired { fencing_token: u64 },
    /// Someone else holds the key
    Held { holder: Vec<u8> },
}

/// Fingerprint of (key, revision) pairs used as a prefix version
pub fn fingerprint(entries: &[KeyValue]) -> u64 {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.key.as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.mod_revision.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    // zero is reserved for "nothing seen yet"
    u64::from_le_bytes(bytes).max(1)
}

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by a coordination store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store could not be reached (connection refused, timeout, outage)
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    /// Lease does not exist any more
    #[error("Lease expired: {0}")]
    LeaseExpired(LeaseId),

    /// Store answered with an error
    #[error("Coordination store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Store Trait
// ============================================================================

/// Capability set of the external coordination store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a single key
    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>>;

    /// List every key starting with `prefix`
    async fn list(&self, prefix: &str) -> StoreResult<Snapshot>;

    /// Unconditional write, optionally bound to a lease; returns the new revision
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<u64>;

    /// Conditional write. `expected == None` creates only if the key is
    /// absent, `Some(rev)` replaces only if the key's mod-revision is `rev`
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> StoreResult<bool>;

    /// Delete a key; returns whether it existed
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete a key only if its mod-revision is `expected`
    async fn compare_and_delete(&self, key: &str, expected: u64) -> StoreResult<bool>;

    /// Create a lease that expires after `ttl` unless kept alive
    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Push the lease deadline out by its TTL
    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<()>;

    /// Drop the lease and every key bound to it
    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()>;

    /// Atomically create `key` bound to `lease` if nobody holds it
    async fn try_acquire(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> StoreResult<AcquireOutcome>;

    /// Long-poll: return the prefix snapshot as soon as its version differs
    /// from `known_version`, or the current snapshot once `wait` elapses
    async fn watch_prefix(
        &self,
        prefix: &str,
        known_version: u64,
        wait: Duration,
    ) -> StoreResult<Snapshot>;
}
