//! Shared key-value store for cross-process coordination state.
//!
//! Rate-limit counters and circuit-breaker records live here so that every
//! proxy process agrees on them. Two backends exist:
//!
//! - [`RedisStore`]: the production backend; counter updates and
//!   compare-and-set writes run as server-side Lua scripts so they are
//!   atomic under concurrency.
//! - [`MemoryStore`]: a single-process backend with identical semantics,
//!   used by tests and opted into for standalone deployments.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

/// Result of an atomic increment-and-compare on a windowed counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    /// Whether the request fit under the limit. Denied requests do not
    /// consume a count.
    pub allowed: bool,
    /// Counter value after the operation.
    pub count: i64,
    /// Time until the window resets; the Retry-After hint on denial.
    pub retry_after: Duration,
}

/// A record value paired with its store version for compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub value: String,
    pub version: u64,
}

/// Errors from the shared store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("store protocol error: {0}")]
    Protocol(String),
}

/// Backend-agnostic interface over the shared store.
///
/// Key layout is owned by the callers:
/// `rl:global:{window}` / `rl:key:{id}:{window}` / `rl:ip:{ip}:{window}`
/// for the rate limiter, `cb:{provider_id}` for circuit records.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically compare the windowed counter at `key` against `limit` and,
    /// if below, consume one count. The key expires `window` after its first
    /// increment.
    async fn check_and_count(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<WindowDecision, StoreError>;

    /// Add `amount` to a windowed gauge (token charging after a call).
    /// Returns the new total.
    async fn charge(&self, key: &str, amount: i64, window: Duration) -> Result<i64, StoreError>;

    /// Read a counter without modifying it. Missing or expired keys read 0.
    async fn read_counter(&self, key: &str) -> Result<i64, StoreError>;

    /// Fetch a versioned record.
    async fn load_record(&self, key: &str) -> Result<Option<VersionedRecord>, StoreError>;

    /// Store `value` at `key` only if the current version still equals
    /// `expected_version` (0 means "create if absent"). Returns false when
    /// another writer got there first.
    async fn swap_record(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
    ) -> Result<bool, StoreError>;

    /// Remove a record unconditionally (admin reset).
    async fn delete_record(&self, key: &str) -> Result<(), StoreError>;
}
