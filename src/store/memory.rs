//! Process-local store backend.
//!
//! Semantics mirror the Redis backend: per-key atomicity comes from the
//! DashMap entry guard, expiry from tokio's clock so time-controlled tests
//! behave deterministically.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{SharedStore, StoreError, VersionedRecord, WindowDecision};

struct Counter {
    value: i64,
    expires_at: Instant,
}

struct Record {
    value: String,
    version: u64,
}

/// In-process [`SharedStore`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    counters: DashMap<String, Counter>,
    records: DashMap<String, Record>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn check_and_count(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<WindowDecision, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Counter {
                value: 0,
                expires_at: now + window,
            });
        if entry.expires_at <= now {
            entry.value = 0;
            entry.expires_at = now + window;
        }

        let retry_after = entry.expires_at.saturating_duration_since(now);
        if entry.value + 1 > limit {
            return Ok(WindowDecision {
                allowed: false,
                count: entry.value,
                retry_after,
            });
        }

        entry.value += 1;
        Ok(WindowDecision {
            allowed: true,
            count: entry.value,
            retry_after,
        })
    }

    async fn charge(&self, key: &str, amount: i64, window: Duration) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Counter {
                value: 0,
                expires_at: now + window,
            });
        if entry.expires_at <= now {
            entry.value = 0;
            entry.expires_at = now + window;
        }
        entry.value += amount;
        Ok(entry.value)
    }

    async fn read_counter(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        Ok(self
            .counters
            .get(key)
            .filter(|c| c.expires_at > now)
            .map(|c| c.value)
            .unwrap_or(0))
    }

    async fn load_record(&self, key: &str) -> Result<Option<VersionedRecord>, StoreError> {
        Ok(self.records.get(key).map(|r| VersionedRecord {
            value: r.value.clone(),
            version: r.version,
        }))
    }

    async fn swap_record(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
    ) -> Result<bool, StoreError> {
        match self.records.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if slot.get().version != expected_version {
                    return Ok(false);
                }
                let record = slot.get_mut();
                record.value = value.to_string();
                record.version += 1;
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                if expected_version != 0 {
                    return Ok(false);
                }
                slot.insert(Record {
                    value: value.to_string(),
                    version: 1,
                });
                Ok(true)
            }
        }
    }

    async fn delete_record(&self, key: &str) -> Result<(), StoreError> {
        self.records.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_up_to_limit() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        for expected in 1..=3 {
            let decision = store.check_and_count("rl:key:k1:0", 3, window).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.count, expected);
        }

        let denied = store.check_and_count("rl:key:k1:0", 3, window).await.unwrap();
        assert!(!denied.allowed);
        // Denied requests do not consume a count.
        assert_eq!(denied.count, 3);
        assert!(denied.retry_after <= window);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expires() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        let first = store.check_and_count("rl:ip:1.2.3.4:0", 1, window).await.unwrap();
        assert!(first.allowed);
        let denied = store.check_and_count("rl:ip:1.2.3.4:0", 1, window).await.unwrap();
        assert!(!denied.allowed);

        tokio::time::advance(Duration::from_secs(61)).await;

        let again = store.check_and_count("rl:ip:1.2.3.4:0", 1, window).await.unwrap();
        assert!(again.allowed);
        assert_eq!(again.count, 1);
    }

    #[tokio::test]
    async fn charge_accumulates() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);

        assert_eq!(store.charge("rl:uptok:5:0", 100, window).await.unwrap(), 100);
        assert_eq!(store.charge("rl:uptok:5:0", 250, window).await.unwrap(), 350);
        assert_eq!(store.read_counter("rl:uptok:5:0").await.unwrap(), 350);
        assert_eq!(store.read_counter("rl:uptok:6:0").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn record_cas_semantics() {
        let store = MemoryStore::new();

        // Create requires expected_version 0.
        assert!(store.swap_record("cb:1", 0, "a").await.unwrap());
        assert!(!store.swap_record("cb:1", 0, "b").await.unwrap());

        let loaded = store.load_record("cb:1").await.unwrap().unwrap();
        assert_eq!(loaded.value, "a");
        assert_eq!(loaded.version, 1);

        // Stale version is rejected, current version wins.
        assert!(!store.swap_record("cb:1", 7, "b").await.unwrap());
        assert!(store.swap_record("cb:1", 1, "b").await.unwrap());
        let loaded = store.load_record("cb:1").await.unwrap().unwrap();
        assert_eq!(loaded.value, "b");
        assert_eq!(loaded.version, 2);

        store.delete_record("cb:1").await.unwrap();
        assert!(store.load_record("cb:1").await.unwrap().is_none());
    }
}
