//! Upstream key selection and per-process key health.
//!
//! Health is deliberately process-local: it is consulted on every attempt
//! and a disagreement between processes only costs one wasted upstream
//! call. Counter updates are atomic because concurrent requests share key
//! entries.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::providers::Outcome;
use crate::proxy::rate_limit::RateLimiter;
use crate::storage::{ApiKeyRecord, KeyStatus};

/// Consecutive auth/quota failures after which a key is demoted to failed.
const FAILURE_THRESHOLD: u32 = 3;

/// Ceiling on the rate-limit cooldown applied from Retry-After.
const MAX_COOLDOWN: Duration = Duration::from_secs(60);

/// Cooldown applied when a 429 carried no Retry-After hint.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Key selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    Priority,
    RoundRobin,
    LeastUsed,
}

impl SelectionStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "priority" => Some(SelectionStrategy::Priority),
            "round_robin" => Some(SelectionStrategy::RoundRobin),
            "least_used" => Some(SelectionStrategy::LeastUsed),
            _ => None,
        }
    }
}

/// What the selector concluded from an attempt's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyVerdict {
    Noted,
    /// The key just crossed the failure threshold and was evicted; the
    /// caller should persist the demotion.
    Demoted,
}

#[derive(Default)]
struct KeyHealth {
    consecutive_failures: AtomicU32,
    cooldown_until_ms: AtomicI64,
    last_used_ms: AtomicI64,
    failed: AtomicBool,
}

/// Picks one eligible key per attempt and feeds outcomes back into the
/// local health map.
pub struct KeySelector {
    strategy: SelectionStrategy,
    limiter: Arc<RateLimiter>,
    health: DashMap<i64, Arc<KeyHealth>>,
    cursors: DashMap<i64, AtomicUsize>,
}

impl KeySelector {
    pub fn new(strategy: SelectionStrategy, limiter: Arc<RateLimiter>) -> Self {
        Self {
            strategy,
            limiter,
            health: DashMap::new(),
            cursors: DashMap::new(),
        }
    }

    fn health_for(&self, key_record_id: i64) -> Arc<KeyHealth> {
        self.health
            .entry(key_record_id)
            .or_insert_with(|| Arc::new(KeyHealth::default()))
            .clone()
    }

    async fn eligible(&self, key: &ApiKeyRecord, exclude: &HashSet<i64>) -> bool {
        if exclude.contains(&key.id) || key.status != KeyStatus::Active {
            return false;
        }
        let health = self.health_for(key.id);
        if health.failed.load(Ordering::Acquire) {
            return false;
        }
        if health.cooldown_until_ms.load(Ordering::Acquire) > now_ms() {
            return false;
        }
        self.limiter.key_within_budget(key).await
    }

    /// Select one key for the provider, skipping `exclude` (keys already
    /// tried in this request). Returns None when no key is eligible.
    pub async fn select(
        &self,
        provider_id: i64,
        keys: &[Arc<ApiKeyRecord>],
        exclude: &HashSet<i64>,
    ) -> Option<Arc<ApiKeyRecord>> {
        let mut eligible: Vec<usize> = Vec::with_capacity(keys.len());
        for (index, key) in keys.iter().enumerate() {
            if self.eligible(key, exclude).await {
                eligible.push(index);
            }
        }
        if eligible.is_empty() {
            return None;
        }

        let chosen_index = match self.strategy {
            SelectionStrategy::Priority => self.pick_priority(keys, &eligible),
            SelectionStrategy::RoundRobin => self.pick_round_robin(provider_id, keys, &eligible),
            SelectionStrategy::LeastUsed => self.pick_least_used(keys, &eligible).await,
        };

        let chosen = keys[chosen_index].clone();
        self.health_for(chosen.id)
            .last_used_ms
            .store(now_ms(), Ordering::Release);
        Some(chosen)
    }

    /// Lowest priority value; ties broken by least-recently-used.
    fn pick_priority(&self, keys: &[Arc<ApiKeyRecord>], eligible: &[usize]) -> usize {
        *eligible
            .iter()
            .min_by_key(|&&index| {
                let key = &keys[index];
                let last_used = self
                    .health_for(key.id)
                    .last_used_ms
                    .load(Ordering::Acquire);
                (key.priority, last_used)
            })
            .expect("eligible is non-empty")
    }

    /// Scan forward from the per-provider cursor over the full key list,
    /// wrapping at most once, and take the first eligible key. The cursor
    /// advances past the chosen key.
    fn pick_round_robin(
        &self,
        provider_id: i64,
        keys: &[Arc<ApiKeyRecord>],
        eligible: &[usize],
    ) -> usize {
        let cursor = self
            .cursors
            .entry(provider_id)
            .or_insert_with(|| AtomicUsize::new(0));
        let start = cursor.load(Ordering::Acquire) % keys.len();

        let eligible_set: HashSet<usize> = eligible.iter().copied().collect();
        for offset in 0..keys.len() {
            let index = (start + offset) % keys.len();
            if eligible_set.contains(&index) {
                cursor.store(index + 1, Ordering::Release);
                return index;
            }
        }
        // Full scan found nothing at the cursor; fall back to priority.
        self.pick_priority(keys, eligible)
    }

    /// Smallest request count in the current window.
    async fn pick_least_used(&self, keys: &[Arc<ApiKeyRecord>], eligible: &[usize]) -> usize {
        let mut best = eligible[0];
        let mut best_used = i64::MAX;
        for &index in eligible {
            let used = self.limiter.key_window_usage(&keys[index]).await;
            if used < best_used {
                best_used = used;
                best = index;
            }
        }
        best
    }

    /// Feed an attempt's outcome into the key's health entry.
    pub fn after_call(
        &self,
        key: &ApiKeyRecord,
        outcome: Outcome,
        retry_after: Option<Duration>,
    ) -> KeyVerdict {
        let health = self.health_for(key.id);
        match outcome {
            Outcome::Ok => {
                health.consecutive_failures.store(0, Ordering::Release);
                health.last_used_ms.store(now_ms(), Ordering::Release);
                KeyVerdict::Noted
            }
            Outcome::AuthFailed | Outcome::QuotaExhausted => {
                let failures = health.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= FAILURE_THRESHOLD && !health.failed.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        key_id = %key.key_id,
                        failures,
                        "key evicted after repeated auth/quota failures"
                    );
                    return KeyVerdict::Demoted;
                }
                KeyVerdict::Noted
            }
            Outcome::RateLimited => {
                let cooldown = retry_after.unwrap_or(DEFAULT_COOLDOWN).min(MAX_COOLDOWN);
                let until = now_ms() + cooldown.as_millis() as i64;
                health.cooldown_until_ms.fetch_max(until, Ordering::AcqRel);
                KeyVerdict::Noted
            }
            Outcome::ServerError | Outcome::Timeout | Outcome::NetworkError => {
                // Provider-level trouble; a single event does not fail a key.
                health.consecutive_failures.fetch_add(1, Ordering::AcqRel);
                KeyVerdict::Noted
            }
            _ => KeyVerdict::Noted,
        }
    }

    /// Put a key on cooldown (over-budget after token charging).
    pub fn apply_cooldown(&self, key: &ApiKeyRecord, cooldown: Duration) {
        let until = now_ms() + cooldown.as_millis() as i64;
        self.health_for(key.id)
            .cooldown_until_ms
            .fetch_max(until, Ordering::AcqRel);
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::store::MemoryStore;

    fn selector(strategy: SelectionStrategy) -> KeySelector {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryStore::new()),
            &LimitsConfig {
                window_secs: 60,
                global_rpm: 0,
                per_key_rpm: 0,
                per_ip_rpm: 0,
            },
        ));
        KeySelector::new(strategy, limiter)
    }

    fn key(id: i64, priority: i64) -> Arc<ApiKeyRecord> {
        Arc::new(ApiKeyRecord {
            id,
            provider_id: 1,
            key_id: format!("key-{}", id),
            ciphertext: String::new(),
            masked: format!("…{:04}", id),
            priority,
            rpm_limit: None,
            tpm_limit: None,
            daily_quota: None,
            status: KeyStatus::Active,
        })
    }

    fn disabled_key(id: i64) -> Arc<ApiKeyRecord> {
        let mut k = ApiKeyRecord::clone(&key(id, 1));
        k.status = KeyStatus::Disabled;
        Arc::new(k)
    }

    #[tokio::test]
    async fn priority_prefers_lowest_value() {
        let selector = selector(SelectionStrategy::Priority);
        let keys = vec![key(1, 5), key(2, 1), key(3, 3)];

        let chosen = selector.select(1, &keys, &HashSet::new()).await.unwrap();
        assert_eq!(chosen.id, 2);
    }

    #[tokio::test]
    async fn priority_ties_break_least_recently_used() {
        let selector = selector(SelectionStrategy::Priority);
        let keys = vec![key(1, 1), key(2, 1)];

        // First pick touches one key; second pick must take the other.
        let first = selector.select(1, &keys, &HashSet::new()).await.unwrap();
        let second = selector.select(1, &keys, &HashSet::new()).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn non_active_keys_are_filtered() {
        let selector = selector(SelectionStrategy::Priority);
        let keys = vec![disabled_key(1), key(2, 9)];

        let chosen = selector.select(1, &keys, &HashSet::new()).await.unwrap();
        assert_eq!(chosen.id, 2);
    }

    #[tokio::test]
    async fn excluded_keys_are_skipped() {
        let selector = selector(SelectionStrategy::Priority);
        let keys = vec![key(1, 1), key(2, 2)];

        let mut tried = HashSet::new();
        tried.insert(1);
        let chosen = selector.select(1, &keys, &tried).await.unwrap();
        assert_eq!(chosen.id, 2);

        tried.insert(2);
        assert!(selector.select(1, &keys, &tried).await.is_none());
    }

    #[tokio::test]
    async fn round_robin_rotates() {
        let selector = selector(SelectionStrategy::RoundRobin);
        let keys = vec![key(1, 1), key(2, 1), key(3, 1)];

        let picks: Vec<i64> = [
            selector.select(1, &keys, &HashSet::new()).await.unwrap().id,
            selector.select(1, &keys, &HashSet::new()).await.unwrap().id,
            selector.select(1, &keys, &HashSet::new()).await.unwrap().id,
            selector.select(1, &keys, &HashSet::new()).await.unwrap().id,
        ]
        .to_vec();
        assert_eq!(picks, vec![1, 2, 3, 1]);
    }

    #[tokio::test]
    async fn round_robin_scans_past_ineligible_cursor_target() {
        let selector = selector(SelectionStrategy::RoundRobin);
        let keys = vec![key(1, 1), key(2, 1), key(3, 1)];

        // Advance the cursor so it points at key 2, then evict key 2.
        selector.select(1, &keys, &HashSet::new()).await.unwrap();
        for _ in 0..FAILURE_THRESHOLD {
            selector.after_call(&keys[1], Outcome::AuthFailed, None);
        }

        let chosen = selector.select(1, &keys, &HashSet::new()).await.unwrap();
        assert_eq!(chosen.id, 3);
    }

    #[tokio::test]
    async fn auth_failures_demote_at_threshold() {
        let selector = selector(SelectionStrategy::Priority);
        let keys = vec![key(1, 1), key(2, 2)];

        assert_eq!(
            selector.after_call(&keys[0], Outcome::AuthFailed, None),
            KeyVerdict::Noted
        );
        assert_eq!(
            selector.after_call(&keys[0], Outcome::AuthFailed, None),
            KeyVerdict::Noted
        );
        assert_eq!(
            selector.after_call(&keys[0], Outcome::AuthFailed, None),
            KeyVerdict::Demoted
        );

        // Evicted for this process: selection now skips key 1.
        let chosen = selector.select(1, &keys, &HashSet::new()).await.unwrap();
        assert_eq!(chosen.id, 2);

        // Demotion fires once.
        assert_eq!(
            selector.after_call(&keys[0], Outcome::AuthFailed, None),
            KeyVerdict::Noted
        );
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let selector = selector(SelectionStrategy::Priority);
        let keys = vec![key(1, 1)];

        selector.after_call(&keys[0], Outcome::AuthFailed, None);
        selector.after_call(&keys[0], Outcome::AuthFailed, None);
        selector.after_call(&keys[0], Outcome::Ok, None);
        selector.after_call(&keys[0], Outcome::AuthFailed, None);
        selector.after_call(&keys[0], Outcome::AuthFailed, None);

        // Streak broken by the success, still selectable.
        assert!(selector.select(1, &keys, &HashSet::new()).await.is_some());
    }

    #[tokio::test]
    async fn rate_limited_applies_bounded_cooldown() {
        let selector = selector(SelectionStrategy::Priority);
        let keys = vec![key(1, 1), key(2, 2)];

        selector.after_call(
            &keys[0],
            Outcome::RateLimited,
            Some(Duration::from_secs(600)),
        );

        // Cooldown capped at 60s, still active now.
        let chosen = selector.select(1, &keys, &HashSet::new()).await.unwrap();
        assert_eq!(chosen.id, 2);

        let health = selector.health_for(1);
        let until = health.cooldown_until_ms.load(Ordering::Acquire);
        assert!(until <= now_ms() + 60_000);
        assert!(until > now_ms());
    }

    #[tokio::test]
    async fn server_errors_do_not_evict_single_handedly() {
        let selector = selector(SelectionStrategy::Priority);
        let keys = vec![key(1, 1)];

        for _ in 0..10 {
            selector.after_call(&keys[0], Outcome::ServerError, None);
        }
        assert!(selector.select(1, &keys, &HashSet::new()).await.is_some());
    }

    #[tokio::test]
    async fn over_budget_cooldown_excludes_key() {
        let selector = selector(SelectionStrategy::Priority);
        let keys = vec![key(1, 1)];

        selector.apply_cooldown(&keys[0], Duration::from_secs(30));
        assert!(selector.select(1, &keys, &HashSet::new()).await.is_none());
    }
}
