//! Request-rate gate and upstream key budget accounting.
//!
//! Three request axes are checked in order: global, per client key, per
//! client IP; the first denial wins and carries the window remainder as
//! the Retry-After hint. Each axis is one atomic increment-and-compare on
//! the shared store, so concurrent processes cannot double-admit.
//!
//! Token budgets for upstream keys are charged after the call returns,
//! from the usage the provider reported.

use std::sync::Arc;
use std::time::Duration;

use crate::config::LimitsConfig;
use crate::storage::{ApiKeyRecord, ClientKeyRecord};
use crate::store::SharedStore;

const DAY: u64 = 86_400;

/// A denied request: which axis denied and when to retry.
#[derive(Debug, Clone, Copy)]
pub struct Denied {
    pub scope: &'static str,
    pub retry_after: Duration,
}

pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    window: Duration,
    global_rpm: u64,
    per_key_rpm: u64,
    per_ip_rpm: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, limits: &LimitsConfig) -> Self {
        Self {
            store,
            window: limits.window(),
            global_rpm: limits.global_rpm,
            per_key_rpm: limits.per_key_rpm,
            per_ip_rpm: limits.per_ip_rpm,
        }
    }

    fn window_index(&self) -> u64 {
        epoch_secs() / self.window.as_secs().max(1)
    }

    /// Admit or deny a request. Axes are checked global → key → IP and the
    /// first denial's Retry-After is returned. A store outage fails open.
    pub async fn admit(
        &self,
        principal: &ClientKeyRecord,
        client_ip: Option<&str>,
    ) -> Result<(), Denied> {
        let window_index = self.window_index();

        if self.global_rpm > 0 {
            let key = format!("rl:global:{}", window_index);
            if let Some(denied) = self.check_axis(&key, self.global_rpm as i64, "global").await {
                return Err(denied);
            }
        }

        let key_limit = principal.rpm_limit.unwrap_or(self.per_key_rpm as i64);
        if key_limit > 0 {
            let key = format!("rl:key:{}:{}", principal.id, window_index);
            if let Some(denied) = self.check_axis(&key, key_limit, "key").await {
                return Err(denied);
            }
        }

        if self.per_ip_rpm > 0 {
            if let Some(ip) = client_ip {
                let key = format!("rl:ip:{}:{}", ip, window_index);
                if let Some(denied) = self.check_axis(&key, self.per_ip_rpm as i64, "ip").await {
                    return Err(denied);
                }
            }
        }

        Ok(())
    }

    async fn check_axis(&self, key: &str, limit: i64, scope: &'static str) -> Option<Denied> {
        match self.store.check_and_count(key, limit, self.window).await {
            Ok(decision) if decision.allowed => None,
            Ok(decision) => Some(Denied {
                scope,
                retry_after: decision.retry_after.max(Duration::from_secs(1)),
            }),
            Err(e) => {
                // Store outage fails open; the invariant binds accepted requests.
                tracing::warn!(scope, error = %e, "rate-limit store unavailable, admitting");
                None
            }
        }
    }

    // ── Upstream key budgets ─────────────────────────────────────────

    fn upstream_rpm_key(&self, key: &ApiKeyRecord) -> String {
        format!("rl:upkey:{}:{}", key.id, self.window_index())
    }

    fn upstream_tpm_key(&self, key: &ApiKeyRecord) -> String {
        format!("rl:uptok:{}:{}", key.id, self.window_index())
    }

    fn upstream_daily_key(&self, key: &ApiKeyRecord) -> String {
        format!("rl:upday:{}:{}", key.id, epoch_secs() / DAY)
    }

    /// Current-window request count for a key (least_used ordering).
    pub async fn key_window_usage(&self, key: &ApiKeyRecord) -> i64 {
        self.store
            .read_counter(&self.upstream_rpm_key(key))
            .await
            .unwrap_or(0)
    }

    /// Whether a key is inside all of its configured budgets.
    pub async fn key_within_budget(&self, key: &ApiKeyRecord) -> bool {
        if let Some(rpm) = key.rpm_limit {
            if self.key_window_usage(key).await >= rpm {
                return false;
            }
        }
        if let Some(tpm) = key.tpm_limit {
            let used = self
                .store
                .read_counter(&self.upstream_tpm_key(key))
                .await
                .unwrap_or(0);
            if used >= tpm {
                return false;
            }
        }
        if let Some(quota) = key.daily_quota {
            let used = self
                .store
                .read_counter(&self.upstream_daily_key(key))
                .await
                .unwrap_or(0);
            if used >= quota {
                return false;
            }
        }
        true
    }

    /// Count one request against the key's window after an attempt.
    pub async fn charge_request(&self, key: &ApiKeyRecord) {
        let rpm_key = self.upstream_rpm_key(key);
        if let Err(e) = self.store.charge(&rpm_key, 1, self.window).await {
            tracing::warn!(key_id = %key.key_id, error = %e, "failed to charge key request");
        }
    }

    /// Charge reported token usage against the key's minute and daily
    /// budgets. Returns a cooldown spanning the window remainder when an
    /// axis went over; the in-flight response still completes.
    pub async fn charge_tokens(&self, key: &ApiKeyRecord, tokens: i64) -> Option<Duration> {
        if tokens <= 0 {
            return None;
        }

        let mut over_quota = false;
        if key.tpm_limit.is_some() || key.daily_quota.is_some() {
            let tpm_key = self.upstream_tpm_key(key);
            match self.store.charge(&tpm_key, tokens, self.window).await {
                Ok(total) => {
                    if let Some(tpm) = key.tpm_limit {
                        over_quota |= total > tpm;
                    }
                }
                Err(e) => {
                    tracing::warn!(key_id = %key.key_id, error = %e, "failed to charge tokens")
                }
            }

            let daily_key = self.upstream_daily_key(key);
            match self
                .store
                .charge(&daily_key, tokens, Duration::from_secs(DAY))
                .await
            {
                Ok(total) => {
                    if let Some(quota) = key.daily_quota {
                        over_quota |= total > quota;
                    }
                }
                Err(e) => {
                    tracing::warn!(key_id = %key.key_id, error = %e, "failed to charge daily quota")
                }
            }
        }

        if over_quota {
            let elapsed = epoch_secs() % self.window.as_secs().max(1);
            Some(Duration::from_secs(
                self.window.as_secs().saturating_sub(elapsed).max(1),
            ))
        } else {
            None
        }
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
