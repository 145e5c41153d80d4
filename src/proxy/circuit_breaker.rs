//! Circuit breaker state machine for per-provider health tracking.
//!
//! Implements the Closed -> Open -> Half-Open -> Closed lifecycle:
//! - **Closed**: requests flow normally, failures within a rolling window
//!   are counted
//! - **Open**: requests are short-circuited until the open duration expires
//! - **Half-Open**: up to P probe requests are admitted to test recovery;
//!   a failed probe reopens the circuit with a doubled duration
//!
//! State lives in the shared store as a versioned record per provider and
//! every transition is a compare-and-set, so a horizontally scaled fleet
//! agrees on whether a provider is currently excluded. A lost CAS means
//! another process performed the same transition; the loser reloads and
//! proceeds.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CircuitBreakerConfig;
use crate::providers::Outcome;
use crate::store::SharedStore;

/// The three states of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation. Requests flow through, failures are counted.
    Closed,
    /// Circuit tripped. All requests are rejected until the timeout expires.
    Open,
    /// Recovery probing. A bounded number of requests test provider health.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase string representation for JSON serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Shared-store record for one provider's circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    /// Failures observed in the current rolling window.
    pub failures: u32,
    pub window_started_ms: i64,
    /// When the Open state expires (also the probe deadline in Half-Open).
    pub opened_until_ms: i64,
    /// Current open duration; doubles on failed probes.
    pub open_secs: u64,
    pub probes_in_flight: u32,
    pub probe_successes: u32,
    /// Most recent failure that moved the state.
    pub last_error: Option<String>,
}

impl CircuitRecord {
    fn closed(base_open_secs: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            window_started_ms: now_ms(),
            opened_until_ms: 0,
            open_secs: base_open_secs,
            probes_in_flight: 0,
            probe_successes: 0,
            last_error: None,
        }
    }
}

/// Type of permit granted for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Normal request through a closed circuit.
    Normal,
    /// Probe request through a half-open circuit.
    Probe,
}

/// Error returned when a provider's circuit is open.
#[derive(Debug, Clone)]
pub struct CircuitOpenError {
    pub provider: String,
    pub reason: String,
    pub retry_in: Duration,
}

impl std::fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Circuit breaker open for provider '{}': {}",
            self.provider, self.reason
        )
    }
}

impl std::error::Error for CircuitOpenError {}

/// Per-provider circuit breakers over the shared store.
pub struct CircuitBreaker {
    store: Arc<dyn SharedStore>,
    cfg: CircuitBreakerConfig,
}

/// CAS retries before giving up on a transition for this attempt.
const MAX_CAS_ATTEMPTS: usize = 4;

impl CircuitBreaker {
    pub fn new(store: Arc<dyn SharedStore>, cfg: CircuitBreakerConfig) -> Self {
        Self { store, cfg }
    }

    fn record_key(provider_id: i64) -> String {
        format!("cb:{}", provider_id)
    }

    async fn load(&self, provider_id: i64) -> (CircuitRecord, u64) {
        match self.store.load_record(&Self::record_key(provider_id)).await {
            Ok(Some(stored)) => match serde_json::from_str(&stored.value) {
                Ok(record) => (record, stored.version),
                Err(e) => {
                    tracing::warn!(provider_id, error = %e, "corrupt circuit record, resetting");
                    (CircuitRecord::closed(self.cfg.open_secs), stored.version)
                }
            },
            Ok(None) => (CircuitRecord::closed(self.cfg.open_secs), 0),
            Err(e) => {
                // Store outage fails open: the provider stays callable.
                tracing::warn!(provider_id, error = %e, "circuit store unavailable");
                (CircuitRecord::closed(self.cfg.open_secs), 0)
            }
        }
    }

    async fn save(&self, provider_id: i64, version: u64, record: &CircuitRecord) -> bool {
        let serialized = match serde_json::to_string(record) {
            Ok(s) => s,
            Err(_) => return false,
        };
        self.store
            .swap_record(&Self::record_key(provider_id), version, &serialized)
            .await
            .unwrap_or(false)
    }

    /// Gate one attempt against the provider's circuit.
    pub async fn acquire(
        &self,
        provider_id: i64,
        provider_name: &str,
    ) -> Result<Permit, CircuitOpenError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut record, version) = self.load(provider_id).await;
            let now = now_ms();

            match record.state {
                CircuitState::Closed => return Ok(Permit::Normal),
                CircuitState::Open => {
                    if now < record.opened_until_ms {
                        return Err(self.open_error(provider_name, &record, now));
                    }
                    // Lazy transition: Open -> HalfOpen, taking the first probe.
                    record.state = CircuitState::HalfOpen;
                    record.probes_in_flight = 1;
                    record.probe_successes = 0;
                    record.opened_until_ms = now + (record.open_secs as i64) * 1000;
                    if self.save(provider_id, version, &record).await {
                        tracing::info!(
                            provider = %provider_name,
                            "circuit entering Half-Open: timeout expired"
                        );
                        return Ok(Permit::Probe);
                    }
                }
                CircuitState::HalfOpen => {
                    // Probes that never resolved (process death mid-call)
                    // unstick once the probe deadline lapses.
                    if now >= record.opened_until_ms {
                        record.probes_in_flight = 0;
                        record.probe_successes = 0;
                        record.opened_until_ms = now + (record.open_secs as i64) * 1000;
                    }
                    if record.probes_in_flight >= self.cfg.half_open_probes {
                        return Err(self.open_error(provider_name, &record, now));
                    }
                    record.probes_in_flight += 1;
                    if self.save(provider_id, version, &record).await {
                        return Ok(Permit::Probe);
                    }
                }
            }
        }

        // Persistent CAS contention: another process is driving the same
        // transitions; treat as closed rather than rejecting the request.
        Ok(Permit::Normal)
    }

    fn open_error(
        &self,
        provider_name: &str,
        record: &CircuitRecord,
        now: i64,
    ) -> CircuitOpenError {
        CircuitOpenError {
            provider: provider_name.to_string(),
            reason: record
                .last_error
                .clone()
                .unwrap_or_else(|| "repeated upstream failures".to_string()),
            retry_in: Duration::from_millis(record.opened_until_ms.saturating_sub(now).max(0) as u64),
        }
    }

    /// Feed an attempt's outcome back into the circuit.
    pub async fn observe(
        &self,
        provider_id: i64,
        provider_name: &str,
        permit: Permit,
        outcome: Outcome,
        message: &str,
    ) {
        if outcome == Outcome::Ok {
            self.observe_success(provider_id, provider_name, permit).await;
        } else if outcome.counts_toward_circuit() {
            self.observe_failure(provider_id, provider_name, permit, outcome, message)
                .await;
        } else if permit == Permit::Probe {
            // Auth, quota and rate-limit failures prove nothing about
            // provider health, so just hand the probe slot back.
            self.release(provider_id, permit).await;
        }
    }

    async fn observe_success(&self, provider_id: i64, provider_name: &str, permit: Permit) {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut record, version) = self.load(provider_id).await;
            match record.state {
                CircuitState::Closed => {
                    if record.failures == 0 {
                        return;
                    }
                    record.failures = 0;
                    record.last_error = None;
                }
                CircuitState::HalfOpen if permit == Permit::Probe => {
                    record.probes_in_flight = record.probes_in_flight.saturating_sub(1);
                    record.probe_successes += 1;
                    if record.probe_successes >= self.cfg.half_open_probes {
                        record = CircuitRecord::closed(self.cfg.open_secs);
                        tracing::info!(provider = %provider_name, "circuit CLOSED: probes succeeded");
                    }
                }
                _ => return,
            }
            if self.save(provider_id, version, &record).await {
                return;
            }
        }
    }

    async fn observe_failure(
        &self,
        provider_id: i64,
        provider_name: &str,
        permit: Permit,
        outcome: Outcome,
        message: &str,
    ) {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut record, version) = self.load(provider_id).await;
            let now = now_ms();

            match record.state {
                CircuitState::Closed => {
                    let window_ms = (self.cfg.window_secs as i64) * 1000;
                    if now - record.window_started_ms > window_ms {
                        record.window_started_ms = now;
                        record.failures = 1;
                    } else {
                        record.failures += 1;
                    }
                    record.last_error =
                        Some(format!("{}: {}", outcome, truncate(message, 256)));

                    if record.failures >= self.cfg.failure_threshold {
                        record.state = CircuitState::Open;
                        record.open_secs = self.cfg.open_secs;
                        record.opened_until_ms = now + (record.open_secs as i64) * 1000;
                        tracing::warn!(
                            provider = %provider_name,
                            failures = record.failures,
                            open_secs = record.open_secs,
                            "circuit OPENED: {} failures within window",
                            record.failures,
                        );
                    }
                }
                CircuitState::HalfOpen if permit == Permit::Probe => {
                    record.state = CircuitState::Open;
                    record.open_secs = (record.open_secs * 2).min(self.cfg.open_secs_cap.max(1));
                    record.opened_until_ms = now + (record.open_secs as i64) * 1000;
                    record.probes_in_flight = 0;
                    record.probe_successes = 0;
                    record.last_error =
                        Some(format!("{}: {}", outcome, truncate(message, 256)));
                    tracing::warn!(
                        provider = %provider_name,
                        open_secs = record.open_secs,
                        "circuit REOPENED: probe failed"
                    );
                }
                _ => return,
            }
            if self.save(provider_id, version, &record).await {
                return;
            }
        }
    }

    /// Hand back an unused probe slot (e.g. no eligible key was found
    /// after the permit was granted).
    pub async fn release(&self, provider_id: i64, permit: Permit) {
        if permit != Permit::Probe {
            return;
        }
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut record, version) = self.load(provider_id).await;
            if record.state != CircuitState::HalfOpen || record.probes_in_flight == 0 {
                return;
            }
            record.probes_in_flight -= 1;
            if self.save(provider_id, version, &record).await {
                return;
            }
        }
    }

    /// Current record for health introspection.
    pub async fn snapshot(&self, provider_id: i64) -> CircuitRecord {
        self.load(provider_id).await.0
    }

    /// Admin force-reset to Closed.
    pub async fn reset(&self, provider_id: i64) {
        if let Err(e) = self
            .store
            .delete_record(&Self::record_key(provider_id))
            .await
        {
            tracing::warn!(provider_id, error = %e, "failed to reset circuit");
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
