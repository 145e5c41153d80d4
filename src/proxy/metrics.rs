//! In-process metrics registry with Prometheus text exposition.
//!
//! Increments are fire-and-forget atomics; nothing on the request path
//! blocks on or fails because of metrics. Label series are capped so a
//! hostile client cannot grow the registry unbounded; drops are themselves
//! counted.

use dashmap::DashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::providers::Outcome;

/// Histogram bucket upper bounds in seconds.
const DURATION_BUCKETS: [f64; 12] = [
    0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Maximum distinct label combinations kept per metric.
const MAX_SERIES: usize = 1024;

struct DurationSeries {
    bucket_counts: [AtomicU64; DURATION_BUCKETS.len()],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl DurationSeries {
    fn new() -> Self {
        Self {
            bucket_counts: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        for (index, bound) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.bucket_counts[index].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Request-path metrics registry.
#[derive(Default)]
pub struct Metrics {
    requests: DashMap<(String, u16), AtomicU64>,
    provider_requests: DashMap<(String, String, &'static str), AtomicU64>,
    fallbacks: DashMap<(String, &'static str), AtomicU64>,
    durations: DashMap<String, DurationSeries>,
    dropped_series: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump<K: std::hash::Hash + Eq>(map: &DashMap<K, AtomicU64>, key: K, dropped: &AtomicU64) {
        if let Some(counter) = map.get(&key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if map.len() >= MAX_SERIES {
            dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// `requests_total{endpoint,status}`
    pub fn observe_request(&self, endpoint: &str, status: u16) {
        Self::bump(
            &self.requests,
            (endpoint.to_string(), status),
            &self.dropped_series,
        );
    }

    /// `provider_requests_total{provider,model,outcome}`
    pub fn observe_provider(&self, provider: &str, model: &str, outcome: Outcome) {
        Self::bump(
            &self.provider_requests,
            (provider.to_string(), model.to_string(), outcome.as_str()),
            &self.dropped_series,
        );
    }

    /// `fallbacks_total{alias,reason}` - one advance past a candidate.
    pub fn observe_fallback(&self, alias: &str, reason: Outcome) {
        Self::bump(
            &self.fallbacks,
            (alias.to_string(), reason.as_str()),
            &self.dropped_series,
        );
    }

    /// `request_duration_seconds{endpoint}`
    pub fn observe_duration(&self, endpoint: &str, duration: Duration) {
        if let Some(series) = self.durations.get(endpoint) {
            series.observe(duration);
            return;
        }
        if self.durations.len() >= MAX_SERIES {
            self.dropped_series.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.durations
            .entry(endpoint.to_string())
            .or_insert_with(DurationSeries::new)
            .observe(duration);
    }

    /// Current value of one requests_total series (used by tests).
    pub fn requests_total(&self, endpoint: &str, status: u16) -> u64 {
        self.requests
            .get(&(endpoint.to_string(), status))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Current value of one fallbacks_total series (used by tests).
    pub fn fallbacks_total(&self, alias: &str, reason: Outcome) -> u64 {
        self.fallbacks
            .get(&(alias.to_string(), reason.as_str()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Current value of one provider_requests_total series (used by tests).
    pub fn provider_requests_total(&self, provider: &str, model: &str, outcome: Outcome) -> u64 {
        self.provider_requests
            .get(&(provider.to_string(), model.to_string(), outcome.as_str()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(4096);

        out.push_str("# TYPE requests_total counter\n");
        for entry in self.requests.iter() {
            let (endpoint, status) = entry.key();
            let _ = writeln!(
                out,
                "requests_total{{endpoint=\"{}\",status=\"{}\"}} {}",
                escape(endpoint),
                status,
                entry.value().load(Ordering::Relaxed)
            );
        }

        out.push_str("# TYPE provider_requests_total counter\n");
        for entry in self.provider_requests.iter() {
            let (provider, model, outcome) = entry.key();
            let _ = writeln!(
                out,
                "provider_requests_total{{provider=\"{}\",model=\"{}\",outcome=\"{}\"}} {}",
                escape(provider),
                escape(model),
                outcome,
                entry.value().load(Ordering::Relaxed)
            );
        }

        out.push_str("# TYPE fallbacks_total counter\n");
        for entry in self.fallbacks.iter() {
            let (alias, reason) = entry.key();
            let _ = writeln!(
                out,
                "fallbacks_total{{alias=\"{}\",reason=\"{}\"}} {}",
                escape(alias),
                reason,
                entry.value().load(Ordering::Relaxed)
            );
        }

        out.push_str("# TYPE request_duration_seconds histogram\n");
        for entry in self.durations.iter() {
            let endpoint = escape(entry.key());
            let series = entry.value();
            for (index, bound) in DURATION_BUCKETS.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "request_duration_seconds_bucket{{endpoint=\"{}\",le=\"{}\"}} {}",
                    endpoint,
                    bound,
                    series.bucket_counts[index].load(Ordering::Relaxed)
                );
            }
            let count = series.count.load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "request_duration_seconds_bucket{{endpoint=\"{}\",le=\"+Inf\"}} {}",
                endpoint, count
            );
            let _ = writeln!(
                out,
                "request_duration_seconds_sum{{endpoint=\"{}\"}} {}",
                endpoint,
                series.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
            );
            let _ = writeln!(
                out,
                "request_duration_seconds_count{{endpoint=\"{}\"}} {}",
                endpoint, count
            );
        }

        let dropped = self.dropped_series.load(Ordering::Relaxed);
        if dropped > 0 {
            out.push_str("# TYPE metrics_dropped_series_total counter\n");
            let _ = writeln!(out, "metrics_dropped_series_total {}", dropped);
        }

        out
    }
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}
