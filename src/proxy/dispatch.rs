//! Dispatch engine: walk the candidate list until success or exhaustion.
//!
//! For each candidate the engine gates on the circuit breaker, picks a key,
//! unseals it, calls the adapter with the clamped per-attempt deadline and
//! feeds the outcome back into the breaker, the key health map and the
//! metrics sink. Failures that condemn the key (auth, quota) exclude it
//! and rotate to the provider's next key; a candidate whose keys are all
//! rejected for auth terminates the request. Server errors may be
//! transient, so they retry the same provider up to the attempt cap.
//! Timeouts, network errors and rate limiting advance to the next
//! candidate. Attempts against the same provider back off exponentially
//! with full jitter; cross-provider advances do not.
//!
//! Streaming: fallback is only possible before the first byte reaches the
//! client, so only errors from *opening* the stream are retried here. Once
//! a stream is returned, mid-stream failures terminate the response.

use rand::Rng;
use secrecy::ExposeSecret;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::providers::{
    AdapterFactory, CallContext, ChunkStream, Operation, Outcome, UpstreamError,
};
use crate::proxy::circuit_breaker::CircuitBreaker;
use crate::proxy::metrics::Metrics;
use crate::proxy::rate_limit::RateLimiter;
use crate::proxy::types::{
    ensure_stream_options, extract_usage, ChatCompletionRequest, CompletionRequest,
    EmbeddingsRequest,
};
use crate::router::{Candidate, KeySelector, KeyVerdict, ModelRouter};
use crate::storage::{audit, ApiKeyRecord, Catalog};
use crate::vault::{sanitize, KeyVault};

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Per-call transient state: identity, deadline and the accumulated
/// attempt trail for audit.
pub struct RequestContext {
    pub request_id: String,
    pub alias: String,
    pub deadline: Instant,
    pub attempts: Vec<AttemptRecord>,
}

impl RequestContext {
    pub fn new(request_id: String, alias: String, timeout: Duration) -> Self {
        Self {
            request_id,
            alias,
            deadline: Instant::now() + timeout,
            attempts: Vec::new(),
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Record of one attempt (or one skipped candidate).
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub provider: String,
    pub key_id: Option<String>,
    pub outcome: Outcome,
    pub message: String,
    pub latency_ms: i64,
}

/// Serialize the attempt trail for the audit row.
pub fn attempts_json(attempts: &[AttemptRecord]) -> String {
    let items: Vec<Value> = attempts
        .iter()
        .map(|a| {
            serde_json::json!({
                "provider": a.provider,
                "key_id": a.key_id,
                "outcome": a.outcome.as_str(),
                "message": a.message,
                "latency_ms": a.latency_ms,
            })
        })
        .collect();
    Value::Array(items).to_string()
}

/// The operation being dispatched, carrying its normalized body.
pub enum DispatchRequest {
    Chat(ChatCompletionRequest),
    Completion(CompletionRequest),
    Embeddings(EmbeddingsRequest),
}

impl DispatchRequest {
    fn operation(&self) -> Operation {
        match self {
            DispatchRequest::Chat(_) => Operation::Chat,
            DispatchRequest::Completion(_) => Operation::Completion,
            DispatchRequest::Embeddings(_) => Operation::Embeddings,
        }
    }

    fn is_stream(&self) -> bool {
        matches!(self, DispatchRequest::Chat(r) if r.stream.unwrap_or(false))
    }
}

/// Successful dispatch: the normalized output plus attribution.
pub enum DispatchOutput {
    Unary(Value),
    Stream(ChunkStream),
}

impl std::fmt::Debug for DispatchOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchOutput::Unary(v) => f.debug_tuple("Unary").field(v).finish(),
            DispatchOutput::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

pub struct DispatchSuccess {
    pub output: DispatchOutput,
    pub provider: String,
    pub key: Arc<ApiKeyRecord>,
    /// (prompt_tokens, completion_tokens) when the response reported usage.
    pub usage: Option<(u32, u32)>,
}

impl std::fmt::Debug for DispatchSuccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchSuccess")
            .field("output", &self.output)
            .field("provider", &self.provider)
            .field("usage", &self.usage)
            .finish()
    }
}

pub struct Dispatcher {
    router: ModelRouter,
    catalog: Arc<Catalog>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    selector: Arc<KeySelector>,
    vault: Arc<KeyVault>,
    factory: Arc<dyn AdapterFactory>,
    metrics: Arc<Metrics>,
    pool: Option<SqlitePool>,
    max_key_attempts: u32,
}

#[allow(clippy::too_many_arguments)]
impl Dispatcher {
    pub fn new(
        catalog: Arc<Catalog>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        selector: Arc<KeySelector>,
        vault: Arc<KeyVault>,
        factory: Arc<dyn AdapterFactory>,
        metrics: Arc<Metrics>,
        pool: Option<SqlitePool>,
        max_key_attempts: u32,
    ) -> Self {
        Self {
            router: ModelRouter::new(catalog.clone()),
            catalog,
            breaker,
            limiter,
            selector,
            vault,
            factory,
            metrics,
            pool,
            max_key_attempts: max_key_attempts.max(1),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn selector(&self) -> &Arc<KeySelector> {
        &self.selector
    }

    pub async fn aliases(&self) -> Vec<String> {
        self.router.aliases().await
    }

    /// Execute one request across the candidate list.
    pub async fn execute(
        &self,
        ctx: &mut RequestContext,
        request: &DispatchRequest,
    ) -> Result<DispatchSuccess> {
        let candidates = self.router.candidates(&ctx.alias).await?;
        let snapshot = self.catalog.snapshot().await;
        let operation = request.operation();

        let mut last_message: Option<String> = None;
        let mut last_provider: Option<i64> = None;
        let mut provider_streak: u32 = 0;

        'candidates: for candidate in &candidates {
            let provider = &candidate.provider;
            let adapter = self.factory.adapter(provider);

            if !adapter.supports(operation) {
                let message = format!(
                    "provider '{}' does not support this operation",
                    provider.name
                );
                self.skip(ctx, candidate, Outcome::BadRequest, message.clone());
                last_message = Some(message);
                continue;
            }

            let keys = snapshot.keys_for(provider.id);
            let mut tried: HashSet<i64> = HashSet::new();
            let mut key_attempts = 0u32;
            let mut last_failure: Option<Outcome> = None;

            loop {
                if ctx.remaining().is_zero() {
                    // Deadline exhausted: no upstream call is made.
                    ctx.attempts.push(AttemptRecord {
                        provider: provider.name.clone(),
                        key_id: None,
                        outcome: Outcome::Timeout,
                        message: "request deadline exhausted".to_string(),
                        latency_ms: 0,
                    });
                    last_message = Some("request deadline exhausted".to_string());
                    break 'candidates;
                }

                if last_provider == Some(provider.id) {
                    provider_streak += 1;
                    let delay = backoff_delay(provider_streak - 1).min(ctx.remaining());
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                } else {
                    last_provider = Some(provider.id);
                    provider_streak = 0;
                }

                let permit = match self.breaker.acquire(provider.id, &provider.name).await {
                    Ok(permit) => permit,
                    Err(open) => {
                        let message = open.to_string();
                        self.skip(ctx, candidate, Outcome::CircuitOpen, message.clone());
                        last_message = Some(message);
                        continue 'candidates;
                    }
                };

                let Some(key) = self.selector.select(provider.id, keys, &tried).await else {
                    self.breaker.release(provider.id, permit).await;
                    if last_failure == Some(Outcome::AuthFailed) {
                        // Every key for this provider was tried and
                        // rejected: terminal for the request.
                        return Err(Error::UpstreamUnavailable {
                            message: last_message.unwrap_or_else(|| {
                                format!("provider '{}' rejected every key", provider.name)
                            }),
                        });
                    }
                    let message = format!("no eligible key for provider '{}'", provider.name);
                    self.skip(ctx, candidate, Outcome::NoKey, message.clone());
                    last_message = Some(message);
                    continue 'candidates;
                };
                key_attempts += 1;

                let secret = match self.vault.unseal(&key.ciphertext) {
                    Ok(secret) => secret,
                    Err(e) => {
                        self.breaker.release(provider.id, permit).await;
                        tracing::error!(
                            key_id = %key.key_id,
                            provider = %provider.name,
                            error = %e,
                            "failed to unseal credential"
                        );
                        let message = format!("credential for key '{}' is unusable", key.key_id);
                        self.skip(ctx, candidate, Outcome::NoKey, message.clone());
                        last_message = Some(message);
                        continue 'candidates;
                    }
                };

                let call_ctx = CallContext {
                    base_url: provider.base_url.clone(),
                    model: candidate.provider_model.clone(),
                    secret,
                    timeout: provider.timeout.min(ctx.remaining()),
                };

                let started = Instant::now();
                let result = self.attempt(&*adapter, &call_ctx, request, candidate).await;
                let latency_ms = started.elapsed().as_millis() as i64;

                match result {
                    Ok(output) => {
                        self.observe(provider.id, &provider.name, permit, &key, Outcome::Ok, None, "")
                            .await;
                        self.metrics.observe_provider(
                            &provider.name,
                            &candidate.provider_model,
                            Outcome::Ok,
                        );
                        ctx.attempts.push(AttemptRecord {
                            provider: provider.name.clone(),
                            key_id: Some(key.key_id.clone()),
                            outcome: Outcome::Ok,
                            message: String::new(),
                            latency_ms,
                        });

                        let usage = match &output {
                            DispatchOutput::Unary(value) => extract_usage(value),
                            DispatchOutput::Stream(_) => None,
                        };
                        if let Some((prompt, completion)) = usage {
                            self.charge_usage(&key, (prompt + completion) as i64).await;
                        }

                        return Ok(DispatchSuccess {
                            output,
                            provider: provider.name.clone(),
                            key,
                            usage,
                        });
                    }
                    Err(upstream) => {
                        let outcome = upstream.outcome;
                        let message = sanitize(
                            &upstream.message,
                            &[call_ctx.secret.expose_secret(), &key.ciphertext],
                            &key.masked,
                        );

                        self.observe(
                            provider.id,
                            &provider.name,
                            permit,
                            &key,
                            outcome,
                            upstream.retry_after,
                            &message,
                        )
                        .await;
                        self.metrics.observe_provider(
                            &provider.name,
                            &candidate.provider_model,
                            outcome,
                        );
                        ctx.attempts.push(AttemptRecord {
                            provider: provider.name.clone(),
                            key_id: Some(key.key_id.clone()),
                            outcome,
                            message: message.clone(),
                            latency_ms,
                        });
                        last_message = Some(message.clone());
                        last_failure = Some(outcome);

                        if outcome == Outcome::BadRequest {
                            // Terminal: the request itself is at fault.
                            return Err(Error::UpstreamBadRequest(message));
                        }

                        // Auth and quota failures take that key out of the
                        // running for this request.
                        if outcome.key_level() {
                            tried.insert(key.id);
                        }

                        // Key faults rotate to the provider's next key;
                        // server errors retry the provider in place.
                        let retry_here = outcome.key_level() || outcome == Outcome::ServerError;
                        if retry_here && key_attempts < self.max_key_attempts {
                            continue;
                        }

                        if outcome == Outcome::AuthFailed {
                            // Attempt cap reached on auth failures:
                            // terminal, same as running out of keys.
                            return Err(Error::UpstreamUnavailable { message });
                        }

                        self.metrics.observe_fallback(&ctx.alias, outcome);
                        continue 'candidates;
                    }
                }
            }
        }

        Err(Error::UpstreamUnavailable {
            message: last_message.unwrap_or_else(|| "no providers available".to_string()),
        })
    }

    /// Record a skipped candidate (no upstream call was made).
    fn skip(&self, ctx: &mut RequestContext, candidate: &Candidate, outcome: Outcome, message: String) {
        self.metrics.observe_provider(
            &candidate.provider.name,
            &candidate.provider_model,
            outcome,
        );
        self.metrics.observe_fallback(&ctx.alias, outcome);
        ctx.attempts.push(AttemptRecord {
            provider: candidate.provider.name.clone(),
            key_id: None,
            outcome,
            message,
            latency_ms: 0,
        });
    }

    /// Feed an outcome into breaker, key health and persistence.
    #[allow(clippy::too_many_arguments)]
    async fn observe(
        &self,
        provider_id: i64,
        provider_name: &str,
        permit: crate::proxy::circuit_breaker::Permit,
        key: &Arc<ApiKeyRecord>,
        outcome: Outcome,
        retry_after: Option<Duration>,
        message: &str,
    ) {
        self.breaker
            .observe(provider_id, provider_name, permit, outcome, message)
            .await;
        let verdict = self.selector.after_call(key, outcome, retry_after);
        self.limiter.charge_request(key).await;

        if let Some(pool) = &self.pool {
            if verdict == KeyVerdict::Demoted {
                audit::spawn_key_demotion(pool, key.id);
            } else {
                audit::spawn_key_usage(pool, key.id, outcome == Outcome::Ok);
            }
        }
    }

    /// Charge reported token usage; over-budget keys go on cooldown for the
    /// window remainder while the in-flight response completes.
    pub async fn charge_usage(&self, key: &Arc<ApiKeyRecord>, tokens: i64) {
        if let Some(cooldown) = self.limiter.charge_tokens(key, tokens).await {
            self.selector.apply_cooldown(key, cooldown);
        }
    }

    async fn attempt(
        &self,
        adapter: &dyn crate::providers::ProviderAdapter,
        call_ctx: &CallContext,
        request: &DispatchRequest,
        candidate: &Candidate,
    ) -> std::result::Result<DispatchOutput, UpstreamError> {
        match request {
            DispatchRequest::Chat(chat) => {
                let mut chat = chat.clone();
                chat.apply_overrides(&candidate.overrides);
                if request.is_stream() {
                    ensure_stream_options(&mut chat);
                    let stream = with_timeout(
                        call_ctx.timeout,
                        adapter.chat_stream(call_ctx, &chat),
                    )
                    .await?;
                    Ok(DispatchOutput::Stream(stream))
                } else {
                    let value =
                        with_timeout(call_ctx.timeout, adapter.chat(call_ctx, &chat)).await?;
                    Ok(DispatchOutput::Unary(value))
                }
            }
            DispatchRequest::Completion(completion) => {
                let mut completion = completion.clone();
                completion.apply_overrides(&candidate.overrides);
                let value =
                    with_timeout(call_ctx.timeout, adapter.completion(call_ctx, &completion))
                        .await?;
                Ok(DispatchOutput::Unary(value))
            }
            DispatchRequest::Embeddings(embeddings) => {
                let value =
                    with_timeout(call_ctx.timeout, adapter.embeddings(call_ctx, embeddings))
                        .await?;
                Ok(DispatchOutput::Unary(value))
            }
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = std::result::Result<T, UpstreamError>>,
) -> std::result::Result<T, UpstreamError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::timeout()),
    }
}

/// Full-jitter exponential backoff: uniform in [0, min(cap, base * 2^n)].
fn backoff_delay(attempt: u32) -> Duration {
    let ceiling = BACKOFF_CAP.min(BACKOFF_BASE * 2u32.saturating_pow(attempt.min(8)));
    let micros = rand::thread_rng().gen_range(0..=ceiling.as_micros() as u64);
    Duration::from_micros(micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_to_cap() {
        for attempt in 0..10 {
            let ceiling = BACKOFF_CAP.min(BACKOFF_BASE * 2u32.saturating_pow(attempt.min(8)));
            for _ in 0..20 {
                assert!(backoff_delay(attempt) <= ceiling);
            }
        }
        // Ceiling saturates at the cap.
        assert_eq!(
            BACKOFF_CAP.min(BACKOFF_BASE * 2u32.saturating_pow(8)),
            BACKOFF_CAP
        );
    }

    #[test]
    fn attempts_serialize_for_audit() {
        let attempts = vec![
            AttemptRecord {
                provider: "alpha".to_string(),
                key_id: Some("key-1".to_string()),
                outcome: Outcome::ServerError,
                message: "boom".to_string(),
                latency_ms: 12,
            },
            AttemptRecord {
                provider: "beta".to_string(),
                key_id: None,
                outcome: Outcome::CircuitOpen,
                message: String::new(),
                latency_ms: 0,
            },
        ];

        let json: Value = serde_json::from_str(&attempts_json(&attempts)).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(json[0]["outcome"], "server_error");
        assert_eq!(json[0]["key_id"], "key-1");
        assert_eq!(json[1]["outcome"], "circuit_open");
        assert_eq!(json[1]["key_id"], Value::Null);
    }

    #[tokio::test]
    async fn request_context_deadline() {
        let ctx = RequestContext::new("r-1".into(), "gpt-4".into(), Duration::ZERO);
        assert!(ctx.remaining().is_zero());

        let ctx = RequestContext::new("r-2".into(), "gpt-4".into(), Duration::from_secs(30));
        assert!(ctx.remaining() > Duration::from_secs(29));
    }
}
