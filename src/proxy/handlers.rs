//! HTTP request handlers.

use axum::extract::{Extension, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use super::dispatch::{attempts_json, DispatchOutput, DispatchRequest, RequestContext};
use super::middleware::RequestId;
use super::server::AppState;
use super::stream::{sse_response, StreamCallback};
use crate::error::Error;
use crate::proxy::types::{ChatCompletionRequest, CompletionRequest, EmbeddingsRequest};
use crate::storage::{spawn_audit_write, ClientKeyRecord, RequestAudit};

const CHAT_ENDPOINT: &str = "/v1/chat/completions";
const COMPLETIONS_ENDPOINT: &str = "/v1/completions";
const EMBEDDINGS_ENDPOINT: &str = "/v1/embeddings";

/// Everything the outcome writer needs once the response is decided.
struct RequestScope {
    state: AppState,
    endpoint: &'static str,
    request_id: String,
    principal_id: i64,
    alias: String,
    started: std::time::Instant,
}

impl RequestScope {
    fn new(
        state: AppState,
        endpoint: &'static str,
        request_id: RequestId,
        principal: &ClientKeyRecord,
        alias: String,
    ) -> Self {
        Self {
            state,
            endpoint,
            request_id: request_id.to_string(),
            principal_id: principal.id,
            alias,
            started: std::time::Instant::now(),
        }
    }

    fn observe(&self, status: u16) {
        self.state.metrics.observe_request(self.endpoint, status);
        self.state
            .metrics
            .observe_duration(self.endpoint, self.started.elapsed());
    }

    fn audit(
        &self,
        status: u16,
        streaming: bool,
        provider: Option<String>,
        key_id: Option<String>,
        usage: Option<(u32, u32)>,
        attempts: Option<String>,
    ) {
        if !self.state.config.logging.audit {
            return;
        }
        let Some(pool) = &self.state.db else { return };
        spawn_audit_write(
            pool,
            RequestAudit {
                request_id: self.request_id.clone(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                endpoint: self.endpoint.to_string(),
                client_key_id: Some(self.principal_id),
                alias: Some(self.alias.clone()),
                provider,
                key_id,
                status,
                streaming,
                input_tokens: usage.map(|(prompt, _)| prompt as i64),
                output_tokens: usage.map(|(_, completion)| completion as i64),
                latency_ms: self.started.elapsed().as_millis() as i64,
                attempts,
            },
        );
    }
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(principal): Extension<Arc<ClientKeyRecord>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let scope = RequestScope::new(
        state.clone(),
        CHAT_ENDPOINT,
        request_id,
        &principal,
        request.model.clone(),
    );
    let is_stream = request.stream.unwrap_or(false);

    tracing::info!(
        model = %request.model,
        stream = is_stream,
        client = %principal.name,
        "Received chat completion request"
    );

    let mut ctx = RequestContext::new(
        scope.request_id.clone(),
        request.model.clone(),
        state.config.dispatch.request_timeout(),
    );
    let result = state
        .dispatcher
        .execute(&mut ctx, &DispatchRequest::Chat(request))
        .await;

    match result {
        Ok(success) => match success.output {
            DispatchOutput::Unary(value) => {
                scope.observe(200);
                scope.audit(
                    200,
                    false,
                    Some(success.provider),
                    Some(success.key.key_id.clone()),
                    success.usage,
                    Some(attempts_json(&ctx.attempts)),
                );
                Json(value).into_response()
            }
            DispatchOutput::Stream(stream) => {
                // Duration observed at first byte; stream length is the
                // client's business.
                scope.observe(200);
                let callback = stream_completion_callback(
                    scope,
                    success.provider,
                    success.key,
                    attempts_json(&ctx.attempts),
                );
                sse_response(stream, callback)
            }
        },
        Err(error) => error_response(scope, error, is_stream, &ctx),
    }
}

/// Build the relay callback that settles accounting when a stream ends.
fn stream_completion_callback(
    scope: RequestScope,
    provider: String,
    key: Arc<crate::storage::ApiKeyRecord>,
    attempts: String,
) -> StreamCallback {
    Box::new(move |stats| {
        let usage = stats.usage;
        scope.audit(
            200,
            true,
            Some(provider),
            Some(key.key_id.clone()),
            usage,
            Some(attempts),
        );
        if let Some((prompt, completion)) = usage {
            let dispatcher = scope.state.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .charge_usage(&key, (prompt + completion) as i64)
                    .await;
            });
        }
    })
}

fn error_response(
    scope: RequestScope,
    error: Error,
    streaming: bool,
    ctx: &RequestContext,
) -> Response {
    let status = error.status().as_u16();
    tracing::warn!(
        alias = %ctx.alias,
        status,
        attempts = ctx.attempts.len(),
        error = %error,
        "request failed"
    );
    scope.observe(status);
    scope.audit(
        status,
        streaming,
        None,
        None,
        None,
        Some(attempts_json(&ctx.attempts)),
    );
    error.into_response()
}

/// Handle POST /v1/completions (legacy).
pub async fn completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(principal): Extension<Arc<ClientKeyRecord>>,
    Json(request): Json<CompletionRequest>,
) -> Response {
    let scope = RequestScope::new(
        state.clone(),
        COMPLETIONS_ENDPOINT,
        request_id,
        &principal,
        request.model.clone(),
    );

    if request.stream.unwrap_or(false) {
        let error = Error::Unsupported("streaming");
        let status = error.status().as_u16();
        scope.observe(status);
        return error.into_response();
    }

    let mut ctx = RequestContext::new(
        scope.request_id.clone(),
        request.model.clone(),
        state.config.dispatch.request_timeout(),
    );
    let result = state
        .dispatcher
        .execute(&mut ctx, &DispatchRequest::Completion(request))
        .await;

    match result {
        Ok(success) => {
            let DispatchOutput::Unary(value) = success.output else {
                return Error::Internal("unexpected stream output".into()).into_response();
            };
            scope.observe(200);
            scope.audit(
                200,
                false,
                Some(success.provider),
                Some(success.key.key_id.clone()),
                success.usage,
                Some(attempts_json(&ctx.attempts)),
            );
            Json(value).into_response()
        }
        Err(error) => error_response(scope, error, false, &ctx),
    }
}

/// Handle POST /v1/embeddings
pub async fn embeddings(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Extension(principal): Extension<Arc<ClientKeyRecord>>,
    Json(request): Json<EmbeddingsRequest>,
) -> Response {
    let scope = RequestScope::new(
        state.clone(),
        EMBEDDINGS_ENDPOINT,
        request_id,
        &principal,
        request.model.clone(),
    );

    let mut ctx = RequestContext::new(
        scope.request_id.clone(),
        request.model.clone(),
        state.config.dispatch.request_timeout(),
    );
    let result = state
        .dispatcher
        .execute(&mut ctx, &DispatchRequest::Embeddings(request))
        .await;

    match result {
        Ok(success) => {
            let DispatchOutput::Unary(value) = success.output else {
                return Error::Internal("unexpected stream output".into()).into_response();
            };
            scope.observe(200);
            scope.audit(
                200,
                false,
                Some(success.provider),
                Some(success.key.key_id.clone()),
                success.usage,
                Some(attempts_json(&ctx.attempts)),
            );
            Json(value).into_response()
        }
        Err(error) => error_response(scope, error, false, &ctx),
    }
}

/// Handle GET /v1/models - list configured aliases.
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let aliases = state.dispatcher.aliases().await;
    let created = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let models: Vec<serde_json::Value> = aliases
        .into_iter()
        .map(|alias| {
            serde_json::json!({
                "id": alias,
                "object": "model",
                "created": created,
                "owned_by": "switchyard",
            })
        })
        .collect();

    Json(serde_json::json!({
        "object": "list",
        "data": models
    }))
}

/// Handle GET /health - per-provider circuit state.
///
/// `ok` when every circuit is closed, `degraded` when some are open or
/// half-open, `unhealthy` (HTTP 503) when every provider is open.
pub async fn health(State(state): State<AppState>) -> Response {
    use crate::proxy::circuit_breaker::CircuitState;

    let snapshot = state.catalog.snapshot().await;
    let mut providers = serde_json::Map::new();
    let mut open = 0usize;
    let mut total = 0usize;
    let mut degraded = false;

    for provider in snapshot.providers() {
        total += 1;
        let record = state.breaker.snapshot(provider.id).await;
        match record.state {
            CircuitState::Open => {
                open += 1;
                degraded = true;
            }
            CircuitState::HalfOpen => degraded = true,
            CircuitState::Closed => {}
        }
        providers.insert(
            provider.name.clone(),
            serde_json::json!({
                "state": record.state.as_str(),
                "failure_count": record.failures,
            }),
        );
    }

    let (status, overall) = if total > 0 && open == total {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if degraded {
        (axum::http::StatusCode::OK, "degraded")
    } else {
        (axum::http::StatusCode::OK, "ok")
    };

    (
        status,
        Json(serde_json::json!({
            "status": overall,
            "service": "switchyard",
            "providers": providers,
        })),
    )
        .into_response()
}

/// Handle GET /metrics - Prometheus text exposition.
pub async fn metrics_export(State(state): State<AppState>) -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
