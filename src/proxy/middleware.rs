//! Request middleware: correlation IDs, client authentication, rate gate.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use super::server::AppState;
use crate::error::Error;
use crate::storage::ClientKeyRecord;

/// Response header carrying the correlation ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation ID attached to every request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// SHA-256 hex digest of a client bearer token, as stored in the catalog.
pub fn hash_client_key(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Attach a fresh request ID and echo it on the response.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(id);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token)
}

/// Authenticate the client against the hashed key catalog.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()) else {
        state.metrics.observe_request(request.uri().path(), 401);
        return Error::InvalidAuth.into_response();
    };

    let snapshot = state.catalog.snapshot().await;
    let Some(principal) = snapshot.client_key_by_hash(&hash_client_key(token)) else {
        tracing::debug!("rejected request with unknown client key");
        state.metrics.observe_request(request.uri().path(), 401);
        return Error::InvalidAuth.into_response();
    };

    request.extensions_mut().insert(principal);
    next.run(request).await
}

/// Best-effort client IP: proxy header first, then the socket address.
fn client_ip(request: &Request) -> Option<String> {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}

/// Deny over-limit requests before any routing work happens.
pub async fn rate_limit_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(principal) = request.extensions().get::<Arc<ClientKeyRecord>>().cloned() else {
        // Auth runs first; a missing principal means a wiring bug.
        return Error::Internal("principal missing after authentication".into()).into_response();
    };

    let ip = client_ip(&request);
    match state.limiter.admit(&principal, ip.as_deref()).await {
        Ok(()) => next.run(request).await,
        Err(denied) => {
            tracing::warn!(
                client = %principal.name,
                scope = denied.scope,
                retry_after = denied.retry_after.as_secs(),
                "rate limit exceeded"
            );
            state
                .metrics
                .observe_request(request.uri().path(), 429);
            Error::RateLimited {
                scope: denied.scope,
                retry_after_secs: denied.retry_after.as_secs().max(1),
            }
            .into_response()
        }
    }
}
