//! OpenAI dialect adapter.
//!
//! The client already speaks this wire format, so request bodies pass
//! through with only the model name swapped for the provider-native one.
//! The same adapter serves `custom_http` providers, which expose an
//! OpenAI-compatible surface at an arbitrary base URL.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::Value;
use std::time::Duration;

use super::framing::sse_json_stream;
use super::{CallContext, ChunkStream, Operation, ProviderAdapter, ProviderKind, UpstreamError};
use crate::proxy::types::{ChatCompletionRequest, CompletionRequest, EmbeddingsRequest};

pub struct OpenAiAdapter {
    client: reqwest::Client,
    kind: ProviderKind,
}

impl OpenAiAdapter {
    pub fn new(client: reqwest::Client, kind: ProviderKind) -> Self {
        Self { client, kind }
    }

    fn url(&self, ctx: &CallContext, path: &str) -> String {
        format!("{}/{}", ctx.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, ctx: &CallContext, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .timeout(ctx.timeout)
            .header("content-type", "application/json")
            .bearer_auth(ctx.secret.expose_secret())
    }

    /// Serialize the request with the provider-native model name swapped in.
    fn rewrite_model<T: serde::Serialize>(
        request: &T,
        model: &str,
    ) -> Result<Value, UpstreamError> {
        let mut body = serde_json::to_value(request)
            .map_err(|e| UpstreamError::protocol(format!("failed to encode request: {}", e)))?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), Value::String(model.to_string()));
        }
        Ok(body)
    }

    async fn send_json(
        &self,
        ctx: &CallContext,
        path: &str,
        body: &Value,
    ) -> Result<Value, UpstreamError> {
        let url = self.url(ctx, path);
        let response = self
            .request(ctx, &url)
            .json(body)
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(read_error(response).await);
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| UpstreamError::protocol(format!("invalid upstream JSON: {}", e)))
    }
}

/// Read a non-2xx response into a classified error, preserving the
/// upstream's error message where it has the OpenAI shape.
pub(super) async fn read_error(response: reqwest::Response) -> UpstreamError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                format!("upstream returned HTTP {}", status)
            } else {
                body.chars().take(512).collect()
            }
        });

    UpstreamError::from_status(status, message, retry_after)
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn supports(&self, _op: Operation) -> bool {
        true
    }

    async fn chat(
        &self,
        ctx: &CallContext,
        request: &ChatCompletionRequest,
    ) -> Result<Value, UpstreamError> {
        let body = Self::rewrite_model(request, &ctx.model)?;
        self.send_json(ctx, "chat/completions", &body).await
    }

    async fn chat_stream(
        &self,
        ctx: &CallContext,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, UpstreamError> {
        let mut body = Self::rewrite_model(request, &ctx.model)?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(true));
        }

        let url = self.url(ctx, "chat/completions");
        let response = self
            .request(ctx, &url)
            .json(&body)
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        Ok(sse_json_stream(response.bytes_stream(), true))
    }

    async fn completion(
        &self,
        ctx: &CallContext,
        request: &CompletionRequest,
    ) -> Result<Value, UpstreamError> {
        let body = Self::rewrite_model(request, &ctx.model)?;
        self.send_json(ctx, "completions", &body).await
    }

    async fn embeddings(
        &self,
        ctx: &CallContext,
        request: &EmbeddingsRequest,
    ) -> Result<Value, UpstreamError> {
        let body = Self::rewrite_model(request, &ctx.model)?;
        self.send_json(ctx, "embeddings", &body).await
    }

    async fn list_models(&self, ctx: &CallContext) -> Result<Vec<Value>, UpstreamError> {
        let url = self.url(ctx, "models");
        let response = self
            .client
            .get(&url)
            .timeout(ctx.timeout)
            .bearer_auth(ctx.secret.expose_secret())
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::protocol(format!("invalid upstream JSON: {}", e)))?;
        Ok(body
            .get("data")
            .and_then(|d| d.as_array())
            .cloned()
            .unwrap_or_default())
    }
}
