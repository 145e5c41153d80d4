//! Mock provider for testing and development.
//!
//! With an empty script it echoes the request deterministically: chat
//! returns a canned reply quoting the last user message, streaming splits
//! the reply into word chunks, embeddings are hash-derived vectors. Tests
//! push [`MockResponse`] entries to script failures and observe call
//! counts.

use async_trait::async_trait;
use futures::stream;
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{CallContext, ChunkStream, Operation, ProviderAdapter, ProviderKind, UpstreamError};
use crate::proxy::types::{ChatCompletionRequest, CompletionRequest, EmbeddingsRequest};

/// Scripted behavior for one call.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Echo success (same as an empty script).
    Success,
    /// Fail with the classification of the given HTTP status.
    Fail {
        status: u16,
        message: String,
        retry_after_secs: Option<u64>,
    },
    /// Transport-level failure before any response.
    Network,
    /// Attempt timed out.
    TimedOut,
    /// Streaming only: emit N content chunks, then cut the connection.
    StreamCut { chunks: usize },
}

impl MockResponse {
    fn into_error(self) -> Option<UpstreamError> {
        match self {
            MockResponse::Success | MockResponse::StreamCut { .. } => None,
            MockResponse::Fail {
                status,
                message,
                retry_after_secs,
            } => Some(UpstreamError::from_status(
                status,
                message,
                retry_after_secs.map(Duration::from_secs),
            )),
            MockResponse::Network => Some(UpstreamError::network("connection reset by peer")),
            MockResponse::TimedOut => Some(UpstreamError::timeout()),
        }
    }
}

#[derive(Default)]
pub struct MockAdapter {
    script: Mutex<VecDeque<MockResponse>>,
    calls: AtomicU32,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<MockResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of adapter calls made so far (any operation).
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_scripted(&self) -> MockResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MockResponse::Success)
    }

    fn reply_text(request: &ChatCompletionRequest) -> String {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content_text())
            .unwrap_or_else(|| "no message".to_string());
        format!("This is a mock response to: {}", last_user)
    }

    fn response_id() -> String {
        format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
    }

    fn created() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    fn supports(&self, _op: Operation) -> bool {
        true
    }

    async fn chat(
        &self,
        ctx: &CallContext,
        request: &ChatCompletionRequest,
    ) -> Result<Value, UpstreamError> {
        if let Some(error) = self.next_scripted().into_error() {
            return Err(error);
        }

        let content = Self::reply_text(request);
        let completion_tokens = content.split_whitespace().count() as u64;
        Ok(json!({
            "id": Self::response_id(),
            "object": "chat.completion",
            "created": Self::created(),
            "model": ctx.model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop",
            }],
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": completion_tokens,
                "total_tokens": 10 + completion_tokens,
            }
        }))
    }

    async fn chat_stream(
        &self,
        ctx: &CallContext,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, UpstreamError> {
        let scripted = self.next_scripted();
        let cut_after = match scripted {
            MockResponse::StreamCut { chunks } => Some(chunks),
            other => {
                if let Some(error) = other.into_error() {
                    return Err(error);
                }
                None
            }
        };

        let id = Self::response_id();
        let created = Self::created();
        let model = ctx.model.clone();
        let content = Self::reply_text(request);
        let words: Vec<String> = content.split_whitespace().map(|w| w.to_string()).collect();
        let word_count = words.len() as u64;

        let mut items: Vec<Result<Value, UpstreamError>> = Vec::new();
        for (index, word) in words.iter().enumerate() {
            if let Some(cut) = cut_after {
                if index >= cut {
                    items.push(Err(UpstreamError::network(
                        "upstream closed the stream before completion",
                    )));
                    return Ok(Box::pin(stream::iter(items)));
                }
            }
            let mut delta = json!({
                "content": if index + 1 < words.len() {
                    format!("{} ", word)
                } else {
                    word.clone()
                }
            });
            if index == 0 {
                delta["role"] = json!("assistant");
            }
            items.push(Ok(json!({
                "id": id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{"index": 0, "delta": delta, "finish_reason": null}],
            })));
        }

        items.push(Ok(json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": word_count,
                "total_tokens": 10 + word_count,
            }
        })));

        Ok(Box::pin(stream::iter(items)))
    }

    async fn completion(
        &self,
        ctx: &CallContext,
        request: &CompletionRequest,
    ) -> Result<Value, UpstreamError> {
        if let Some(error) = self.next_scripted().into_error() {
            return Err(error);
        }

        let prompt = match &request.prompt {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let content = format!("Mock completion for: {}", prompt);
        let completion_tokens = content.split_whitespace().count() as u64;
        Ok(json!({
            "id": Self::response_id(),
            "object": "text_completion",
            "created": Self::created(),
            "model": ctx.model,
            "choices": [{
                "index": 0,
                "text": content,
                "finish_reason": "stop",
            }],
            "usage": {
                "prompt_tokens": 5,
                "completion_tokens": completion_tokens,
                "total_tokens": 5 + completion_tokens,
            }
        }))
    }

    async fn embeddings(
        &self,
        ctx: &CallContext,
        request: &EmbeddingsRequest,
    ) -> Result<Value, UpstreamError> {
        if let Some(error) = self.next_scripted().into_error() {
            return Err(error);
        }

        let inputs: Vec<String> = match &request.input {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().map(|s| s.to_string()).unwrap_or_default())
                .collect(),
            other => vec![other.to_string()],
        };

        let data: Vec<Value> = inputs
            .iter()
            .enumerate()
            .map(|(index, text)| {
                let embedding: Vec<f64> = (0..16)
                    .map(|dim| {
                        let mut hasher = DefaultHasher::new();
                        (text, dim).hash(&mut hasher);
                        (hasher.finish() % 1000) as f64 / 1000.0
                    })
                    .collect();
                json!({"object": "embedding", "index": index, "embedding": embedding})
            })
            .collect();

        let prompt_tokens: u64 = inputs
            .iter()
            .map(|t| t.split_whitespace().count() as u64)
            .sum();
        Ok(json!({
            "object": "list",
            "data": data,
            "model": ctx.model,
            "usage": {"prompt_tokens": prompt_tokens, "total_tokens": prompt_tokens},
        }))
    }

    async fn list_models(&self, _ctx: &CallContext) -> Result<Vec<Value>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            json!({"id": "mock-gpt-3.5-turbo", "object": "model", "owned_by": "mock-provider"}),
            json!({"id": "mock-gpt-4", "object": "model", "owned_by": "mock-provider"}),
            json!({"id": "mock-text-embedding", "object": "model", "owned_by": "mock-provider"}),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Outcome;
    use futures::StreamExt;
    use secrecy::SecretString;

    fn ctx() -> CallContext {
        CallContext {
            base_url: "http://mock".to_string(),
            model: "mock-gpt-4".to_string(),
            secret: SecretString::from("mock-key".to_string()),
            timeout: Duration::from_secs(5),
        }
    }

    fn chat_request() -> ChatCompletionRequest {
        serde_json::from_value(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hi there"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn echo_chat_quotes_last_user_message() {
        let adapter = MockAdapter::new();
        let result = adapter.chat(&ctx(), &chat_request()).await.unwrap();
        assert_eq!(
            result["choices"][0]["message"]["content"],
            "This is a mock response to: Hi there"
        );
        assert_eq!(result["choices"][0]["message"]["role"], "assistant");
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_pop_in_order() {
        let adapter = MockAdapter::with_script(vec![
            MockResponse::Fail {
                status: 500,
                message: "boom".to_string(),
                retry_after_secs: None,
            },
            MockResponse::Success,
        ]);

        let err = adapter.chat(&ctx(), &chat_request()).await.unwrap_err();
        assert_eq!(err.outcome, Outcome::ServerError);

        assert!(adapter.chat(&ctx(), &chat_request()).await.is_ok());
        // Script exhausted -> echo success.
        assert!(adapter.chat(&ctx(), &chat_request()).await.is_ok());
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn echo_stream_ends_with_finish_and_usage() {
        let adapter = MockAdapter::new();
        let stream = adapter.chat_stream(&ctx(), &chat_request()).await.unwrap();
        let chunks: Vec<Value> = stream.map(|c| c.unwrap()).collect().await;

        assert!(chunks.len() > 2);
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        let last = chunks.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert!(last["usage"]["total_tokens"].as_u64().unwrap() > 10);
    }

    #[tokio::test]
    async fn stream_cut_yields_chunks_then_error() {
        let adapter = MockAdapter::with_script(vec![MockResponse::StreamCut { chunks: 2 }]);
        let stream = adapter.chat_stream(&ctx(), &chat_request()).await.unwrap();
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_ok());
        assert_eq!(items[2].as_ref().unwrap_err().outcome, Outcome::NetworkError);
    }

    #[tokio::test]
    async fn embeddings_are_deterministic() {
        let adapter = MockAdapter::new();
        let request: EmbeddingsRequest = serde_json::from_value(json!({
            "model": "embed",
            "input": ["alpha", "beta"]
        }))
        .unwrap();

        let first = adapter.embeddings(&ctx(), &request).await.unwrap();
        let second = adapter.embeddings(&ctx(), &request).await.unwrap();
        assert_eq!(first["data"], second["data"]);
        assert_eq!(first["data"].as_array().unwrap().len(), 2);
    }
}
