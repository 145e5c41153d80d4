//! Anthropic Messages dialect adapter.
//!
//! Chat requests are translated to the Messages API (system prompt is a
//! top-level field, `max_tokens` is mandatory) and responses are normalized
//! back to the OpenAI chat shape, including event-stream translation of
//! `message_start` / `content_block_delta` / `message_delta` /
//! `message_stop` into OpenAI chunk deltas.

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use std::collections::VecDeque;

use super::framing::sse_json_stream;
use super::openai::read_error;
use super::{CallContext, ChunkStream, Operation, ProviderAdapter, ProviderKind, UpstreamError};
use crate::proxy::types::{ChatCompletionRequest, CompletionRequest, EmbeddingsRequest};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default generation budget when the client did not set max_tokens.
/// The Messages API rejects requests without one.
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicAdapter {
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn messages_url(ctx: &CallContext) -> String {
        format!("{}/messages", ctx.base_url.trim_end_matches('/'))
    }

    fn request(&self, ctx: &CallContext, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .timeout(ctx.timeout)
            .header("content-type", "application/json")
            .header("x-api-key", ctx.secret.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    fn translate_request(
        request: &ChatCompletionRequest,
        model: &str,
        stream: bool,
    ) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();

        for message in &request.messages {
            match message.role.as_str() {
                // The Messages API takes the system prompt out of band.
                "system" | "developer" => system_parts.push(message.content_text()),
                "assistant" => messages.push(json!({
                    "role": "assistant",
                    "content": message.content.clone(),
                })),
                _ => messages.push(json!({
                    "role": "user",
                    "content": message.content.clone(),
                })),
            }
        }

        let mut body = json!({
            "model": model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });
        let obj = body.as_object_mut().expect("object literal");

        if !system_parts.is_empty() {
            obj.insert("system".to_string(), json!(system_parts.join("\n")));
        }
        if let Some(temperature) = request.temperature {
            obj.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            obj.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(stop) = &request.stop {
            obj.insert("stop_sequences".to_string(), json!(stop.as_vec()));
        }
        if stream {
            obj.insert("stream".to_string(), json!(true));
        }
        body
    }

    fn map_stop_reason(reason: Option<&str>) -> Value {
        match reason {
            Some("end_turn") | Some("stop_sequence") => json!("stop"),
            Some("max_tokens") => json!("length"),
            Some("tool_use") => json!("tool_calls"),
            Some(other) => json!(other),
            None => Value::Null,
        }
    }

    fn translate_response(upstream: Value) -> Value {
        let content = upstream
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let input_tokens = upstream
            .pointer("/usage/input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let output_tokens = upstream
            .pointer("/usage/output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        json!({
            "id": upstream.get("id").cloned().unwrap_or(json!("msg")),
            "object": "chat.completion",
            "created": unix_now(),
            "model": upstream.get("model").cloned().unwrap_or(Value::Null),
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": Self::map_stop_reason(
                    upstream.get("stop_reason").and_then(|r| r.as_str())
                ),
            }],
            "usage": {
                "prompt_tokens": input_tokens,
                "completion_tokens": output_tokens,
                "total_tokens": input_tokens + output_tokens,
            }
        })
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct StreamTranslator {
    inner: ChunkStream,
    pending: VecDeque<Value>,
    id: Value,
    model: Value,
    created: u64,
    input_tokens: u64,
    output_tokens: u64,
    stopped: bool,
}

impl StreamTranslator {
    fn chunk(&self, choices: Value) -> Value {
        json!({
            "id": self.id.clone(),
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model.clone(),
            "choices": choices,
        })
    }

    /// Translate one upstream event into zero or more OpenAI chunks.
    fn handle_event(&mut self, event: Value) {
        match event.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                if let Some(message) = event.get("message") {
                    if let Some(id) = message.get("id") {
                        self.id = id.clone();
                    }
                    if let Some(model) = message.get("model") {
                        self.model = model.clone();
                    }
                    self.input_tokens = message
                        .pointer("/usage/input_tokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                }
                let chunk = self.chunk(json!([{
                    "index": 0,
                    "delta": {"role": "assistant", "content": ""},
                    "finish_reason": null,
                }]));
                self.pending.push_back(chunk);
            }
            Some("content_block_delta") => {
                if let Some(text) = event.pointer("/delta/text").and_then(|t| t.as_str()) {
                    let chunk = self.chunk(json!([{
                        "index": 0,
                        "delta": {"content": text},
                        "finish_reason": null,
                    }]));
                    self.pending.push_back(chunk);
                }
            }
            Some("message_delta") => {
                self.output_tokens = event
                    .pointer("/usage/output_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(self.output_tokens);
                let finish = AnthropicAdapter::map_stop_reason(
                    event.pointer("/delta/stop_reason").and_then(|r| r.as_str()),
                );
                let chunk = self.chunk(json!([{
                    "index": 0,
                    "delta": {},
                    "finish_reason": finish,
                }]));
                self.pending.push_back(chunk);
            }
            Some("message_stop") => {
                let mut usage_chunk = self.chunk(json!([]));
                usage_chunk["usage"] = json!({
                    "prompt_tokens": self.input_tokens,
                    "completion_tokens": self.output_tokens,
                    "total_tokens": self.input_tokens + self.output_tokens,
                });
                self.pending.push_back(usage_chunk);
                self.stopped = true;
            }
            // ping / content_block_start / content_block_stop carry nothing.
            _ => {}
        }
    }
}

fn translate_stream(inner: ChunkStream) -> ChunkStream {
    let translator = StreamTranslator {
        inner,
        pending: VecDeque::new(),
        id: json!("msg"),
        model: Value::Null,
        created: unix_now(),
        input_tokens: 0,
        output_tokens: 0,
        stopped: false,
    };

    Box::pin(futures::stream::unfold(translator, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                return Some((Ok(chunk), st));
            }
            if st.stopped {
                return None;
            }

            match st.inner.next().await {
                Some(Ok(event)) => {
                    if event.get("type").and_then(|t| t.as_str()) == Some("error") {
                        let message = event
                            .pointer("/error/message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("upstream stream error")
                            .to_string();
                        st.stopped = true;
                        return Some((Err(UpstreamError::protocol(message)), st));
                    }
                    st.handle_event(event);
                }
                Some(Err(e)) => {
                    st.stopped = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.stopped = true;
                    return Some((
                        Err(UpstreamError::network(
                            "upstream closed the stream before completion",
                        )),
                        st,
                    ));
                }
            }
        }
    }))
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn supports(&self, op: Operation) -> bool {
        matches!(op, Operation::Chat | Operation::ListModels)
    }

    async fn chat(
        &self,
        ctx: &CallContext,
        request: &ChatCompletionRequest,
    ) -> Result<Value, UpstreamError> {
        let body = Self::translate_request(request, &ctx.model, false);
        let response = self
            .request(ctx, &Self::messages_url(ctx))
            .json(&body)
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let upstream: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::protocol(format!("invalid upstream JSON: {}", e)))?;
        Ok(Self::translate_response(upstream))
    }

    async fn chat_stream(
        &self,
        ctx: &CallContext,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, UpstreamError> {
        let body = Self::translate_request(request, &ctx.model, true);
        let response = self
            .request(ctx, &Self::messages_url(ctx))
            .json(&body)
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        // Completion is signaled by message_stop, not a [DONE] sentinel.
        Ok(translate_stream(sse_json_stream(
            response.bytes_stream(),
            false,
        )))
    }

    async fn completion(
        &self,
        _ctx: &CallContext,
        _request: &CompletionRequest,
    ) -> Result<Value, UpstreamError> {
        Err(UpstreamError {
            outcome: super::Outcome::BadRequest,
            status: None,
            message: "anthropic providers do not support legacy completions".to_string(),
            retry_after: None,
        })
    }

    async fn embeddings(
        &self,
        _ctx: &CallContext,
        _request: &EmbeddingsRequest,
    ) -> Result<Value, UpstreamError> {
        Err(UpstreamError {
            outcome: super::Outcome::BadRequest,
            status: None,
            message: "anthropic providers do not support embeddings".to_string(),
            retry_after: None,
        })
    }

    async fn list_models(&self, ctx: &CallContext) -> Result<Vec<Value>, UpstreamError> {
        let url = format!("{}/models", ctx.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .timeout(ctx.timeout)
            .header("x-api-key", ctx.secret.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Outcome;
    use httpmock::{Method::POST, MockServer};
    use secrecy::SecretString;
    use std::time::Duration;

    fn ctx(base_url: String) -> CallContext {
        CallContext {
            base_url,
            model: "claude-3-5-sonnet".to_string(),
            secret: SecretString::from("sk-ant-test".to_string()),
            timeout: Duration::from_secs(5),
        }
    }

    fn chat_request(body: Value) -> ChatCompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn system_messages_are_hoisted() {
        let request = chat_request(json!({
            "model": "gpt-4",
            "max_tokens": 64,
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "user", "content": "Hi"},
                {"role": "assistant", "content": "Hello"},
                {"role": "user", "content": "Bye"}
            ]
        }));

        let body = AnthropicAdapter::translate_request(&request, "claude-3-5-sonnet", false);
        assert_eq!(body["system"], "Be terse.");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["model"], "claude-3-5-sonnet");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");
    }

    #[test]
    fn max_tokens_defaults_when_absent() {
        let request = chat_request(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        let body = AnthropicAdapter::translate_request(&request, "claude-3-5-sonnet", true);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn response_translation_builds_openai_shape() {
        let upstream = json!({
            "id": "msg_01",
            "model": "claude-3-5-sonnet",
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "text", "text": " there"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 4}
        });

        let translated = AnthropicAdapter::translate_response(upstream);
        assert_eq!(translated["object"], "chat.completion");
        assert_eq!(
            translated["choices"][0]["message"]["content"],
            "Hello there"
        );
        assert_eq!(translated["choices"][0]["finish_reason"], "stop");
        assert_eq!(translated["usage"]["prompt_tokens"], 12);
        assert_eq!(translated["usage"]["completion_tokens"], 4);
        assert_eq!(translated["usage"]["total_tokens"], 16);
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(
            AnthropicAdapter::map_stop_reason(Some("max_tokens")),
            json!("length")
        );
        assert_eq!(
            AnthropicAdapter::map_stop_reason(Some("end_turn")),
            json!("stop")
        );
        assert_eq!(AnthropicAdapter::map_stop_reason(None), Value::Null);
    }

    #[tokio::test]
    async fn chat_sends_anthropic_headers() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/messages")
                    .header("x-api-key", "sk-ant-test")
                    .header("anthropic-version", ANTHROPIC_VERSION);
                then.status(200).json_body(json!({
                    "id": "msg_02",
                    "model": "claude-3-5-sonnet",
                    "content": [{"type": "text", "text": "Hi!"}],
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 3, "output_tokens": 2}
                }));
            })
            .await;

        let adapter = AnthropicAdapter::new(reqwest::Client::new());
        let request = chat_request(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        let result = adapter
            .chat(&ctx(format!("{}/v1", server.base_url())), &request)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result["choices"][0]["message"]["content"], "Hi!");
    }

    #[tokio::test]
    async fn stream_translates_event_sequence() {
        let server = MockServer::start_async().await;
        let sse_body = concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_03\",\"model\":\"claude-3-5-sonnet\",\"usage\":{\"input_tokens\":9}}}\n\n",
            "data: {\"type\":\"content_block_start\",\"index\":0}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(sse_body);
            })
            .await;

        let adapter = AnthropicAdapter::new(reqwest::Client::new());
        let request = chat_request(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        let stream = adapter
            .chat_stream(&ctx(format!("{}/v1", server.base_url())), &request)
            .await
            .unwrap();

        let chunks: Vec<Value> = stream.map(|c| c.unwrap()).collect().await;
        // role, two content deltas, finish, usage
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "Hel");
        assert_eq!(chunks[2]["choices"][0]["delta"]["content"], "lo");
        assert_eq!(chunks[3]["choices"][0]["finish_reason"], "stop");
        assert_eq!(chunks[4]["usage"]["prompt_tokens"], 9);
        assert_eq!(chunks[4]["usage"]["completion_tokens"], 2);
        assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));
    }

    #[tokio::test]
    async fn truncated_stream_surfaces_error_item() {
        let server = MockServer::start_async().await;
        let sse_body = concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_04\",\"model\":\"claude-3-5-sonnet\",\"usage\":{\"input_tokens\":1}}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
        );
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(sse_body);
            })
            .await;

        let adapter = AnthropicAdapter::new(reqwest::Client::new());
        let request = chat_request(json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        let stream = adapter
            .chat_stream(&ctx(format!("{}/v1", server.base_url())), &request)
            .await
            .unwrap();

        let items: Vec<_> = stream.collect().await;
        assert!(items.len() >= 3);
        assert!(items.last().unwrap().is_err());
    }

    #[tokio::test]
    async fn unsupported_operations_refuse() {
        let adapter = AnthropicAdapter::new(reqwest::Client::new());
        assert!(!adapter.supports(Operation::Embeddings));
        assert!(!adapter.supports(Operation::Completion));

        let request: EmbeddingsRequest = serde_json::from_value(json!({
            "model": "m",
            "input": "x"
        }))
        .unwrap();
        let err = adapter
            .embeddings(&ctx("http://unused".to_string()), &request)
            .await
            .unwrap_err();
        assert_eq!(err.outcome, Outcome::BadRequest);
    }
}
