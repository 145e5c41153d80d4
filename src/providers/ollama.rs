//! Ollama native dialect adapter.
//!
//! Talks to a local Ollama daemon: `/api/chat` (NDJSON streaming),
//! `/api/embed` and `/api/tags`. Ollama needs no credential; the unsealed
//! secret is ignored. Responses are normalized to the OpenAI shapes.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use super::framing::ndjson_stream;
use super::openai::read_error;
use super::{CallContext, ChunkStream, Operation, ProviderAdapter, ProviderKind, UpstreamError};
use crate::proxy::types::{ChatCompletionRequest, CompletionRequest, EmbeddingsRequest};

pub struct OllamaAdapter {
    client: reqwest::Client,
}

impl OllamaAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn url(ctx: &CallContext, path: &str) -> String {
        format!("{}/{}", ctx.base_url.trim_end_matches('/'), path)
    }

    fn translate_request(request: &ChatCompletionRequest, model: &str, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content_text()}))
            .collect();

        let mut options = serde_json::Map::new();
        if let Some(temperature) = request.temperature {
            options.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            options.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(max_tokens) = request.max_tokens {
            options.insert("num_predict".to_string(), json!(max_tokens));
        }
        if let Some(stop) = &request.stop {
            options.insert("stop".to_string(), json!(stop.as_vec()));
        }

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }

    fn finish_reason(upstream: &Value) -> Value {
        match upstream.get("done_reason").and_then(|r| r.as_str()) {
            Some("length") => json!("length"),
            _ => json!("stop"),
        }
    }

    fn usage_from(upstream: &Value) -> Value {
        let prompt = upstream
            .get("prompt_eval_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let completion = upstream
            .get("eval_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        json!({
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion,
        })
    }

    fn translate_response(upstream: Value, response_id: &str) -> Value {
        let content = upstream
            .pointer("/message/content")
            .and_then(|c| c.as_str())
            .unwrap_or_default();

        json!({
            "id": response_id,
            "object": "chat.completion",
            "created": unix_now(),
            "model": upstream.get("model").cloned().unwrap_or(Value::Null),
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": Self::finish_reason(&upstream),
            }],
            "usage": Self::usage_from(&upstream),
        })
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn response_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Translate the NDJSON line stream into OpenAI chunk deltas. The first
/// chunk carries the assistant role; the `done: true` line becomes the
/// finish chunk with usage attached.
fn translate_stream(inner: ChunkStream, model: String) -> ChunkStream {
    struct State {
        inner: ChunkStream,
        id: String,
        model: String,
        created: u64,
        first: bool,
        finished: bool,
    }

    let state = State {
        inner,
        id: response_id(),
        model,
        created: unix_now(),
        first: true,
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        loop {
            match st.inner.next().await {
                Some(Ok(line)) => {
                    let done = line.get("done").and_then(|d| d.as_bool()).unwrap_or(false);
                    if done {
                        st.finished = true;
                        let mut chunk = json!({
                            "id": st.id,
                            "object": "chat.completion.chunk",
                            "created": st.created,
                            "model": st.model,
                            "choices": [{
                                "index": 0,
                                "delta": {},
                                "finish_reason": OllamaAdapter::finish_reason(&line),
                            }],
                        });
                        chunk["usage"] = OllamaAdapter::usage_from(&line);
                        return Some((Ok(chunk), st));
                    }

                    let Some(text) = line.pointer("/message/content").and_then(|c| c.as_str())
                    else {
                        continue;
                    };
                    let mut delta = json!({"content": text});
                    if st.first {
                        st.first = false;
                        delta["role"] = json!("assistant");
                    }
                    let chunk = json!({
                        "id": st.id,
                        "object": "chat.completion.chunk",
                        "created": st.created,
                        "model": st.model,
                        "choices": [{"index": 0, "delta": delta, "finish_reason": null}],
                    });
                    return Some((Ok(chunk), st));
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.finished = true;
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
impl ProviderAdapter for OllamaAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn supports(&self, op: Operation) -> bool {
        matches!(
            op,
            Operation::Chat | Operation::Embeddings | Operation::ListModels
        )
    }

    async fn chat(
        &self,
        ctx: &CallContext,
        request: &ChatCompletionRequest,
    ) -> Result<Value, UpstreamError> {
        let body = Self::translate_request(request, &ctx.model, false);
        let response = self
            .client
            .post(Self::url(ctx, "api/chat"))
            .timeout(ctx.timeout)
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
        Ok(Self::translate_response(upstream, &response_id()))
    }

    async fn chat_stream(
        &self,
        ctx: &CallContext,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, UpstreamError> {
        let body = Self::translate_request(request, &ctx.model, true);
        let response = self
            .client
            .post(Self::url(ctx, "api/chat"))
            .timeout(ctx.timeout)
            .json(&body)
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        Ok(translate_stream(
            ndjson_stream(response.bytes_stream()),
            ctx.model.clone(),
        ))
    }

    async fn completion(
        &self,
        _ctx: &CallContext,
        _request: &CompletionRequest,
    ) -> Result<Value, UpstreamError> {
        Err(UpstreamError {
            outcome: super::Outcome::BadRequest,
            status: None,
            message: "ollama providers do not support legacy completions".to_string(),
            retry_after: None,
        })
    }

    async fn embeddings(
        &self,
        ctx: &CallContext,
        request: &EmbeddingsRequest,
    ) -> Result<Value, UpstreamError> {
        let body = json!({
            "model": ctx.model,
            "input": request.input,
        });
        let response = self
            .client
            .post(Self::url(ctx, "api/embed"))
            .timeout(ctx.timeout)
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

        let data: Vec<Value> = upstream
            .get("embeddings")
            .and_then(|e| e.as_array())
            .map(|rows| {
                rows.iter()
                    .enumerate()
                    .map(|(index, embedding)| {
                        json!({
                            "object": "embedding",
                            "index": index,
                            "embedding": embedding,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let prompt = upstream
            .get("prompt_eval_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        Ok(json!({
            "object": "list",
            "data": data,
            "model": upstream.get("model").cloned().unwrap_or(Value::Null),
            "usage": {"prompt_tokens": prompt, "total_tokens": prompt},
        }))
    }

    async fn list_models(&self, ctx: &CallContext) -> Result<Vec<Value>, UpstreamError> {
        let response = self
            .client
            .get(Self::url(ctx, "api/tags"))
            .timeout(ctx.timeout)
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
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(|name| json!({"id": name, "object": "model", "owned_by": "ollama"}))
                    .collect()
            })
            .unwrap_or_default())
    }
}
