//! SSE relay for streaming chat responses.
//!
//! Forwards upstream chunks to the client in order, observing usage and
//! finish_reason on the way through. A mid-stream upstream failure becomes
//! a final error event on the client stream; the engine never swaps
//! upstreams once the first chunk has been forwarded. The `[DONE]`
//! sentinel is emitted only for streams that completed cleanly.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use serde_json::Value;
use std::convert::Infallible;

use crate::providers::ChunkStream;
use crate::proxy::types::extract_usage;

/// What the relay learned from watching the stream to its end.
#[derive(Debug, Clone)]
pub struct StreamStats {
    /// (prompt_tokens, completion_tokens) from the final usage chunk.
    pub usage: Option<(u32, u32)>,
    pub finish_reason: Option<String>,
    /// Whether the stream completed cleanly (vs. a mid-stream failure).
    pub completed: bool,
}

/// Invoked exactly once when the client stream ends, cleanly or not.
pub type StreamCallback = Box<dyn FnOnce(StreamStats) + Send + 'static>;

enum Phase {
    Running,
    SendDone,
    Finished,
}

struct RelayState {
    inner: ChunkStream,
    phase: Phase,
    usage: Option<(u32, u32)>,
    finish_reason: Option<String>,
    on_complete: Option<StreamCallback>,
}

impl RelayState {
    fn finish(&mut self, completed: bool) {
        if let Some(callback) = self.on_complete.take() {
            callback(StreamStats {
                usage: self.usage,
                finish_reason: self.finish_reason.clone(),
                completed,
            });
        }
    }
}

/// Build the `text/event-stream` response relaying `stream` to the client.
pub fn sse_response(stream: ChunkStream, on_complete: StreamCallback) -> Response {
    let state = RelayState {
        inner: stream,
        phase: Phase::Running,
        usage: None,
        finish_reason: None,
        on_complete: Some(on_complete),
    };

    let events = futures::stream::unfold(state, |mut state| async move {
        match state.phase {
            Phase::Running => match state.inner.next().await {
                Some(Ok(chunk)) => {
                    observe_chunk(&chunk, &mut state.usage, &mut state.finish_reason);
                    Some((format!("data: {}\n\n", chunk), state))
                }
                Some(Err(error)) => {
                    tracing::warn!(error = %error, "upstream stream failed mid-response");
                    state.phase = Phase::Finished;
                    state.finish(false);
                    let event = serde_json::json!({
                        "error": {
                            "message": error.message,
                            "type": "upstream_error",
                        }
                    });
                    Some((format!("data: {}\n\n", event), state))
                }
                None => {
                    state.phase = Phase::SendDone;
                    Some((String::new(), state))
                }
            },
            Phase::SendDone => {
                state.phase = Phase::Finished;
                state.finish(true);
                Some(("data: [DONE]\n\n".to_string(), state))
            }
            Phase::Finished => None,
        }
    })
    .filter(|event| futures::future::ready(!event.is_empty()))
    .map(Ok::<String, Infallible>);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(events))
        .expect("static response parts")
}

fn observe_chunk(
    chunk: &Value,
    usage: &mut Option<(u32, u32)>,
    finish_reason: &mut Option<String>,
) {
    if let Some(parsed) = extract_usage(chunk) {
        *usage = Some(parsed);
    }
    if let Some(reason) = chunk
        .pointer("/choices/0/finish_reason")
        .and_then(|r| r.as_str())
    {
        *finish_reason = Some(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::UpstreamError;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn chunk(content: &str) -> Value {
        json!({
            "id": "c-1",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}],
        })
    }

    fn final_chunk() -> Value {
        json!({
            "id": "c-1",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 6, "completion_tokens": 2, "total_tokens": 8},
        })
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .expect("read body");
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn capture() -> (StreamCallback, Arc<Mutex<Option<StreamStats>>>) {
        let slot: Arc<Mutex<Option<StreamStats>>> = Arc::new(Mutex::new(None));
        let inner = slot.clone();
        (
            Box::new(move |stats| {
                *inner.lock().unwrap() = Some(stats);
            }),
            slot,
        )
    }

    #[tokio::test]
    async fn clean_stream_ends_with_done() {
        let stream: ChunkStream = Box::pin(futures::stream::iter(vec![
            Ok(chunk("Hel")),
            Ok(chunk("lo")),
            Ok(final_chunk()),
        ]));
        let (callback, stats) = capture();

        let response = sse_response(stream, callback);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        let text = body_text(response).await;

        assert!(text.contains("\"content\":\"Hel\""));
        assert!(text.contains("\"content\":\"lo\""));
        assert!(text.ends_with("data: [DONE]\n\n"));

        let stats = stats.lock().unwrap().clone().unwrap();
        assert!(stats.completed);
        assert_eq!(stats.usage, Some((6, 2)));
        assert_eq!(stats.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_error_event_not_done() {
        let stream: ChunkStream = Box::pin(futures::stream::iter(vec![
            Ok(chunk("partial")),
            Err(UpstreamError::network("connection reset")),
        ]));
        let (callback, stats) = capture();

        let text = body_text(sse_response(stream, callback)).await;

        assert!(text.contains("\"content\":\"partial\""));
        assert!(text.contains("\"type\":\"upstream_error\""));
        assert!(!text.contains("[DONE]"));

        let stats = stats.lock().unwrap().clone().unwrap();
        assert!(!stats.completed);
        assert!(stats.usage.is_none());
    }

    #[tokio::test]
    async fn chunks_preserve_upstream_order() {
        let stream: ChunkStream = Box::pin(futures::stream::iter(
            (0..10).map(|i| Ok(chunk(&format!("w{}", i)))).collect::<Vec<_>>(),
        ));
        let (callback, _stats) = capture();
        let text = body_text(sse_response(stream, callback)).await;

        let mut last_index = None;
        for i in 0..10 {
            let position = text.find(&format!("w{}", i)).unwrap();
            if let Some(prev) = last_index {
                assert!(position > prev);
            }
            last_index = Some(position);
        }
    }

    #[tokio::test]
    async fn empty_stream_still_emits_done() {
        let stream: ChunkStream = Box::pin(futures::stream::iter(Vec::<_>::new()));
        let (callback, stats) = capture();
        let text = body_text(sse_response(stream, callback)).await;

        assert_eq!(text, "data: [DONE]\n\n");
        assert!(stats.lock().unwrap().clone().unwrap().completed);
    }
}
