//! Wire framing for streamed upstream bodies.
//!
//! [`SseFrames`] reassembles complete SSE lines from TCP-chunked bytes;
//! chunk boundaries routinely split JSON payloads, so raw bytes are
//! buffered until a full line is available. [`sse_json_stream`] and
//! [`ndjson_stream`] lift a reqwest byte stream into a stream of parsed
//! JSON payloads.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;

use super::{ChunkStream, UpstreamError};

/// Upper bound on buffered bytes between newlines. A line that exceeds it
/// is dropped so a misbehaving upstream cannot grow the buffer unbounded.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Line-buffered extraction of `data:` payloads from an SSE byte stream.
pub struct SseFrames {
    buffer: Vec<u8>,
}

impl SseFrames {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a chunk of bytes; returns the data payloads of every line that
    /// completed. Non-`data:` fields (event:, id:, retry:) and comment
    /// lines are skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut payloads = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                if let Some(payload) = Self::parse_line(&self.buffer) {
                    payloads.push(payload);
                }
                self.buffer.clear();
            } else {
                self.buffer.push(byte);
                if self.buffer.len() > MAX_LINE_BYTES {
                    tracing::warn!("dropping oversized SSE line");
                    self.buffer.clear();
                }
            }
        }
        payloads
    }

    /// Flush a final unterminated line at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        let payload = Self::parse_line(&self.buffer);
        self.buffer.clear();
        payload
    }

    fn parse_line(raw: &[u8]) -> Option<String> {
        let mut line = raw;
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() || line[0] == b':' {
            return None;
        }
        let text = std::str::from_utf8(line).ok()?;
        let data = text.strip_prefix("data:")?;
        Some(data.strip_prefix(' ').unwrap_or(data).to_string())
    }
}

impl Default for SseFrames {
    fn default() -> Self {
        Self::new()
    }
}

struct FramedState<S> {
    body: Pin<Box<S>>,
    frames: SseFrames,
    pending: VecDeque<Value>,
    trailing_error: Option<UpstreamError>,
    finished: bool,
}

/// Lift an SSE byte stream into a stream of parsed JSON payloads.
///
/// A `data: [DONE]` sentinel terminates the sequence cleanly. When
/// `require_done` is set and the body ends without the sentinel, a final
/// network error item is yielded so the consumer can tell a truncated
/// stream from a complete one. Malformed JSON lines are skipped.
pub fn sse_json_stream<S>(body: S, require_done: bool) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = FramedState {
        body: Box::pin(body),
        frames: SseFrames::new(),
        pending: VecDeque::new(),
        trailing_error: None,
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(value) = state.pending.pop_front() {
                return Some((Ok(value), state));
            }
            if let Some(error) = state.trailing_error.take() {
                return Some((Err(error), state));
            }
            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    for payload in state.frames.push(&bytes) {
                        if state.finished {
                            break;
                        }
                        if payload.trim() == "[DONE]" {
                            state.finished = true;
                        } else if let Ok(value) = serde_json::from_str::<Value>(&payload) {
                            state.pending.push_back(value);
                        }
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(UpstreamError::from_reqwest(e)), state));
                }
                None => {
                    let mut done = false;
                    if let Some(payload) = state.frames.flush() {
                        if payload.trim() == "[DONE]" {
                            done = true;
                        } else if let Ok(value) = serde_json::from_str::<Value>(&payload) {
                            state.pending.push_back(value);
                        }
                    }
                    state.finished = true;
                    if !done && require_done {
                        // Buffered values drain first, then the truncation
                        // surfaces as the final item.
                        state.trailing_error = Some(UpstreamError::network(
                            "upstream closed the stream before completion",
                        ));
                    }
                }
            }
        }
    }))
}

/// Lift an NDJSON byte stream (one JSON object per line) into parsed values.
/// The sequence ends when the body ends; transport errors surface as items.
pub fn ndjson_stream<S>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    struct NdjsonState<S> {
        body: Pin<Box<S>>,
        buffer: Vec<u8>,
        pending: VecDeque<Value>,
        finished: bool,
    }

    let state = NdjsonState {
        body: Box::pin(body),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(value) = state.pending.pop_front() {
                return Some((Ok(value), state));
            }
            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    for &byte in bytes.iter() {
                        if byte == b'\n' {
                            if let Ok(value) = serde_json::from_slice::<Value>(&state.buffer) {
                                state.pending.push_back(value);
                            }
                            state.buffer.clear();
                        } else {
                            state.buffer.push(byte);
                            if state.buffer.len() > MAX_LINE_BYTES {
                                tracing::warn!("dropping oversized NDJSON line");
                                state.buffer.clear();
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(UpstreamError::from_reqwest(e)), state));
                }
                None => {
                    if !state.buffer.is_empty() {
                        if let Ok(value) = serde_json::from_slice::<Value>(&state.buffer) {
                            state.pending.push_back(value);
                        }
                        state.buffer.clear();
                    }
                    state.finished = true;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build SSE data from event lines, then split at the given byte positions.
    ///
    /// Each event string is appended with `\n\n` (SSE event delimiter). The
    /// resulting byte buffer is split at the specified positions to simulate
    /// TCP chunk boundaries.
    fn split_sse_at_positions(events: &[&str], split_positions: &[usize]) -> Vec<Vec<u8>> {
        let full: Vec<u8> = events
            .iter()
            .flat_map(|e| format!("{}\n\n", e).into_bytes())
            .collect();

        let mut chunks = Vec::new();
        let mut prev = 0;
        for &pos in split_positions {
            if pos > prev && pos < full.len() {
                chunks.push(full[prev..pos].to_vec());
                prev = pos;
            }
        }
        chunks.push(full[prev..].to_vec());
        chunks
    }

    fn collect_payloads(chunks: &[Vec<u8>]) -> (Vec<String>, Option<String>) {
        let mut frames = SseFrames::new();
        let mut payloads = Vec::new();
        for chunk in chunks {
            payloads.extend(frames.push(chunk));
        }
        (payloads, frames.flush())
    }

    #[test]
    fn single_chunk_full_stream() {
        let events = [
            r#"data: {"id":"abc","choices":[{"index":0,"delta":{"role":"assistant"}}]}"#,
            r#"data: {"id":"abc","choices":[{"index":0,"delta":{"content":"Hello"}}]}"#,
            "data: [DONE]",
        ];
        let chunks = split_sse_at_positions(&events, &[]);
        let (payloads, rest) = collect_payloads(&chunks);

        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[2], "[DONE]");
        assert!(rest.is_none());
    }

    #[test]
    fn payload_split_across_chunks() {
        let events = [
            r#"data: {"id":"abc","choices":[{"index":0,"delta":{"content":"Hi"}}]}"#,
            r#"data: {"id":"abc","usage":{"prompt_tokens":10,"completion_tokens":5}}"#,
            "data: [DONE]",
        ];
        let chunks = split_sse_at_positions(&events, &[17, 50, 99]);
        assert!(chunks.len() > 1, "should be split into multiple chunks");

        let (payloads, _) = collect_payloads(&chunks);
        assert_eq!(payloads.len(), 3);
        assert!(payloads[1].contains("prompt_tokens"));
    }

    #[test]
    fn non_data_fields_and_comments_skipped() {
        let raw = b"event: message\nid: 123\nretry: 5000\n: comment\ndata: {\"x\":1}\n\n";
        let mut frames = SseFrames::new();
        let payloads = frames.push(raw);
        assert_eq!(payloads, vec![r#"{"x":1}"#.to_string()]);
    }

    #[test]
    fn crlf_line_endings() {
        let raw = b"data: {\"x\":1}\r\n\r\ndata: [DONE]\r\n\r\n";
        let mut frames = SseFrames::new();
        let payloads = frames.push(raw);
        assert_eq!(payloads, vec![r#"{"x":1}"#.to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn data_without_space() {
        let raw = b"data:{\"x\":1}\n\ndata:[DONE]\n\n";
        let mut frames = SseFrames::new();
        let payloads = frames.push(raw);
        assert_eq!(payloads, vec![r#"{"x":1}"#.to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn final_line_without_newline_flushes() {
        let raw = b"data: {\"x\":1}\n\ndata: [DONE]";
        let mut frames = SseFrames::new();
        let payloads = frames.push(raw);
        assert_eq!(payloads.len(), 1);
        assert_eq!(frames.flush(), Some("[DONE]".to_string()));
    }

    #[test]
    fn oversized_line_dropped() {
        let huge = vec![b'x'; 65 * 1024];
        let mut frames = SseFrames::new();
        assert!(frames.push(&huge).is_empty());

        // Normal processing continues after the drop.
        let payloads = frames.push(b"\ndata: {\"ok\":true}\n");
        assert_eq!(payloads, vec![r#"{"ok":true}"#.to_string()]);
    }

    fn byte_stream(
        chunks: Vec<Vec<u8>>,
    ) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
    }

    #[tokio::test]
    async fn sse_stream_terminates_on_done() {
        let chunks = split_sse_at_positions(
            &[r#"data: {"n":1}"#, r#"data: {"n":2}"#, "data: [DONE]"],
            &[10],
        );
        let stream = sse_json_stream(byte_stream(chunks), true);
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap()["n"], 1);
        assert_eq!(items[1].as_ref().unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn sse_stream_without_done_yields_error() {
        let chunks = split_sse_at_positions(&[r#"data: {"n":1}"#], &[]);
        let stream = sse_json_stream(byte_stream(chunks), true);
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn sse_stream_without_done_clean_when_not_required() {
        let chunks = split_sse_at_positions(&[r#"data: {"n":1}"#], &[]);
        let stream = sse_json_stream(byte_stream(chunks), false);
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }

    #[tokio::test]
    async fn sse_stream_skips_malformed_json() {
        let chunks = split_sse_at_positions(
            &["data: {not json}", r#"data: {"n":1}"#, "data: [DONE]"],
            &[],
        );
        let stream = sse_json_stream(byte_stream(chunks), true);
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap()["n"], 1);
    }

    #[tokio::test]
    async fn ndjson_splits_lines() {
        let chunks = vec![
            b"{\"a\":1}\n{\"a\"".to_vec(),
            b":2}\n{\"a\":3}".to_vec(),
        ];
        let stream = ndjson_stream(byte_stream(chunks));
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 3);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.as_ref().unwrap()["a"], (i as i64) + 1);
        }
    }
}
