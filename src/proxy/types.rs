//! OpenAI-compatible request and response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::OverrideConfig;

/// Chat completion request (OpenAI-compatible).
///
/// Unrecognized fields are collected into `extra` and forwarded to the
/// upstream untouched, so pass-through providers see the client's body
/// unchanged.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A chat message. Content may be a plain string or a structured part list.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    /// Flatten content to text where possible (string content or text parts).
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
            other => other.to_string(),
        }
    }
}

/// Stop sequence can be a string or array of strings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StopSequence {
    Single(String),
    Multiple(Vec<String>),
}

impl StopSequence {
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            StopSequence::Single(s) => vec![s.clone()],
            StopSequence::Multiple(v) => v.clone(),
        }
    }
}

/// Options controlling streaming response behavior (OpenAI-compatible).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamOptions {
    /// When true, the final streaming chunk includes a usage object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_usage: Option<bool>,
}

/// Legacy completion request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Embedding request. `input` is a string or an array of strings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Extract token usage from a provider response or streamed chunk.
///
/// Returns (prompt_tokens, completion_tokens) if the usage object is present
/// and contains both fields. Returns None if usage is missing or incomplete.
pub fn extract_usage(response: &Value) -> Option<(u32, u32)> {
    let usage = response.get("usage")?;
    let input = usage.get("prompt_tokens")?.as_u64()? as u32;
    let output = usage.get("completion_tokens")?.as_u64()? as u32;
    Some((input, output))
}

fn merge_field<T: Copy>(slot: &mut Option<T>, value: Option<T>, forced: bool) {
    if let Some(v) = value {
        if forced || slot.is_none() {
            *slot = Some(v);
        }
    }
}

impl ChatCompletionRequest {
    /// Merge a mapping's override config into the request.
    ///
    /// Client-supplied values win unless the override is marked forced.
    pub fn apply_overrides(&mut self, overrides: &OverrideConfig) {
        merge_field(&mut self.temperature, overrides.temperature, overrides.forced);
        merge_field(&mut self.max_tokens, overrides.max_tokens, overrides.forced);
        merge_field(&mut self.top_p, overrides.top_p, overrides.forced);
        merge_field(
            &mut self.frequency_penalty,
            overrides.frequency_penalty,
            overrides.forced,
        );
        merge_field(
            &mut self.presence_penalty,
            overrides.presence_penalty,
            overrides.forced,
        );
        if let Some(stop) = &overrides.stop {
            if overrides.forced || self.stop.is_none() {
                self.stop = Some(StopSequence::Multiple(stop.clone()));
            }
        }
    }
}

impl CompletionRequest {
    /// Merge a mapping's override config into the request (see chat variant).
    pub fn apply_overrides(&mut self, overrides: &OverrideConfig) {
        merge_field(&mut self.temperature, overrides.temperature, overrides.forced);
        merge_field(&mut self.max_tokens, overrides.max_tokens, overrides.forced);
        merge_field(&mut self.top_p, overrides.top_p, overrides.forced);
        merge_field(
            &mut self.frequency_penalty,
            overrides.frequency_penalty,
            overrides.forced,
        );
        merge_field(
            &mut self.presence_penalty,
            overrides.presence_penalty,
            overrides.forced,
        );
        if let Some(stop) = &overrides.stop {
            if overrides.forced || self.stop.is_none() {
                self.stop = Some(StopSequence::Multiple(stop.clone()));
            }
        }
    }
}

/// Ensure stream_options includes `include_usage: true` for streaming requests.
///
/// Merges with any existing client-provided stream_options rather than
/// overwriting. Only adds `include_usage: true` if the field is not already
/// set. The final usage chunk is what the token accountant charges from.
pub fn ensure_stream_options(request: &mut ChatCompletionRequest) {
    match &mut request.stream_options {
        Some(opts) => {
            if opts.include_usage.is_none() {
                opts.include_usage = Some(true);
            }
        }
        None => {
            request.stream_options = Some(StreamOptions {
                include_usage: Some(true),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to build a minimal ChatCompletionRequest for testing.
    fn minimal_request() -> ChatCompletionRequest {
        serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hello"}],
            "stream": true
        }))
        .unwrap()
    }

    #[test]
    fn ensure_stream_options_sets_when_none() {
        let mut req = minimal_request();
        assert!(req.stream_options.is_none());

        ensure_stream_options(&mut req);

        let opts = req.stream_options.as_ref().unwrap();
        assert_eq!(opts.include_usage, Some(true));
    }

    #[test]
    fn ensure_stream_options_preserves_existing_false() {
        let mut req = minimal_request();
        req.stream_options = Some(StreamOptions {
            include_usage: Some(false),
        });

        ensure_stream_options(&mut req);

        // Should NOT override -- merge strategy only sets when is_none
        let opts = req.stream_options.as_ref().unwrap();
        assert_eq!(opts.include_usage, Some(false));
    }

    #[test]
    fn unknown_fields_round_trip() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "logit_bias": {"50256": -100},
            "seed": 42
        });

        let req: ChatCompletionRequest = serde_json::from_value(body.clone()).unwrap();
        assert_eq!(req.extra.get("seed"), Some(&serde_json::json!(42)));

        let round_tripped = serde_json::to_value(&req).unwrap();
        assert_eq!(round_tripped, body);
    }

    #[test]
    fn overrides_respect_client_values() {
        let mut req = minimal_request();
        req.temperature = Some(0.9);

        let overrides = OverrideConfig {
            temperature: Some(0.1),
            max_tokens: Some(256),
            ..Default::default()
        };
        req.apply_overrides(&overrides);

        // Client value wins, missing field is filled in.
        assert_eq!(req.temperature, Some(0.9));
        assert_eq!(req.max_tokens, Some(256));
    }

    #[test]
    fn forced_overrides_replace_client_values() {
        let mut req = minimal_request();
        req.temperature = Some(0.9);

        let overrides = OverrideConfig {
            temperature: Some(0.1),
            forced: true,
            ..Default::default()
        };
        req.apply_overrides(&overrides);

        assert_eq!(req.temperature, Some(0.1));
    }

    #[test]
    fn override_stop_becomes_sequence() {
        let mut req = minimal_request();
        let overrides = OverrideConfig {
            stop: Some(vec!["\n\n".to_string()]),
            ..Default::default()
        };
        req.apply_overrides(&overrides);
        assert_eq!(req.stop.unwrap().as_vec(), vec!["\n\n".to_string()]);
    }

    #[test]
    fn extract_usage_present() {
        let response = serde_json::json!({
            "id": "chatcmpl-123",
            "choices": [],
            "usage": {
                "prompt_tokens": 100,
                "completion_tokens": 200,
                "total_tokens": 300
            }
        });
        assert_eq!(extract_usage(&response), Some((100, 200)));
    }

    #[test]
    fn extract_usage_missing_or_partial() {
        assert_eq!(extract_usage(&serde_json::json!({"choices": []})), None);
        assert_eq!(
            extract_usage(&serde_json::json!({"usage": {"prompt_tokens": 5}})),
            None
        );
        assert_eq!(extract_usage(&serde_json::json!({"usage": null})), None);
    }

    #[test]
    fn message_content_text_handles_parts() {
        let msg: Message = serde_json::from_value(serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "part one "},
                {"type": "image_url", "image_url": {"url": "http://x"}},
                {"type": "text", "text": "part two"}
            ]
        }))
        .unwrap();
        assert_eq!(msg.content_text(), "part one part two");
    }
}
