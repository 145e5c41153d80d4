//! Upstream provider adapters.
//!
//! Each adapter translates OpenAI-shaped requests to one upstream dialect
//! and normalizes responses (and streamed chunks) back to the OpenAI wire
//! shape. Adapters are stateless beyond the shared HTTP connection pool;
//! transport and HTTP outcomes are mapped to the normalized [`Outcome`]
//! categories the dispatch engine routes on.

mod anthropic;
mod framing;
mod mock;
mod ollama;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use framing::{ndjson_stream, sse_json_stream, SseFrames};
pub use mock::{MockAdapter, MockResponse};
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

use async_trait::async_trait;
use futures::Stream;
use secrecy::SecretString;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::proxy::types::{ChatCompletionRequest, CompletionRequest, EmbeddingsRequest};
use crate::storage::ProviderRecord;

/// The closed set of supported upstream dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
    Mock,
    /// Any OpenAI-compatible endpoint at a custom base URL.
    CustomHttp,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            "ollama" => Some(ProviderKind::Ollama),
            "mock" => Some(ProviderKind::Mock),
            "custom_http" | "custom-http" => Some(ProviderKind::CustomHttp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Mock => "mock",
            ProviderKind::CustomHttp => "custom_http",
        }
    }
}

/// Operations an adapter may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Chat,
    Completion,
    Embeddings,
    ListModels,
}

/// Normalized classification of one upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    AuthFailed,
    RateLimited,
    BadRequest,
    ServerError,
    Timeout,
    NetworkError,
    QuotaExhausted,
    /// Engine-level: the provider's circuit was open, no call was made.
    CircuitOpen,
    /// Engine-level: no eligible key for the provider, no call was made.
    NoKey,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::AuthFailed => "auth_failed",
            Outcome::RateLimited => "rate_limited",
            Outcome::BadRequest => "bad_request",
            Outcome::ServerError => "server_error",
            Outcome::Timeout => "timeout",
            Outcome::NetworkError => "network_error",
            Outcome::QuotaExhausted => "quota_exhausted",
            Outcome::CircuitOpen => "circuit_open",
            Outcome::NoKey => "no_key",
        }
    }

    /// Whether the dispatch engine may advance to another candidate after
    /// this outcome.
    pub fn retryable(&self) -> bool {
        !matches!(self, Outcome::Ok | Outcome::BadRequest)
    }

    /// Whether this outcome condemns the chosen key: the engine excludes
    /// it and tries the provider's next key. Rate limiting is a provider
    /// condition, not a key fault; it advances to the next candidate.
    pub fn key_level(&self) -> bool {
        matches!(self, Outcome::AuthFailed | Outcome::QuotaExhausted)
    }

    /// Whether the circuit breaker counts this outcome as a provider failure.
    pub fn counts_toward_circuit(&self) -> bool {
        matches!(
            self,
            Outcome::ServerError | Outcome::Timeout | Outcome::NetworkError
        )
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure from one adapter call.
#[derive(Debug)]
pub struct UpstreamError {
    pub outcome: Outcome,
    pub status: Option<u16>,
    pub message: String,
    /// Parsed Retry-After hint on rate-limited responses.
    pub retry_after: Option<Duration>,
}

impl UpstreamError {
    pub fn timeout() -> Self {
        Self {
            outcome: Outcome::Timeout,
            status: None,
            message: "upstream call timed out".to_string(),
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::NetworkError,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::ServerError,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classify a non-2xx upstream HTTP status.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        let outcome = match status {
            401 | 403 => Outcome::AuthFailed,
            402 => Outcome::QuotaExhausted,
            429 => Outcome::RateLimited,
            400..=499 => Outcome::BadRequest,
            _ => Outcome::ServerError,
        };
        Self {
            outcome,
            status: Some(status),
            message,
            retry_after,
        }
    }

    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout()
        } else {
            Self::network(e.to_string())
        }
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({}): {}", self.outcome, status, self.message),
            None => write!(f, "{}: {}", self.outcome, self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Everything an adapter needs for one upstream call.
///
/// The secret is the unsealed credential; it lives for exactly this call.
pub struct CallContext {
    pub base_url: String,
    pub model: String,
    pub secret: SecretString,
    pub timeout: Duration,
}

/// Lazy, finite sequence of OpenAI-shaped streamed chunks.
///
/// The sequence preserves upstream ordering. Dropping it releases the
/// underlying connection, which is how client disconnects propagate to the
/// upstream.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value, UpstreamError>> + Send>>;

/// Common capability interface the dispatch engine sees.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn supports(&self, op: Operation) -> bool;

    async fn chat(
        &self,
        ctx: &CallContext,
        request: &ChatCompletionRequest,
    ) -> Result<Value, UpstreamError>;

    /// Open a streaming chat call. Errors returned here happened before any
    /// byte reached the client, so the engine may still fall back; errors
    /// yielded inside the stream terminate the client response.
    async fn chat_stream(
        &self,
        ctx: &CallContext,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, UpstreamError>;

    async fn completion(
        &self,
        ctx: &CallContext,
        request: &CompletionRequest,
    ) -> Result<Value, UpstreamError>;

    async fn embeddings(
        &self,
        ctx: &CallContext,
        request: &EmbeddingsRequest,
    ) -> Result<Value, UpstreamError>;

    async fn list_models(&self, ctx: &CallContext) -> Result<Vec<Value>, UpstreamError>;
}

/// Resolves a provider record to the adapter that speaks its dialect.
pub trait AdapterFactory: Send + Sync {
    fn adapter(&self, provider: &ProviderRecord) -> Arc<dyn ProviderAdapter>;
}

/// Production factory: one adapter per dialect over a shared connection pool.
pub struct HttpAdapterFactory {
    openai: Arc<OpenAiAdapter>,
    anthropic: Arc<AnthropicAdapter>,
    ollama: Arc<OllamaAdapter>,
    mock: Arc<MockAdapter>,
}

impl HttpAdapterFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            openai: Arc::new(OpenAiAdapter::new(client.clone(), ProviderKind::OpenAi)),
            anthropic: Arc::new(AnthropicAdapter::new(client.clone())),
            ollama: Arc::new(OllamaAdapter::new(client)),
            mock: Arc::new(MockAdapter::new()),
        }
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn adapter(&self, provider: &ProviderRecord) -> Arc<dyn ProviderAdapter> {
        match provider.kind {
            ProviderKind::OpenAi | ProviderKind::CustomHttp => self.openai.clone(),
            ProviderKind::Anthropic => self.anthropic.clone(),
            ProviderKind::Ollama => self.ollama.clone(),
            ProviderKind::Mock => self.mock.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parse_roundtrip() {
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::Anthropic,
            ProviderKind::Ollama,
            ProviderKind::Mock,
            ProviderKind::CustomHttp,
        ] {
            assert_eq!(ProviderKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ProviderKind::parse("custom-http"), Some(ProviderKind::CustomHttp));
        assert_eq!(ProviderKind::parse("azure"), None);
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            UpstreamError::from_status(401, String::new(), None).outcome,
            Outcome::AuthFailed
        );
        assert_eq!(
            UpstreamError::from_status(403, String::new(), None).outcome,
            Outcome::AuthFailed
        );
        assert_eq!(
            UpstreamError::from_status(402, String::new(), None).outcome,
            Outcome::QuotaExhausted
        );
        assert_eq!(
            UpstreamError::from_status(429, String::new(), None).outcome,
            Outcome::RateLimited
        );
        assert_eq!(
            UpstreamError::from_status(400, String::new(), None).outcome,
            Outcome::BadRequest
        );
        assert_eq!(
            UpstreamError::from_status(404, String::new(), None).outcome,
            Outcome::BadRequest
        );
        assert_eq!(
            UpstreamError::from_status(500, String::new(), None).outcome,
            Outcome::ServerError
        );
        assert_eq!(
            UpstreamError::from_status(503, String::new(), None).outcome,
            Outcome::ServerError
        );
    }

    #[test]
    fn outcome_routing_flags() {
        assert!(!Outcome::BadRequest.retryable());
        assert!(!Outcome::Ok.retryable());
        assert!(Outcome::ServerError.retryable());
        assert!(Outcome::CircuitOpen.retryable());
        assert!(Outcome::NoKey.retryable());

        assert!(Outcome::AuthFailed.key_level());
        assert!(Outcome::QuotaExhausted.key_level());
        assert!(!Outcome::RateLimited.key_level());
        assert!(!Outcome::ServerError.key_level());
        assert!(!Outcome::Timeout.key_level());

        assert!(Outcome::ServerError.counts_toward_circuit());
        assert!(Outcome::Timeout.counts_toward_circuit());
        assert!(Outcome::NetworkError.counts_toward_circuit());
        assert!(!Outcome::AuthFailed.counts_toward_circuit());
        assert!(!Outcome::RateLimited.counts_toward_circuit());
        assert!(!Outcome::BadRequest.counts_toward_circuit());
    }
}
