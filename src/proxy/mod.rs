//! HTTP proxy module.
//!
//! The OpenAI-compatible surface plus the core request machinery: the rate
//! gate, the circuit breaker, the dispatch engine, the SSE relay and the
//! metrics sink.

pub mod circuit_breaker;
pub mod dispatch;
mod handlers;
pub mod metrics;
pub mod middleware;
pub mod rate_limit;
mod server;
pub mod stream;
pub mod types;

pub use circuit_breaker::{CircuitBreaker, CircuitRecord, CircuitState, Permit};
pub use dispatch::{
    attempts_json, DispatchOutput, DispatchRequest, DispatchSuccess, Dispatcher, RequestContext,
};
pub use metrics::Metrics;
pub use middleware::{hash_client_key, RequestId};
pub use rate_limit::RateLimiter;
pub use server::{build_state, create_router, run_server, AppState};
pub use types::{ChatCompletionRequest, CompletionRequest, EmbeddingsRequest, Message};
