//! HTTP server setup and wiring.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use reqwest::Client;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use super::circuit_breaker::CircuitBreaker;
use super::dispatch::Dispatcher;
use super::handlers;
use super::metrics::Metrics;
use super::middleware::{authenticate, rate_limit_gate, request_id};
use super::rate_limit::RateLimiter;
use crate::config::Config;
use crate::providers::HttpAdapterFactory;
use crate::router::{KeySelector, SelectionStrategy};
use crate::storage::{self, Catalog};
use crate::store::{MemoryStore, RedisStore, SharedStore};
use crate::vault::KeyVault;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub dispatcher: Arc<Dispatcher>,
    pub limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<Metrics>,
    pub db: Option<SqlitePool>,
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    // Client-facing endpoints sit behind auth and the rate gate.
    let protected = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/models", get(handlers::list_models))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_gate))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .merge(protected)
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_export))
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the full application state from configuration.
pub async fn build_state(config: Config) -> anyhow::Result<AppState> {
    let pool = storage::init_pool(&config.database.url).await?;
    let catalog = Arc::new(
        Catalog::from_pool(
            pool.clone(),
            Duration::from_secs(config.database.catalog_ttl_secs),
        )
        .await?,
    );

    let store: Arc<dyn SharedStore> = match &config.shared_store.url {
        Some(url) => {
            let redis = RedisStore::new(url)?;
            redis.ping().await?;
            tracing::info!("using redis shared store");
            Arc::new(redis)
        }
        None => {
            tracing::warn!("using in-process shared store (single-process mode)");
            Arc::new(MemoryStore::new())
        }
    };

    let vault = Arc::new(KeyVault::from_encoded(
        config.vault.master_key.expose_secret(),
    )?);

    let http_client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let metrics = Arc::new(Metrics::new());
    let limiter = Arc::new(RateLimiter::new(store.clone(), &config.limits));
    let strategy = SelectionStrategy::parse(&config.dispatch.selection_strategy)
        .expect("validated at config load");
    let selector = Arc::new(KeySelector::new(strategy, limiter.clone()));
    let breaker = Arc::new(CircuitBreaker::new(
        store.clone(),
        config.circuit_breaker.clone(),
    ));
    let factory = Arc::new(HttpAdapterFactory::new(http_client));

    let dispatcher = Arc::new(Dispatcher::new(
        catalog.clone(),
        breaker.clone(),
        limiter.clone(),
        selector,
        vault,
        factory,
        metrics.clone(),
        Some(pool.clone()),
        config.dispatch.max_key_attempts,
    ));

    Ok(AppState {
        config: Arc::new(config),
        catalog,
        dispatcher,
        limiter,
        breaker,
        metrics,
        db: Some(pool),
    })
}

/// Run the HTTP server until shutdown.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let state = build_state(config).await?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting switchyard proxy server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
