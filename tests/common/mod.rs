//! Shared test harness: an app wired over the in-process store, a fixed
//! catalog snapshot and scriptable mock adapters.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use switchyard::config::Config;
use switchyard::providers::{AdapterFactory, MockAdapter, ProviderAdapter, ProviderKind};
use switchyard::proxy::{
    create_router, hash_client_key, AppState, CircuitBreaker, Dispatcher, Metrics, RateLimiter,
};
use switchyard::router::{KeySelector, SelectionStrategy};
use switchyard::storage::{
    ApiKeyRecord, Catalog, CatalogSnapshot, ClientKeyRecord, KeyStatus, MappingRecord,
    OverrideConfig, ProviderRecord,
};
use switchyard::store::MemoryStore;
use switchyard::vault::{mask, KeyVault};

/// Bearer token every harness-issued request authenticates with.
pub const CLIENT_TOKEN: &str = "sk-client-integration";

/// Hex-encoded 32-byte master key shared by all tests.
pub const MASTER_KEY_HEX: &str =
    "2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a";

pub fn test_vault() -> KeyVault {
    KeyVault::from_encoded(MASTER_KEY_HEX).expect("valid master key")
}

pub fn provider(id: i64, name: &str) -> ProviderRecord {
    ProviderRecord {
        id,
        name: name.to_string(),
        kind: ProviderKind::Mock,
        base_url: format!("http://{}.test", name),
        timeout: Duration::from_secs(5),
        max_retries: 2,
        enabled: true,
    }
}

pub fn api_key(id: i64, provider_id: i64, priority: i64) -> ApiKeyRecord {
    let vault = test_vault();
    let cleartext = format!("sk-upstream-{}", id);
    ApiKeyRecord {
        id,
        provider_id,
        key_id: format!("key-{}", id),
        ciphertext: vault.seal(&cleartext).expect("seal"),
        masked: mask(&cleartext),
        priority,
        rpm_limit: None,
        tpm_limit: None,
        daily_quota: None,
        status: KeyStatus::Active,
    }
}

pub fn mapping(
    id: i64,
    alias: &str,
    provider_id: i64,
    provider_model: &str,
    order_index: i64,
) -> MappingRecord {
    MappingRecord {
        id,
        alias: alias.to_string(),
        provider_id,
        provider_model: provider_model.to_string(),
        order_index,
        is_default: false,
        overrides: OverrideConfig::default(),
    }
}

pub fn client_key(rpm_limit: Option<i64>) -> ClientKeyRecord {
    ClientKeyRecord {
        id: 1,
        name: "integration".to_string(),
        key_hash: hash_client_key(CLIENT_TOKEN),
        rpm_limit,
        active: true,
    }
}

/// Dispatches per provider name; unknown providers fall back to a fresh
/// echo adapter.
pub struct TestFactory {
    adapters: HashMap<String, Arc<MockAdapter>>,
}

impl AdapterFactory for TestFactory {
    fn adapter(&self, provider: &ProviderRecord) -> Arc<dyn ProviderAdapter> {
        match self.adapters.get(&provider.name) {
            Some(adapter) => adapter.clone(),
            None => Arc::new(MockAdapter::new()),
        }
    }
}

pub struct HarnessOptions {
    pub global_rpm: u64,
    pub per_key_rpm: u64,
    pub per_ip_rpm: u64,
    pub cb_threshold: u32,
    pub cb_open_secs: u64,
    pub cb_probes: u32,
    pub request_timeout_secs: u64,
    pub strategy: &'static str,
    pub max_key_attempts: u32,
    pub client_rpm_limit: Option<i64>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            global_rpm: 0,
            per_key_rpm: 0,
            per_ip_rpm: 0,
            cb_threshold: 3,
            cb_open_secs: 30,
            cb_probes: 1,
            request_timeout_secs: 30,
            strategy: "priority",
            max_key_attempts: 3,
            client_rpm_limit: None,
        }
    }
}

pub struct Harness {
    pub state: AppState,
    pub metrics: Arc<Metrics>,
    pub breaker: Arc<CircuitBreaker>,
    pub dispatcher: Arc<Dispatcher>,
    pub adapters: HashMap<String, Arc<MockAdapter>>,
}

impl Harness {
    pub fn app(&self) -> axum::Router {
        create_router(self.state.clone())
    }

    pub fn adapter(&self, provider_name: &str) -> &Arc<MockAdapter> {
        &self.adapters[provider_name]
    }
}

pub fn build_harness(
    providers: Vec<ProviderRecord>,
    keys: Vec<ApiKeyRecord>,
    mappings: Vec<MappingRecord>,
    adapters: Vec<(&str, Arc<MockAdapter>)>,
    options: HarnessOptions,
) -> Harness {
    let config_toml = format!(
        r#"
        [database]
        url = "sqlite://unused.db"

        [shared_store]
        in_memory = true

        [vault]
        master_key = "{master_key}"

        [limits]
        window_secs = 60
        global_rpm = {global_rpm}
        per_key_rpm = {per_key_rpm}
        per_ip_rpm = {per_ip_rpm}

        [circuit_breaker]
        failure_threshold = {cb_threshold}
        window_secs = 60
        open_secs = {cb_open_secs}
        half_open_probes = {cb_probes}

        [dispatch]
        request_timeout_secs = {request_timeout_secs}
        max_key_attempts = {max_key_attempts}
        selection_strategy = "{strategy}"
        "#,
        master_key = MASTER_KEY_HEX,
        global_rpm = options.global_rpm,
        per_key_rpm = options.per_key_rpm,
        per_ip_rpm = options.per_ip_rpm,
        cb_threshold = options.cb_threshold,
        cb_open_secs = options.cb_open_secs,
        cb_probes = options.cb_probes,
        request_timeout_secs = options.request_timeout_secs,
        max_key_attempts = options.max_key_attempts,
        strategy = options.strategy,
    );
    let config = Config::parse_str(&config_toml).expect("harness config");

    let snapshot = CatalogSnapshot::build(
        providers,
        keys,
        mappings,
        vec![client_key(options.client_rpm_limit)],
    );
    let catalog = Arc::new(Catalog::fixed(snapshot));

    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(Metrics::new());
    let limiter = Arc::new(RateLimiter::new(store.clone(), &config.limits));
    let strategy = SelectionStrategy::parse(options.strategy).expect("strategy");
    let selector = Arc::new(KeySelector::new(strategy, limiter.clone()));
    let breaker = Arc::new(CircuitBreaker::new(
        store.clone(),
        config.circuit_breaker.clone(),
    ));
    let vault = Arc::new(test_vault());

    let adapters: HashMap<String, Arc<MockAdapter>> = adapters
        .into_iter()
        .map(|(name, adapter)| (name.to_string(), adapter))
        .collect();
    let factory = Arc::new(TestFactory {
        adapters: adapters.clone(),
    });

    let dispatcher = Arc::new(Dispatcher::new(
        catalog.clone(),
        breaker.clone(),
        limiter.clone(),
        selector,
        vault,
        factory,
        metrics.clone(),
        None,
        options.max_key_attempts,
    ));

    let state = AppState {
        config: Arc::new(config),
        catalog,
        dispatcher: dispatcher.clone(),
        limiter,
        breaker: breaker.clone(),
        metrics: metrics.clone(),
        db: None,
    };

    Harness {
        state,
        metrics,
        breaker,
        dispatcher,
        adapters,
    }
}

/// One provider ("alpha"), one key, one mapping for `alias`.
pub fn single_provider_harness(alias: &str, adapter: Arc<MockAdapter>) -> Harness {
    build_harness(
        vec![provider(1, "alpha")],
        vec![api_key(1, 1, 1)],
        vec![mapping(1, alias, 1, "alpha-native", 0)],
        vec![("alpha", adapter)],
        HarnessOptions::default(),
    )
}

// ── HTTP helpers ─────────────────────────────────────────────────────

pub fn chat_body(model: &str, content: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": content}]
    })
}

pub fn post_json(path: &str, body: &serde_json::Value) -> http::Request<axum::body::Body> {
    http::Request::post(path)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", CLIENT_TOKEN))
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

pub fn get_request(path: &str) -> http::Request<axum::body::Body> {
    http::Request::get(path)
        .header("authorization", format!("Bearer {}", CLIENT_TOKEN))
        .body(axum::body::Body::empty())
        .unwrap()
}

pub async fn parse_body(
    response: axum::response::Response,
) -> (http::StatusCode, serde_json::Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 4_194_304)
        .await
        .expect("read body");
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap_or_default();
    (status, json)
}

pub async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 4_194_304)
        .await
        .expect("read body");
    String::from_utf8(bytes.to_vec()).unwrap()
}
