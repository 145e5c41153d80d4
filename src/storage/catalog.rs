//! Provider / key / mapping catalog with a bounded-staleness cache.
//!
//! The catalog tables are written by an external admin surface; the hot
//! path only ever reads an immutable snapshot. Snapshots are re-read from
//! the database once they exceed the configured TTL (default 5s), so admin
//! changes become visible within that bound without any per-request query.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::providers::ProviderKind;

/// Lifecycle state of an upstream credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Disabled,
    Failed,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Disabled => "disabled",
            KeyStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "active" => KeyStatus::Active,
            "failed" => KeyStatus::Failed,
            _ => KeyStatus::Disabled,
        }
    }
}

/// A configured upstream provider.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub id: i64,
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub enabled: bool,
}

/// A stored upstream credential. The secret itself is an opaque ciphertext
/// until the vault unseals it for a single call.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub provider_id: i64,
    /// Stable handle used in logs and metrics; never the secret.
    pub key_id: String,
    pub ciphertext: String,
    /// Last four characters of the cleartext, fixed at creation.
    pub masked: String,
    pub priority: i64,
    pub rpm_limit: Option<i64>,
    pub tpm_limit: Option<i64>,
    pub daily_quota: Option<i64>,
    pub status: KeyStatus,
}

/// Per-mapping request overrides. The schema is closed: unknown keys are
/// rejected when the record is loaded, not at dispatch time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OverrideConfig {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub stop: Option<Vec<String>>,
    /// When true, override values replace client-supplied ones.
    pub forced: bool,
}

impl OverrideConfig {
    pub fn is_empty(&self) -> bool {
        *self == OverrideConfig::default()
    }
}

/// An alias → provider-model binding.
#[derive(Debug, Clone)]
pub struct MappingRecord {
    pub id: i64,
    pub alias: String,
    pub provider_id: i64,
    pub provider_model: String,
    pub order_index: i64,
    pub is_default: bool,
    pub overrides: OverrideConfig,
}

/// A client principal allowed to call the proxy.
#[derive(Debug, Clone)]
pub struct ClientKeyRecord {
    pub id: i64,
    pub name: String,
    /// SHA-256 hex digest of the bearer token.
    pub key_hash: String,
    pub rpm_limit: Option<i64>,
    pub active: bool,
}

/// Immutable point-in-time view of the catalog.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    providers: HashMap<i64, Arc<ProviderRecord>>,
    keys_by_provider: HashMap<i64, Vec<Arc<ApiKeyRecord>>>,
    mappings_by_alias: HashMap<String, Vec<MappingRecord>>,
    client_keys_by_hash: HashMap<String, Arc<ClientKeyRecord>>,
}

impl CatalogSnapshot {
    /// Build a snapshot from records (used by the loader and by tests).
    pub fn build(
        providers: Vec<ProviderRecord>,
        keys: Vec<ApiKeyRecord>,
        mut mappings: Vec<MappingRecord>,
        client_keys: Vec<ClientKeyRecord>,
    ) -> Self {
        let providers: HashMap<i64, Arc<ProviderRecord>> = providers
            .into_iter()
            .map(|p| (p.id, Arc::new(p)))
            .collect();

        let mut keys_by_provider: HashMap<i64, Vec<Arc<ApiKeyRecord>>> = HashMap::new();
        for key in keys {
            keys_by_provider
                .entry(key.provider_id)
                .or_default()
                .push(Arc::new(key));
        }

        // Default mapping first, then order_index ascending.
        mappings.sort_by(|a, b| {
            b.is_default
                .cmp(&a.is_default)
                .then(a.order_index.cmp(&b.order_index))
        });
        let mut mappings_by_alias: HashMap<String, Vec<MappingRecord>> = HashMap::new();
        for mapping in mappings {
            mappings_by_alias
                .entry(mapping.alias.clone())
                .or_default()
                .push(mapping);
        }

        let client_keys_by_hash = client_keys
            .into_iter()
            .filter(|k| k.active)
            .map(|k| (k.key_hash.clone(), Arc::new(k)))
            .collect();

        Self {
            providers,
            keys_by_provider,
            mappings_by_alias,
            client_keys_by_hash,
        }
    }

    pub fn provider(&self, id: i64) -> Option<Arc<ProviderRecord>> {
        self.providers.get(&id).cloned()
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<ProviderRecord>> {
        self.providers.values()
    }

    pub fn keys_for(&self, provider_id: i64) -> &[Arc<ApiKeyRecord>] {
        self.keys_by_provider
            .get(&provider_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn mappings_for(&self, alias: &str) -> &[MappingRecord] {
        self.mappings_by_alias
            .get(alias)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Distinct aliases, sorted for stable /v1/models output.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.mappings_by_alias.keys().cloned().collect();
        aliases.sort();
        aliases
    }

    pub fn client_key_by_hash(&self, hash: &str) -> Option<Arc<ClientKeyRecord>> {
        self.client_keys_by_hash.get(hash).cloned()
    }
}

struct CatalogState {
    snapshot: Arc<CatalogSnapshot>,
    loaded_at: Instant,
}

/// Cached catalog handle shared across request tasks.
pub struct Catalog {
    pool: Option<SqlitePool>,
    ttl: Duration,
    state: tokio::sync::RwLock<CatalogState>,
}

impl Catalog {
    /// A catalog that never refreshes, for tests and the `check` command.
    pub fn fixed(snapshot: CatalogSnapshot) -> Self {
        Self {
            pool: None,
            ttl: Duration::from_secs(u64::MAX / 4),
            state: tokio::sync::RwLock::new(CatalogState {
                snapshot: Arc::new(snapshot),
                loaded_at: Instant::now(),
            }),
        }
    }

    /// Load the catalog from the database and keep refreshing with `ttl`
    /// bounded staleness.
    pub async fn from_pool(pool: SqlitePool, ttl: Duration) -> Result<Self, sqlx::Error> {
        let snapshot = load_snapshot(&pool).await?;
        Ok(Self {
            pool: Some(pool),
            ttl,
            state: tokio::sync::RwLock::new(CatalogState {
                snapshot: Arc::new(snapshot),
                loaded_at: Instant::now(),
            }),
        })
    }

    /// Current snapshot, re-read from the database when stale.
    ///
    /// A failed refresh serves the previous snapshot; the proxy keeps
    /// routing on slightly stale data rather than failing requests.
    pub async fn snapshot(&self) -> Arc<CatalogSnapshot> {
        {
            let state = self.state.read().await;
            if state.loaded_at.elapsed() < self.ttl || self.pool.is_none() {
                return state.snapshot.clone();
            }
        }

        let mut state = self.state.write().await;
        if state.loaded_at.elapsed() < self.ttl {
            return state.snapshot.clone();
        }

        let pool = self.pool.as_ref().expect("checked above");
        match load_snapshot(pool).await {
            Ok(snapshot) => {
                state.snapshot = Arc::new(snapshot);
                state.loaded_at = Instant::now();
            }
            Err(e) => {
                tracing::warn!(error = %e, "catalog refresh failed, serving stale snapshot");
                state.loaded_at = Instant::now();
            }
        }
        state.snapshot.clone()
    }

    /// Force the next `snapshot()` call to re-read the database.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        let backdate = self.ttl.saturating_add(Duration::from_secs(1));
        if let Some(past) = Instant::now().checked_sub(backdate) {
            state.loaded_at = past;
        }
    }
}

#[derive(sqlx::FromRow)]
struct ProviderRow {
    id: i64,
    name: String,
    kind: String,
    base_url: String,
    timeout_ms: i64,
    max_retries: i64,
    enabled: bool,
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: i64,
    provider_id: i64,
    key_id: String,
    ciphertext: String,
    masked: String,
    priority: i64,
    rpm_limit: Option<i64>,
    tpm_limit: Option<i64>,
    daily_quota: Option<i64>,
    status: String,
}

#[derive(sqlx::FromRow)]
struct MappingRow {
    id: i64,
    alias: String,
    provider_id: i64,
    provider_model: String,
    order_index: i64,
    is_default: bool,
    overrides: String,
}

#[derive(sqlx::FromRow)]
struct ClientKeyRow {
    id: i64,
    name: String,
    key_hash: String,
    rpm_limit: Option<i64>,
    active: bool,
}

async fn load_snapshot(pool: &SqlitePool) -> Result<CatalogSnapshot, sqlx::Error> {
    let provider_rows: Vec<ProviderRow> = sqlx::query_as(
        "SELECT id, name, kind, base_url, timeout_ms, max_retries, enabled FROM providers",
    )
    .fetch_all(pool)
    .await?;

    let key_rows: Vec<ApiKeyRow> = sqlx::query_as(
        "SELECT id, provider_id, key_id, ciphertext, masked, priority,
                rpm_limit, tpm_limit, daily_quota, status
         FROM api_keys",
    )
    .fetch_all(pool)
    .await?;

    let mapping_rows: Vec<MappingRow> = sqlx::query_as(
        "SELECT id, alias, provider_id, provider_model, order_index, is_default, overrides
         FROM model_mappings",
    )
    .fetch_all(pool)
    .await?;

    let client_key_rows: Vec<ClientKeyRow> =
        sqlx::query_as("SELECT id, name, key_hash, rpm_limit, active FROM client_keys")
            .fetch_all(pool)
            .await?;

    let providers = provider_rows
        .into_iter()
        .filter_map(|row| {
            let Some(kind) = ProviderKind::parse(&row.kind) else {
                tracing::warn!(provider = %row.name, kind = %row.kind, "skipping provider with unknown kind");
                return None;
            };
            Some(ProviderRecord {
                id: row.id,
                name: row.name,
                kind,
                base_url: row.base_url,
                timeout: Duration::from_millis(row.timeout_ms.max(1) as u64),
                max_retries: row.max_retries.max(0) as u32,
                enabled: row.enabled,
            })
        })
        .collect();

    let keys = key_rows
        .into_iter()
        .map(|row| ApiKeyRecord {
            id: row.id,
            provider_id: row.provider_id,
            key_id: row.key_id,
            ciphertext: row.ciphertext,
            masked: row.masked,
            priority: row.priority,
            rpm_limit: row.rpm_limit,
            tpm_limit: row.tpm_limit,
            daily_quota: row.daily_quota,
            status: KeyStatus::parse(&row.status),
        })
        .collect();

    let mappings = mapping_rows
        .into_iter()
        .filter_map(|row| {
            let overrides = match serde_json::from_str::<OverrideConfig>(&row.overrides) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(alias = %row.alias, error = %e, "skipping mapping with invalid overrides");
                    return None;
                }
            };
            Some(MappingRecord {
                id: row.id,
                alias: row.alias,
                provider_id: row.provider_id,
                provider_model: row.provider_model,
                order_index: row.order_index,
                is_default: row.is_default,
                overrides,
            })
        })
        .collect();

    let client_keys = client_key_rows
        .into_iter()
        .map(|row| ClientKeyRecord {
            id: row.id,
            name: row.name,
            key_hash: row.key_hash,
            rpm_limit: row.rpm_limit,
            active: row.active,
        })
        .collect();

    Ok(CatalogSnapshot::build(providers, keys, mappings, client_keys))
}
