//! Configuration parsing and validation for switchyard.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub shared_store: SharedStoreConfig,
    pub vault: VaultConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Catalog database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. "sqlite://switchyard.db".
    /// Supports `${VAR}` environment references.
    pub url: String,
    /// How long a catalog snapshot may be served before it is re-read.
    #[serde(default = "default_catalog_ttl_secs")]
    pub catalog_ttl_secs: u64,
}

fn default_catalog_ttl_secs() -> u64 {
    5
}

/// Shared key-value store configuration.
///
/// Rate-limit counters and circuit-breaker state live here so that a
/// horizontally scaled fleet agrees on them. A process-local store is
/// available for single-process deployments but must be opted into
/// explicitly; configuring neither is an error.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SharedStoreConfig {
    /// Redis URL, e.g. "redis://127.0.0.1:6379". Supports `${VAR}`.
    pub url: Option<String>,
    /// Explicit opt-in to the in-process store.
    #[serde(default)]
    pub in_memory: bool,
}

/// Key vault configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    /// 32-byte master encryption key, base64 or hex encoded.
    /// Supports `${VAR}` environment references.
    pub master_key: MasterKey,
}

/// Master key wrapper that redacts in Debug and zeroizes on drop.
#[derive(Clone)]
pub struct MasterKey(SecretString);

impl MasterKey {
    /// Access the encoded key value. Call sites are auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for MasterKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| MasterKey(SecretString::from(s)))
    }
}

impl From<&str> for MasterKey {
    fn from(s: &str) -> Self {
        MasterKey(SecretString::from(s))
    }
}

/// Rate limiting configuration. A limit of 0 disables the axis.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Window length in seconds for all request counters.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Requests per window across all clients.
    #[serde(default)]
    pub global_rpm: u64,
    /// Requests per window per client key (overridable per record).
    #[serde(default = "default_per_key_rpm")]
    pub per_key_rpm: u64,
    /// Requests per window per client IP.
    #[serde(default)]
    pub per_ip_rpm: u64,
}

fn default_window_secs() -> u64 {
    60
}

fn default_per_key_rpm() -> u64 {
    60
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            global_rpm: 0,
            per_key_rpm: default_per_key_rpm(),
            per_ip_rpm: 0,
        }
    }
}

impl LimitsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

/// Circuit breaker parameters shared by all providers.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within the rolling window required to trip the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Rolling failure window in seconds.
    #[serde(default = "default_cb_window_secs")]
    pub window_secs: u64,
    /// Initial open duration in seconds; doubles on failed probes.
    #[serde(default = "default_open_secs")]
    pub open_secs: u64,
    /// Ceiling for the doubled open duration.
    #[serde(default = "default_open_secs_cap")]
    pub open_secs_cap: u64,
    /// Probe calls admitted in half-open state.
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cb_window_secs() -> u64 {
    60
}

fn default_open_secs() -> u64 {
    30
}

fn default_open_secs_cap() -> u64 {
    300
}

fn default_half_open_probes() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_cb_window_secs(),
            open_secs: default_open_secs(),
            open_secs_cap: default_open_secs_cap(),
            half_open_probes: default_half_open_probes(),
        }
    }
}

/// Dispatch engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Overall request deadline in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum keys tried per candidate before moving on.
    #[serde(default = "default_max_key_attempts")]
    pub max_key_attempts: u32,
    /// Key selection strategy: "priority", "round_robin" or "least_used".
    #[serde(default = "default_strategy")]
    pub selection_strategy: String,
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_key_attempts() -> u32 {
    3
}

fn default_strategy() -> String {
    "priority".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_key_attempts: default_max_key_attempts(),
            selection_strategy: default_strategy(),
        }
    }
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to write per-request audit rows to the database
    #[serde(default = "default_true")]
    pub audit: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            audit: true,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for '{field}': {message}")]
    EnvVar {
        var: String,
        field: String,
        message: String,
    },
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// The closure-based design makes this testable without touching global env
/// state. Supports multiple `${VAR}` in one string (e.g.,
/// `redis://${HOST}:${PORT}`). Fails on first missing variable, unclosed
/// `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, field: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            field: field.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                field: field.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            field: field.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in '{}')",
                var_name, field
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Expand all `${VAR}` references in a string using real environment variables.
fn expand_env_vars(input: &str, field: &str) -> Result<String, ConfigError> {
    expand_env_vars_with(input, field, |name| std::env::var(name).ok())
}

impl Config {
    /// Load configuration from a TOML file with environment variable expansion.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.expand_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Expand `${VAR}` references in fields that commonly carry secrets or
    /// deployment-specific endpoints.
    fn expand_env(&mut self) -> Result<(), ConfigError> {
        self.database.url = expand_env_vars(&self.database.url, "database.url")?;
        if let Some(url) = &self.shared_store.url {
            self.shared_store.url = Some(expand_env_vars(url, "shared_store.url")?);
        }
        let expanded = expand_env_vars(self.vault.master_key.expose_secret(), "vault.master_key")?;
        self.vault.master_key = MasterKey(SecretString::from(expanded));
        Ok(())
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.shared_store.url.is_none() && !self.shared_store.in_memory {
            return Err(ConfigError::Validation(
                "no shared store configured: set shared_store.url, or opt into \
                 shared_store.in_memory = true for single-process deployments"
                    .to_string(),
            ));
        }
        if self.shared_store.url.is_some() && self.shared_store.in_memory {
            return Err(ConfigError::Validation(
                "shared_store.url and shared_store.in_memory are mutually exclusive".to_string(),
            ));
        }
        match self.dispatch.selection_strategy.as_str() {
            "priority" | "round_robin" | "least_used" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "unknown selection_strategy '{}'; expected priority, round_robin or least_used",
                    other
                )))
            }
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.half_open_probes == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.half_open_probes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
