pub mod validation;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub base_path: String,
    pub connect_timeout_secs: u64,
    pub stream_max_duration_secs: u64,
    pub http_pool_max_idle_per_host: usize,
    pub http_pool_idle_timeout_secs: u64,
    pub http_use_env_proxy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_max_blocking_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_reuse_port_listener_count: Option<usize>,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_stream_max_duration_secs() -> u64 {
    300
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize)]
struct ServerConfigWire {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default)]
    base_path: String,
    #[serde(default = "default_connect_timeout_secs")]
    connect_timeout_secs: u64,
    #[serde(default = "default_stream_max_duration_secs")]
    stream_max_duration_secs: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    http_pool_idle_timeout_secs: u64,
    #[serde(default)]
    http_use_env_proxy: bool,
    #[serde(default)]
    runtime_worker_threads: Option<RuntimeThreadsSetting>,
    #[serde(default)]
    runtime_max_blocking_threads: Option<RuntimeThreadsSetting>,
    #[serde(default)]
    tcp_reuse_port_listener_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuntimeThreadsSetting {
    Fixed(usize),
    Auto(()),
}

fn runtime_threads_or_default(
    setting: Option<&RuntimeThreadsSetting>,
    default: Option<usize>,
) -> Option<usize> {
    match setting {
        None => default,
        Some(RuntimeThreadsSetting::Fixed(threads)) => Some(*threads),
        Some(RuntimeThreadsSetting::Auto(())) => None,
    }
}

impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = ServerConfigWire::deserialize(deserializer)?;
        Ok(Self {
            port: wire.port,
            host: wire.host,
            base_path: wire.base_path,
            connect_timeout_secs: wire.connect_timeout_secs,
            stream_max_duration_secs: wire.stream_max_duration_secs,
            http_pool_max_idle_per_host: wire.http_pool_max_idle_per_host,
            http_pool_idle_timeout_secs: wire.http_pool_idle_timeout_secs,
            http_use_env_proxy: wire.http_use_env_proxy,
            // missing => default, explicit null => runtime decides
            runtime_worker_threads: runtime_threads_or_default(
                wire.runtime_worker_threads.as_ref(),
                None,
            ),
            runtime_max_blocking_threads: runtime_threads_or_default(
                wire.runtime_max_blocking_threads.as_ref(),
                Some(8),
            ),
            tcp_reuse_port_listener_count: wire.tcp_reuse_port_listener_count,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            base_path: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            stream_max_duration_secs: default_stream_max_duration_secs(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            http_use_env_proxy: false,
            runtime_worker_threads: None,
            runtime_max_blocking_threads: Some(8),
            tcp_reuse_port_listener_count: None,
        }
    }
}

/// Upstream chat-completion provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Inline credential. When absent, `api_key_env` is consulted per request.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    pub model: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f64>,
}

fn default_api_key_env() -> String {
    "UPSTREAM_API_KEY".to_string()
}

impl UpstreamConfig {
    /// Resolve the upstream credential: inline key first, then the environment.
    ///
    /// Blank values count as missing.
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_deref() {
            if !key.trim().is_empty() {
                return Some(key.trim().to_string());
            }
        }
        if self.api_key_env.is_empty() {
            return None;
        }
        std::env::var(&self.api_key_env)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

/// Cross-origin settings applied to preflight and streaming responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_cors_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_cors_max_age_secs() -> u64 {
    600
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
            max_age_secs: default_cors_max_age_secs(),
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] or [`ConfigError::Validation`].
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}
