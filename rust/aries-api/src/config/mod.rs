//! Configuration management for the Aries fabric.
//!
//! Configuration loads from defaults, an optional `config/aries` file, and
//! `ARIES__`-prefixed environment variables, with dedicated overrides for
//! secrets that conventionally live in plain environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AriesConfig {
    /// Gateway configuration (HTTP surface, cache, fallback chain).
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Upstream LLM provider configuration.
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Swarm executor configuration.
    #[serde(default)]
    pub swarm: SwarmConfig,
    /// Remote worker coordinator configuration.
    #[serde(default)]
    pub remote_workers: RemoteWorkersConfig,
    /// Primary relay endpoint.
    #[serde(default)]
    pub relay: Option<RelayConfig>,
    /// Secondary relay endpoint.
    #[serde(default)]
    pub relay_secondary: Option<RelayConfig>,
    /// Model selection per pipeline stage.
    #[serde(default)]
    pub models: ModelsConfig,
    /// Per-model pricing table.
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AriesConfig {
    /// Load configuration from environment and config files.
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/aries").required(false))
            .add_source(
                config::Environment::with_prefix("ARIES")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AriesConfig = config.try_deserialize().unwrap_or_default();

        // Secrets and endpoints from conventional environment variables
        if let Ok(credential) = std::env::var("ANTHROPIC_API_KEY") {
            app_config.upstream.credential = Some(credential);
        }
        if let Ok(token) = std::env::var("ARIES_GATEWAY_TOKEN") {
            app_config.gateway.token = Some(token);
        }
        if let Ok(secret) = std::env::var("ARIES_WORKER_SECRET") {
            app_config.remote_workers.secret = secret;
        }
        if let Ok(url) = std::env::var("ARIES_RELAY_URL") {
            let secret = std::env::var("ARIES_RELAY_SECRET").unwrap_or_default();
            app_config.relay = Some(RelayConfig { url, secret });
        }
        if let Ok(url) = std::env::var("ARIES_RELAY_SECONDARY_URL") {
            let secret = std::env::var("ARIES_RELAY_SECONDARY_SECRET").unwrap_or_default();
            app_config.relay_secondary = Some(RelayConfig { url, secret });
        }

        Ok(app_config)
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Gateway HTTP port.
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Static bearer token for non-loopback callers.
    pub token: Option<String>,
    /// Maximum simultaneous in-flight upstream calls.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Maximum queued requests past the permit pool.
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
    /// Response cache TTL in seconds.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Response cache capacity (entries).
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Ordered model fallback chain (fully qualified ids).
    #[serde(default = "default_fallback_chain")]
    pub fallback_chain: Vec<String>,
    /// Path of the persisted usage counters file.
    #[serde(default = "default_usage_file")]
    pub usage_file: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_gateway_port() -> u16 {
    9600
}

fn default_max_concurrent() -> usize {
    4
}

fn default_queue_limit() -> usize {
    32
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_capacity() -> usize {
    128
}

fn default_fallback_chain() -> Vec<String> {
    vec![
        "anthropic/claude-sonnet-4-5".to_string(),
        "anthropic/claude-haiku-3-5".to_string(),
    ]
}

fn default_usage_file() -> String {
    "./data/usage.json".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_gateway_port(),
            token: None,
            max_concurrent: default_max_concurrent(),
            queue_limit: default_queue_limit(),
            cache_ttl_secs: default_cache_ttl(),
            cache_capacity: default_cache_capacity(),
            fallback_chain: default_fallback_chain(),
            usage_file: default_usage_file(),
        }
    }
}

/// Upstream LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the upstream API.
    #[serde(default = "default_upstream_url")]
    pub base_url: String,
    /// Upstream credential (API key or OAuth-style token).
    pub credential: Option<String>,
    /// Default maximum output tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-request upstream deadline in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_upstream_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_url(),
            credential: None,
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Swarm executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Upper bound on concurrent local workers (API concurrency share).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Hard cap on workers per run.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-worker deadline in seconds.
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_secs: u64,
    /// Retries per worker after the first attempt.
    #[serde(default = "default_retries")]
    pub retries: usize,
    /// Tool-use iterations per local worker.
    #[serde(default = "default_tool_iterations")]
    pub max_tool_iterations: usize,
}

fn default_concurrency() -> usize {
    3
}

fn default_max_workers() -> usize {
    10
}

fn default_worker_timeout() -> u64 {
    90
}

fn default_retries() -> usize {
    2
}

fn default_tool_iterations() -> usize {
    3
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_workers: default_max_workers(),
            worker_timeout_secs: default_worker_timeout(),
            retries: default_retries(),
            max_tool_iterations: default_tool_iterations(),
        }
    }
}

/// Remote worker coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteWorkersConfig {
    /// Whether the coordinator listener is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Coordinator listener port.
    #[serde(default = "default_coordinator_port")]
    pub port: u16,
    /// Shared secret workers must present on attach.
    #[serde(default)]
    pub secret: String,
    /// Heartbeat scan interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Heartbeat timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_coordinator_port() -> u16 {
    9700
}

fn default_heartbeat_interval() -> u64 {
    10_000
}

fn default_heartbeat_timeout() -> u64 {
    30_000
}

impl Default for RemoteWorkersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_coordinator_port(),
            secret: String::new(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
        }
    }
}

/// A relay endpoint (URL + shared secret).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay base URL.
    pub url: String,
    /// Shared secret sent in the `X-Aries-Secret` header.
    #[serde(default)]
    pub secret: String,
}

/// Model selection per pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Default chat model for the gateway surface.
    #[serde(default = "default_chat_model")]
    pub chat: String,
    /// Model for task decomposition.
    #[serde(default = "default_simple_model")]
    pub decompose: String,
    /// Model for swarm workers.
    #[serde(default = "default_chat_model")]
    pub worker: String,
    /// Model for result aggregation.
    #[serde(default = "default_chat_model")]
    pub aggregate: String,
    /// Model for cheap auxiliary calls.
    #[serde(default = "default_simple_model")]
    pub simple: String,
}

fn default_chat_model() -> String {
    "anthropic/claude-sonnet-4-5".to_string()
}

fn default_simple_model() -> String {
    "anthropic/claude-haiku-3-5".to_string()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            chat: default_chat_model(),
            decompose: default_simple_model(),
            worker: default_chat_model(),
            aggregate: default_chat_model(),
            simple: default_simple_model(),
        }
    }
}

/// Per-model price points, in USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Input token price.
    pub input: f64,
    /// Output token price.
    pub output: f64,
    /// Cache-read token price.
    pub cache_read: f64,
    /// Cache-write token price.
    pub cache_write: f64,
}

/// Pricing table with a default row for unknown models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Per-model overrides keyed by qualified id.
    #[serde(default)]
    pub models: HashMap<String, ModelPricing>,
    /// Fallback pricing for unknown models.
    #[serde(default = "default_pricing")]
    pub default: ModelPricing,
}

fn default_pricing() -> ModelPricing {
    ModelPricing {
        input: 3.0,
        output: 15.0,
        cache_read: 0.3,
        cache_write: 3.75,
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            models: HashMap::new(),
            default: default_pricing(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to emit JSON-formatted logs.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
