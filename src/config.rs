//! Configuration management for Turnstile.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `TURNSTILE__*` environment variables (`__` separates nested keys,
//! e.g. `TURNSTILE__RATE_LIMITING__BURST=20`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::http::KeyPolicy;

/// Prefix of environment variables that override configuration.
const ENV_PREFIX: &str = "TURNSTILE";

/// Upper bound accepted for `burst`, to catch configuration typos.
const MAX_BURST: u32 = 1_000_000;

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Admission algorithm used for every limiter built from this configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

/// Which request attribute a limit applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    #[default]
    Ip,
    User,
    ApiKey,
    Endpoint,
}

impl From<KeyType> for KeyPolicy {
    fn from(key_type: KeyType) -> Self {
        match key_type {
            KeyType::Ip => KeyPolicy::Ip,
            KeyType::User => KeyPolicy::User,
            KeyType::ApiKey => KeyPolicy::ApiKey,
            KeyType::Endpoint => KeyPolicy::Endpoint,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Global enable/disable switch
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Admission algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Requests per minute (token bucket refill rate, or the sliding
    /// window's limit per `window_secs`)
    #[serde(default = "default_rate")]
    pub rate: u32,

    /// Maximum tokens held by a bucket
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Key derivation policy
    #[serde(default, rename = "type")]
    pub key_type: KeyType,

    /// Sliding window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Idle time after which a key's state is reclaimed
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Paths that bypass rate limiting entirely
    #[serde(default = "default_skip_paths")]
    pub skip_paths: Vec<String>,

    /// Route-scoped limits; unmapped routes share the default limiter
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointLimit>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            algorithm: Algorithm::default(),
            rate: default_rate(),
            burst: default_burst(),
            key_type: KeyType::default(),
            window_secs: default_window_secs(),
            ttl_secs: default_ttl_secs(),
            skip_paths: default_skip_paths(),
            endpoints: HashMap::new(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_rate() -> u32 {
    60
}

fn default_burst() -> u32 {
    10
}

fn default_window_secs() -> u64 {
    60
}

fn default_ttl_secs() -> u64 {
    600
}

fn default_skip_paths() -> Vec<String> {
    vec!["/health".to_string(), "/ready".to_string(), "/metrics".to_string()]
}

/// Limit override for a single route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointLimit {
    /// Requests per minute for this route
    pub rate: u32,
    /// Burst for this route; falls back to the global burst
    #[serde(default)]
    pub burst: Option<u32>,
}

impl RateLimitingConfig {
    /// Idle TTL as a duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sliding window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Validate the rate limiting configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        check_limit("rate_limiting", self.rate, self.burst)?;

        if self.ttl_secs == 0 {
            return Err(TurnstileError::Config(
                "rate_limiting.ttl_secs must be greater than 0".to_string(),
            ));
        }
        if self.algorithm == Algorithm::SlidingWindow && self.window_secs == 0 {
            return Err(TurnstileError::Config(
                "rate_limiting.window_secs must be greater than 0".to_string(),
            ));
        }

        for path in &self.skip_paths {
            if !path.starts_with('/') {
                return Err(TurnstileError::Config(format!(
                    "rate_limiting.skip_paths entry '{}' must start with '/'",
                    path
                )));
            }
        }

        for (route, limit) in &self.endpoints {
            if !route.starts_with('/') {
                return Err(TurnstileError::Config(format!(
                    "rate_limiting.endpoints route '{}' must start with '/'",
                    route
                )));
            }
            check_limit(
                &format!("rate_limiting.endpoints.{}", route),
                limit.rate,
                limit.burst.unwrap_or(self.burst),
            )?;
        }

        Ok(())
    }
}

fn check_limit(scope: &str, rate: u32, burst: u32) -> Result<()> {
    if rate == 0 {
        return Err(TurnstileError::Config(format!(
            "{}: rate must be greater than 0",
            scope
        )));
    }
    if burst == 0 {
        return Err(TurnstileError::Config(format!(
            "{}: burst must be greater than 0",
            scope
        )));
    }
    if burst > MAX_BURST {
        return Err(TurnstileError::Config(format!(
            "{}: burst ({}) must not exceed {}",
            scope, burst, MAX_BURST
        )));
    }
    Ok(())
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// The file is parsed as YAML directly so that map keys such as endpoint
    /// routes keep their case; environment values are merged over it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                parse_yaml(&contents)?
            }
            None => TurnstileConfig::default(),
        };

        let env_layer: serde_json::Value = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("rate_limiting.skip_paths"),
            )
            .build()?
            .try_deserialize()?;

        let mut merged = serde_json::to_value(&file_config)
            .map_err(|e| TurnstileError::Config(format!("Failed to merge configuration: {}", e)))?;
        merge_values(&mut merged, env_layer);

        let config: TurnstileConfig = serde_json::from_value(merged).map_err(|e| {
            TurnstileError::Config(format!("Invalid environment override: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = parse_yaml(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()
    }
}

fn parse_yaml(yaml: &str) -> Result<TurnstileConfig> {
    serde_yaml::from_str(yaml)
        .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
}

/// Recursively overlay `layer` onto `base`. Objects merge key by key; any
/// other value in `layer` replaces the one in `base`.
fn merge_values(base: &mut serde_json::Value, layer: serde_json::Value) {
    match (base, layer) {
        (serde_json::Value::Object(base), serde_json::Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}
