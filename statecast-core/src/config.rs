use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub cache: CacheConfig,
    pub relay: RelayConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Largest inbound websocket message accepted, in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty disables the cross-instance bus (single-node mode)
    pub url: String,
    pub channel: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            channel: "statecast:events".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            max_capacity: 100_000,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub heartbeat_interval_ms: u64,
    /// Outbound token refill rate per connection (tokens per second)
    pub rate: f64,
    /// Outbound token bucket capacity per connection
    pub burst: f64,
    pub base_batch_window_ms: u64,
    pub min_batch_window_ms: u64,
    pub max_batch_window_ms: u64,
    /// Queue length above which a key's batch window widens
    pub high_watermark: usize,
    /// Queue length below which a key's batch window narrows
    pub low_watermark: usize,
    pub require_auth: bool,
    /// Frames buffered per connection before new frames are dropped
    pub outbound_buffer: usize,
    pub inbound_frames_per_second: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            rate: 5.0,
            burst: 20.0,
            base_batch_window_ms: 40,
            min_batch_window_ms: 10,
            max_batch_window_ms: 500,
            high_watermark: 200,
            low_watermark: 10,
            require_auth: false,
            outbound_buffer: 1024,
            inbound_frames_per_second: 50,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accepted static tokens. Empty means no token verifier is installed.
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // STATECAST_SERVER__HTTP_PORT, STATECAST_RELAY__REQUIRE_AUTH, ...
        builder = builder.add_source(
            Environment::with_prefix("STATECAST")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("auth.tokens")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check cross-field constraints. Returns every violation found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let relay = &self.relay;

        if relay.heartbeat_interval_ms == 0 {
            errors.push("relay.heartbeat_interval_ms must be greater than 0".to_string());
        }
        if relay.rate <= 0.0 {
            errors.push("relay.rate must be greater than 0".to_string());
        }
        if relay.burst < 1.0 {
            errors.push("relay.burst must be at least 1".to_string());
        }
        if relay.min_batch_window_ms == 0 {
            errors.push("relay.min_batch_window_ms must be greater than 0".to_string());
        }
        if relay.min_batch_window_ms > relay.max_batch_window_ms {
            errors.push(format!(
                "relay.min_batch_window_ms ({}) exceeds relay.max_batch_window_ms ({})",
                relay.min_batch_window_ms, relay.max_batch_window_ms
            ));
        }
        if relay.base_batch_window_ms < relay.min_batch_window_ms
            || relay.base_batch_window_ms > relay.max_batch_window_ms
        {
            errors.push(format!(
                "relay.base_batch_window_ms ({}) must lie within [{}, {}]",
                relay.base_batch_window_ms, relay.min_batch_window_ms, relay.max_batch_window_ms
            ));
        }
        if relay.low_watermark >= relay.high_watermark {
            errors.push("relay.low_watermark must be below relay.high_watermark".to_string());
        }
        if relay.outbound_buffer == 0 {
            errors.push("relay.outbound_buffer must be greater than 0".to_string());
        }
        if relay.inbound_frames_per_second == 0 {
            errors.push("relay.inbound_frames_per_second must be greater than 0".to_string());
        }
        if self.cache.ttl_ms == 0 {
            errors.push("cache.ttl_ms must be greater than 0".to_string());
        }
        if relay.require_auth && self.auth.tokens.is_empty() {
            errors.push("relay.require_auth is set but auth.tokens is empty".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
