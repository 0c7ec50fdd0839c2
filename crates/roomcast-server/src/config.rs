//! Server configuration.
//!
//! Configuration is layered, lowest precedence first:
//! - Built-in defaults
//! - The first TOML file found in [`CONFIG_PATHS`]
//! - Environment variables (`ROOMCAST__*`, `__` separating sections, e.g.
//!   `ROOMCAST__PUBSUB__URL`)
//!
//! Environment keys are lowercased on the way in; values keep their case.

use anyhow::{bail, ensure, Context, Result};
use roomcast_core::{ConnectionConfig, HubConfig, DEFAULT_CHANNEL_PREFIX};
use roomcast_protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration files searched by [`Config::load`], in order.
pub const CONFIG_PATHS: [&str; 3] = [
    "roomcast.toml",
    "/etc/roomcast/roomcast.toml",
    "~/.config/roomcast/roomcast.toml",
];

/// Prefix of configuration environment variables.
const ENV_PREFIX: &str = "ROOMCAST";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket endpoint configuration.
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// External pub/sub configuration.
    #[serde(default)]
    pub pubsub: PubSubConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// WebSocket endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Per-connection outbound buffer capacity, in messages.
    #[serde(default = "default_send_buffer_capacity")]
    pub send_buffer_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Deadline for a single socket write, in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Idle time after which a silent client is dropped, in milliseconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Ping interval in milliseconds. Must be below `read_timeout_ms`.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,
}

/// Pub/sub backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PubSubBackend {
    /// In-process fan-out; single server only.
    #[default]
    Memory,
    /// Redis pub/sub; fans out across server processes.
    Redis,
}

/// External pub/sub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubConfig {
    /// Backend to use.
    #[serde(default)]
    pub backend: PubSubBackend,

    /// Backend URL, e.g. `redis://127.0.0.1:6379`.
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix of room channel names.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Accepted bearer token of each principal, keyed by principal ID.
    ///
    /// From the environment: `ROOMCAST__AUTH__TOKENS__<principal>=<token>`.
    /// The principal ID is lowercased there, the token is not.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

impl AuthConfig {
    /// Token -> principal lookup table.
    #[must_use]
    pub fn token_table(&self) -> HashMap<String, String> {
        self.tokens
            .iter()
            .map(|(principal, token)| (token.clone(), principal.clone()))
            .collect()
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_send_buffer_capacity() -> usize {
    256
}

fn default_write_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_read_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_ping_interval() -> u64 {
    54_000 // 90% of the read timeout
}

fn default_channel_prefix() -> String {
    DEFAULT_CHANNEL_PREFIX.to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket: WebSocketConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            pubsub: PubSubConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            max_frame_size: default_max_frame_size(),
            send_buffer_capacity: default_send_buffer_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: default_write_timeout(),
            read_timeout_ms: default_read_timeout(),
            ping_interval_ms: default_ping_interval(),
        }
    }
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            backend: PubSubBackend::default(),
            url: None,
            channel_prefix: default_channel_prefix(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

impl Config {
    /// Load configuration from the first file in [`CONFIG_PATHS`] and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result is invalid.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        Self::build(file.as_deref(), environment())
    }

    fn build(file: Option<&str>, environment: ::config::Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = file {
            tracing::info!(path = %path, "Loading configuration file");
            builder = builder.add_source(::config::File::with_name(path));
        }

        let config: Config = builder
            .add_source(environment)
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let heartbeat = &self.heartbeat;
        ensure!(heartbeat.write_timeout_ms > 0, "heartbeat.write_timeout_ms must be positive");
        ensure!(heartbeat.ping_interval_ms > 0, "heartbeat.ping_interval_ms must be positive");
        ensure!(
            heartbeat.ping_interval_ms < heartbeat.read_timeout_ms,
            "heartbeat.ping_interval_ms ({}) must be less than heartbeat.read_timeout_ms ({})",
            heartbeat.ping_interval_ms,
            heartbeat.read_timeout_ms
        );

        ensure!(
            self.websocket.send_buffer_capacity > 0,
            "websocket.send_buffer_capacity must be positive"
        );
        ensure!(self.websocket.max_frame_size > 0, "websocket.max_frame_size must be positive");
        ensure!(
            self.websocket.path.starts_with('/'),
            "websocket.path must start with '/'"
        );

        let mut seen = HashSet::new();
        for (principal, token) in &self.auth.tokens {
            ensure!(!token.trim().is_empty(), "auth.tokens.{} must not be empty", principal);
            ensure!(seen.insert(token), "auth.tokens.{} reuses another principal's token", principal);
        }

        if self.pubsub.backend == PubSubBackend::Redis
            && self.pubsub.url.as_deref().map_or(true, str::is_empty)
        {
            bail!("pubsub.url is required for the redis backend");
        }

        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}:{}", self.host, self.port))
    }

    /// Per-connection settings.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
            read_timeout: Duration::from_millis(self.heartbeat.read_timeout_ms),
            ping_interval: Duration::from_millis(self.heartbeat.ping_interval_ms),
            send_buffer_capacity: self.websocket.send_buffer_capacity,
        }
    }

    /// Hub settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            channel_prefix: self.pubsub.channel_prefix.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.websocket.path, "/ws");
        assert_eq!(config.websocket.max_frame_size, 16 * 1024);
        assert_eq!(config.pubsub.backend, PubSubBackend::Memory);
        assert_eq!(config.pubsub.channel_prefix, "room:");
        config.validate().unwrap();
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let config = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_connection_config_defaults() {
        let connection = Config::default().connection_config();
        let expected = ConnectionConfig::default();
        assert_eq!(connection.write_timeout, expected.write_timeout);
        assert_eq!(connection.read_timeout, expected.read_timeout);
        assert_eq!(connection.ping_interval, expected.ping_interval);
        assert_eq!(connection.send_buffer_capacity, expected.send_buffer_capacity);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [pubsub]
            backend = "redis"
            url = "redis://127.0.0.1:6379"
            channel_prefix = "chat:"

            [auth.tokens]
            alice = "Secret-1"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.pubsub.backend, PubSubBackend::Redis);
        assert_eq!(config.hub_config().channel_prefix, "chat:");
        assert_eq!(
            config.auth.token_table().get("Secret-1").map(String::as_str),
            Some("alice")
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_ping_not_below_read_timeout() {
        let mut config = Config::default();
        config.heartbeat.ping_interval_ms = config.heartbeat.read_timeout_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.websocket.send_buffer_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.websocket.max_frame_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let environment = environment().source(Some(HashMap::from([
            ("ROOMCAST__PORT".to_string(), "9001".to_string()),
            ("ROOMCAST__PUBSUB__CHANNEL_PREFIX".to_string(), "chat:".to_string()),
            ("ROOMCAST__AUTH__TOKENS__alice".to_string(), "S3cret-Token".to_string()),
        ])));

        let config = Config::build(None, environment).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.pubsub.channel_prefix, "chat:");
        assert_eq!(
            config.auth.token_table().get("S3cret-Token").map(String::as_str),
            Some("alice")
        );
    }

    #[test]
    fn test_validate_rejects_shared_or_empty_tokens() {
        let mut config = Config::default();
        config.auth.tokens.insert("alice".to_string(), "same".to_string());
        config.auth.tokens.insert("bob".to_string(), "same".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auth.tokens.insert("alice".to_string(), " ".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_redis_url() {
        let mut config = Config::default();
        config.pubsub.backend = PubSubBackend::Redis;
        assert!(config.validate().is_err());

        config.pubsub.url = Some("redis://localhost".to_string());
        config.validate().unwrap();
    }
}
