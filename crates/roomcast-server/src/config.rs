//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - A TOML file: `--config <path>`, or the first of `roomcast.toml`,
//!   `/etc/roomcast/roomcast.toml`, `~/.config/roomcast/roomcast.toml`
//! - Environment variables (`ROOMCAST_PORT`, `ROOMCAST_BROKER__URL`, ...)

use anyhow::{ensure, Context, Result};
use roomcast_broker::BridgeConfig;
use roomcast_core::{GatewayConfig, RegistryConfig};
use roomcast_protocol::DEFAULT_TOPIC_PREFIX;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default config file locations, in lookup order.
const CONFIG_PATHS: [&str; 3] = [
    "roomcast.toml",
    "/etc/roomcast/roomcast.toml",
    "~/.config/roomcast/roomcast.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Pinned instance identity. Generated at startup when absent.
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Broker configuration.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Client authentication.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// `redis://host:port`, `rediss://...`, or `memory://` for a single node.
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Prefix of room topics.
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Connection attempts at startup before giving up.
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,

    /// First reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Reconnect delay cap in milliseconds.
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_ms: u64,

    /// Limit for one connection attempt in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Limit for one publish in milliseconds.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum rooms per connection.
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_connection: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Deliveries buffered per connection before dropping.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
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

/// Client authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Require a bearer token on the upgrade request.
    #[serde(default)]
    pub required: bool,
}

// Default value functions
fn default_host() -> String {
    std::env::var("ROOMCAST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("ROOMCAST_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_topic_prefix() -> String {
    DEFAULT_TOPIC_PREFIX.to_string()
}

fn default_startup_attempts() -> u32 {
    5
}

fn default_reconnect_delay() -> u64 {
    500
}

fn default_max_reconnect_delay() -> u64 {
    30_000
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_publish_timeout() -> u64 {
    5_000
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_rooms() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            instance_id: None,
            transport: TransportConfig::default(),
            broker: BrokerConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            topic_prefix: default_topic_prefix(),
            startup_attempts: default_startup_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
            max_reconnect_delay_ms: default_max_reconnect_delay(),
            connect_timeout_ms: default_connect_timeout(),
            publish_timeout_ms: default_publish_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_rooms_per_connection: default_max_rooms(),
            max_message_size: default_max_message_size(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
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

impl Config {
    /// Load configuration from a file (explicit or default paths) and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file is missing, a file or variable
    /// cannot be parsed, or the result fails validation.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match explicit {
            Some(path) => {
                ensure!(path.exists(), "Config file not found: {}", path.display());
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                for path in &CONFIG_PATHS {
                    let expanded = shellexpand::tilde(path);
                    let path = Path::new(expanded.as_ref());
                    if path.exists() {
                        builder = builder.add_source(config::File::from(path));
                        break;
                    }
                }
            }
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("ROOMCAST")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file, without environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check values the types cannot.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.transport.websocket_path.starts_with('/'),
            "transport.websocket_path must start with '/'"
        );
        ensure!(
            !self.broker.topic_prefix.is_empty(),
            "broker.topic_prefix cannot be empty"
        );
        ensure!(
            self.broker.startup_attempts > 0,
            "broker.startup_attempts must be at least 1"
        );
        ensure!(
            self.broker.publish_timeout_ms > 0,
            "broker.publish_timeout_ms must be positive"
        );
        ensure!(
            self.limits.max_message_size > 0,
            "limits.max_message_size must be positive"
        );
        ensure!(
            self.limits.outbound_buffer > 0,
            "limits.outbound_buffer must be positive"
        );
        if let Some(id) = &self.instance_id {
            ensure!(!id.is_empty(), "instance_id cannot be empty");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Bridge settings derived from the broker section.
    #[must_use]
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            startup_attempts: self.broker.startup_attempts,
            reconnect_delay: Duration::from_millis(self.broker.reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(self.broker.max_reconnect_delay_ms),
            connect_timeout: Duration::from_millis(self.broker.connect_timeout_ms),
            publish_timeout: Duration::from_millis(self.broker.publish_timeout_ms),
            ..BridgeConfig::default()
        }
    }

    /// Gateway settings derived from the broker and limits sections.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            topic_prefix: self.broker.topic_prefix.clone(),
            max_message_size: self.limits.max_message_size,
            registry: RegistryConfig {
                max_rooms_per_connection: self.limits.max_rooms_per_connection,
                outbound_buffer: self.limits.outbound_buffer,
            },
        }
    }
}
