//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (TETHER_HOST, TETHER_PORT)
//! - TOML configuration file
//!
//! With `[mqtt] enabled = true` the bridge runs against an external MQTT
//! broker; otherwise it runs on the embedded broker behind the gateway.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tether_core::BridgeConfig;
use tether_transport::{BrokerConfig, MqttConfig};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Presence and correlation timing.
    #[serde(default)]
    pub bridge: BridgeSettings,

    /// External MQTT broker.
    #[serde(default)]
    pub mqtt: MqttSettings,

    /// Device gateway.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Presence and correlation timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Default wait for a command response in milliseconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Silence after which a device is offline, in milliseconds.
    #[serde(default = "default_staleness_threshold")]
    pub staleness_threshold_ms: u64,

    /// Presence sweep period in milliseconds.
    #[serde(default = "default_sweep_interval")]
    pub presence_sweep_interval_ms: u64,

    /// Correlation safety sweep period in milliseconds.
    #[serde(default = "default_sweep_interval")]
    pub correlation_sweep_interval_ms: u64,
}

/// External MQTT broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    /// Bridge devices through an MQTT broker instead of the embedded one.
    #[serde(default)]
    pub enabled: bool,

    /// Broker host.
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client identifier; generated from the process id when unset.
    #[serde(default)]
    pub client_id: Option<String>,

    /// User name.
    #[serde(default)]
    pub username: Option<String>,

    /// Password.
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval in milliseconds.
    #[serde(default = "default_mqtt_keep_alive")]
    pub keep_alive_ms: u64,

    /// Pause between reconnect attempts in milliseconds.
    #[serde(default = "default_mqtt_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Maximum payload size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_payload_size: usize,
}

/// WebSocket device gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Enable the gateway.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Keepalive interval advertised to devices, in milliseconds.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,

    /// Messages buffered per session before new ones are dropped.
    #[serde(default = "default_forward_queue_capacity")]
    pub forward_queue_capacity: usize,
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
    std::env::var("TETHER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("TETHER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000)
}

fn default_true() -> bool {
    true
}

fn default_command_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_staleness_threshold() -> u64 {
    60_000 // 1 minute
}

fn default_sweep_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_mqtt_host() -> String {
    std::env::var("TETHER_MQTT_HOST").unwrap_or_else(|_| "localhost".to_string())
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_keep_alive() -> u64 {
    30_000
}

fn default_mqtt_reconnect_delay() -> u64 {
    5_000
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_keepalive_interval() -> u64 {
    15_000
}

fn default_forward_queue_capacity() -> usize {
    256
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bridge: BridgeSettings::default(),
            mqtt: MqttSettings::default(),
            gateway: GatewayConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout(),
            staleness_threshold_ms: default_staleness_threshold(),
            presence_sweep_interval_ms: default_sweep_interval(),
            correlation_sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_ms: default_mqtt_keep_alive(),
            reconnect_delay_ms: default_mqtt_reconnect_delay(),
            max_payload_size: default_max_message_size(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_ws_path(),
            max_message_size: default_max_message_size(),
            keepalive_interval_ms: default_keepalive_interval(),
            forward_queue_capacity: default_forward_queue_capacity(),
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
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "tether.toml",
            "/etc/tether/tether.toml",
            "~/.config/tether/tether.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
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

    /// Bridge timing as used by the core.
    #[must_use]
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            command_timeout: Duration::from_millis(self.bridge.command_timeout_ms),
            staleness_threshold: Duration::from_millis(self.bridge.staleness_threshold_ms),
            presence_sweep_interval: Duration::from_millis(self.bridge.presence_sweep_interval_ms),
            correlation_sweep_interval: Duration::from_millis(
                self.bridge.correlation_sweep_interval_ms,
            ),
            ..BridgeConfig::default()
        }
    }

    /// Broker limits derived from the gateway settings.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_payload_size: self.gateway.max_message_size,
            ..BrokerConfig::default()
        }
    }

    /// MQTT client settings.
    #[must_use]
    pub fn mqtt_config(&self) -> MqttConfig {
        let defaults = MqttConfig::default();
        MqttConfig {
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            client_id: self.mqtt.client_id.clone().unwrap_or(defaults.client_id.clone()),
            keep_alive: Duration::from_millis(self.mqtt.keep_alive_ms),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
            max_payload_size: self.mqtt.max_payload_size,
            reconnect_delay: Duration::from_millis(self.mqtt.reconnect_delay_ms),
            ..defaults
        }
    }
}
