//! Configuration for the gate client
//!
//! Loaded from a TOML file. Every section is optional and every field has a
//! default matching the controller deployment, so a file naming just a broker
//! URL or a proxy URL is a complete configuration.

use crate::protocol::{CommandKind, Permission, TopicSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GateConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub resilience: ResilienceSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub thresholds: ThresholdsSection,
    #[serde(default)]
    pub access: AccessSection,
    #[serde(default)]
    pub server: ServerSection,
}

/// Which transport the client may use
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportPreference {
    /// Direct broker connection, falling back to the HTTP proxy
    #[default]
    Auto,
    Direct,
    HttpProxy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// Client identity used for the broker session and pool key
    #[serde(default = "default_client_id")]
    pub id: String,
    #[serde(default)]
    pub transport: TransportPreference,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            id: default_client_id(),
            transport: TransportPreference::default(),
        }
    }
}

fn default_client_id() -> String {
    "gatelink".to_string()
}

/// Direct broker connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// `mqtt://host:port` or `mqtts://host:port`
    pub broker_url: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Pause between the transport's own reconnection attempts
    #[serde(default = "default_reconnect_period_ms")]
    pub reconnect_period_ms: u64,
    #[serde(default = "default_gate_status_topic")]
    pub gate_status_topic: String,
    #[serde(default = "default_garage_status_topic")]
    pub garage_status_topic: String,
    #[serde(default = "default_log_topic")]
    pub log_topic: String,
    #[serde(default = "default_command_topic")]
    pub command_topic: String,
    #[serde(default = "default_will_topic")]
    pub will_topic: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: None,
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_period_ms: default_reconnect_period_ms(),
            gate_status_topic: default_gate_status_topic(),
            garage_status_topic: default_garage_status_topic(),
            log_topic: default_log_topic(),
            command_topic: default_command_topic(),
            will_topic: default_will_topic(),
        }
    }
}

impl MqttSection {
    pub fn topics(&self) -> TopicSet {
        TopicSet {
            gate_status: self.gate_status_topic.clone(),
            garage_status: self.garage_status_topic.clone(),
            log: self.log_topic.clone(),
            command: self.command_topic.clone(),
            will: self.will_topic.clone(),
        }
    }

    pub fn username(&self) -> Option<String> {
        get_env_var_optional(self.username_env.as_ref())
    }

    pub fn password(&self) -> Option<String> {
        get_env_var_optional(self.password_env.as_ref())
    }
}

fn default_keep_alive_secs() -> u64 {
    45
}

fn default_reconnect_period_ms() -> u64 {
    3000
}

fn default_gate_status_topic() -> String {
    crate::protocol::topics::GATE_STATUS_TOPIC.to_string()
}

fn default_garage_status_topic() -> String {
    crate::protocol::topics::GARAGE_STATUS_TOPIC.to_string()
}

fn default_log_topic() -> String {
    crate::protocol::topics::LOG_TOPIC.to_string()
}

fn default_command_topic() -> String {
    crate::protocol::topics::COMMAND_TOPIC.to_string()
}

fn default_will_topic() -> String {
    crate::protocol::topics::WILL_TOPIC.to_string()
}

/// HTTP polling proxy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxySection {
    /// Proxy base URL, e.g. `https://gate.example.com/api`
    pub base_url: Option<String>,
    #[serde(default = "default_status_path")]
    pub status_path: String,
    #[serde(default = "default_publish_path")]
    pub publish_path: String,
    #[serde(default = "default_foreground_interval_ms")]
    pub foreground_interval_ms: u64,
    #[serde(default = "default_background_interval_ms")]
    pub background_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            base_url: None,
            status_path: default_status_path(),
            publish_path: default_publish_path(),
            foreground_interval_ms: default_foreground_interval_ms(),
            background_interval_ms: default_background_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

fn default_status_path() -> String {
    "/mqtt-status".to_string()
}

fn default_publish_path() -> String {
    "/mqtt-publish".to_string()
}

fn default_foreground_interval_ms() -> u64 {
    7000
}

fn default_background_interval_ms() -> u64 {
    20000
}

fn default_request_timeout_ms() -> u64 {
    10000
}

fn default_cache_ttl_ms() -> u64 {
    3000
}

/// Retry manager and circuit breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResilienceSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Randomize retry delays; off keeps the documented delay sequence
    #[serde(default)]
    pub jitter: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    60000
}

/// Connection pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSection {
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            capacity: default_pool_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_pool_capacity() -> usize {
    3
}

fn default_connect_timeout_ms() -> u64 {
    15000
}

/// Health monitor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
    /// Mean latency above which quality drops to Poor
    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            latency_window: default_latency_window(),
            degraded_latency_ms: default_degraded_latency_ms(),
        }
    }
}

fn default_probe_interval_ms() -> u64 {
    30000
}

fn default_latency_window() -> usize {
    10
}

fn default_degraded_latency_ms() -> u64 {
    3000
}

/// Initial values for the timing thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ThresholdsSection {
    #[serde(default = "default_auto_close_time_limit_s")]
    pub auto_close_time_limit_s: u32,
    #[serde(default = "default_retry_time_limit_s")]
    pub retry_time_limit_s: u32,
    #[serde(default = "default_open_check_time_limit_s")]
    pub open_check_time_limit_s: u32,
}

impl Default for ThresholdsSection {
    fn default() -> Self {
        Self {
            auto_close_time_limit_s: default_auto_close_time_limit_s(),
            retry_time_limit_s: default_retry_time_limit_s(),
            open_check_time_limit_s: default_open_check_time_limit_s(),
        }
    }
}

fn default_auto_close_time_limit_s() -> u32 {
    250
}

fn default_retry_time_limit_s() -> u32 {
    3
}

fn default_open_check_time_limit_s() -> u32 {
    10
}

/// Who may issue which command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessSection {
    /// Permissions for actors not listed in `actors`
    #[serde(default = "default_permissions")]
    pub default_permissions: Vec<Permission>,
    #[serde(default)]
    pub actors: HashMap<String, Vec<Permission>>,
}

impl Default for AccessSection {
    fn default() -> Self {
        Self {
            default_permissions: default_permissions(),
            actors: HashMap::new(),
        }
    }
}

fn default_permissions() -> Vec<Permission> {
    vec![Permission::Gate, Permission::Garage, Permission::Stop]
}

impl AccessSection {
    pub fn allows(&self, actor: &str, kind: CommandKind) -> bool {
        let granted = self
            .actors
            .get(actor)
            .unwrap_or(&self.default_permissions);
        granted.contains(&kind.permission())
    }
}

/// Local status endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_server_port(),
        }
    }
}

fn default_server_port() -> u16 {
    9090
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GateConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let has_broker = self.mqtt.broker_url.is_some();
        let has_proxy = self.proxy.base_url.is_some();

        match self.client.transport {
            TransportPreference::Auto if !has_broker && !has_proxy => {
                return Err(ConfigError::InvalidConfig(
                    "either [mqtt].broker_url or [proxy].base_url must be set".to_string(),
                ));
            }
            TransportPreference::Direct if !has_broker => {
                return Err(ConfigError::InvalidConfig(
                    "transport = \"direct\" requires [mqtt].broker_url".to_string(),
                ));
            }
            TransportPreference::HttpProxy if !has_proxy => {
                return Err(ConfigError::InvalidConfig(
                    "transport = \"http_proxy\" requires [proxy].base_url".to_string(),
                ));
            }
            _ => {}
        }

        if let Some(url) = &self.mqtt.broker_url {
            let parsed = url::Url::parse(url)
                .map_err(|e| ConfigError::InvalidConfig(format!("broker_url '{url}': {e}")))?;
            if !matches!(parsed.scheme(), "mqtt" | "mqtts" | "tcp" | "ssl") {
                return Err(ConfigError::InvalidConfig(format!(
                    "broker_url scheme '{}' is not supported",
                    parsed.scheme()
                )));
            }
        }

        if let Some(url) = &self.proxy.base_url {
            url::Url::parse(url)
                .map_err(|e| ConfigError::InvalidConfig(format!("proxy base_url '{url}': {e}")))?;
        }

        validate_client_id(&self.client.id)?;

        let positive = [
            ("proxy.foreground_interval_ms", self.proxy.foreground_interval_ms),
            ("proxy.background_interval_ms", self.proxy.background_interval_ms),
            ("proxy.request_timeout_ms", self.proxy.request_timeout_ms),
            ("pool.connect_timeout_ms", self.pool.connect_timeout_ms),
            ("health.probe_interval_ms", self.health.probe_interval_ms),
            ("resilience.base_delay_ms", self.resilience.base_delay_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.pool.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "pool.capacity must be at least 1".to_string(),
            ));
        }
        if self.health.latency_window == 0 {
            return Err(ConfigError::InvalidConfig(
                "health.latency_window must be at least 1".to_string(),
            ));
        }
        if self.resilience.max_retries == 0 {
            return Err(ConfigError::InvalidConfig(
                "resilience.max_retries must be at least 1".to_string(),
            ));
        }
        if !(self.resilience.backoff_multiplier >= 1.0) {
            return Err(ConfigError::InvalidConfig(
                "resilience.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.resilience.failure_threshold == 0 {
            return Err(ConfigError::InvalidConfig(
                "resilience.failure_threshold must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.connect_timeout_ms)
    }

    /// Create a proxy-only configuration pointing at `base_url`
    pub fn for_proxy(base_url: impl Into<String>) -> Self {
        let mut config = GateConfig::default();
        config.client.transport = TransportPreference::HttpProxy;
        config.proxy.base_url = Some(base_url.into());
        config
    }

    /// Create a direct-only configuration pointing at `broker_url`
    pub fn for_broker(broker_url: impl Into<String>) -> Self {
        let mut config = GateConfig::default();
        config.client.transport = TransportPreference::Direct;
        config.mqtt.broker_url = Some(broker_url.into());
        config
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

/// Client ids become part of the broker session id
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidConfig(format!(
            "client id '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
