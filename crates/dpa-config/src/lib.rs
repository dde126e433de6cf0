use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

/// Configuration error
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    LoadError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Common application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    #[validate(length(min = 1))]
    pub service_name: String,
    #[validate(length(min = 1))]
    pub log_level: String,
    /// `json` or `text`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[validate(range(min = 1, max = 65535))]
    pub metrics_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "dpa".to_string(),
            log_level: "info".to_string(),
            log_format: default_log_format(),
            metrics_port: 9090,
        }
    }
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_port() -> u16 {
    3868
}

fn default_interval_ms() -> u64 {
    30_000
}

fn default_listen_addr() -> String {
    "0.0.0.0:3868".to_string()
}

fn default_product_name() -> String {
    "dpa".to_string()
}

/// A statically configured remote Diameter node
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PeerConfig {
    /// DiameterIdentity of the remote node (its Origin-Host)
    #[validate(length(min = 1))]
    pub host: String,
    /// Resolvable address; defaults to `host`
    pub address: Option<String>,
    #[serde(default = "default_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
}

impl PeerConfig {
    /// `address:port` used for outbound connections
    pub fn connect_addr(&self) -> String {
        format!("{}:{}", self.address.as_deref().unwrap_or(&self.host), self.port)
    }
}

/// Local Diameter node configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NodeConfig {
    /// Local DiameterIdentity, also the election key
    #[validate(length(min = 1))]
    pub identity: String,
    #[validate(length(min = 1))]
    pub realm: String,
    #[serde(default = "default_listen_addr")]
    #[validate(length(min = 1))]
    pub listen_addr: String,
    #[serde(default = "default_product_name")]
    pub product_name: String,
    #[serde(default)]
    pub vendor_id: u32,
    #[serde(default)]
    pub auth_application_ids: Vec<u32>,
    /// Tw: idle time before a DWR is due
    #[serde(default = "default_interval_ms")]
    #[validate(range(min = 1))]
    pub watchdog_interval_ms: u64,
    /// Backoff before a failed peer is reconnected
    #[serde(default = "default_interval_ms")]
    #[validate(range(min = 1))]
    pub reconnect_delay_ms: u64,
    /// Limit for establishing an outbound TCP connection
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,
    /// Age after which an unanswered request is expired; also bounds the wait states
    #[serde(default = "default_interval_ms")]
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,
    #[serde(default)]
    #[validate(nested)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    #[validate(nested)]
    pub app: AppConfig,
}

impl NodeConfig {
    pub fn new(identity: &str, realm: &str) -> Self {
        Self {
            identity: identity.to_string(),
            realm: realm.to_string(),
            listen_addr: default_listen_addr(),
            product_name: default_product_name(),
            vendor_id: 0,
            auth_application_ids: Vec::new(),
            watchdog_interval_ms: default_interval_ms(),
            reconnect_delay_ms: default_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_interval_ms(),
            peers: Vec::new(),
            app: AppConfig::default(),
        }
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Load configuration from file
pub fn load_config<T>(path: &str) -> Result<T, ConfigError>
where
    T: for<'de> Deserialize<'de> + Validate,
{
    let config: T = config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(config::Environment::with_prefix("DPA").separator("__"))
        .build()
        .map_err(|e| ConfigError::LoadError(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::LoadError(e.to_string()))?;

    config
        .validate()
        .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
    Ok(config)
}

/// Load configuration from YAML string (for testing)
pub fn load_from_yaml<T>(yaml: &str) -> Result<T, ConfigError>
where
    T: for<'de> Deserialize<'de> + Validate,
{
    let config: T =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::LoadError(e.to_string()))?;
    config
        .validate()
        .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
    Ok(config)
}
