//! Configuration structures for the registry client and server

use crate::error::Result;
use crate::models::RegistryAddress;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Port assumed for registry addresses given without one
pub const DEFAULT_REGISTRY_PORT: u16 = 9090;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Server configuration (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
    /// Client configuration (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,
}

/// Registry server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:9090")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Alternate registry addresses advertised to clients on login
    #[serde(default)]
    pub sync_registries: Vec<String>,
}

/// Registry client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Candidate registry addresses (`host[:port]`)
    pub registries: Vec<String>,
    /// Port used for addresses without one
    #[serde(default = "default_registry_port")]
    pub default_port: u16,
    /// Login user name
    #[serde(default)]
    pub username: Option<String>,
    /// Login password
    #[serde(default)]
    pub password: Option<String>,
    /// Application name reported to the registry and stamped on URLs
    pub app_name: String,
    /// Base reconnect / retry period in milliseconds
    #[serde(default = "default_retry_period_ms")]
    pub retry_period_ms: u64,
    /// Response timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Idle heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Directory for the durable provider cache (disabled when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_cache_dir: Option<PathBuf>,
    /// Host written into consumer URLs
    #[serde(default = "default_local_host")]
    pub local_host: String,
    /// Thread pool size advertised on published providers
    #[serde(default = "default_provider_threads")]
    pub provider_threads: u32,
}

fn default_listen_addr() -> String {
    format!("0.0.0.0:{DEFAULT_REGISTRY_PORT}")
}

fn default_registry_port() -> u16 {
    DEFAULT_REGISTRY_PORT
}

fn default_retry_period_ms() -> u64 {
    5000
}

fn default_timeout_ms() -> u64 {
    10000
}

fn default_heartbeat_interval_ms() -> u64 {
    60000
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_provider_threads() -> u32 {
    200
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            sync_registries: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Server listening on `listen_addr`
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Self::default()
        }
    }

    /// Advertise alternate registries to every client that logs in
    pub fn with_sync_registries(mut self, registries: Vec<String>) -> Self {
        self.sync_registries = registries;
        self
    }
}

impl ClientConfig {
    /// Client for a comma-separated registry list
    pub fn new(address: &str, app_name: impl Into<String>) -> Self {
        Self {
            registries: address
                .split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
                .map(str::to_string)
                .collect(),
            default_port: default_registry_port(),
            username: None,
            password: None,
            app_name: app_name.into(),
            retry_period_ms: default_retry_period_ms(),
            timeout_ms: default_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            local_cache_dir: None,
            local_host: default_local_host(),
            provider_threads: default_provider_threads(),
        }
    }

    /// Set login credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the reconnect / retry period
    pub fn with_retry_period(mut self, period: Duration) -> Self {
        self.retry_period_ms = period.as_millis() as u64;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable the durable provider cache
    pub fn with_local_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_cache_dir = Some(dir.into());
        self
    }

    /// Parsed registry addresses
    pub fn registry_addresses(&self) -> Result<Vec<RegistryAddress>> {
        self.registries
            .iter()
            .map(|addr| RegistryAddress::parse(addr, self.default_port))
            .collect()
    }

    /// Reconnect / retry period
    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms)
    }

    /// Response timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Heartbeat interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl RegistryConfig {
    /// Load configuration from file
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use async_fs::File;
        use futures::io::AsyncReadExt;

        let mut file = File::open(path.as_ref()).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;

        // YAML by extension, JSON otherwise
        if path.as_ref().extension().and_then(|s| s.to_str()) == Some("yaml")
            || path.as_ref().extension().and_then(|s| s.to_str()) == Some("yml")
        {
            Ok(serde_yaml::from_str(&contents)?)
        } else {
            Ok(serde_json::from_str(&contents)?)
        }
    }
}
