//! Configuration module
//!
//! Handles loading and saving SensorLink configuration. The file only feeds
//! the explicit structs channels and discovery take at construction.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::discovery::DiscoveryConfig;
use crate::network::{Endpoint, NetworkConfig};
use crate::protocol::{
    ControllerConfiguration, DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT, DEFAULT_DISCOVERY_PORT,
    PROTOCOL_VERSION,
};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid value for {field}: {value:?}")]
    Invalid { field: &'static str, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    /// Diagnostic tracing pushed to devices in the handshake
    #[serde(default)]
    pub tracing: TracingSettings,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Name a device reports in its controller info
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Interface servers bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Control channel TCP port
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Data channel TCP (and UDP) port
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    /// Minimum time between two samples of one continuous data type (0 = off)
    #[serde(default)]
    pub min_interval_ms: u64,
    /// Carry continuous streams over UDP
    #[serde(default = "default_true")]
    pub enable_udp: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_data_port() -> u16 {
    DEFAULT_DATA_PORT
}

fn default_true() -> bool {
    true
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            control_port: default_control_port(),
            data_port: default_data_port(),
            min_interval_ms: 0,
            enable_udp: default_true(),
        }
    }
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Answer discovery probes when running as a server
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    /// Probe targets (empty = limited broadcast on `port`)
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default = "default_discovery_timeout")]
    pub timeout_ms: u64,
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_discovery_timeout() -> u64 {
    3000
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            port: default_discovery_port(),
            targets: Vec::new(),
            timeout_ms: default_discovery_timeout(),
        }
    }
}

/// Tracing options for connected devices
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracingSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Where devices upload diagnostic logs
    #[serde(default)]
    pub endpoint: String,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("sensorlink/config.toml")),
            Some(PathBuf::from("./sensorlink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    fn bind_ip(&self) -> ConfigResult<IpAddr> {
        self.network
            .bind_address
            .parse()
            .map_err(|_| ConfigError::Invalid {
                field: "network.bind_address",
                value: self.network.bind_address.clone(),
            })
    }

    pub fn control_endpoint(&self) -> ConfigResult<Endpoint> {
        Ok(Endpoint::new(self.bind_ip()?, self.network.control_port))
    }

    pub fn data_endpoint(&self) -> ConfigResult<Endpoint> {
        Ok(Endpoint::new(self.bind_ip()?, self.network.data_port))
    }

    pub fn network_config(&self) -> NetworkConfig {
        let config = NetworkConfig::default().with_min_interval_ms(self.network.min_interval_ms);
        if self.network.enable_udp {
            config
        } else {
            config.without_udp()
        }
    }

    /// The configuration a server pushes to each device it accepts
    pub fn controller_configuration(&self) -> ControllerConfiguration {
        let config = ControllerConfiguration::new(PROTOCOL_VERSION);
        if self.tracing.enabled {
            config.with_tracing(self.tracing.endpoint.clone())
        } else {
            config
        }
    }

    pub fn discovery_config(&self) -> ConfigResult<DiscoveryConfig> {
        let settings = &self.discovery;
        let targets = if settings.targets.is_empty() {
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), settings.port)]
        } else {
            settings
                .targets
                .iter()
                .map(|target| {
                    target.parse().map_err(|_| ConfigError::Invalid {
                        field: "discovery.targets",
                        value: target.clone(),
                    })
                })
                .collect::<ConfigResult<Vec<SocketAddr>>>()?
        };

        Ok(DiscoveryConfig {
            port: settings.port,
            targets,
            timeout: Duration::from_millis(settings.timeout_ms),
            protocol_version: PROTOCOL_VERSION,
        })
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralSettings {
            device_name: "living-room-tablet".to_string(),
            verbose: false,
        },
        network: NetworkSettings {
            min_interval_ms: 10,
            ..Default::default()
        },
        discovery: DiscoverySettings {
            targets: vec!["192.168.1.255:24812".to_string()],
            ..Default::default()
        },
        tracing: TracingSettings {
            enabled: false,
            endpoint: "http://192.168.1.10:8080/logs".to_string(),
        },
    };

    Ok(toml::to_string_pretty(&config)?)
}
