//! Configuration management for devbridge

use crate::error::{BridgeError, Result};
use crate::logging::LoggingConfig;
use crate::protocols::ProtocolKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Device port the app's reloader daemon listens on
pub const DEFAULT_RELOAD_DEVICE_PORT: u16 = 13592;
/// Device port the embedded JavaScript engine exposes its debugger on
pub const DEFAULT_DEBUGGER_DEVICE_PORT: u16 = 13593;

/// Main configuration structure for devbridge
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DevBridgeConfig {
    /// Outward-facing proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// ADB tunnel configuration
    #[serde(default)]
    pub adb: AdbConfig,
    /// iOS simulator discovery configuration
    #[serde(default)]
    pub simulator: SimulatorConfig,
    /// Per-target settings
    #[serde(default)]
    pub target: TargetConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Proxy server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the proxy binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port the proxy listens on, 0 picks a free port
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    /// How often discovery responders refresh the device list, in milliseconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
}

/// ADB tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdbConfig {
    /// Whether the auto-connector runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Path to the `adb` executable
    #[serde(default = "default_adb_binary")]
    pub binary: PathBuf,
    /// Device-side port of the reload channel
    #[serde(default = "default_reload_port")]
    pub reload_device_port: u16,
    /// Device-side port of the debugger channel
    #[serde(default = "default_debugger_port")]
    pub debugger_device_port: u16,
    /// Device/tunnel poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Delay before reconnecting a dropped daemon connection, in milliseconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

/// iOS simulator socket discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Whether simulator discovery runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Path to the `lsof` executable
    #[serde(default = "default_lsof_binary")]
    pub lsof_binary: PathBuf,
    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Timeout for proxy-initiated calls, in milliseconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    /// Largest accepted device frame, in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Protocol adapter attached to Android targets
    #[serde(default)]
    pub protocol: ProtocolKind,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_proxy_port() -> u16 {
    13595
}
fn default_refresh_interval() -> u64 {
    5000
}
fn default_adb_binary() -> PathBuf {
    PathBuf::from("adb")
}
fn default_lsof_binary() -> PathBuf {
    PathBuf::from("lsof")
}
fn default_reload_port() -> u16 {
    DEFAULT_RELOAD_DEVICE_PORT
}
fn default_debugger_port() -> u16 {
    DEFAULT_DEBUGGER_DEVICE_PORT
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_reconnect_delay() -> u64 {
    1000
}
fn default_call_timeout() -> u64 {
    10_000
}
fn default_max_frame_size() -> usize {
    64 * 1024 * 1024
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_proxy_port(),
            refresh_interval_ms: default_refresh_interval(),
        }
    }
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_adb_binary(),
            reload_device_port: default_reload_port(),
            debugger_device_port: default_debugger_port(),
            poll_interval_ms: default_poll_interval(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lsof_binary: default_lsof_binary(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout(),
            max_frame_size: default_max_frame_size(),
            protocol: ProtocolKind::default(),
        }
    }
}

impl AdbConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl SimulatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl TargetConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl ProxyConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// `host:port` the listener binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl DevBridgeConfig {
    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from: {}", path.display());

        let contents = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::config(format!("Failed to read config file: {}", e)))?;

        let config: DevBridgeConfig = toml::from_str(&contents)
            .map_err(|e| BridgeError::config(format!("Failed to parse config file: {}", e)))?;

        info!("Configuration loaded successfully from: {}", path.display());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        debug!("Saving configuration to: {}", path.display());

        let contents = toml::to_string_pretty(self)
            .map_err(|e| BridgeError::config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BridgeError::config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        std::fs::write(path, contents)
            .map_err(|e| BridgeError::config(format!("Failed to write config file: {}", e)))?;

        info!("Configuration saved successfully to: {}", path.display());
        Ok(())
    }

    /// Load configuration with fallback paths
    pub fn load_with_fallback() -> Self {
        let mut config_paths = vec![
            PathBuf::from("devbridge.toml"),
            PathBuf::from(".devbridge.toml"),
        ];

        if let Some(config_dir) = dirs::config_dir() {
            config_paths.push(config_dir.join("devbridge").join("config.toml"));
        }
        if let Some(home_dir) = dirs::home_dir() {
            config_paths.push(home_dir.join(".devbridge.toml"));
        }

        for config_path in config_paths {
            if config_path.exists() {
                match Self::load_from_file(&config_path) {
                    Ok(config) => {
                        info!("Using configuration from: {}", config_path.display());
                        return config;
                    }
                    Err(e) => {
                        warn!(
                            "Failed to load config from {}: {}",
                            config_path.display(),
                            e
                        );
                    }
                }
            }
        }

        info!("No configuration file found, using defaults");
        Self::default()
    }

    /// Merge configuration with environment variables
    pub fn merge_with_env(&mut self) {
        if let Ok(port) = std::env::var("DEVBRIDGE_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.proxy.port = port,
                Err(_) => warn!("Ignoring invalid DEVBRIDGE_PORT value: {}", port),
            }
        }

        if let Ok(adb) = std::env::var("DEVBRIDGE_ADB") {
            self.adb.binary = PathBuf::from(adb);
        }

        debug!("Configuration merged with environment variables");
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.adb.reload_device_port == 0 || self.adb.debugger_device_port == 0 {
            return Err(BridgeError::config("Device ports cannot be 0"));
        }

        if self.adb.reload_device_port == self.adb.debugger_device_port {
            return Err(BridgeError::config(
                "Reload and debugger device ports must differ",
            ));
        }

        if self.adb.poll_interval_ms == 0 || self.simulator.poll_interval_ms == 0 {
            return Err(BridgeError::config("Poll intervals must be greater than 0"));
        }

        if self.proxy.refresh_interval_ms == 0 {
            return Err(BridgeError::config(
                "Refresh interval must be greater than 0",
            ));
        }

        if self.target.call_timeout_ms == 0 {
            return Err(BridgeError::config("Call timeout must be greater than 0"));
        }

        debug!("Configuration validation completed successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = DevBridgeConfig::default();
        assert_eq!(config.proxy.port, 13595);
        assert_eq!(config.adb.reload_device_port, DEFAULT_RELOAD_DEVICE_PORT);
        assert_eq!(config.adb.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.adb.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(config.simulator.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.proxy.refresh_interval(), Duration::from_secs(5));
        assert_eq!(config.target.protocol, ProtocolKind::Hermes);
    }

    #[test]
    fn test_config_serialization() {
        let config = DevBridgeConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: DevBridgeConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.proxy.port, deserialized.proxy.port);
        assert_eq!(
            config.adb.debugger_device_port,
            deserialized.adb.debugger_device_port
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: DevBridgeConfig =
            toml::from_str("[proxy]\nport = 9000\n\n[target]\nprotocol = \"generic\"\n").unwrap();
        assert_eq!(config.proxy.port, 9000);
        assert_eq!(config.target.protocol, ProtocolKind::Generic);
        assert_eq!(config.target.call_timeout(), Duration::from_secs(10));
        assert_eq!(config.proxy.bind_address, "127.0.0.1");
        assert_eq!(config.adb.binary, PathBuf::from("adb"));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = DevBridgeConfig::default();
        config.proxy.port = 9333;
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();

        let loaded_config = DevBridgeConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded_config.proxy.port, 9333);
    }

    #[test]
    fn test_config_validation() {
        let mut config = DevBridgeConfig::default();
        assert!(config.validate().is_ok());

        config.adb.debugger_device_port = config.adb.reload_device_port;
        assert!(config.validate().is_err());

        config.adb.debugger_device_port = DEFAULT_DEBUGGER_DEVICE_PORT;
        config.target.call_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
