//! Configuration management for taplink.
//!
//! Settings are read from a TOML file, optionally overridden from
//! `TAPLINK_*` environment variables, and validated before use.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::device::DeviceKind;
use crate::proto::framing::{HEADER_SIZE, MAX_FRAME_SIZE};

/// Longest interface name the kernel accepts, excluding the terminator.
const MAX_DEVICE_NAME: usize = 15;

/// Why a configuration could not be loaded, saved or accepted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found at {0}")]
    NotFound(PathBuf),

    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("cannot write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("malformed config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A setting the selected role cannot run without
    #[error("missing required setting: {0}")]
    MissingValue(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Which end of the link this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Dials a server
    #[default]
    Client,
    /// Accepts peers
    Server,
}

/// Forwarding engine used by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// Two tasks per peer
    #[default]
    Threaded,
    /// One readiness loop for all peers
    Multiplexed,
}

impl std::str::FromStr for EngineMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "threaded" => Ok(EngineMode::Threaded),
            "multiplexed" => Ok(EngineMode::Multiplexed),
            other => Err(invalid(
                "engine.mode",
                format!("unknown mode {other:?} (expected threaded or multiplexed)"),
            )),
        }
    }
}

/// Network configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Port to listen on or dial (default: 9981)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address to bind to (default: "0.0.0.0")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Listen backlog (default: 128)
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

fn default_port() -> u16 {
    9981
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> u32 {
    128
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            port: default_port(),
            bind_address: default_bind_address(),
            backlog: default_backlog(),
        }
    }
}

impl NetworkConfig {
    /// Socket address the server listens on.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|e| invalid("network.bind_address", format!("{e}")))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Client-specific configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Server to connect to, either `host` or `host:port`
    pub server_address: Option<String>,

    /// Reconnect automatically on disconnect (default: false)
    #[serde(default)]
    pub auto_reconnect: bool,

    /// Reconnect interval in seconds (default: 5)
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
}

fn default_reconnect_interval() -> u64 {
    5
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_address: None,
            auto_reconnect: false,
            reconnect_interval: default_reconnect_interval(),
        }
    }
}

impl ClientConfig {
    /// Address to dial. A bare host gets `port` appended.
    pub fn peer_address(&self, port: u16) -> Option<String> {
        let addr = self.server_address.as_deref()?.trim();
        if addr.parse::<SocketAddr>().is_ok() {
            return Some(addr.to_string());
        }
        match addr.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => Some(format!("[{ip}]:{port}")),
            Ok(IpAddr::V4(ip)) => Some(format!("{ip}:{port}")),
            Err(_) if addr.contains(':') => Some(addr.to_string()),
            Err(_) => Some(format!("{addr}:{port}")),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }
}

/// Virtual interface settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DeviceConfig {
    /// Requested interface name; empty lets the kernel pick one
    #[serde(default)]
    pub name: String,

    /// Layer-2 (`tap`, default) or layer-3 (`tun`) interface
    #[serde(default)]
    pub kind: DeviceKind,
}

/// Forwarding engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub mode: EngineMode,

    /// Maximum readiness events handled per wait (default: 64)
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Upper bound on one multiplexer wait, in milliseconds (default: 100)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bytes queued for a peer that is not reading before its link is
    /// dropped (default: 256 KiB)
    #[serde(default = "default_max_backlog_bytes")]
    pub max_backlog_bytes: usize,
}

fn default_max_events() -> usize {
    64
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_backlog_bytes() -> usize {
    256 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            mode: EngineMode::default(),
            max_events: default_max_events(),
            poll_interval_ms: default_poll_interval_ms(),
            max_backlog_bytes: default_max_backlog_bytes(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Main configuration structure for taplink.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Role of this instance
    #[serde(default)]
    pub role: Role,

    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub network: NetworkConfig,

    /// Used when role is Client
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            role: Role::default(),
            log_level: default_log_level(),
            network: NetworkConfig::default(),
            client: ClientConfig::default(),
            device: DeviceConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file, apply environment overrides and
    /// validate the result.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse `path` and apply environment overrides without validating, for
    /// callers that layer further overrides on top first.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        // Environment takes precedence over the file
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        Self::apply_env_overrides(&mut config);
        config
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.role {
            Role::Server => {
                if self.network.port == 0 {
                    return Err(invalid("network.port", "server must have a valid port"));
                }
                self.network.listen_addr()?;
            }
            Role::Client => {
                let missing = self
                    .client
                    .server_address
                    .as_deref()
                    .map_or(true, |addr| addr.trim().is_empty());
                if missing {
                    return Err(ConfigError::MissingValue(
                        "client.server_address".to_string(),
                    ));
                }
            }
        }

        if self.device.name.len() > MAX_DEVICE_NAME {
            return Err(invalid(
                "device.name",
                format!("must be at most {MAX_DEVICE_NAME} bytes"),
            ));
        }

        if self.engine.max_events == 0 {
            return Err(invalid("engine.max_events", "must be greater than 0"));
        }

        if self.engine.poll_interval_ms == 0 {
            return Err(invalid("engine.poll_interval_ms", "must be greater than 0"));
        }

        let one_frame = HEADER_SIZE + MAX_FRAME_SIZE;
        if self.engine.max_backlog_bytes < one_frame {
            return Err(invalid(
                "engine.max_backlog_bytes",
                format!("must hold at least one frame ({one_frame} bytes)"),
            ));
        }

        Ok(())
    }

    /// Apply environment variable overrides (prefix: TAPLINK_)
    /// Example keys:
    /// - TAPLINK_ROLE, TAPLINK_LOG_LEVEL
    /// - TAPLINK_NETWORK_PORT, TAPLINK_NETWORK_BIND_ADDRESS
    /// - TAPLINK_CLIENT_SERVER_ADDRESS, TAPLINK_CLIENT_AUTO_RECONNECT
    /// - TAPLINK_DEVICE_NAME, TAPLINK_DEVICE_KIND, TAPLINK_ENGINE_MODE
    fn apply_env_overrides(cfg: &mut Config) {
        use std::env;

        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            }
        }

        if let Ok(v) = env::var("TAPLINK_ROLE") {
            cfg.role = match v.to_ascii_lowercase().as_str() {
                "server" => Role::Server,
                _ => Role::Client,
            };
        }
        if let Ok(v) = env::var("TAPLINK_LOG_LEVEL") {
            cfg.log_level = v;
        }

        if let Ok(v) = env::var("TAPLINK_NETWORK_PORT") {
            if let Ok(n) = v.parse() {
                cfg.network.port = n;
            }
        }
        if let Ok(v) = env::var("TAPLINK_NETWORK_BIND_ADDRESS") {
            cfg.network.bind_address = v;
        }

        if let Ok(v) = env::var("TAPLINK_CLIENT_SERVER_ADDRESS") {
            if !v.is_empty() {
                cfg.client.server_address = Some(v);
            }
        }
        if let Ok(v) = env::var("TAPLINK_CLIENT_AUTO_RECONNECT") {
            if let Some(b) = parse_bool(&v) {
                cfg.client.auto_reconnect = b;
            }
        }

        if let Ok(v) = env::var("TAPLINK_DEVICE_NAME") {
            cfg.device.name = v;
        }
        if let Ok(v) = env::var("TAPLINK_DEVICE_KIND") {
            cfg.device.kind = match v.to_ascii_lowercase().as_str() {
                "tun" => DeviceKind::Tun,
                "tap" => DeviceKind::Tap,
                _ => cfg.device.kind,
            };
        }
        if let Ok(v) = env::var("TAPLINK_ENGINE_MODE") {
            if let Ok(mode) = v.parse() {
                cfg.engine.mode = mode;
            }
        }
    }

    /// Reload configuration from the same file it was loaded from
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        *self = Self::load(path)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("taplink").join("config.toml")
        } else {
            PathBuf::from("taplink.toml")
        }
    }
}

/// Configuration manager for handling configuration loading and reloading.
#[derive(Debug)]
pub struct ConfigManager {
    config: Config,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager with the default configuration
    pub fn new() -> Self {
        ConfigManager {
            config: Config::default(),
            config_path: Config::default_path(),
        }
    }

    /// Load configuration from the specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;

        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(Config::default_path())
    }

    /// Read `path`, or start from defaults (remembering `path`) if the file
    /// does not exist. Environment overrides apply either way.
    ///
    /// The result is not validated: the caller may still change the role or
    /// other settings, and validates once it has.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let config = match Config::read(&config_path) {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => Config::from_env(),
            Err(e) => return Err(e),
        };
        Ok(ConfigManager {
            config,
            config_path,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Reload configuration from the current path
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.config.reload(&self.config_path)
    }

    /// Save the current configuration to the current path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.save(&self.config_path)
    }

    /// Save the current configuration to a new path
    pub fn save_as<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        self.config.save(path)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
