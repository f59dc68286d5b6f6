//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, supporting a TOML
//! configuration file at `~/.config/relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [transport]
//! socket_path = "/run/user/1000/relay/relay.sock"
//! ws_addr = "127.0.0.1:8765"
//! max_connections = 100
//! connection_channel_capacity = 256
//!
//! [hub]
//! send_timeout_ms = 500
//!
//! [requests]
//! request_timeout_ms = 3000
//! default_history_limit = 20
//! max_history_limit = 1000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hub::{HubConfig, DEFAULT_SEND_TIMEOUT};
use crate::service::{
    ServiceConfig, DEFAULT_HISTORY_LIMIT, DEFAULT_REQUEST_TIMEOUT, MAX_HISTORY_LIMIT,
};

/// Default WebSocket gateway address
pub const DEFAULT_WS_ADDR: &str = "127.0.0.1:8765";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Transport section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// Unix socket path for the streaming gateway
    pub socket_path: Option<String>,

    /// Listen address of the WebSocket request gateway
    pub ws_addr: Option<String>,

    /// Maximum concurrent streaming connections
    pub max_connections: Option<usize>,

    /// Outbound event buffer per connection
    pub connection_channel_capacity: Option<usize>,
}

/// Hub section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubToml {
    /// Per-recipient send timeout in milliseconds
    pub send_timeout_ms: Option<u64>,
}

/// Request section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestsToml {
    /// Deadline for one unary request in milliseconds
    pub request_timeout_ms: Option<u64>,

    /// History size used when a request gives no limit
    pub default_history_limit: Option<usize>,

    /// Largest history a request may ask for
    pub max_history_limit: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Transport configuration section
    pub transport: TransportToml,

    /// Hub configuration section
    pub hub: HubToml,

    /// Request configuration section
    pub requests: RequestsToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the relay
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct RelayConfigFile {
    /// Unix socket path for the streaming gateway
    pub socket_path: PathBuf,

    /// Listen address of the WebSocket request gateway
    pub ws_addr: String,

    /// Whether the WebSocket request gateway is started
    pub websocket_enabled: bool,

    /// Maximum concurrent streaming connections
    pub max_connections: usize,

    /// Outbound event buffer per connection
    pub connection_channel_capacity: usize,

    /// Per-recipient send timeout
    pub send_timeout: Duration,

    /// Deadline for one unary request
    pub request_timeout: Duration,

    /// History size used when a request gives no limit
    pub default_history_limit: usize,

    /// Largest history a request may ask for
    pub max_history_limit: usize,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfigFile {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            ws_addr: DEFAULT_WS_ADDR.to_string(),
            websocket_enabled: true,
            max_connections: 100,
            connection_channel_capacity: 256,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            default_history_limit: DEFAULT_HISTORY_LIMIT,
            max_history_limit: MAX_HISTORY_LIMIT,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfigFile {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Hub settings derived from this configuration
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            send_timeout: self.send_timeout,
        }
    }

    /// Message service settings derived from this configuration
    #[must_use]
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            request_timeout: self.request_timeout,
            default_history_limit: self.default_history_limit,
            max_history_limit: self.max_history_limit,
        }
    }

    /// Check the configuration for values the relay cannot run with
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.connection_channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "connection_channel_capacity must be greater than 0".into(),
            ));
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "send_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "request_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.default_history_limit == 0 {
            return Err(ConfigError::ValidationError(
                "default_history_limit must be greater than 0".into(),
            ));
        }
        if self.default_history_limit > self.max_history_limit {
            return Err(ConfigError::ValidationError(format!(
                "default_history_limit ({}) exceeds max_history_limit ({})",
                self.default_history_limit, self.max_history_limit
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay/relay.toml` or `~/.config/relay/relay.toml`
/// if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Get the default socket path
///
/// Uses `$XDG_RUNTIME_DIR/relay/relay.sock` if available, otherwise
/// `/tmp/relay-$UID/relay.sock`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("relay").join("relay.sock")
    } else {
        // SAFETY: getuid has no preconditions and cannot fail
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/relay-{uid}/relay.sock"))
    }
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<RelayConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfigFile, ConfigError> {
    let mut config = load_file_layer(path)?;
    apply_env_config(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Defaults plus the TOML file, without environment overrides
fn load_file_layer(path: Option<PathBuf>) -> Result<RelayConfigFile, ConfigError> {
    let mut config = RelayConfigFile::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfigFile, toml: &RelayToml) {
    if let Some(ref path) = toml.transport.socket_path {
        config.socket_path = PathBuf::from(path);
    }
    if let Some(ref addr) = toml.transport.ws_addr {
        config.ws_addr = addr.clone();
    }
    if let Some(max) = toml.transport.max_connections {
        config.max_connections = max;
    }
    if let Some(capacity) = toml.transport.connection_channel_capacity {
        config.connection_channel_capacity = capacity;
    }

    if let Some(ms) = toml.hub.send_timeout_ms {
        config.send_timeout = Duration::from_millis(ms);
    }

    if let Some(ms) = toml.requests.request_timeout_ms {
        config.request_timeout = Duration::from_millis(ms);
    }
    if let Some(limit) = toml.requests.default_history_limit {
        config.default_history_limit = limit;
    }
    if let Some(limit) = toml.requests.max_history_limit {
        config.max_history_limit = limit;
    }
}

/// Apply environment variable overrides to the config
///
/// Values that do not parse are ignored with a warning.
fn apply_env_config<F>(config: &mut RelayConfigFile, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
        let value = raw.trim().parse::<T>().ok();
        if value.is_none() {
            tracing::warn!(key, value = raw, "Ignoring unparseable environment override");
        }
        value
    }

    if let Some(path) = lookup("RELAY_SOCKET") {
        config.socket_path = PathBuf::from(path);
        config.source = ConfigSource::Env;
    }
    if let Some(addr) = lookup("RELAY_WS_ADDR") {
        config.ws_addr = addr;
        config.source = ConfigSource::Env;
    }
    if let Some(n) = lookup("RELAY_MAX_CONNECTIONS").and_then(|v| parsed("RELAY_MAX_CONNECTIONS", &v)) {
        config.max_connections = n;
        config.source = ConfigSource::Env;
    }
    if let Some(n) = lookup("RELAY_CHANNEL_CAPACITY").and_then(|v| parsed("RELAY_CHANNEL_CAPACITY", &v)) {
        config.connection_channel_capacity = n;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = lookup("RELAY_SEND_TIMEOUT_MS").and_then(|v| parsed("RELAY_SEND_TIMEOUT_MS", &v)) {
        config.send_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = lookup("RELAY_REQUEST_TIMEOUT_MS").and_then(|v| parsed("RELAY_REQUEST_TIMEOUT_MS", &v)) {
        config.request_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(n) = lookup("RELAY_HISTORY_LIMIT").and_then(|v| parsed("RELAY_HISTORY_LIMIT", &v)) {
        config.default_history_limit = n;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Socket path override
    pub socket_path: Option<PathBuf>,

    /// WebSocket address override
    pub ws_addr: Option<String>,

    /// Disable the WebSocket gateway
    pub disable_websocket: bool,

    /// Send timeout override (milliseconds)
    pub send_timeout_ms: Option<u64>,

    /// Request timeout override (milliseconds)
    pub request_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set socket path override
    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Set WebSocket address override
    #[must_use]
    pub fn with_ws_addr(mut self, addr: String) -> Self {
        self.ws_addr = Some(addr);
        self
    }

    /// Turn the WebSocket gateway off
    #[must_use]
    pub fn without_websocket(mut self) -> Self {
        self.disable_websocket = true;
        self
    }

    /// Set send timeout override
    #[must_use]
    pub fn with_send_timeout_ms(mut self, ms: u64) -> Self {
        self.send_timeout_ms = Some(ms);
        self
    }

    /// Set request timeout override
    #[must_use]
    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = Some(ms);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.socket_path.is_none()
            && self.ws_addr.is_none()
            && !self.disable_websocket
            && self.send_timeout_ms.is_none()
            && self.request_timeout_ms.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfigFile) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref path) = self.socket_path {
            config.socket_path = path.clone();
        }
        if let Some(ref addr) = self.ws_addr {
            config.ws_addr = addr.clone();
        }
        if self.disable_websocket {
            config.websocket_enabled = false;
        }
        if let Some(ms) = self.send_timeout_ms {
            config.send_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
