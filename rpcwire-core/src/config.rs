//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RPCWIRE_CONFIG or --config)
//! 3. Environment variables

use rpcwire_protocol::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT, HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Wire protocol limits.
    pub protocol: ProtocolConfig,
    /// Connection timeouts and heartbeats.
    pub connection: ConnectionConfig,
    /// Invocation retry policy.
    pub retry: RetryConfig,
    /// Batch request queue.
    pub batch: BatchConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os("RPCWIRE_CONFIG").map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Loads `path` (or the defaults), then applies environment variable
    /// overrides and validates the result.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.protocol.apply_env_overrides();
        self.connection.apply_env_overrides();
        self.retry.apply_env_overrides();
        self.batch.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.max_message_size <= HEADER_SIZE {
            return Err(ConfigError::Validation(format!(
                "protocol.max_message_size must exceed {} bytes",
                HEADER_SIZE
            )));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.retry.max_interval_ms < self.retry.base_interval_ms {
            return Err(ConfigError::Validation(
                "retry.max_interval_ms must not be below retry.base_interval_ms".to_string(),
            ));
        }
        if self.batch.max_size <= HEADER_SIZE + 4 {
            return Err(ConfigError::Validation(
                "batch.max_size too small for a batch header".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent incoming connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_parse("RPCWIRE_BIND") {
            self.bind_addr = addr;
        }
        if let Some(n) = env_parse("RPCWIRE_MAX_CONNECTIONS") {
            self.max_connections = n;
        }
    }
}

/// Wire protocol configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Largest accepted message, header included.
    pub max_message_size: usize,
    /// Compress outgoing requests and batches of 100 bytes or more.
    pub compress: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            compress: false,
        }
    }
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(size) = env_parse("RPCWIRE_MAX_MESSAGE_SIZE") {
            self.max_message_size = size;
        }
        if let Some(compress) = env_flag("RPCWIRE_COMPRESS") {
            self.compress = compress;
        }
    }
}

/// Connection timeouts. A zero timeout disables the corresponding check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Time allowed for connection validation, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Idle time before a heartbeat or close, in seconds.
    pub idle_timeout_secs: u64,
    /// Send heartbeats when idle instead of closing.
    pub heartbeat: bool,
    /// Time allowed for a graceful close, in milliseconds.
    pub close_timeout_ms: u64,
    /// Per-invocation timeout, in milliseconds.
    pub invocation_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            idle_timeout_secs: 60,
            heartbeat: true,
            close_timeout_ms: 10_000,
            invocation_timeout_ms: 0,
        }
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

impl ConnectionConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_parse("RPCWIRE_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = ms;
        }
        if let Some(secs) = env_parse("RPCWIRE_IDLE_TIMEOUT") {
            self.idle_timeout_secs = secs;
        }
        if let Some(heartbeat) = env_flag("RPCWIRE_HEARTBEAT") {
            self.heartbeat = heartbeat;
        }
        if let Some(ms) = env_parse("RPCWIRE_CLOSE_TIMEOUT_MS") {
            self.close_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("RPCWIRE_INVOCATION_TIMEOUT_MS") {
            self.invocation_timeout_ms = ms;
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero(Duration::from_millis(self.connect_timeout_ms))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero(Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn close_timeout(&self) -> Option<Duration> {
        non_zero(Duration::from_millis(self.close_timeout_ms))
    }

    pub fn invocation_timeout(&self) -> Option<Duration> {
        non_zero(Duration::from_millis(self.invocation_timeout_ms))
    }
}

/// Retry configuration. The delay before retry `n` (zero-based) is
/// `min(base_interval * multiplier^n, max_interval)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Number of retries after the first attempt.
    pub max_attempts: u32,
    pub base_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_interval_ms: 50,
            multiplier: 2.0,
            max_interval_ms: 5_000,
        }
    }
}

impl RetryConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("RPCWIRE_RETRY_MAX_ATTEMPTS") {
            self.max_attempts = n;
        }
        if let Some(ms) = env_parse("RPCWIRE_RETRY_BASE_MS") {
            self.base_interval_ms = ms;
        }
        if let Some(m) = env_parse("RPCWIRE_RETRY_MULTIPLIER") {
            self.multiplier = m;
        }
        if let Some(ms) = env_parse("RPCWIRE_RETRY_MAX_MS") {
            self.max_interval_ms = ms;
        }
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

/// Batch request queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Largest batch message, header included.
    pub max_size: usize,
    /// Flush automatically before a batch grows past this size
    /// (0 = disabled).
    pub auto_flush_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_MESSAGE_SIZE,
            auto_flush_size: 0,
        }
    }
}

impl BatchConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(size) = env_parse("RPCWIRE_BATCH_MAX_SIZE") {
            self.max_size = size;
        }
        if let Some(size) = env_parse("RPCWIRE_BATCH_AUTO_FLUSH_SIZE") {
            self.auto_flush_size = size;
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Serde helper for SocketAddr (kept as a string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.protocol.max_message_size, 4 * 1024 * 1024);
        assert!(config.connection.heartbeat);
        assert_eq!(config.connection.invocation_timeout(), None);
        assert_eq!(config.retry.base_interval(), Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:4061\"\nretry:\n  max_attempts: 7\nconnection:\n  idle_timeout_secs: 0"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 4061);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.multiplier, 2.0);
        assert_eq!(config.connection.idle_timeout(), None);
        assert_eq!(config.batch, BatchConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpcwire.yaml");
        let mut config = Config::default();
        config.protocol.compress = true;
        config.batch.auto_flush_size = 4096;
        config.save(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/rpcwire.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/rpcwire.yaml"));
    }

    #[test]
    fn test_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "retry: [not, a, map]").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.retry.multiplier = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::default();
        config.protocol.max_message_size = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.max_interval_ms = 1;
        assert!(config.validate().is_err());
    }
}
