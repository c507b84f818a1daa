//! Configuration management for mongowire
//!
//! This module handles loading, parsing, and managing configuration from various sources:
//! - Configuration files (TOML format)
//! - Environment variables
//! - Command-line arguments
//!
//! Configuration precedence (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file
//! 4. Default values

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConnectionError, Result};
use crate::wire::{DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN};

/// Prefix of every environment variable read by [`Config::from_env`].
pub const ENV_PREFIX: &str = "MONGOWIRE_";

const DEFAULT_PORT: u16 = 27017;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Query defaults
    #[serde(default)]
    pub query: QueryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection-related configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Default server URI, `mongodb://host[:port][/database]`
    #[serde(default = "default_uri")]
    pub default_uri: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Largest reply accepted from the server, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Defaults applied to every new query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Client-side read timeout in milliseconds (0 = wait indefinitely)
    #[serde(default)]
    pub default_timeout_ms: u64,

    /// Documents per batch (0 = server default)
    #[serde(default)]
    pub batch_size: i32,

    /// Confirm each write with getlasterror
    #[serde(default = "default_acknowledge_writes")]
    pub acknowledge_writes: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// Enable timestamps in logs
    #[serde(default = "default_log_timestamps")]
    pub timestamps: bool,
}

/// Log level options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Components of a `mongodb://` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
}

impl ServerAddress {
    /// `host:port` as accepted by `TcpStream::connect`.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Default value functions
fn default_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_acknowledge_writes() -> bool {
    true
}

fn default_log_level() -> LogLevel {
    LogLevel::Warn
}

fn default_log_timestamps() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_uri: default_uri(),
            connect_timeout: default_connect_timeout(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 0,
            batch_size: 0,
            acknowledge_writes: default_acknowledge_writes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            timestamps: default_log_timestamps(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file (TOML format)
    ///
    /// # Returns
    /// * `Result<Config>` - Loaded configuration or error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound(path.display().to_string()),
            _ => ConfigError::InvalidFormat(format!("{}: {e}", path.display())),
        })?;
        toml::from_str(&content)
            .map_err(|e| ConfigError::InvalidFormat(format!("{}: {e}", path.display())).into())
    }

    /// Load configuration from multiple sources with proper precedence
    ///
    /// A missing file is not an error; defaults are used instead.
    ///
    /// # Arguments
    /// * `path` - Explicit config file, or `None` for [`Config::default_path`]
    ///
    /// # Returns
    /// * `Result<Config>` - Merged configuration or error
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(Self::default_path, Path::to_path_buf);
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables are prefixed with MONGOWIRE_
    /// Example: MONGOWIRE_QUERY_TIMEOUT_MS=500
    ///
    /// # Returns
    /// * `Result<Config>` - Configuration from environment or default
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from variables found by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(uri) = var("URI") {
            self.connection.default_uri = uri;
        }
        if let Some(value) = var("CONNECT_TIMEOUT") {
            self.connection.connect_timeout = parse_field("connect_timeout", &value)?;
        }
        if let Some(value) = var("MAX_MESSAGE_SIZE") {
            self.connection.max_message_size = parse_field("max_message_size", &value)?;
        }
        if let Some(value) = var("QUERY_TIMEOUT_MS") {
            self.query.default_timeout_ms = parse_field("default_timeout_ms", &value)?;
        }
        if let Some(value) = var("BATCH_SIZE") {
            self.query.batch_size = parse_field("batch_size", &value)?;
        }
        if let Some(value) = var("ACKNOWLEDGE_WRITES") {
            self.query.acknowledge_writes = parse_field("acknowledge_writes", &value)?;
        }
        if let Some(value) = var("LOG_LEVEL") {
            self.logging.level = LogLevel::parse(&value)?;
        }
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// # Returns
    /// * `PathBuf` - Path to default configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mongowire")
            .join("config.toml")
    }

    /// Save configuration to a file
    ///
    /// # Arguments
    /// * `path` - Path where to save the configuration
    ///
    /// # Returns
    /// * `Result<()>` - Success or error
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    ///
    /// # Returns
    /// * `Result<()>` - Ok if valid, error otherwise
    pub fn validate(&self) -> Result<()> {
        self.connection.validate_uri()?;
        if self.connection.max_message_size < HEADER_LEN {
            return Err(invalid("max_message_size", self.connection.max_message_size));
        }
        if self.connection.connect_timeout == 0 {
            return Err(invalid("connect_timeout", 0));
        }
        if self.query.batch_size < 0 {
            return Err(invalid("batch_size", self.query.batch_size));
        }
        Ok(())
    }

    /// Get connection timeout as Duration
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connect_timeout)
    }
}

impl ConnectionConfig {
    /// Parse and validate the connection URI
    ///
    /// # Returns
    /// * `Result<()>` - Ok if URI is valid, error otherwise
    pub fn validate_uri(&self) -> Result<()> {
        parse_uri(&self.default_uri).map(|_| ())
    }

    /// `host:port` to dial.
    pub fn address(&self) -> Result<String> {
        parse_uri(&self.default_uri).map(|addr| addr.socket_address())
    }

    /// Database named in the URI path, if any.
    pub fn database(&self) -> Option<String> {
        parse_uri(&self.default_uri).ok()?.database
    }
}

impl QueryConfig {
    /// Default query timeout, `None` when disabled.
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_ms > 0).then(|| Duration::from_millis(self.default_timeout_ms))
    }
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(invalid("level", value)),
        }
    }
}

/// Parse `mongodb://[user:pass@]host[:port][/database][?options]`.
///
/// Credentials and options are accepted and ignored. Seed lists with
/// more than one host are rejected.
pub fn parse_uri(uri: &str) -> Result<ServerAddress> {
    let rest = uri
        .strip_prefix("mongodb://")
        .ok_or_else(|| ConnectionError::InvalidUri(format!("{uri}: expected mongodb:// scheme")))?;
    let rest = rest.split_once('@').map_or(rest, |(_, hosts)| hosts);
    let (hosts, path) = rest.split_once('/').unwrap_or((rest, ""));

    if hosts.contains(',') {
        return Err(ConnectionError::InvalidUri(format!("{uri}: only one host is supported")).into());
    }

    let (host, port) = match hosts.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ConnectionError::InvalidUri(format!("{uri}: invalid port '{port}'")))?;
            (host, port)
        }
        None => (hosts, DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(ConnectionError::InvalidUri(format!("{uri}: missing host")).into());
    }

    let database = path
        .split('?')
        .next()
        .filter(|db| !db.is_empty())
        .map(str::to_string);

    Ok(ServerAddress {
        host: host.to_string(),
        port,
        database,
    })
}

fn parse_field<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| invalid(field, value))
}

fn invalid(field: &str, value: impl ToString) -> crate::error::MongoWireError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}
