/// Configuration management for mongo-session
///
/// [`ClientOptions`] is the typed option set every component reads from. It
/// can be built in code, parsed from a connection string (see [`uri`]) or
/// loaded from the `[client]` table of a TOML [`Config`] file.
pub mod uri;

use crate::core::{Endpoint, Preference, DEFAULT_PORT};
use bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub use uri::{parse_host_list, ConnectionString};

/// Main configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection string layered over `client` when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Client options
    #[serde(default)]
    pub client: ClientOptions,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// How the connection string parser treats options it does not recognize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    /// Unknown options fail with [`ConfigError::UnknownOption`]
    #[default]
    Strict,
    /// Unknown options are logged and ignored
    Lenient,
}

/// User name and password taken from a connection string.
///
/// Carried for the authentication collaborator; this crate never sends it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Database the credential is defined in (`authSource`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("source", &self.source)
            .finish()
    }
}

/// Number of acknowledging nodes, or a named mode such as `majority`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Acknowledgment {
    Nodes(u32),
    Mode(String),
}

impl Acknowledgment {
    pub fn majority() -> Self {
        Acknowledgment::Mode("majority".to_string())
    }

    fn parse(value: &str) -> Self {
        match value.parse::<u32>() {
            Ok(n) => Acknowledgment::Nodes(n),
            Err(_) => Acknowledgment::Mode(value.to_string()),
        }
    }
}

/// Acknowledgment requested for writes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteConcern {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<Acknowledgment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<bool>,
}

impl WriteConcern {
    pub fn nodes(n: u32) -> Self {
        Self {
            w: Some(Acknowledgment::Nodes(n)),
            ..Default::default()
        }
    }

    pub fn majority() -> Self {
        Self {
            w: Some(Acknowledgment::majority()),
            ..Default::default()
        }
    }

    pub fn journal(mut self, journal: bool) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn w_timeout(mut self, timeout: Duration) -> Self {
        self.w_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// True when the server default should apply
    pub fn is_empty(&self) -> bool {
        self.w.is_none() && self.w_timeout_ms.is_none() && self.journal.is_none()
    }

    /// `writeConcern` sub-document sent with write commands
    pub fn to_document(&self) -> Document {
        let mut document = doc! {};
        match &self.w {
            Some(Acknowledgment::Nodes(n)) => {
                document.insert("w", *n as i32);
            }
            Some(Acknowledgment::Mode(mode)) => {
                document.insert("w", mode.clone());
            }
            None => {}
        }
        if let Some(ms) = self.w_timeout_ms {
            document.insert("wtimeout", Bson::Int64(ms as i64));
        }
        if let Some(journal) = self.journal {
            document.insert("j", journal);
        }
        document
    }
}

/// Every option a client recognizes, with driver defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Seed list; replica set members found through `hello` are added later
    pub hosts: Vec<Endpoint>,
    /// Database named in the connection string path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    pub connect_timeout_ms: u64,
    /// Default per-operation reply timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_timeout_ms: Option<u64>,
    pub server_selection_timeout_ms: u64,
    pub heartbeat_frequency_ms: u64,
    pub min_heartbeat_frequency_ms: u64,
    pub local_threshold_ms: u64,
    pub max_pool_size: usize,
    pub min_pool_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_idle_time_ms: Option<u64>,
    pub wait_queue_timeout_ms: u64,
    /// Waiters allowed per endpoint, as a multiple of `max_pool_size`
    pub wait_queue_multiple: usize,
    /// Consecutive heartbeat failures before an endpoint is marked down
    pub failure_threshold: u32,
    /// Retries granted to idempotent operations after an I/O failure
    pub max_retries: u32,
    pub retry_reads: bool,
    pub read_preference: Preference,
    pub write_concern: WriteConcern,
    pub parse_mode: ParseMode,
}

/// Reply timeout used when `socketTimeoutMS` is unset or zero
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            hosts: vec![Endpoint::new("localhost", DEFAULT_PORT)],
            default_database: None,
            credential: None,
            app_name: None,
            connect_timeout_ms: 10_000,
            socket_timeout_ms: None,
            server_selection_timeout_ms: 30_000,
            heartbeat_frequency_ms: 10_000,
            min_heartbeat_frequency_ms: 500,
            local_threshold_ms: 15,
            max_pool_size: 100,
            min_pool_size: 0,
            max_idle_time_ms: None,
            wait_queue_timeout_ms: 10_000,
            wait_queue_multiple: 5,
            failure_threshold: 1,
            max_retries: 1,
            retry_reads: true,
            read_preference: Preference::primary(),
            write_concern: WriteConcern::default(),
            parse_mode: ParseMode::Strict,
        }
    }
}

impl ClientOptions {
    /// Parse a connection string with default options underneath
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        ConnectionString::parse(uri, ParseMode::Strict)?.apply(Self::default())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        match self.socket_timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.server_selection_timeout_ms)
    }

    pub fn heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.heartbeat_frequency_ms)
    }

    pub fn min_heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.min_heartbeat_frequency_ms)
    }

    pub fn local_threshold(&self) -> Duration {
        Duration::from_millis(self.local_threshold_ms)
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle_time_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub fn wait_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_queue_timeout_ms)
    }

    /// Retries available to an idempotent read
    pub fn read_retries(&self) -> u32 {
        if self.retry_reads {
            self.max_retries
        } else {
            0
        }
    }

    /// Validate option combinations
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one host is required".to_string(),
            ));
        }

        if self.max_pool_size == 0 {
            return Err(ConfigError::invalid_option(
                "maxPoolSize",
                "must be greater than 0",
            ));
        }

        if self.min_pool_size > self.max_pool_size {
            return Err(ConfigError::invalid_option(
                "minPoolSize",
                format!(
                    "{} exceeds maxPoolSize {}",
                    self.min_pool_size, self.max_pool_size
                ),
            ));
        }

        if self.heartbeat_frequency_ms == 0 {
            return Err(ConfigError::invalid_option(
                "heartbeatFrequencyMS",
                "must be greater than 0",
            ));
        }

        if self.heartbeat_frequency_ms < self.min_heartbeat_frequency_ms {
            return Err(ConfigError::invalid_option(
                "heartbeatFrequencyMS",
                format!(
                    "must be at least {}ms",
                    self.min_heartbeat_frequency_ms
                ),
            ));
        }

        if self.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }

        self.read_preference.validate(self.heartbeat_frequency())
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Effective client options: the `uri`, if any, layered over `client`
    pub fn client_options(&self) -> Result<ClientOptions, ConfigError> {
        match &self.uri {
            Some(uri) => {
                ConnectionString::parse(uri, self.client.parse_mode)?.apply(self.client.clone())
            }
            None => Ok(self.client.clone()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.client_options()?.validate()?;

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            uri: Some(
                "mongodb://10.0.1.10:27017,10.0.1.11:27017,10.0.1.12:27017/app?readPreference=secondaryPreferred"
                    .to_string(),
            ),
            client: ClientOptions {
                app_name: Some("mongo-session".to_string()),
                max_pool_size: 50,
                min_pool_size: 2,
                max_idle_time_ms: Some(300_000),
                write_concern: WriteConcern::majority().journal(true),
                ..Default::default()
            },
            logging: LoggingConfig::default(),
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid connection string: {0}")]
    InvalidUri(String),

    #[error("Invalid host '{host}': {message}")]
    InvalidHost { host: String, message: String },

    #[error("Invalid value for option {option}: {message}")]
    InvalidOption { option: String, message: String },

    #[error("Unknown connection string option: {0}")]
    UnknownOption(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl ConfigError {
    pub fn invalid_option<O: Into<String>, M: Into<String>>(option: O, message: M) -> Self {
        ConfigError::InvalidOption {
            option: option.into(),
            message: message.into(),
        }
    }

    pub fn invalid_host<H: Into<String>, M: Into<String>>(host: H, message: M) -> Self {
        ConfigError::InvalidHost {
            host: host.into(),
            message: message.into(),
        }
    }
}
