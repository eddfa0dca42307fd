use std::{fmt, fs, num::NonZeroUsize, path::Path, str::FromStr};

use serde::Deserialize;
use thiserror::Error;

use crate::DEFAULT_CAPACITY;

/// Top-level configuration for Mailsink.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            smtp: SmtpConfig::default(),
            http: HttpConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// SMTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Name announced in the greeting and used for synthesized identifiers.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Sender addresses allowed to deliver, empty admits everyone.
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Maximum accepted message size in bytes.
    #[serde(default)]
    pub max_message_size: Option<usize>,

    /// Whether `AUTH` is advertised in the `EHLO` reply.
    #[serde(default = "default_true")]
    pub advertise_auth: bool,
}

impl SmtpConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_smtp_port(),
            hostname: default_hostname(),
            whitelist: Vec::new(),
            max_message_size: None,
            advertise_auth: default_true(),
        }
    }
}

/// HTTP API listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Basic auth credentials required on every request when set.
    #[serde(default)]
    pub auth: Option<Credentials>,
}

impl HttpConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
            auth: None,
        }
    }
}

/// Mailbox store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Number of messages kept before the oldest is evicted.
    #[serde(default = "default_max_messages")]
    pub max_messages: NonZeroUsize,

    /// Whether the raw header mapping is included in listed messages.
    #[serde(default)]
    pub headers: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            headers: false,
        }
    }
}

/// A `USERNAME:PASSWORD` pair.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl FromStr for Credentials {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some((username, password)) if !username.is_empty() && !password.is_empty() => {
                Ok(Self {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
            _ => Err(ConfigError::Invalid(
                "authentication details must be in USERNAME:PASSWORD format".to_string(),
            )),
        }
    }
}

impl TryFrom<String> for Credentials {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A parse error occurred deserializing TOML.
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is present but unusable.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_smtp_port() -> u16 {
    1025
}

fn default_http_port() -> u16 {
    1080
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_max_messages() -> NonZeroUsize {
    DEFAULT_CAPACITY
}

fn default_true() -> bool {
    true
}
