//! Configuration sources for the subscriber.
//!
//! Settings are merged with the precedence command line > config file >
//! built-in defaults. The config file is optional TOML:
//!
//! ```toml
//! broker = "mqtt.example.org"
//! port = 1883
//! topic = "akita/smartcity"
//! username = "observer"
//! password = "secret"
//! qos = 1
//!
//! [reconnect]
//! enabled = true
//! delay_secs = 5
//! ```
//!
//! Validation of the merged values happens in
//! [`ConnectionConfig::configure`](crate::mqtt::config::ConnectionConfig::configure).

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::mqtt::config::ReconnectPolicy;

pub const DEFAULT_BROKER: &str = "localhost";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_BASE_TOPIC: &str = "akita/smartcity";

const CONFIG_DIR: &str = "ascs";
const CONFIG_FILE: &str = "mqtt-test-subscriber.toml";

/// Errors raised before any network activity takes place.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("broker host must not be empty")]
    EmptyBroker,

    #[error("port {0} is out of range (1-65535)")]
    InvalidPort(u16),

    #[error("base topic must not be empty")]
    EmptyTopic,

    #[error("base topic '{0}' must not contain MQTT wildcards")]
    WildcardInTopic(String),

    #[error("QoS {0} is invalid (expected 0, 1 or 2)")]
    InvalidQos(u8),

    #[error("client id must not be empty")]
    EmptyClientId,

    #[error("reconnect delay must be at least 1 second")]
    ZeroReconnectDelay,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Contents of the optional TOML config file. Every key may be omitted.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub broker: Option<String>,
    pub port: Option<u16>,
    pub topic: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub qos: Option<u8>,
    pub verbose: Option<bool>,
    pub reconnect: Option<ReconnectPolicy>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config file {}", path.display());
        Ok(config)
    }

    /// Loads `explicit` when given, otherwise the per-user default file if it
    /// exists. A missing default file is not an error.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.is_file() => Self::load(&path),
            Some(path) => {
                debug!("No config file at {}", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut path| {
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    })
}

/// Values supplied on the command line; `None` means "not given".
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub broker: Option<String>,
    pub port: Option<u16>,
    pub topic: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub qos: Option<u8>,
    pub verbose: bool,
    pub no_reconnect: bool,
    pub reconnect_delay_secs: Option<u64>,
}

/// Merged but not yet validated settings.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub broker: String,
    pub port: u16,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub qos: u8,
    pub verbose: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: DEFAULT_BROKER.to_string(),
            port: DEFAULT_PORT,
            topic: DEFAULT_BASE_TOPIC.to_string(),
            username: None,
            password: None,
            client_id: None,
            qos: 0,
            verbose: false,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Settings {
    pub fn merge(file: FileConfig, cli: Overrides) -> Self {
        let defaults = Self::default();
        let mut reconnect = file.reconnect.unwrap_or(defaults.reconnect);
        if cli.no_reconnect {
            reconnect.enabled = false;
        }
        if let Some(secs) = cli.reconnect_delay_secs {
            reconnect.delay = std::time::Duration::from_secs(secs);
        }

        Self {
            broker: cli.broker.or(file.broker).unwrap_or(defaults.broker),
            port: cli.port.or(file.port).unwrap_or(defaults.port),
            topic: cli.topic.or(file.topic).unwrap_or(defaults.topic),
            username: cli.username.or(file.username),
            password: cli.password.or(file.password),
            client_id: cli.client_id.or(file.client_id),
            qos: cli.qos.or(file.qos).unwrap_or(defaults.qos),
            verbose: cli.verbose || file.verbose.unwrap_or(defaults.verbose),
            reconnect,
        }
    }
}
