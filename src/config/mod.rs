//! Engine configuration
//!
//! A TOML file layered over built-in defaults, with two ways to inject
//! environment values:
//! - `${VAR}` / `${VAR:-fallback}` placeholders inside the file
//! - `MQTT_ENGINE__<SECTION>__<KEY>` variables overriding single keys
//!
//! [`Config::broker_config`] turns the result into the runtime
//! [`BrokerConfig`].

use std::fmt;
use std::path::Path;
use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File, FileFormat};
use regex::{Captures, Regex};
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::protocol::QoS;
use crate::session::OverflowStrategy;

pub use persistence::{BackendType, PersistenceConfig};

mod persistence;

#[cfg(test)]
mod tests;

const ENV_PREFIX: &str = "MQTT_ENGINE";
const ENV_SEPARATOR: &str = "__";

/// Why a configuration could not be loaded
#[derive(Debug)]
pub enum ConfigError {
    /// The file exists but could not be read
    Io(std::io::Error),
    /// Invalid TOML
    Parse(toml::de::Error),
    /// Layering or deserializing through the `config` crate failed
    Config(config::ConfigError),
    /// Well-formed but inconsistent settings
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read configuration: {}", e),
            ConfigError::Parse(e) => write!(f, "invalid TOML: {}", e),
            ConfigError::Config(e) => write!(f, "configuration error: {}", e),
            ConfigError::Validation(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Config(e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Validation(msg.to_string())
}

/// Replace `${VAR}` and `${VAR:-fallback}` with the variable's value.
/// Unset variables without a fallback become empty strings.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let placeholder = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(format!("placeholder pattern: {}", e)))?;
    let substituted = placeholder.replace_all(content, |caps: &Captures| {
        std::env::var(&caps[1])
            .unwrap_or_else(|_| caps.get(2).map_or(String::new(), |m| m.as_str().to_string()))
    });
    Ok(substituted.into_owned())
}

/// Full configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `error`, `warn`, `info`, `debug`, `trace` or any `EnvFilter`
    /// directive. `RUST_LOG` takes precedence.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Settings shared with the transport collaborator
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, passed through to whoever owns the sockets
    pub bind: String,
    pub tls: Option<ServerTlsConfig>,
    /// Wait for CONNECT, for an acknowledgement before a resend, and for a
    /// closing connection
    #[serde(with = "humantime_serde")]
    pub communication_timeout: Duration,
    /// Resends of an unacknowledged message before the client is dropped
    pub max_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1883".to_string(),
            tls: None,
            communication_timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

/// Certificate material for a TLS listener, PEM files
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerTlsConfig {
    pub cert: String,
    pub key: String,
    /// CA bundle for verifying client certificates
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub require_client_cert: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds. Used for v5 clients that ask for 0.
    pub default_keep_alive: u16,
    /// Seconds. Larger requests are clamped.
    pub max_keep_alive: u16,
    /// When false every session ends with its connection
    pub persistent_sessions: bool,
    /// Per-session queue capacity, 0 for unbounded
    pub max_pending_messages: usize,
    pub overflow_strategy: OverflowStrategy,
    /// Sweep interval for expired sessions, 0 disables the sweep
    #[serde(with = "humantime_serde")]
    pub expiry_check_interval: Duration,
    /// Per-client send quota, 0 leaves it to the client's receive maximum
    pub max_inflight: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: 60,
            max_keep_alive: u16::MAX,
            persistent_sessions: true,
            max_pending_messages: 250,
            overflow_strategy: OverflowStrategy::default(),
            expiry_check_interval: Duration::from_secs(60),
            max_inflight: 0,
        }
    }
}

/// Optional protocol features announced in CONNACK
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// 0, 1 or 2
    pub max_qos: u8,
    pub retain_available: bool,
    pub wildcard_subscriptions: bool,
    pub subscription_identifiers: bool,
    /// Inbound topic aliases accepted per connection, 0 disables them
    pub max_topic_alias: u16,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: 2,
            retain_available: true,
            wildcard_subscriptions: true,
            subscription_identifiers: true,
            max_topic_alias: u16::MAX,
        }
    }
}

impl Config {
    /// Load `path` with environment overrides. A missing file is not an
    /// error; defaults and environment variables still apply.
    ///
    /// `MQTT_ENGINE__SESSION__MAX_PENDING_MESSAGES=1000` overrides
    /// `session.max_pending_messages`. Only the double underscore separates
    /// levels, so single underscores in key names are kept.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = Self::builder_with_defaults()?;

        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => {
                let content = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&content, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let layered = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;
        let config: Config = layered.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, no file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse TOML text as is, without placeholders or environment overrides
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    // Durations go through humantime, so their defaults must be strings
    // before an environment override or a partial file is merged in.
    fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.communication_timeout", "10s")?
            .set_default("session.expiry_check_interval", "60s")?
            .set_default("persistence.flush_interval", "100ms")?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(invalid("mqtt.max_qos must be 0, 1 or 2"));
        }
        if self.server.communication_timeout.is_zero() {
            return Err(invalid("server.communication_timeout must not be zero"));
        }
        if let Some(tls) = &self.server.tls {
            if tls.cert.is_empty() || tls.key.is_empty() {
                return Err(invalid("server.tls needs both cert and key"));
            }
        }
        if self.persistence.enabled
            && self.persistence.backend == BackendType::File
            && self.persistence.path.as_os_str().is_empty()
        {
            return Err(invalid("persistence.path is required by the file backend"));
        }
        Ok(())
    }

    /// Runtime settings for [`Broker::new`](crate::broker::Broker::new)
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            communication_timeout: self.server.communication_timeout,
            max_retries: self.server.max_retries,
            default_keep_alive: self.session.default_keep_alive,
            max_keep_alive: self.session.max_keep_alive,
            persistent_sessions: self.session.persistent_sessions,
            max_pending_messages: self.session.max_pending_messages,
            overflow_strategy: self.session.overflow_strategy,
            expiry_check_interval: self.session.expiry_check_interval,
            max_inflight: self.session.max_inflight,
            // validate() keeps max_qos in range
            max_qos: QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: self.mqtt.retain_available,
            wildcard_subscriptions: self.mqtt.wildcard_subscriptions,
            subscription_identifiers: self.mqtt.subscription_identifiers,
            max_topic_alias: self.mqtt.max_topic_alias,
            persistence_flush_interval: self.persistence.flush_interval,
            persistence_batch_size: self.persistence.max_batch_size,
            ..BrokerConfig::default()
        }
    }
}
