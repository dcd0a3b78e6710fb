use std::fmt;
use std::time::Duration;

use rumqttc::{MqttOptions, QoS};
use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::config::{ConfigError, Settings};

/// Keepalive negotiated with the broker at connect time.
pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

const CLIENT_ID_PREFIX: &str = "ascs-sub";

/// What the network loop does after it loses an established connection.
///
/// rumqttc reconnects whenever its event loop is polled again after an error,
/// so "enabled" means "keep polling after `delay`" and "disabled" means the
/// network loop ends and the process idles until interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    #[serde(rename = "delay_secs", deserialize_with = "duration_secs")]
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(1),
        }
    }
}

fn duration_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

/// Username/password pair sent in the CONNECT packet.
#[derive(Clone, PartialEq, Eq)]
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

/// Validated, immutable connection settings for one subscriber session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub base_topic: String,
    pub credentials: Option<Credentials>,
    pub client_id: String,
    pub qos: QoS,
    pub verbose: bool,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    /// Validates merged settings. Performs no I/O.
    pub fn configure(settings: Settings) -> Result<Self, ConfigError> {
        let host = settings.broker.trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::EmptyBroker);
        }

        if settings.port == 0 {
            return Err(ConfigError::InvalidPort(settings.port));
        }

        let trimmed = settings.topic.trim();
        let base_topic = trimmed.strip_suffix('/').unwrap_or(trimmed).to_string();
        if base_topic.is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if base_topic.contains(['#', '+']) {
            return Err(ConfigError::WildcardInTopic(base_topic));
        }

        let qos = match settings.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => return Err(ConfigError::InvalidQos(other)),
        };

        let client_id = match settings.client_id {
            Some(id) if id.trim().is_empty() => return Err(ConfigError::EmptyClientId),
            Some(id) => id,
            None => format!("{CLIENT_ID_PREFIX}-{}", std::process::id()),
        };

        if settings.reconnect.delay.is_zero() {
            return Err(ConfigError::ZeroReconnectDelay);
        }

        let credentials = match (settings.username, settings.password) {
            (Some(username), password) => Some(Credentials {
                username,
                password: password.unwrap_or_default(),
            }),
            (None, Some(_)) => {
                warn!("Password given without a username; connecting anonymously");
                None
            }
            (None, None) => None,
        };

        Ok(Self {
            host,
            port: settings.port,
            base_topic,
            credentials,
            client_id,
            qos,
            verbose: settings.verbose,
            reconnect: settings.reconnect,
        })
    }

    /// The single wildcard filter covering the base topic and every sub-level.
    pub fn subscription_filter(&self) -> String {
        format!("{}/#", self.base_topic)
    }

    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(KEEP_ALIVE)
            .set_clean_session(true);
        if let Some(credentials) = &self.credentials {
            options.set_credentials(
                credentials.username.clone(),
                credentials.password.clone(),
            );
        }
        options
    }
}

impl fmt::Display for ConnectionConfig {
    /// `user@host:port`, password left out.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.credentials {
            Some(credentials) => write!(f, "{}@{}:{}", credentials.username, self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn defaults_produce_the_smart_city_filter() {
        let config = ConnectionConfig::configure(settings()).unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1883);
        assert_eq!(config.subscription_filter(), "akita/smartcity/#");
        assert_eq!(config.qos, QoS::AtMostOnce);
        assert!(config.client_id.starts_with("ascs-sub-"));
        assert!(config.credentials.is_none());
    }

    #[test]
    fn port_zero_is_rejected() {
        let err = ConnectionConfig::configure(Settings { port: 0, ..settings() }).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(0)));
    }

    #[test]
    fn empty_topic_is_rejected() {
        let err = ConnectionConfig::configure(Settings {
            topic: "  ".into(),
            ..settings()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyTopic));

        let err = ConnectionConfig::configure(Settings {
            topic: "/".into(),
            ..settings()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyTopic));
    }

    #[test]
    fn trailing_slash_is_dropped_from_the_base_topic() {
        let config = ConnectionConfig::configure(Settings {
            topic: "akita/lab/".into(),
            ..settings()
        })
        .unwrap();
        assert_eq!(config.subscription_filter(), "akita/lab/#");
    }

    #[test]
    fn only_one_trailing_slash_is_dropped() {
        let config = ConnectionConfig::configure(Settings {
            topic: "akita/lab//".into(),
            ..settings()
        })
        .unwrap();
        assert_eq!(config.base_topic, "akita/lab/");
        assert_eq!(config.subscription_filter(), "akita/lab//#");
    }

    #[test]
    fn zero_reconnect_delay_is_rejected() {
        let err = ConnectionConfig::configure(Settings {
            reconnect: ReconnectPolicy {
                enabled: true,
                delay: Duration::ZERO,
            },
            ..settings()
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroReconnectDelay));

        let config = ConnectionConfig::configure(Settings {
            reconnect: ReconnectPolicy {
                enabled: true,
                delay: Duration::from_secs(1),
            },
            ..settings()
        })
        .unwrap();
        assert_eq!(config.reconnect.delay, Duration::from_secs(1));
    }

    #[test]
    fn wildcards_in_base_topic_are_rejected() {
        for topic in ["akita/#", "akita/+/temp"] {
            let err = ConnectionConfig::configure(Settings {
                topic: topic.into(),
                ..settings()
            })
            .unwrap_err();
            assert!(matches!(err, ConfigError::WildcardInTopic(_)), "{topic}");
        }
    }

    #[test]
    fn qos_above_two_is_rejected() {
        let err = ConnectionConfig::configure(Settings { qos: 3, ..settings() }).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidQos(3)));
    }

    #[test]
    fn password_without_username_is_ignored() {
        let config = ConnectionConfig::configure(Settings {
            password: Some("secret".into()),
            ..settings()
        })
        .unwrap();
        assert!(config.credentials.is_none());
    }

    #[test]
    fn credentials_are_kept_out_of_display_and_debug() {
        let config = ConnectionConfig::configure(Settings {
            username: Some("gateway".into()),
            password: Some("hunter2".into()),
            ..settings()
        })
        .unwrap();
        assert_eq!(config.to_string(), "gateway@localhost:1883");
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn options_carry_keepalive_and_credentials() {
        let config = ConnectionConfig::configure(Settings {
            broker: "broker.local".into(),
            port: 8883,
            username: Some("gateway".into()),
            client_id: Some("observer-1".into()),
            ..settings()
        })
        .unwrap();
        let options = config.mqtt_options();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(options.keep_alive(), KEEP_ALIVE);
        assert_eq!(options.client_id(), "observer-1");
        assert_eq!(
            options.credentials(),
            Some(("gateway".to_string(), String::new()))
        );
    }
}
