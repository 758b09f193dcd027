//! Startup configuration.
//!
//! Values come from the process environment. Callers load a `.env` file
//! first (`dotenvy`) so a checked-out tree or a flashed image can carry its
//! own settings; variables already present in the environment win.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_NODE_TOPIC: &str = "sensor/data";
pub const DEFAULT_SUBSCRIBER_TOPIC: &str = "test/topic";
pub const DEFAULT_PUBLISH_INTERVAL_MS: u32 = 10_000;
pub const DEFAULT_SENSOR_PIN: u8 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SensorKind {
    Dht11,
    #[default]
    Dht22,
}

impl FromStr for SensorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dht11" | "11" => Ok(Self::Dht11),
            "dht22" | "22" | "am2302" => Ok(Self::Dht22),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorConfig {
    pub pin: u8,
    pub kind: SensorKind,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            pin: DEFAULT_SENSOR_PIN,
            kind: SensorKind::Dht22,
        }
    }
}

/// Everything the sensor node needs at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub ssid: String,
    pub passphrase: String,
    pub broker_host: String,
    pub broker_port: u16,
    pub topic: String,
    pub publish_interval_ms: u32,
    pub sensor: SensorConfig,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);

        Ok(Self {
            ssid: vars.required("WIFI_SSID")?,
            passphrase: vars.required("WIFI_PW")?,
            broker_host: vars.required("MQTT_HOST")?,
            broker_port: vars.parsed("MQTT_PORT", DEFAULT_MQTT_PORT)?,
            topic: vars.or("MQTT_TOPIC", DEFAULT_NODE_TOPIC),
            publish_interval_ms: vars.parsed("PUBLISH_INTERVAL_MS", DEFAULT_PUBLISH_INTERVAL_MS)?,
            sensor: SensorConfig {
                pin: vars.parsed("DHT_PIN", DEFAULT_SENSOR_PIN)?,
                kind: vars.parsed("DHT_TYPE", SensorKind::default())?,
            },
        })
    }
}

/// Settings of the desktop test subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub topic: String,
    pub client_prefix: String,
    pub connect_timeout: Duration,
    /// `None`: a dropped connection ends the session.
    pub reconnect_delay: Option<Duration>,
    /// SQLite file every decoded reading is stored in. Unset: print only.
    pub database_url: Option<String>,
}

impl SubscriberConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);

        let reconnect = vars.flag("MQTT_RECONNECT")?;
        let reconnect_delay = Duration::from_millis(vars.parsed("MQTT_RECONNECT_DELAY_MS", 1000)?);

        Ok(Self {
            broker_host: vars.or("MQTT_HOST", "localhost"),
            broker_port: vars.parsed("MQTT_PORT", DEFAULT_MQTT_PORT)?,
            topic: vars.or("MQTT_TOPIC", DEFAULT_SUBSCRIBER_TOPIC),
            client_prefix: vars.or("MQTT_CLIENT_PREFIX", "test-subscriber"),
            connect_timeout: Duration::from_millis(vars.parsed("MQTT_CONNECT_TIMEOUT_MS", 4000)?),
            reconnect_delay: reconnect.then_some(reconnect_delay),
            database_url: vars.get("DATABASE_URL"),
        })
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    fn parsed<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { key, value }),
        }
    }

    fn flag(&self, key: &'static str) -> Result<bool, ConfigError> {
        match self.get(key).as_deref().map(str::trim) {
            None => Ok(false),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(value) => Err(ConfigError::Invalid {
                key,
                value: value.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn node_defaults() {
        let cfg = NodeConfig::from_lookup(lookup(&[
            ("WIFI_SSID", "hotspot"),
            ("WIFI_PW", "secret"),
            ("MQTT_HOST", "192.168.137.157"),
        ]))
        .unwrap();

        assert_eq!(cfg.ssid, "hotspot");
        assert_eq!(cfg.passphrase, "secret");
        assert_eq!(cfg.broker_host, "192.168.137.157");
        assert_eq!(cfg.broker_port, 1883);
        assert_eq!(cfg.topic, "sensor/data");
        assert_eq!(cfg.publish_interval_ms, 10_000);
        assert_eq!(cfg.sensor, SensorConfig::default());
    }

    #[test]
    fn node_overrides() {
        let cfg = NodeConfig::from_lookup(lookup(&[
            ("WIFI_SSID", "hotspot"),
            ("WIFI_PW", "secret"),
            ("MQTT_HOST", "broker.local"),
            ("MQTT_PORT", "8883"),
            ("MQTT_TOPIC", "greenhouse/1"),
            ("PUBLISH_INTERVAL_MS", "2500"),
            ("DHT_PIN", "15"),
            ("DHT_TYPE", "DHT11"),
        ]))
        .unwrap();

        assert_eq!(cfg.broker_port, 8883);
        assert_eq!(cfg.topic, "greenhouse/1");
        assert_eq!(cfg.publish_interval_ms, 2500);
        assert_eq!(
            cfg.sensor,
            SensorConfig {
                pin: 15,
                kind: SensorKind::Dht11
            }
        );
    }

    #[test]
    fn node_requires_credentials() {
        let err = NodeConfig::from_lookup(lookup(&[("WIFI_SSID", "x"), ("MQTT_HOST", "h")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("WIFI_PW"));

        let err = NodeConfig::from_lookup(lookup(&[
            ("WIFI_SSID", "  "),
            ("WIFI_PW", "p"),
            ("MQTT_HOST", "h"),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing("WIFI_SSID"));
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = NodeConfig::from_lookup(lookup(&[
            ("WIFI_SSID", "s"),
            ("WIFI_PW", "p"),
            ("MQTT_HOST", "h"),
            ("MQTT_PORT", "70000"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "MQTT_PORT",
                value: "70000".into()
            }
        );
    }

    #[test]
    fn subscriber_defaults_do_not_reconnect() {
        let cfg = SubscriberConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.broker_host, "localhost");
        assert_eq!(cfg.broker_port, 1883);
        assert_eq!(cfg.topic, "test/topic");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(4));
        assert_eq!(cfg.reconnect_delay, None);
        assert_eq!(cfg.database_url, None);
    }

    #[test]
    fn subscriber_store_is_opt_in() {
        let cfg =
            SubscriberConfig::from_lookup(lookup(&[("DATABASE_URL", "readings.db")])).unwrap();
        assert_eq!(cfg.database_url.as_deref(), Some("readings.db"));

        let cfg = SubscriberConfig::from_lookup(lookup(&[("DATABASE_URL", " ")])).unwrap();
        assert_eq!(cfg.database_url, None);
    }

    #[test]
    fn subscriber_reconnect_is_opt_in() {
        let cfg = SubscriberConfig::from_lookup(lookup(&[
            ("MQTT_RECONNECT", "true"),
            ("MQTT_RECONNECT_DELAY_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(cfg.reconnect_delay, Some(Duration::from_millis(250)));

        assert!(SubscriberConfig::from_lookup(lookup(&[("MQTT_RECONNECT", "maybe")])).is_err());
    }
}
