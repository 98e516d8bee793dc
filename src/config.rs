use std::env;
use std::time::Duration;

use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub liveness: LivenessConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    /// Inbound filter, e.g. `farm/+/sensor`
    pub sub_topic: String,
    /// Outbound prefix, commands go to `{prefix}/{device_id}/control`
    pub topic_prefix: String,
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub offline_timeout: Duration,
    pub command_timeout: Duration,
    pub history_limit: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

/// Reads settings through `lookup` so tests never touch the process environment.
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.is_empty())
    }

    fn or_default<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, String> {
        match self.optional(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| format!("{key} has an invalid value: {raw}")),
            None => Ok(default),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let raw_url = vars
            .optional("MQTT_URL")
            .unwrap_or_else(|| "mqtt://localhost:1883".to_string());
        let (broker_host, broker_port) = parse_broker_url(&raw_url)?;

        let config = Self {
            mqtt: MqttConfig {
                broker_host,
                broker_port,
                username: vars.optional("MQTT_USERNAME"),
                password: vars.optional("MQTT_PASSWORD"),
                client_id: vars.or_default("MQTT_CLIENT_ID", "farm-broker".to_string())?,
                sub_topic: vars.or_default("MQTT_SUB_TOPIC", "farm/+/sensor".to_string())?,
                topic_prefix: vars.or_default("MQTT_TOPIC_PREFIX", "farm".to_string())?,
            },
            liveness: LivenessConfig {
                offline_timeout: Duration::from_millis(
                    vars.or_default("OFFLINE_TIMEOUT_MS", 15_000u64)?,
                ),
                command_timeout: Duration::from_millis(
                    vars.or_default("COMMAND_TIMEOUT_MS", 5_000u64)?,
                ),
                history_limit: vars.or_default("HISTORY_LIMIT", 120usize)?,
            },
            server: ServerConfig {
                port: vars.or_default("PORT", 3000)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_URL must name a host".into());
        }
        if self.mqtt.sub_topic.is_empty() {
            return Err("MQTT_SUB_TOPIC must not be empty".into());
        }
        if self.liveness.offline_timeout.is_zero() {
            return Err("OFFLINE_TIMEOUT_MS must be > 0".into());
        }
        if self.liveness.command_timeout.is_zero() {
            return Err("COMMAND_TIMEOUT_MS must be > 0".into());
        }
        Ok(())
    }
}

pub fn control_topic(prefix: &str, device_id: &str) -> String {
    format!("{prefix}/{device_id}/control")
}

/// "mqtt://broker.local:1884" → ("broker.local", 1884). Port defaults to 1883.
fn parse_broker_url(raw: &str) -> Result<(String, u16), String> {
    let url = Url::parse(raw).map_err(|e| format!("MQTT_URL is not a valid URL ({raw}): {e}"))?;
    match url.scheme() {
        "mqtt" | "tcp" => {}
        other => return Err(format!("MQTT_URL scheme '{other}' is not supported")),
    }
    let host = url.host_str().unwrap_or_default().to_string();
    Ok((host, url.port().unwrap_or(1883)))
}
