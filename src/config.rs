//! Bridge configuration
//!
//! Built once at startup and handed to the bridge by value. Each setting is
//! read from the first non-empty environment variable in its list, so the
//! newer names win over the legacy ones.

use crate::error::{BridgeError, Result};
use crate::types::StatusPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const BROKER_HOST_VARS: &[&str] = &["MQTT_BROKER_HOST", "MQTT_BROKER"];
const BROKER_PORT_VARS: &[&str] = &["MQTT_BROKER_PORT", "MQTT_PORT"];
const INBOUND_TOPIC_VARS: &[&str] = &["MQTT_TOPIC_IN_COMMAND", "MQTT_TOPIC_CMD"];
const OUTBOUND_TOPIC_VARS: &[&str] = &["MQTT_TOPIC_OUT_RESULT", "MQTT_TOPIC_RET"];
const CLIENT_ID_VARS: &[&str] = &["MQTT_BRIDGE_CLIENT_ID", "MQTT_CLIENT_ID"];
const AGENT_CMD_VARS: &[&str] = &["OPENCLAW_CMD"];
const AGENT_ID_VARS: &[&str] = &["OPENCLAW_AGENT"];
const AGENT_TIMEOUT_VARS: &[&str] = &["OPENCLAW_TIMEOUT_SECS"];
const STATUS_POLICY_VARS: &[&str] = &["BRIDGE_STATUS_POLICY"];

pub const DEFAULT_INBOUND_TOPIC: &str = "openclaw/device/user_speech_text";
pub const DEFAULT_OUTBOUND_TOPIC: &str = "openclaw/server/response";

/// Connection and dispatch settings for one bridge instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Broker host name or IP
    pub broker_host: String,

    /// Broker TCP port
    pub broker_port: u16,

    /// Topic instructions arrive on
    pub inbound_topic: String,

    /// Topic envelopes are published to
    pub outbound_topic: String,

    /// MQTT client id; the broker evicts an older session with the same id
    pub client_id: String,

    /// MQTT keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Upper bound for the initial CONNECT/CONNACK handshake
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How the envelope `status` is derived
    #[serde(default)]
    pub status_policy: StatusPolicy,

    /// External agent invocation
    #[serde(default)]
    pub agent: AgentConfig,
}

/// How the external agent executable is invoked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Executable name or path
    pub executable: String,

    /// Value passed to `--agent`
    pub agent_id: String,

    /// Wall-clock limit for one invocation
    pub timeout_secs: u64,

    /// Leading character of banner lines to skip in stdout
    pub banner_marker: String,

    /// Product name; stdout lines containing it are treated as banner, and
    /// it prefixes error descriptions
    pub product_name: String,
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: "openclaw".to_string(),
            agent_id: "main".to_string(),
            timeout_secs: 300,
            banner_marker: "🦞".to_string(),
            product_name: "OpenClaw".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            inbound_topic: DEFAULT_INBOUND_TOPIC.to_string(),
            outbound_topic: DEFAULT_OUTBOUND_TOPIC.to_string(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            status_policy: StatusPolicy::default(),
            agent: AgentConfig::default(),
        }
    }
}

/// Client id unique to this process
pub fn default_client_id() -> String {
    format!("openclaw_bridge_srv_{}", std::process::id())
}

impl BridgeConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| first_non_empty(&lookup, keys);
        let defaults = Self::default();

        let broker_port = match first(BROKER_PORT_VARS) {
            Some(raw) => parse_number::<u16>(BROKER_PORT_VARS, &raw)?,
            None => defaults.broker_port,
        };

        let mut agent = AgentConfig::default();
        if let Some(exe) = first(AGENT_CMD_VARS) {
            agent.executable = exe;
        }
        if let Some(id) = first(AGENT_ID_VARS) {
            agent.agent_id = id;
        }
        if let Some(raw) = first(AGENT_TIMEOUT_VARS) {
            agent.timeout_secs = parse_number::<u64>(AGENT_TIMEOUT_VARS, &raw)?;
        }

        let status_policy = match first(STATUS_POLICY_VARS) {
            Some(raw) => raw.parse()?,
            None => StatusPolicy::default(),
        };

        let config = Self {
            broker_host: first(BROKER_HOST_VARS).unwrap_or(defaults.broker_host),
            broker_port,
            inbound_topic: first(INBOUND_TOPIC_VARS).unwrap_or(defaults.inbound_topic),
            outbound_topic: first(OUTBOUND_TOPIC_VARS).unwrap_or(defaults.outbound_topic),
            client_id: first(CLIENT_ID_VARS).unwrap_or(defaults.client_id),
            keep_alive_secs: defaults.keep_alive_secs,
            connect_timeout_secs: defaults.connect_timeout_secs,
            status_policy,
            agent,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the MQTT client or the agent runner cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() || self.client_id.starts_with(char::is_whitespace) {
            return Err(BridgeError::Config(format!(
                "invalid client id '{}': must be non-empty and not start with whitespace",
                self.client_id
            )));
        }
        if self.inbound_topic.is_empty() || self.outbound_topic.is_empty() {
            return Err(BridgeError::Config("topic names must be non-empty".to_string()));
        }
        if self.inbound_topic == self.outbound_topic {
            return Err(BridgeError::Config(format!(
                "inbound and outbound topic are both '{}'; the bridge would consume its own replies",
                self.inbound_topic
            )));
        }
        if self.agent.timeout_secs == 0 {
            return Err(BridgeError::Config("agent timeout must be at least 1 second".to_string()));
        }
        Ok(())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `host:port` for logs and diagnostics
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.broker_host, self.broker_port)
    }
}

fn first_non_empty<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter()
        .filter_map(|key| lookup(key))
        .find(|value| !value.is_empty())
}

fn parse_number<T: std::str::FromStr>(keys: &[&str], raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| {
        BridgeError::Config(format!("{}: invalid value '{}': {}", keys.join("/"), raw, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = assert_ok!(BridgeConfig::from_lookup(|_| None));
        assert_eq!(config.broker_host, "localhost");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.inbound_topic, "openclaw/device/user_speech_text");
        assert_eq!(config.outbound_topic, "openclaw/server/response");
        assert_eq!(config.client_id, format!("openclaw_bridge_srv_{}", std::process::id()));
        assert_eq!(config.keep_alive(), Duration::from_secs(60));
        assert_eq!(config.status_policy, StatusPolicy::NonEmpty);
        assert_eq!(config.agent.executable, "openclaw");
        assert_eq!(config.agent.agent_id, "main");
        assert_eq!(config.agent.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_new_names_win_over_legacy() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("MQTT_BROKER_HOST", "10.0.0.5"),
            ("MQTT_BROKER", "192.168.254.129"),
            ("MQTT_TOPIC_CMD", "AI_CMD"),
            ("MQTT_TOPIC_RET", "AI_RET"),
        ]))
        .unwrap();

        assert_eq!(config.broker_host, "10.0.0.5");
        assert_eq!(config.inbound_topic, "AI_CMD");
        assert_eq!(config.outbound_topic, "AI_RET");
    }

    #[test]
    fn test_empty_value_falls_through() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("MQTT_BROKER_PORT", ""),
            ("MQTT_PORT", "8883"),
            ("MQTT_BRIDGE_CLIENT_ID", ""),
        ]))
        .unwrap();

        assert_eq!(config.broker_port, 8883);
        assert!(config.client_id.starts_with("openclaw_bridge_srv_"));
    }

    #[test]
    fn test_invalid_port_is_config_error() {
        let err = BridgeConfig::from_lookup(lookup_from(&[("MQTT_PORT", "not-a-port")])).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
        assert!(err.to_string().contains("MQTT_BROKER_PORT/MQTT_PORT"));
    }

    #[test]
    fn test_agent_overrides() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            ("OPENCLAW_CMD", "/opt/openclaw/bin/openclaw"),
            ("OPENCLAW_AGENT", "voice"),
            ("OPENCLAW_TIMEOUT_SECS", "45"),
            ("BRIDGE_STATUS_POLICY", "outcome"),
        ]))
        .unwrap();

        assert_eq!(config.agent.executable, "/opt/openclaw/bin/openclaw");
        assert_eq!(config.agent.agent_id, "voice");
        assert_eq!(config.agent.timeout_secs, 45);
        assert_eq!(config.status_policy, StatusPolicy::Outcome);
    }

    #[test]
    fn test_same_topic_rejected() {
        let err = BridgeConfig::from_lookup(lookup_from(&[
            ("MQTT_TOPIC_CMD", "loop"),
            ("MQTT_TOPIC_RET", "loop"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("consume its own replies"));
    }

    #[test]
    fn test_client_id_with_leading_space_rejected() {
        let err = BridgeConfig::from_lookup(lookup_from(&[("MQTT_CLIENT_ID", " bridge")])).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert_err!(BridgeConfig::from_lookup(lookup_from(&[("OPENCLAW_TIMEOUT_SECS", "0")])));
    }

    #[test]
    fn test_serialization_roundtrip_uses_camel_case() {
        let config = BridgeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"brokerHost\":\"localhost\""));
        assert!(json.contains("\"statusPolicy\":\"non-empty\""));

        let parsed: BridgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
