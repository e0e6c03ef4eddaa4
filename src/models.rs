use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::OffsetDateTime;
use uuid::Uuid;

pub type ScraperId = Uuid;

pub const STATE_SUCCESSFUL: &str = "Successful";
pub const STATE_BROKER_DISCONNECTED: &str = "MQTT Broker disconnected";

pub fn read_failure_state(path: &std::path::Path) -> String {
    format!("Could not read file version from file '{}'.", path.display())
}

pub fn publish_failure_state(reason: &str) -> String {
    format!("Could not publish version: {}", reason)
}

/// A configured binding of a filesystem path to a broker topic plus its runtime status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scraper {
    pub id: ScraperId,
    pub name: String,
    pub enabled: bool,
    pub path: PathBuf,
    pub mqtt_topic: String,
    #[serde(
        rename = "lastUpdate",
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub last_update_utc: Option<OffsetDateTime>,
    #[serde(default)]
    pub update_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_version: Option<String>,
}

impl Scraper {
    pub fn new(id: ScraperId, props: ScraperProps) -> Self {
        Self {
            id,
            name: props.name,
            enabled: props.enabled,
            path: props.path,
            mqtt_topic: props.mqtt_topic,
            last_update_utc: None,
            update_state: String::new(),
            last_version: None,
        }
    }

    pub(crate) fn clear_status(&mut self) {
        self.last_update_utc = None;
        self.update_state.clear();
        self.last_version = None;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScraperProps {
    pub name: String,
    pub path: PathBuf,
    pub mqtt_topic: String,
    pub enabled: bool,
}

/// Partial edit of a scraper's declarative fields. `enabled` only changes through toggling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScraperEdit {
    pub name: Option<String>,
    pub path: Option<PathBuf>,
    pub mqtt_topic: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MqttProtocol {
    #[default]
    #[serde(rename = "mqtt://")]
    Plaintext,
    #[serde(rename = "mqtts://")]
    Tls,
}

impl MqttProtocol {
    pub fn toggled(self) -> Self {
        match self {
            MqttProtocol::Plaintext => MqttProtocol::Tls,
            MqttProtocol::Tls => MqttProtocol::Plaintext,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub protocol: MqttProtocol,
    pub username: String,
    pub password: String,
    pub device_id: String,
    pub device_group: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_id: "tauri-mqtt-client".to_string(),
            host: "localhost".to_string(),
            port: 1883,
            protocol: MqttProtocol::Plaintext,
            username: String::new(),
            password: String::new(),
            device_id: "FC_0103".to_string(),
            device_group: "autogroup_Monitor".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerConfigPatch {
    pub client_id: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<MqttProtocol>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub device_id: Option<String>,
    pub device_group: Option<String>,
}

/// Observed connection state. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerStatus {
    pub connected: bool,
    pub description: String,
}

impl Default for BrokerStatus {
    fn default() -> Self {
        Self {
            connected: false,
            description: "Server started".to_string(),
        }
    }
}
