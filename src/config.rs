use std::path::Path;

use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::contacts::Recipient;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub sender: SenderConfig,
    pub mqtt: Option<MqttConfig>,
    pub link: Option<LinkConfig>,
    pub location: Option<LocationConfig>,
    pub dispatch: Option<DispatchConfig>,
    pub direct_send: Option<DirectSendConfig>,
    pub compose: Option<ComposeConfig>,
    pub permissions: Option<PermissionConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::de::from_str(&contents)?)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct SenderConfig {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub ack_timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct LinkConfig {
    /// Connect to this button instead of the first one found.
    pub device: Option<MacAddress>,
    pub power_on_timeout_seconds: Option<u64>,
    pub mtu: Option<u16>,
    pub auto_reconnect: Option<bool>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct LocationConfig {
    /// Program printing the current position as `lat,lng`.
    pub command: Option<Vec<String>>,
    pub last_known_latitude: Option<f64>,
    pub last_known_longitude: Option<f64>,
    pub permission_timeout_ms: Option<u64>,
    pub fix_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Direct,
    Relay,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct DispatchConfig {
    pub mode: Option<DeliveryMode>,
    pub history_path: Option<String>,
    pub contacts_path: Option<String>,
    pub contacts: Option<Vec<Recipient>>,
    /// An alert running longer than this releases the in-flight guard.
    pub stuck_alert_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DirectSendConfig {
    pub program: String,
    /// `{to}` and `{body}` are substituted per recipient.
    pub args: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ComposeConfig {
    pub opener: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PermissionConfig {
    pub radio: Option<bool>,
    pub send_message: Option<bool>,
    pub location: Option<bool>,
}
