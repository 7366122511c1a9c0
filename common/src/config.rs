use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    clock::Millis,
    topics::{
        is_valid_topic, DEFAULT_AVAILABILITY_TOPIC, DEFAULT_CLIENT_ID, DEFAULT_COMMAND_TOPIC,
        DEFAULT_STATE_TOPIC,
    },
};

pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("wifiSsid cannot be empty")]
    MissingSsid,
    #[error("mqttHost cannot be empty")]
    MissingBrokerHost,
    #[error("mqttPort must be between 1 and 65535")]
    InvalidPort,
    #[error("{0} is not a valid topic")]
    InvalidTopic(&'static str),
    #[error("commandTopic and stateTopic must differ")]
    TopicCollision,
}

/// Connection parameters and switch wiring, as saved by provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub client_id: String,
    pub command_topic: String,
    pub state_topic: String,
    pub availability_topic: String,
    /// Push button (toggle on press only) instead of a latching wall switch.
    pub momentary: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            command_topic: DEFAULT_COMMAND_TOPIC.to_string(),
            state_topic: DEFAULT_STATE_TOPIC.to_string(),
            availability_topic: DEFAULT_AVAILABILITY_TOPIC.to_string(),
            momentary: false,
        }
    }
}

impl DeviceConfig {
    pub fn has_station_credentials(&self) -> bool {
        let ssid = self.wifi_ssid.trim();
        !ssid.is_empty() && ssid != "CHANGE_ME"
    }

    /// Checks a configuration submitted through the provisioning portal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wifi_ssid.trim().is_empty() {
            return Err(ConfigError::MissingSsid);
        }
        if self.mqtt_host.trim().is_empty() {
            return Err(ConfigError::MissingBrokerHost);
        }
        if self.mqtt_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        for (name, topic) in [
            ("commandTopic", &self.command_topic),
            ("stateTopic", &self.state_topic),
            ("availabilityTopic", &self.availability_topic),
        ] {
            if !is_valid_topic(topic) {
                return Err(ConfigError::InvalidTopic(name));
            }
        }
        if self.command_topic == self.state_topic {
            return Err(ConfigError::TopicCollision);
        }
        Ok(())
    }

    /// Repairs a loaded snapshot so the device can always boot with it.
    pub fn sanitize(&mut self) {
        if self.mqtt_port == 0 {
            self.mqtt_port = DEFAULT_MQTT_PORT;
        }
        if self.client_id.trim().is_empty() {
            self.client_id = DEFAULT_CLIENT_ID.to_string();
        }
        if !is_valid_topic(&self.command_topic) {
            self.command_topic = DEFAULT_COMMAND_TOPIC.to_string();
        }
        if !is_valid_topic(&self.state_topic) || self.state_topic == self.command_topic {
            self.state_topic = DEFAULT_STATE_TOPIC.to_string();
        }
        // The command topic itself may already be the default state topic.
        if self.state_topic == self.command_topic {
            self.command_topic = DEFAULT_COMMAND_TOPIC.to_string();
        }
        if !is_valid_topic(&self.availability_topic) {
            self.availability_topic = DEFAULT_AVAILABILITY_TOPIC.to_string();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub tick_interval_ms: Millis,
    pub gesture_max_gap_ms: Millis,
    pub gesture_edge_count: u8,
    pub provisioning_timeout_ms: Millis,
    pub update_timeout_ms: Millis,
    pub backoff_step_ms: u32,
    pub backoff_max_ms: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10,
            gesture_max_gap_ms: 500,
            gesture_edge_count: 5,
            provisioning_timeout_ms: 300_000,
            update_timeout_ms: 300_000,
            backoff_step_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl TimingConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(1, 1_000);
        self.gesture_edge_count = self.gesture_edge_count.max(2);
        self.backoff_max_ms = self.backoff_max_ms.max(1);
        self.backoff_step_ms = self.backoff_step_ms.clamp(1, self.backoff_max_ms);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.device.sanitize();
        self.timing.sanitize();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn provisioned() -> DeviceConfig {
        DeviceConfig {
            wifi_ssid: "home".to_string(),
            wifi_pass: "secret".to_string(),
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn defaults_have_no_station_credentials() {
        assert!(!DeviceConfig::default().has_station_credentials());
        assert!(provisioned().has_station_credentials());

        let placeholder = DeviceConfig {
            wifi_ssid: "CHANGE_ME".to_string(),
            ..DeviceConfig::default()
        };
        assert!(!placeholder.has_station_credentials());
    }

    #[test]
    fn validate_reports_first_problem() {
        assert_eq!(provisioned().validate(), Ok(()));
        assert_eq!(
            DeviceConfig::default().validate(),
            Err(ConfigError::MissingSsid)
        );

        let mut config = provisioned();
        config.mqtt_port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort));

        let mut config = provisioned();
        config.state_topic = "relay/#".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTopic("stateTopic"))
        );

        let mut config = provisioned();
        config.state_topic = config.command_topic.clone();
        assert_eq!(config.validate(), Err(ConfigError::TopicCollision));
    }

    #[test]
    fn sanitize_restores_unusable_fields() {
        let mut config = provisioned();
        config.mqtt_port = 0;
        config.client_id = "  ".to_string();
        config.command_topic = String::new();
        config.state_topic = DEFAULT_COMMAND_TOPIC.to_string();

        config.sanitize();

        assert_eq!(config.mqtt_port, DEFAULT_MQTT_PORT);
        assert_eq!(config.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(config.command_topic, DEFAULT_COMMAND_TOPIC);
        assert_eq!(config.state_topic, DEFAULT_STATE_TOPIC);
        assert_eq!(config.validate(), Ok(()));

        let mut config = provisioned();
        config.command_topic = DEFAULT_STATE_TOPIC.to_string();
        config.state_topic = DEFAULT_STATE_TOPIC.to_string();

        config.sanitize();

        assert_eq!(config.command_topic, DEFAULT_COMMAND_TOPIC);
        assert_eq!(config.state_topic, DEFAULT_STATE_TOPIC);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let runtime: RuntimeConfig =
            serde_json::from_str(r#"{"device":{"wifi_ssid":"home","momentary":true}}"#).unwrap();

        assert_eq!(runtime.device.wifi_ssid, "home");
        assert!(runtime.device.momentary);
        assert_eq!(runtime.device.mqtt_port, DEFAULT_MQTT_PORT);
        assert_eq!(runtime.timing, TimingConfig::default());
    }

    #[test]
    fn timing_sanitize_keeps_backoff_step_under_ceiling() {
        let mut timing = TimingConfig {
            gesture_edge_count: 0,
            backoff_step_ms: 90_000,
            ..TimingConfig::default()
        };

        timing.sanitize();

        assert_eq!(timing.gesture_edge_count, 2);
        assert_eq!(timing.backoff_step_ms, 60_000);
    }
}
