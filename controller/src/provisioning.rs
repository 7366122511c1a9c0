//! Request and response bodies of the setup portal, shared by the host and
//! ESP32 builds.

use relay_common::{ConfigError, DeviceConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkConfigView {
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    pub wifi_pass_set: bool,
    #[serde(rename = "mqttHost")]
    pub mqtt_host: String,
    #[serde(rename = "mqttPort")]
    pub mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    pub mqtt_user: String,
    #[serde(rename = "mqttPassSet")]
    pub mqtt_pass_set: bool,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "commandTopic")]
    pub command_topic: String,
    #[serde(rename = "stateTopic")]
    pub state_topic: String,
    #[serde(rename = "availabilityTopic")]
    pub availability_topic: String,
    pub momentary: bool,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfigUpdate {
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    pub wifi_pass: Option<String>,
    #[serde(rename = "mqttHost")]
    pub mqtt_host: String,
    #[serde(rename = "mqttPort")]
    pub mqtt_port: u16,
    #[serde(rename = "mqttUser", default)]
    pub mqtt_user: String,
    #[serde(rename = "mqttPass", default)]
    pub mqtt_pass: Option<String>,
    #[serde(rename = "clientId", default)]
    pub client_id: Option<String>,
    #[serde(rename = "commandTopic", default)]
    pub command_topic: Option<String>,
    #[serde(rename = "stateTopic", default)]
    pub state_topic: Option<String>,
    #[serde(rename = "availabilityTopic", default)]
    pub availability_topic: Option<String>,
    #[serde(default)]
    pub momentary: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct NetworkUpdateResponse {
    #[serde(rename = "restartRequired")]
    pub restart_required: bool,
    pub network: NetworkConfigView,
}

pub fn build_network_config_view(config: &DeviceConfig) -> NetworkConfigView {
    NetworkConfigView {
        wifi_ssid: config.wifi_ssid.clone(),
        wifi_pass_set: !config.wifi_pass.is_empty(),
        mqtt_host: config.mqtt_host.clone(),
        mqtt_port: config.mqtt_port,
        mqtt_user: config.mqtt_user.clone(),
        mqtt_pass_set: !config.mqtt_pass.is_empty(),
        client_id: config.client_id.clone(),
        command_topic: config.command_topic.clone(),
        state_topic: config.state_topic.clone(),
        availability_topic: config.availability_topic.clone(),
        momentary: config.momentary,
    }
}

/// Merges a portal submission into the current configuration. Omitted
/// passwords and topics keep their stored values.
pub fn apply_network_update(
    current: &DeviceConfig,
    update: NetworkConfigUpdate,
) -> Result<DeviceConfig, ConfigError> {
    let mut next = current.clone();
    next.wifi_ssid = update.wifi_ssid.trim().to_string();
    if let Some(pass) = update.wifi_pass {
        next.wifi_pass = pass;
    }
    next.mqtt_host = update.mqtt_host.trim().to_string();
    next.mqtt_port = update.mqtt_port;
    next.mqtt_user = update.mqtt_user;
    if let Some(pass) = update.mqtt_pass {
        next.mqtt_pass = pass;
    }
    if let Some(client_id) = update.client_id {
        next.client_id = client_id;
    }
    if let Some(topic) = update.command_topic {
        next.command_topic = topic;
    }
    if let Some(topic) = update.state_topic {
        next.state_topic = topic;
    }
    if let Some(topic) = update.availability_topic {
        next.availability_topic = topic;
    }
    if let Some(momentary) = update.momentary {
        next.momentary = momentary;
    }

    next.validate()?;
    Ok(next)
}

pub const PORTAL_HTML: &str = r#"<!doctype html>
<html>
<head><meta name="viewport" content="width=device-width,initial-scale=1"><title>Relay setup</title></head>
<body>
<h1>Relay setup</h1>
<form id="f">
<label>WiFi SSID <input name="wifiSsid" required></label><br>
<label>WiFi password <input name="wifiPass" type="password" placeholder="unchanged"></label><br>
<label>MQTT host <input name="mqttHost" required></label><br>
<label>MQTT port <input name="mqttPort" type="number" min="1" max="65535" value="1883"></label><br>
<label>MQTT user <input name="mqttUser"></label><br>
<label>MQTT password <input name="mqttPass" type="password" placeholder="unchanged"></label><br>
<label>Command topic <input name="commandTopic"></label><br>
<label>State topic <input name="stateTopic"></label><br>
<label>Push button <input name="momentary" type="checkbox"></label><br>
<button>Save</button> <button type="button" id="x">Exit</button>
</form>
<p id="s"></p>
<script>
const f = document.getElementById('f'), s = document.getElementById('s');
fetch('/api/network').then(r => r.json()).then(c => {
  for (const k of ['wifiSsid','mqttHost','mqttPort','mqttUser','commandTopic','stateTopic']) f[k].value = c[k];
  f.momentary.checked = c.momentary;
});
f.onsubmit = async e => {
  e.preventDefault();
  const b = {wifiSsid: f.wifiSsid.value, mqttHost: f.mqttHost.value, mqttPort: +f.mqttPort.value,
    mqttUser: f.mqttUser.value, commandTopic: f.commandTopic.value, stateTopic: f.stateTopic.value,
    momentary: f.momentary.checked};
  if (f.wifiPass.value) b.wifiPass = f.wifiPass.value;
  if (f.mqttPass.value) b.mqttPass = f.mqttPass.value;
  const r = await fetch('/api/network', {method: 'PUT', headers: {'content-type': 'application/json'}, body: JSON.stringify(b)});
  s.textContent = r.ok ? 'Saved, restarting' : (await r.json()).error;
};
document.getElementById('x').onclick = () => fetch('/api/exit', {method: 'POST'}).then(() => s.textContent = 'Restarting');
</script>
</body>
</html>
"#;
