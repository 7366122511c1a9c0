use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use relay_common::{DeviceConfig, RuntimeConfig, StoreError};

/// JSON snapshot of the runtime configuration under the data directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    data_dir: PathBuf,
    runtime_path: PathBuf,
}

impl ConfigStore {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("RELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.relay"));
        Self::new(data_dir)
    }

    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            runtime_path: data_dir.join("runtime.json"),
            data_dir,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn load(&self) -> anyhow::Result<RuntimeConfig> {
        match std::fs::read(&self.runtime_path) {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Replaces the device section, keeping whatever timing is on disk.
    pub fn save_device(&self, device: &DeviceConfig) -> Result<(), StoreError> {
        let mut runtime = self.load().unwrap_or_else(|err| {
            tracing::warn!("replacing unreadable runtime config: {err:#}");
            RuntimeConfig::default()
        });
        runtime.device = device.clone();

        std::fs::create_dir_all(&self.data_dir)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let payload = serde_json::to_vec_pretty(&runtime)?;
        std::fs::write(&self.runtime_path, payload)
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }
}

/// Broker settings from the environment win over the stored snapshot.
pub fn apply_env_overrides(
    runtime: &mut RuntimeConfig,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let device = &mut runtime.device;
    if let Some(host) = lookup("MQTT_HOST") {
        device.mqtt_host = host;
    }
    if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        device.mqtt_port = port;
    }
    if let Some(user) = lookup("MQTT_USER") {
        device.mqtt_user = user;
    }
    if let Some(pass) = lookup("MQTT_PASS") {
        device.mqtt_pass = pass;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("relay-store-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn missing_file_loads_defaults() {
        let store = ConfigStore::new(scratch_dir("missing"));
        assert_eq!(store.load().unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn saved_device_survives_reload_and_keeps_timing() {
        let dir = scratch_dir("roundtrip");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("runtime.json"),
            r#"{"timing":{"gesture_edge_count":7}}"#,
        )
        .unwrap();

        let store = ConfigStore::new(&dir);
        let device = DeviceConfig {
            wifi_ssid: "home".to_string(),
            momentary: true,
            ..DeviceConfig::default()
        };
        store.save_device(&device).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.device, device);
        assert_eq!(loaded.timing.gesture_edge_count, 7);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn env_overrides_replace_broker_settings() {
        let mut runtime = RuntimeConfig::default();
        apply_env_overrides(&mut runtime, |key| match key {
            "MQTT_HOST" => Some("broker.lan".to_string()),
            "MQTT_PORT" => Some("not-a-port".to_string()),
            "MQTT_USER" => Some("relay".to_string()),
            _ => None,
        });

        assert_eq!(runtime.device.mqtt_host, "broker.lan");
        assert_eq!(runtime.device.mqtt_port, 1883);
        assert_eq!(runtime.device.mqtt_user, "relay");
        assert_eq!(runtime.device.mqtt_pass, "");
    }
}
