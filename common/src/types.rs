use serde::Serialize;

use crate::clock::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Normal,
    Provisioning {
        started_at: Millis,
    },
    Update {
        started_at: Millis,
    },
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Provisioning { .. } => "PROVISIONING",
            Self::Update { .. } => "UPDATE",
        }
    }

    pub fn started_at(self) -> Option<Millis> {
        match self {
            Self::Normal => None,
            Self::Provisioning { started_at } | Self::Update { started_at } => Some(started_at),
        }
    }
}

/// Status LED patterns requested from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Normal,
    BrokerDisconnected,
    Provisioning,
    Updating,
    Restarting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    Command,
    Requested,
    ConfigurationSaved,
    PortalExited,
    ProvisioningTimeout,
    UpdateApplied,
    UpdateTimeout,
}

impl RestartReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "reset command",
            Self::Requested => "reset requested",
            Self::ConfigurationSaved => "configuration saved",
            Self::PortalExited => "provisioning portal exited",
            Self::ProvisioningTimeout => "provisioning timed out",
            Self::UpdateApplied => "firmware update applied",
            Self::UpdateTimeout => "firmware update timed out",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeviceStatus {
    pub mode: &'static str,
    #[serde(rename = "modeElapsedMs")]
    pub mode_elapsed_ms: Option<Millis>,
    #[serde(rename = "relayOn")]
    pub relay_on: bool,
    #[serde(rename = "brokerConnected")]
    pub broker_connected: bool,
    #[serde(rename = "backoffMs")]
    pub backoff_ms: u32,
    pub momentary: bool,
    #[serde(rename = "restartPending")]
    pub restart_pending: bool,
}
