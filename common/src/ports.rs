//! Narrow interfaces to the collaborators the control core drives. Each build
//! of the controller binary supplies its own adapters.

use thiserror::Error;

use crate::{config::DeviceConfig, types::Indicator};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("network unavailable")]
    NetworkUnavailable,
    #[error("broker connect failed: {0}")]
    ConnectFailed(String),
    #[error("connect attempt timed out")]
    Timeout,
    #[error("transport closed")]
    Closed,
    #[error("request queue full")]
    QueueFull,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode configuration: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Broker session. Every call returns promptly: `connect` is bounded and
/// `poll_message` never waits.
pub trait BrokerTransport {
    fn network_available(&self) -> bool;
    fn connect(&mut self) -> Result<(), LinkError>;
    fn is_connected(&self) -> bool;
    fn disconnect(&mut self);
    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError>;
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError>;
    fn poll_message(&mut self) -> Option<InboundMessage>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalEvent {
    Started,
    ConfigurationSaved(DeviceConfig),
}

/// Local setup interface that owns the radio while it runs.
pub trait ProvisioningPortal {
    /// `on_demand` is false when the device had no credentials at boot.
    fn start(&mut self, on_demand: bool, current: &DeviceConfig);
    fn is_running(&self) -> bool;
    fn stop(&mut self);
    fn service(&mut self) -> Option<PortalEvent>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    Applied,
    Failed(String),
}

/// Firmware update transport. Completion reporting is best effort; the
/// controller's timeout is what guarantees the device leaves update mode.
pub trait FirmwareUpdater {
    fn begin(&mut self);
    fn service(&mut self) -> Option<UpdateEvent>;
}

pub trait Platform {
    fn set_relay(&mut self, on: bool);
    fn indicate(&mut self, indicator: Indicator);
    fn save_config(&mut self, config: &DeviceConfig) -> Result<(), StoreError>;
    /// Reboots the device. On hardware this does not return.
    fn restart(&mut self);
}
