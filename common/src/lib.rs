pub mod clock;
pub mod command;
pub mod config;
pub mod controller;
pub mod ports;
pub mod relay;
pub mod session;
pub mod switch;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use clock::{elapsed_ms, Millis};
pub use command::Command;
pub use config::{ConfigError, DeviceConfig, RuntimeConfig, TimingConfig};
pub use controller::{DeviceController, DeviceEvent, DeviceState, RestartState, TickOutcome};
pub use ports::{
    BrokerTransport, FirmwareUpdater, InboundMessage, LinkError, Platform, PortalEvent,
    ProvisioningPortal, StoreError, UpdateEvent,
};
pub use relay::{RelayState, StateReport};
pub use session::{ConnectivitySession, ConnectivityState};
pub use switch::{GestureDetector, GestureWindow, SwitchEdge, SwitchState};
pub use topics::*;
pub use types::{DeviceStatus, Indicator, Mode, RestartReason};
