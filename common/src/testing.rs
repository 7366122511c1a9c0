//! Recording fakes for the collaborator traits.

use std::collections::VecDeque;

use crate::{
    config::DeviceConfig,
    ports::{
        BrokerTransport, FirmwareUpdater, InboundMessage, LinkError, Platform, PortalEvent,
        ProvisioningPortal, StoreError, UpdateEvent,
    },
    types::Indicator,
};

#[derive(Debug, Default)]
pub struct FakeBroker {
    pub network: bool,
    pub link_up: bool,
    pub failures_left: u32,
    pub connect_attempts: u32,
    pub disconnects: u32,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, String, bool)>,
    pub publish_error: Option<LinkError>,
    pub inbound: VecDeque<InboundMessage>,
}

impl FakeBroker {
    pub fn online() -> Self {
        Self {
            network: true,
            ..Self::default()
        }
    }

    pub fn offline() -> Self {
        Self::default()
    }

    pub fn fail_next_connects(&mut self, count: u32) {
        self.failures_left = count;
    }

    pub fn drop_link(&mut self) {
        self.link_up = false;
    }

    pub fn deliver(&mut self, topic: &str, payload: &[u8]) {
        self.inbound.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub fn payloads_on(&self, topic: &str) -> Vec<(String, bool)> {
        self.published
            .iter()
            .filter(|(published_topic, _, _)| published_topic == topic)
            .map(|(_, payload, retain)| (payload.clone(), *retain))
            .collect()
    }
}

impl BrokerTransport for FakeBroker {
    fn network_available(&self) -> bool {
        self.network
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.connect_attempts += 1;
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(LinkError::Timeout);
        }
        self.link_up = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link_up
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
        self.link_up = false;
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
        if let Some(err) = self.publish_error.take() {
            return Err(err);
        }
        self.published.push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
            retain,
        ));
        Ok(())
    }

    fn poll_message(&mut self) -> Option<InboundMessage> {
        self.inbound.pop_front()
    }
}

#[derive(Debug, Default)]
pub struct FakePortal {
    pub running: bool,
    pub starts: Vec<bool>,
    pub stops: u32,
    pub pending: VecDeque<PortalEvent>,
}

impl ProvisioningPortal for FakePortal {
    fn start(&mut self, on_demand: bool, _current: &DeviceConfig) {
        self.running = true;
        self.starts.push(on_demand);
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn stop(&mut self) {
        self.stops += 1;
        self.running = false;
    }

    fn service(&mut self) -> Option<PortalEvent> {
        self.pending.pop_front()
    }
}

#[derive(Debug, Default)]
pub struct FakeUpdater {
    pub begun: u32,
    pub serviced: u32,
    pub pending: VecDeque<UpdateEvent>,
}

impl FirmwareUpdater for FakeUpdater {
    fn begin(&mut self) {
        self.begun += 1;
    }

    fn service(&mut self) -> Option<UpdateEvent> {
        self.serviced += 1;
        self.pending.pop_front()
    }
}

#[derive(Debug, Default)]
pub struct FakePlatform {
    pub relay_writes: Vec<bool>,
    pub indicators: Vec<Indicator>,
    pub saved: Vec<DeviceConfig>,
    pub fail_saves: bool,
    pub restarts: u32,
}

impl Platform for FakePlatform {
    fn set_relay(&mut self, on: bool) {
        self.relay_writes.push(on);
    }

    fn indicate(&mut self, indicator: Indicator) {
        self.indicators.push(indicator);
    }

    fn save_config(&mut self, config: &DeviceConfig) -> Result<(), StoreError> {
        if self.fail_saves {
            return Err(StoreError::Unavailable("flash busy".to_string()));
        }
        self.saved.push(config.clone());
        Ok(())
    }

    fn restart(&mut self) {
        self.restarts += 1;
    }
}
