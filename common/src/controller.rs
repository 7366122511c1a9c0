use std::collections::VecDeque;

use log::{debug, info, warn};

use crate::{
    clock::{elapsed_ms, Millis},
    command::Command,
    config::{DeviceConfig, RuntimeConfig},
    ports::{
        BrokerTransport, FirmwareUpdater, InboundMessage, Platform, PortalEvent,
        ProvisioningPortal, UpdateEvent,
    },
    relay::{RelayState, StateReport},
    session::{Backoff, ConnectivitySession, ConnectivityState, SessionEvent},
    switch::{GestureDetector, GestureWindow, SwitchEdge, SwitchState},
    types::{DeviceStatus, Indicator, Mode, RestartReason},
};

/// Inbound payloads longer than this are dropped unparsed.
pub const MAX_COMMAND_PAYLOAD_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartState {
    #[default]
    Idle,
    /// Asked for during the current tick.
    Requested(RestartReason),
    /// Carried out at the top of the next tick.
    Armed(RestartReason),
}

/// Everything the control loop owns. Each component only touches its own part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub switch: SwitchState,
    pub gesture: GestureWindow,
    pub relay: RelayState,
    pub connectivity: ConnectivityState,
    pub mode: Mode,
    pub restart: RestartState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Switch(SwitchEdge),
    GestureCompleted,
    BrokerConnected,
    BrokerDisconnected,
    Command(Command),
    PortalStarted,
    ConfigurationSaved(DeviceConfig),
    PortalExited,
    UpdateApplied,
    UpdateFailed(String),
    ResetRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Restart,
}

/// The mode state machine. Reconciles switch edges, broker commands and
/// timeouts into one mode and one relay state, one tick at a time.
pub struct DeviceController<B, P, U, H> {
    config: RuntimeConfig,
    state: DeviceState,
    gesture: GestureDetector,
    session: ConnectivitySession<B>,
    portal: P,
    updater: U,
    platform: H,
    events: VecDeque<DeviceEvent>,
}

impl<B, P, U, H> DeviceController<B, P, U, H>
where
    B: BrokerTransport,
    P: ProvisioningPortal,
    U: FirmwareUpdater,
    H: Platform,
{
    pub fn new(mut config: RuntimeConfig, transport: B, portal: P, updater: U, platform: H) -> Self {
        config.sanitize();

        let gesture = GestureDetector::new(
            config.timing.gesture_max_gap_ms,
            config.timing.gesture_edge_count,
        );
        let session = ConnectivitySession::new(
            transport,
            Backoff {
                step_ms: config.timing.backoff_step_ms,
                max_ms: config.timing.backoff_max_ms,
            },
            config.device.command_topic.clone(),
            config.device.availability_topic.clone(),
        );

        Self {
            config,
            state: DeviceState::default(),
            gesture,
            session,
            portal,
            updater,
            platform,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn transport(&self) -> &B {
        self.session.transport()
    }

    pub fn transport_mut(&mut self) -> &mut B {
        self.session.transport_mut()
    }

    pub fn portal(&self) -> &P {
        &self.portal
    }

    pub fn updater(&self) -> &U {
        &self.updater
    }

    pub fn platform(&self) -> &H {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut H {
        &mut self.platform
    }

    /// Drives the relay to its boot state and, without station credentials,
    /// goes straight into provisioning.
    pub fn start(&mut self, now: Millis) {
        self.platform.set_relay(self.state.relay.on);

        if self.config.device.has_station_credentials() {
            self.platform.indicate(Indicator::BrokerDisconnected);
            info!(
                "starting in normal mode ({} switch)",
                if self.config.device.momentary {
                    "momentary"
                } else {
                    "toggle"
                }
            );
        } else {
            warn!("no station credentials configured; entering provisioning");
            self.enter_provisioning(now, false);
        }
    }

    /// Schedules a restart from outside the tick, honoured at the end of the
    /// next tick like any other request.
    pub fn request_reset(&mut self) {
        self.events.push_back(DeviceEvent::ResetRequested);
    }

    /// One pass of the control loop: switch input, then broker or
    /// collaborator servicing, then mode timeouts, then restart scheduling.
    pub fn tick(&mut self, now: Millis, raw_pressed: bool) -> TickOutcome {
        if let RestartState::Armed(reason) = self.state.restart {
            info!("restarting: {}", reason.as_str());
            if self.portal.is_running() {
                self.portal.stop();
            }
            self.platform.indicate(Indicator::Restarting);
            self.platform.restart();
            return TickOutcome::Restart;
        }

        match self.state.mode {
            Mode::Normal => {
                self.sample_switch(now, raw_pressed);
                self.dispatch_events(now);
                // A gesture may have handed the radio to the portal.
                if self.state.mode == Mode::Normal {
                    self.service_broker(now);
                }
            }
            Mode::Provisioning { .. } => self.service_portal(),
            Mode::Update { .. } => self.service_updater(),
        }
        self.dispatch_events(now);

        self.check_mode_timeout(now);

        if let RestartState::Requested(reason) = self.state.restart {
            info!("restart scheduled: {}", reason.as_str());
            self.state.restart = RestartState::Armed(reason);
        }

        TickOutcome::Continue
    }

    pub fn status(&self, now: Millis) -> DeviceStatus {
        DeviceStatus {
            mode: self.state.mode.as_str(),
            mode_elapsed_ms: self
                .state
                .mode
                .started_at()
                .map(|started_at| elapsed_ms(now, started_at)),
            relay_on: self.state.relay.on,
            broker_connected: self.state.connectivity.connected,
            backoff_ms: self.state.connectivity.backoff_ms,
            momentary: self.config.device.momentary,
            restart_pending: self.state.restart != RestartState::Idle,
        }
    }

    fn sample_switch(&mut self, now: Millis, raw_pressed: bool) {
        let Some(edge) = self.state.switch.sample(raw_pressed) else {
            return;
        };
        self.events.push_back(DeviceEvent::Switch(edge));

        // Every transition counts, whether or not it toggles the relay.
        if self.gesture.on_edge(&mut self.state.gesture, now) {
            self.events.push_back(DeviceEvent::GestureCompleted);
        }
    }

    fn service_broker(&mut self, now: Millis) {
        for event in self.session.tick(&mut self.state.connectivity, now) {
            let event = match event {
                SessionEvent::Connected => DeviceEvent::BrokerConnected,
                SessionEvent::Disconnected => DeviceEvent::BrokerDisconnected,
                SessionEvent::Message(message) => match self.parse_message(message) {
                    Some(command) => DeviceEvent::Command(command),
                    None => continue,
                },
            };
            self.events.push_back(event);
        }
    }

    fn service_portal(&mut self) {
        while let Some(event) = self.portal.service() {
            self.events.push_back(match event {
                PortalEvent::Started => DeviceEvent::PortalStarted,
                PortalEvent::ConfigurationSaved(config) => DeviceEvent::ConfigurationSaved(config),
            });
        }

        if !self.portal.is_running() && self.state.restart == RestartState::Idle {
            self.events.push_back(DeviceEvent::PortalExited);
        }
    }

    fn service_updater(&mut self) {
        if let Some(event) = self.updater.service() {
            self.events.push_back(match event {
                UpdateEvent::Applied => DeviceEvent::UpdateApplied,
                UpdateEvent::Failed(reason) => DeviceEvent::UpdateFailed(reason),
            });
        }
    }

    fn parse_message(&self, message: InboundMessage) -> Option<Command> {
        if message.topic != self.config.device.command_topic {
            debug!("ignoring message on {}", message.topic);
            return None;
        }
        if message.payload.len() > MAX_COMMAND_PAYLOAD_BYTES {
            warn!(
                "dropping oversized command payload ({} bytes)",
                message.payload.len()
            );
            return None;
        }
        Some(Command::parse(&message.payload))
    }

    fn dispatch_events(&mut self, now: Millis) {
        while let Some(event) = self.events.pop_front() {
            self.dispatch(event, now);
        }
    }

    fn dispatch(&mut self, event: DeviceEvent, now: Millis) {
        match event {
            DeviceEvent::Switch(edge) => {
                debug!("switch {edge:?}");
                let reports = self
                    .state
                    .relay
                    .apply_edge(edge, self.config.device.momentary);
                self.platform.set_relay(self.state.relay.on);
                for report in reports {
                    self.publish_state(report);
                }
            }
            DeviceEvent::GestureCompleted => {
                info!("switch gesture completed");
                self.enter_provisioning(now, true);
            }
            DeviceEvent::BrokerConnected => {
                self.platform.indicate(Indicator::Normal);
                let report = self.state.relay.report();
                self.publish_state(report);
            }
            DeviceEvent::BrokerDisconnected => {
                self.platform.indicate(Indicator::BrokerDisconnected);
            }
            DeviceEvent::Command(command) => self.handle_command(command, now),
            DeviceEvent::PortalStarted => {
                info!("provisioning portal started");
                self.platform.indicate(Indicator::Provisioning);
            }
            DeviceEvent::ConfigurationSaved(mut config) => {
                config.sanitize();
                if let Err(err) = self.platform.save_config(&config) {
                    warn!("failed to save provisioned configuration: {err}");
                }
                self.request_restart(RestartReason::ConfigurationSaved);
            }
            DeviceEvent::PortalExited => {
                warn!("provisioning portal stopped on its own");
                self.request_restart(RestartReason::PortalExited);
            }
            DeviceEvent::UpdateApplied => self.request_restart(RestartReason::UpdateApplied),
            DeviceEvent::UpdateFailed(reason) => {
                warn!("firmware update failed: {reason}");
            }
            DeviceEvent::ResetRequested => self.request_restart(RestartReason::Requested),
        }
    }

    fn handle_command(&mut self, command: Command, now: Millis) {
        if self.state.mode != Mode::Normal && command != Command::Reset {
            debug!(
                "ignoring {} outside normal mode ({})",
                command.as_str(),
                self.state.mode.as_str()
            );
            return;
        }

        match command {
            Command::TurnOn => {
                let report = self.state.relay.enable();
                self.platform.set_relay(true);
                self.publish_state(report);
            }
            Command::TurnOff => {
                let report = self.state.relay.disable();
                self.platform.set_relay(false);
                self.publish_state(report);
            }
            Command::EnterProvisioning => self.enter_provisioning(now, true),
            Command::EnterUpdate => self.enter_update(now),
            Command::Reset => self.request_restart(RestartReason::Command),
            Command::Unknown => debug!("ignoring unknown command"),
        }
    }

    fn publish_state(&mut self, report: StateReport) {
        debug!("state report {}", report.payload());
        self.session.publish(
            &self.state.connectivity,
            &self.config.device.state_topic,
            report.payload().as_bytes(),
            true,
        );
    }

    fn enter_provisioning(&mut self, now: Millis, on_demand: bool) {
        if self.state.mode != Mode::Normal {
            return;
        }

        info!("entering provisioning mode (on demand: {on_demand})");
        self.session.suspend(&mut self.state.connectivity);
        self.portal.start(on_demand, &self.config.device);
        self.state.mode = Mode::Provisioning { started_at: now };
    }

    fn enter_update(&mut self, now: Millis) {
        if self.state.mode != Mode::Normal {
            return;
        }

        info!("entering firmware update mode");
        self.session.suspend(&mut self.state.connectivity);
        self.updater.begin();
        self.platform.indicate(Indicator::Updating);
        self.state.mode = Mode::Update { started_at: now };
    }

    fn check_mode_timeout(&mut self, now: Millis) {
        let (started_at, timeout_ms, reason) = match self.state.mode {
            Mode::Normal => return,
            Mode::Provisioning { started_at } => (
                started_at,
                self.config.timing.provisioning_timeout_ms,
                RestartReason::ProvisioningTimeout,
            ),
            Mode::Update { started_at } => (
                started_at,
                self.config.timing.update_timeout_ms,
                RestartReason::UpdateTimeout,
            ),
        };

        if elapsed_ms(now, started_at) >= timeout_ms {
            self.request_restart(reason);
        }
    }

    fn request_restart(&mut self, reason: RestartReason) {
        if self.state.restart == RestartState::Idle {
            self.state.restart = RestartState::Requested(reason);
        }
    }
}
