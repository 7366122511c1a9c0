use core::convert::TryInto;
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyOutputPin, Output, OutputPin, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use relay_common::{
    BrokerTransport, DeviceConfig, DeviceController, FirmwareUpdater, InboundMessage, Indicator,
    LinkError, Millis, Platform, PortalEvent, ProvisioningPortal, RuntimeConfig, StoreError,
    TickOutcome, UpdateEvent, PAYLOAD_OFFLINE,
};

use crate::{
    firmware::{parse_expected_sha256, verify_image, ImageDigest, MAX_IMAGE_BYTES, SHA256_HEADER},
    provisioning::{
        apply_network_update, build_network_config_view, ErrorBody, NetworkConfigUpdate,
        NetworkUpdateResponse, PORTAL_HTML,
    },
};

const NVS_NAMESPACE: &str = "relay";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 4096;
const OTA_CHUNK_SIZE: usize = 4096;
const PROVISIONING_AP_SSID: &str = "RelaySwitch-Setup";
const PROVISIONING_AP_PASSWORD: &str = "RelaySetup";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 3;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_REASSOCIATE_MS: u64 = 10_000;
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const LED_FLASH_MS: Millis = 100;
const LED_FAST_BLINK_MS: Millis = 200;
const LED_SLOW_BLINK_MS: Millis = 900;
/// The status LED sinks current through the GPIO.
const LED_ACTIVE_LOW: bool = true;

type SharedWifi = Rc<RefCell<BlockingWifi<EspWifi<'static>>>>;
type EspController = DeviceController<EspTransport, EspPortal, EspUpdater, EspPlatform>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = store.load().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime.device);

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, momentary={}",
        runtime.device.wifi_ssid,
        runtime.device.mqtt_host,
        runtime.device.mqtt_port,
        runtime.device.momentary,
    );

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let mut button = PinDriver::input(pins.gpio0)?;
    button.set_pull(Pull::Up)?;
    let relay = PinDriver::output(pins.gpio12.downgrade_output())?;
    let status_led = init_status_led(pins.gpio13.downgrade_output());

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
    if runtime.device.has_station_credentials() {
        if let Err(err) = start_station(&mut wifi, &runtime.device) {
            warn!("wifi station startup failed: {err:#}");
        }
    }
    let wifi: SharedWifi = Rc::new(RefCell::new(wifi));

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let tick = Duration::from_millis(u64::from(runtime.timing.tick_interval_ms.max(1)));
    let transport = EspTransport::new(wifi.clone(), runtime.device.clone());
    let portal = EspPortal::new(wifi);
    let platform = EspPlatform {
        relay,
        status_led,
        indicator: Indicator::BrokerDisconnected,
        store,
    };

    let mut controller: EspController =
        DeviceController::new(runtime, transport, portal, EspUpdater::default(), platform);
    controller.start(monotonic_ms());

    loop {
        feed_watchdog();

        let now = monotonic_ms();
        let pressed = button.is_low();
        if controller.tick(now, pressed) == TickOutcome::Restart {
            // esp_restart does not return; reaching this means it was refused.
            return Err(anyhow!("restart did not take effect"));
        }
        controller.platform_mut().refresh_led(now);

        thread::sleep(tick);
    }
}

fn ensure_wifi_defaults(device: &mut DeviceConfig) {
    if device.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            device.wifi_ssid = ssid.to_string();
        }
    }

    if device.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            device.wifi_pass = pass.to_string();
        }
    }
}

/// Joins the configured network. Failure is not fatal: the broker session
/// keeps skipping attempts until the station associates.
fn start_station(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    device: &DeviceConfig,
) -> anyhow::Result<()> {
    let auth_method = if device.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: device
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: device
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    disable_wifi_power_save();
    info!("wifi started, connecting to `{}`", device.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                return Ok(());
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            feed_watchdog();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    Err(last_err.map_or_else(|| anyhow!("wifi connect failed"), anyhow::Error::from))
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<EspWifi<'static>>) -> anyhow::Result<()> {
    if wifi.is_started()? {
        let _ = wifi.disconnect();
        wifi.stop()?;
    }

    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!(
        "provisioning AP started on `{}` (password: `{}`)",
        PROVISIONING_AP_SSID, PROVISIONING_AP_PASSWORD
    );
    Ok(())
}

#[derive(Debug)]
enum LinkEvent {
    Up,
    Down(String),
    Message(InboundMessage),
}

/// ESP-IDF MQTT client. A fresh client is built per connect attempt and
/// dropped on failure, so retry pacing stays with the controller's backoff.
pub struct EspTransport {
    wifi: SharedWifi,
    device: DeviceConfig,
    client: Option<EspMqttClient<'static>>,
    events: Option<mpsc::Receiver<LinkEvent>>,
    inbox: VecDeque<InboundMessage>,
    connected: bool,
    last_reassociate: Cell<Option<Instant>>,
}

impl EspTransport {
    fn new(wifi: SharedWifi, device: DeviceConfig) -> Self {
        Self {
            wifi,
            device,
            client: None,
            events: None,
            inbox: VecDeque::new(),
            connected: false,
            last_reassociate: Cell::new(None),
        }
    }

    fn drain_events(&mut self) {
        let Some(events) = self.events.as_ref() else {
            return;
        };

        while let Ok(event) = events.try_recv() {
            match event {
                LinkEvent::Up => self.connected = true,
                LinkEvent::Down(reason) => {
                    if self.connected {
                        warn!("mqtt link lost: {reason}");
                    }
                    self.connected = false;
                }
                LinkEvent::Message(message) => self.inbox.push_back(message),
            }
        }
    }

    fn close_client(&mut self) {
        self.client = None;
        self.events = None;
        self.connected = false;
    }

    fn reassociate(&self) {
        let due = self
            .last_reassociate
            .get()
            .is_none_or(|at| at.elapsed() >= Duration::from_millis(WIFI_REASSOCIATE_MS));
        if !due {
            return;
        }

        self.last_reassociate.set(Some(Instant::now()));
        if let Err(err) = self.wifi.borrow_mut().wifi_mut().connect() {
            warn!("wifi reassociate request failed: {err}");
        }
    }
}

impl BrokerTransport for EspTransport {
    fn network_available(&self) -> bool {
        if is_wifi_station_connected() {
            return true;
        }
        self.reassociate();
        false
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.drain_events();
        if self.connected {
            return Ok(());
        }
        self.close_client();

        let (client, conn) = create_mqtt_client(&self.device)
            .map_err(|err| LinkError::ConnectFailed(format!("{err:?}")))?;
        let (tx, events) = mpsc::channel();
        spawn_mqtt_receiver(conn, tx)
            .map_err(|err| LinkError::ConnectFailed(format!("receiver thread: {err}")))?;

        let deadline = Instant::now() + MQTT_CONNECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(LinkEvent::Up) => break,
                Ok(LinkEvent::Message(message)) => self.inbox.push_back(message),
                Ok(LinkEvent::Down(reason)) => return Err(LinkError::ConnectFailed(reason)),
                Err(mpsc::RecvTimeoutError::Timeout) => return Err(LinkError::Timeout),
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(LinkError::Closed),
            }
        }

        info!(
            "mqtt connected to {}:{}",
            self.device.mqtt_host, self.device.mqtt_port
        );
        self.client = Some(client);
        self.events = Some(events);
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        self.close_client();
        self.inbox.clear();
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), LinkError> {
        let client = self.client.as_mut().ok_or(LinkError::Closed)?;
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .map(|_| ())
            .map_err(|err| LinkError::ConnectFailed(format!("subscribe {topic}: {err}")))
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), LinkError> {
        self.drain_events();
        if !self.connected {
            return Err(LinkError::Closed);
        }
        let client = self.client.as_mut().ok_or(LinkError::Closed)?;
        client
            .enqueue(topic, QoS::AtLeastOnce, retain, payload)
            .map(|_| ())
            .map_err(|_| LinkError::QueueFull)
    }

    fn poll_message(&mut self) -> Option<InboundMessage> {
        self.drain_events();
        self.inbox.pop_front()
    }
}

fn create_mqtt_client(
    device: &DeviceConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", device.mqtt_host, device.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(device.client_id.as_str()),
        username: if device.mqtt_user.is_empty() {
            None
        } else {
            Some(device.mqtt_user.as_str())
        },
        password: if device.mqtt_pass.is_empty() {
            None
        } else {
            Some(device.mqtt_pass.as_str())
        },
        keep_alive_interval: Some(Duration::from_secs(15)),
        lwt: Some(LwtConfiguration {
            topic: device.availability_topic.as_str(),
            payload: PAYLOAD_OFFLINE.as_bytes(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    events: mpsc::Sender<LinkEvent>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            // Ends once the client is dropped and the connection closes.
            while let Ok(event) = conn.next() {
                let event = match event.payload() {
                    EventPayload::Connected(_) => LinkEvent::Up,
                    EventPayload::Disconnected => LinkEvent::Down("disconnected".to_string()),
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => LinkEvent::Message(InboundMessage {
                        topic: topic.to_string(),
                        payload: data.to_vec(),
                    }),
                    EventPayload::Error(err) => {
                        warn!("mqtt error: {err:?}");
                        continue;
                    }
                    _ => continue,
                };

                if events.send(event).is_err() {
                    break;
                }
            }
        })
        .map(|_| ())
}

/// Setup portal on the provisioning access point. Takes the radio over from
/// the station while it runs.
pub struct EspPortal {
    wifi: SharedWifi,
    server: Option<EspHttpServer<'static>>,
    events: Option<mpsc::Receiver<PortalEvent>>,
    running: Arc<AtomicBool>,
}

impl EspPortal {
    fn new(wifi: SharedWifi) -> Self {
        Self {
            wifi,
            server: None,
            events: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn try_start(&mut self, current: &DeviceConfig) -> anyhow::Result<()> {
        start_provisioning_ap(&mut self.wifi.borrow_mut())?;

        let (tx, events) = mpsc::channel();
        let _ = tx.send(PortalEvent::Started);
        self.running.store(true, Ordering::Relaxed);
        self.server = Some(create_portal_server(
            current.clone(),
            tx,
            self.running.clone(),
        )?);
        self.events = Some(events);
        Ok(())
    }
}

impl ProvisioningPortal for EspPortal {
    fn start(&mut self, on_demand: bool, current: &DeviceConfig) {
        if self.is_running() {
            return;
        }

        info!(
            "starting {} provisioning portal",
            if on_demand { "on-demand" } else { "boot" }
        );
        if let Err(err) = self.try_start(current) {
            warn!("failed to start provisioning portal: {err:#}");
            self.running.store(false, Ordering::Relaxed);
            self.server = None;
        }
    }

    fn is_running(&self) -> bool {
        self.server.is_some() && self.running.load(Ordering::Relaxed)
    }

    fn stop(&mut self) {
        self.server = None;
        self.running.store(false, Ordering::Relaxed);
        if let Err(err) = self.wifi.borrow_mut().stop() {
            warn!("failed to stop provisioning AP: {err}");
        }
        info!("provisioning portal stopped");
    }

    fn service(&mut self) -> Option<PortalEvent> {
        self.events.as_ref()?.try_recv().ok()
    }
}

fn create_portal_server(
    current: DeviceConfig,
    events: mpsc::Sender<PortalEvent>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;
    let config = Arc::new(Mutex::new(current));

    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_ok_response()?.write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let config = config.clone();
        server.fn_handler::<anyhow::Error, _>("/api/network", Method::Get, move |req| {
            let view = {
                let config = config.lock().map_err(|_| anyhow!("portal state poisoned"))?;
                build_network_config_view(&config)
            };
            write_json(req, 200, &view)
        })?;
    }

    {
        let config = config.clone();
        server.fn_handler::<anyhow::Error, _>("/api/network", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: NetworkConfigUpdate = match serde_json::from_slice(&body) {
                Ok(update) => update,
                Err(err) => return write_error(req, 400, &format!("invalid network payload: {err}")),
            };

            let next = {
                let mut config = config.lock().map_err(|_| anyhow!("portal state poisoned"))?;
                match apply_network_update(&config, update) {
                    Ok(next) => {
                        *config = next.clone();
                        next
                    }
                    Err(err) => {
                        drop(config);
                        return write_error(req, 400, &err.to_string());
                    }
                }
            };

            if events
                .send(PortalEvent::ConfigurationSaved(next.clone()))
                .is_err()
            {
                return write_error(req, 503, "Provisioning is no longer active");
            }

            let payload = NetworkUpdateResponse {
                restart_required: true,
                network: build_network_config_view(&next),
            };
            write_json(req, 200, &payload)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/exit", Method::Post, move |req| {
        info!("provisioning portal exit requested");
        running.store(false, Ordering::Relaxed);
        write_json(req, 202, &serde_json::json!({ "restarting": true }))
    })?;

    Ok(server)
}

/// Push update endpoint. Streams the upload straight into the inactive OTA
/// slot while hashing it.
#[derive(Default)]
pub struct EspUpdater {
    server: Option<EspHttpServer<'static>>,
    events: Option<mpsc::Receiver<UpdateEvent>>,
}

impl FirmwareUpdater for EspUpdater {
    fn begin(&mut self) {
        if self.server.is_some() {
            return;
        }

        let (tx, events) = mpsc::channel();
        match create_update_server(tx.clone()) {
            Ok(server) => {
                info!("waiting for firmware upload on /update");
                self.server = Some(server);
            }
            Err(err) => {
                let reason = format!("failed to start update server: {err:#}");
                warn!("{reason}");
                let _ = tx.send(UpdateEvent::Failed(reason));
            }
        }
        self.events = Some(events);
    }

    fn service(&mut self) -> Option<UpdateEvent> {
        self.events.as_ref()?.try_recv().ok()
    }
}

fn create_update_server(
    events: mpsc::Sender<UpdateEvent>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/update", Method::Post, move |mut req| {
        let expected = match req.header(SHA256_HEADER).map(parse_expected_sha256).transpose() {
            Ok(expected) => expected,
            Err(message) => return write_error(req, 400, message),
        };
        if req.content_len().unwrap_or(0) as usize > MAX_IMAGE_BYTES {
            return write_error(req, 413, "firmware image too large");
        }

        match flash_image(&mut req, expected.as_deref()) {
            Ok(sha256) => {
                info!("firmware image written (sha256 {sha256})");
                let _ = events.send(UpdateEvent::Applied);
                write_json(req, 200, &serde_json::json!({ "sha256": sha256 }))
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!("firmware update failed: {reason}");
                let _ = events.send(UpdateEvent::Failed(reason.clone()));
                write_error(req, 400, &reason)
            }
        }
    })?;

    Ok(server)
}

fn flash_image(
    req: &mut Request<&mut EspHttpConnection<'_>>,
    expected_sha256: Option<&str>,
) -> anyhow::Result<String> {
    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut update = ota
        .initiate_update()
        .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

    let mut digest = ImageDigest::default();
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];
    let streamed = loop {
        let read = match req.read(&mut chunk) {
            Ok(0) => break Ok(()),
            Ok(read) => read,
            Err(err) => break Err(anyhow!("upload read failed: {err:?}")),
        };
        if digest.len() as usize + read > MAX_IMAGE_BYTES {
            break Err(anyhow!("firmware image too large"));
        }
        if let Err(err) = update.write(&chunk[..read]) {
            break Err(anyhow!("failed writing OTA data: {err:?}"));
        }
        digest.update(&chunk[..read]);
        feed_watchdog();
    };

    match streamed.and_then(|()| verify_image(digest, expected_sha256).map_err(anyhow::Error::msg)) {
        Ok(sha256) => {
            update
                .complete()
                .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;
            Ok(sha256)
        }
        Err(err) => {
            if let Err(abort_err) = update.abort() {
                warn!("failed to abort OTA update: {abort_err:?}");
            }
            Err(err)
        }
    }
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = ErrorBody {
        error: message.to_string(),
    };
    write_json(req, status_code, &payload)
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

pub struct EspPlatform {
    relay: PinDriver<'static, AnyOutputPin, Output>,
    status_led: Option<StatusLed>,
    indicator: Indicator,
    store: NvsStore,
}

impl EspPlatform {
    fn refresh_led(&mut self, now: Millis) {
        let blink = |period: Millis| (now / period) % 2 == 0;
        let desired_on = match self.indicator {
            Indicator::Normal => true,
            Indicator::BrokerDisconnected => blink(LED_SLOW_BLINK_MS),
            Indicator::Provisioning => blink(LED_FAST_BLINK_MS),
            Indicator::Updating => blink(LED_FLASH_MS),
            Indicator::Restarting => false,
        };

        let Some(led) = self.status_led.as_mut() else {
            return;
        };

        if desired_on == led.lit {
            return;
        }

        let result = if desired_on != LED_ACTIVE_LOW {
            led.pin.set_high()
        } else {
            led.pin.set_low()
        };

        if let Err(err) = result {
            warn!("failed to drive status LED: {err}");
        } else {
            led.lit = desired_on;
        }
    }
}

impl Platform for EspPlatform {
    fn set_relay(&mut self, on: bool) {
        let result = if on {
            self.relay.set_high()
        } else {
            self.relay.set_low()
        };

        match result {
            Ok(()) => info!("relay {}", if on { "ON" } else { "OFF" }),
            Err(err) => warn!("failed to drive relay: {err}"),
        }
    }

    fn indicate(&mut self, indicator: Indicator) {
        self.indicator = indicator;
    }

    fn save_config(&mut self, config: &DeviceConfig) -> Result<(), StoreError> {
        self.store.save_device(config)
    }

    fn restart(&mut self) {
        thread::sleep(Duration::from_millis(500));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_device(&self, device: &DeviceConfig) -> Result<(), StoreError> {
        let mut runtime = self.load().unwrap_or_else(|err| {
            warn!("replacing unreadable runtime config: {err:#}");
            RuntimeConfig::default()
        });
        runtime.device = device.clone();

        let payload = serde_json::to_string(&runtime)?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StoreError::Unavailable(format!("{err:?}")))?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)
            .map_err(|err| StoreError::Unavailable(format!("{err:?}")))
    }
}

fn init_status_led(pin: AnyOutputPin) -> Option<StatusLed> {
    match PinDriver::output(pin) {
        Ok(mut pin) => {
            let _ = if LED_ACTIVE_LOW {
                pin.set_high()
            } else {
                pin.set_low()
            };
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable: {err}");
            None
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

/// Milliseconds since boot, wrapping like the hardware counter.
fn monotonic_ms() -> Millis {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as Millis
}
