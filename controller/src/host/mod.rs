mod mqtt;
mod portal;
mod store;
mod update;

use std::{
    io::BufRead,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};
use relay_common::{
    BrokerTransport, DeviceConfig, DeviceController, DeviceStatus, Indicator, Millis, Platform,
    RuntimeConfig, StoreError, TickOutcome, PAYLOAD_OFFLINE,
};
use tokio::{net::TcpListener, runtime::Handle, sync::watch};
use tracing::{debug, info, warn};

use crate::provisioning::ErrorBody;
use mqtt::MqttTransport;
use portal::HttpPortal;
use store::{apply_env_overrides, ConfigStore};
use update::HttpUpdater;

type HostController = DeviceController<MqttTransport, HttpPortal, HttpUpdater, HostPlatform>;

/// Pause between tearing the old controller down and booting the new one, so
/// listeners release their ports.
const REBOOT_DELAY: Duration = Duration::from_millis(500);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    let console = Arc::new(ConsoleInput::default());
    let (status_tx, status_rx) = watch::channel(None);

    spawn_shutdown_listener(shutdown.clone());
    spawn_console_reader(console.clone(), status_rx.clone());
    spawn_status_server(status_rx).await?;

    let handle = Handle::current();
    let store = ConfigStore::from_env();
    tokio::task::spawn_blocking(move || {
        run_control_loop(handle, store, console, status_tx, shutdown)
    })
    .await
    .context("control loop panicked")?
}

/// Boots a controller, ticks it until it asks for a restart, then boots a
/// fresh one from the stored configuration.
fn run_control_loop(
    handle: Handle,
    store: ConfigStore,
    console: Arc<ConsoleInput>,
    status: watch::Sender<Option<DeviceStatus>>,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    loop {
        let mut controller = boot(&handle, &store);
        let tick = Duration::from_millis(u64::from(controller.config().timing.tick_interval_ms));

        loop {
            if shutdown.load(Ordering::Relaxed) {
                go_offline(&mut controller);
                return Ok(());
            }
            if console.reset.swap(false, Ordering::Relaxed) {
                controller.request_reset();
            }

            let now = monotonic_ms();
            let outcome = controller.tick(now, console.pressed.load(Ordering::Relaxed));
            status.send_replace(Some(controller.status(now)));
            if outcome == TickOutcome::Restart {
                break;
            }
            std::thread::sleep(tick);
        }

        drop(controller);
        std::thread::sleep(REBOOT_DELAY);
        info!("rebooting");
    }
}

fn boot(handle: &Handle, store: &ConfigStore) -> HostController {
    let mut runtime = store.load().unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime, |key| std::env::var(key).ok());

    let transport = MqttTransport::new(handle.clone(), &runtime.device);
    let portal = HttpPortal::new(handle.clone());
    let updater = HttpUpdater::new(handle.clone(), store.data_dir().to_path_buf());
    let platform = HostPlatform::new(store.clone());

    let mut controller = DeviceController::new(runtime, transport, portal, updater, platform);
    controller.start(monotonic_ms());
    controller
}

/// A clean disconnect suppresses the last will, so announce it ourselves.
fn go_offline(controller: &mut HostController) {
    info!("shutting down");
    if !controller.state().connectivity.connected {
        return;
    }

    let topic = controller.config().device.availability_topic.clone();
    let transport = controller.transport_mut();
    if let Err(err) = transport.publish(&topic, PAYLOAD_OFFLINE.as_bytes(), true) {
        warn!("failed to publish offline status: {err}");
    }
    std::thread::sleep(Duration::from_millis(200));
    transport.disconnect();
}

pub struct HostPlatform {
    store: ConfigStore,
    indicator: Option<Indicator>,
}

impl HostPlatform {
    fn new(store: ConfigStore) -> Self {
        Self {
            store,
            indicator: None,
        }
    }
}

impl Platform for HostPlatform {
    fn set_relay(&mut self, on: bool) {
        info!("relay {}", if on { "ON" } else { "OFF" });
    }

    fn indicate(&mut self, indicator: Indicator) {
        if self.indicator != Some(indicator) {
            debug!("indicator: {indicator:?}");
            self.indicator = Some(indicator);
        }
    }

    fn save_config(&mut self, config: &DeviceConfig) -> Result<(), StoreError> {
        self.store.save_device(config)
    }

    fn restart(&mut self) {
        info!("restart requested; rebooting in-process");
    }
}

/// Switch level and requests typed on stdin.
#[derive(Default)]
struct ConsoleInput {
    pressed: AtomicBool,
    reset: AtomicBool,
}

fn spawn_console_reader(console: Arc<ConsoleInput>, status: watch::Receiver<Option<DeviceStatus>>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match line.trim() {
                "press" | "p" => console.pressed.store(true, Ordering::Relaxed),
                "release" | "r" => console.pressed.store(false, Ordering::Relaxed),
                "flick" | "f" => {
                    console.pressed.fetch_xor(true, Ordering::Relaxed);
                }
                "reset" => console.reset.store(true, Ordering::Relaxed),
                "status" | "s" => match status.borrow().as_ref() {
                    Some(current) => info!("{current:?}"),
                    None => info!("controller not started yet"),
                },
                "" => {}
                other => warn!("unknown console command {other:?} (press, release, flick, reset, status)"),
            }
        }
    });
}

fn spawn_shutdown_listener(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            return;
        }
        shutdown.store(true, Ordering::Relaxed);
    });
}

async fn spawn_status_server(status: watch::Receiver<Option<DeviceStatus>>) -> anyhow::Result<()> {
    let port = std::env::var("RELAY_STATUS_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8081);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .with_state(status);

    info!("status available on http://{addr}/api/status");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("status server error: {err}");
        }
    });
    Ok(())
}

async fn handle_get_status(
    State(status): State<watch::Receiver<Option<DeviceStatus>>>,
) -> impl IntoResponse {
    let current = status.borrow().clone();
    match current {
        Some(current) => Json(current).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "Controller is starting"),
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Milliseconds since the first call, wrapping like the hardware counter.
fn monotonic_ms() -> Millis {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as Millis
}
