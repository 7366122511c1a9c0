use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use relay_common::{DeviceConfig, PortalEvent, ProvisioningPortal};
use tokio::{
    net::TcpListener,
    runtime::Handle,
    sync::{mpsc, Mutex, Notify},
    task::JoinHandle,
};
use tracing::{info, warn};

use super::error_response;
use crate::provisioning::{
    apply_network_update, build_network_config_view, NetworkConfigUpdate, NetworkUpdateResponse,
    PORTAL_HTML,
};

#[derive(Clone)]
struct PortalState {
    config: Arc<Mutex<DeviceConfig>>,
    events: mpsc::UnboundedSender<PortalEvent>,
    exit: Arc<Notify>,
}

struct PortalServer {
    running: Arc<AtomicBool>,
    events: mpsc::UnboundedReceiver<PortalEvent>,
    task: JoinHandle<()>,
}

/// Setup portal served over HTTP. On the host the "access point" is just a
/// local listener.
pub struct HttpPortal {
    handle: Handle,
    port: u16,
    server: Option<PortalServer>,
}

impl HttpPortal {
    pub fn new(handle: Handle) -> Self {
        let port = std::env::var("RELAY_PORTAL_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(8080);

        Self {
            handle,
            port,
            server: None,
        }
    }
}

impl ProvisioningPortal for HttpPortal {
    fn start(&mut self, on_demand: bool, current: &DeviceConfig) {
        if self.is_running() {
            return;
        }

        let (tx, events) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let state = PortalState {
            config: Arc::new(Mutex::new(current.clone())),
            events: tx,
            exit: Arc::new(Notify::new()),
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!(
            "starting {} provisioning portal on http://{addr}",
            if on_demand { "on-demand" } else { "boot" }
        );

        let task = self.handle.spawn(serve_portal(addr, state, running.clone()));
        self.server = Some(PortalServer {
            running,
            events,
            task,
        });
    }

    fn is_running(&self) -> bool {
        self.server
            .as_ref()
            .is_some_and(|server| server.running.load(Ordering::Relaxed))
    }

    fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            server.task.abort();
            info!("provisioning portal stopped");
        }
    }

    fn service(&mut self) -> Option<PortalEvent> {
        self.server.as_mut()?.events.try_recv().ok()
    }
}

impl Drop for HttpPortal {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_portal(addr: SocketAddr, state: PortalState, running: Arc<AtomicBool>) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!("failed to bind provisioning portal at {addr}: {err}");
            running.store(false, Ordering::Relaxed);
            return;
        }
    };

    let _ = state.events.send(PortalEvent::Started);
    let exit = state.exit.clone();
    let app = Router::new()
        .route("/", get(handle_index))
        .route(
            "/api/network",
            get(handle_get_network).put(handle_put_network),
        )
        .route("/api/exit", post(handle_exit))
        .with_state(state);

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { exit.notified().await })
        .await
    {
        warn!("provisioning portal error: {err}");
    }
    running.store(false, Ordering::Relaxed);
}

async fn handle_index() -> impl IntoResponse {
    Html(PORTAL_HTML)
}

async fn handle_get_network(State(state): State<PortalState>) -> impl IntoResponse {
    let config = state.config.lock().await;
    Json(build_network_config_view(&config))
}

async fn handle_put_network(
    State(state): State<PortalState>,
    Json(update): Json<NetworkConfigUpdate>,
) -> impl IntoResponse {
    let mut config = state.config.lock().await;
    let next = match apply_network_update(&config, update) {
        Ok(next) => next,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    *config = next.clone();
    if state
        .events
        .send(PortalEvent::ConfigurationSaved(next.clone()))
        .is_err()
    {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Provisioning is no longer active",
        );
    }

    let payload = NetworkUpdateResponse {
        restart_required: true,
        network: build_network_config_view(&next),
    };
    Json(payload).into_response()
}

async fn handle_exit(State(state): State<PortalState>) -> impl IntoResponse {
    info!("provisioning portal exit requested");
    state.exit.notify_one();
    StatusCode::ACCEPTED
}
