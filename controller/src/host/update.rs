use std::{net::SocketAddr, path::PathBuf};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use relay_common::{FirmwareUpdater, UpdateEvent};
use serde::Serialize;
use tokio::{net::TcpListener, runtime::Handle, sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use super::error_response;
use crate::firmware::{parse_expected_sha256, verify_image, ImageDigest, MAX_IMAGE_BYTES, SHA256_HEADER};

#[derive(Clone)]
struct UpdateState {
    image_path: PathBuf,
    events: mpsc::UnboundedSender<UpdateEvent>,
}

#[derive(Debug, Serialize)]
struct UpdateResponse {
    sha256: String,
    bytes: usize,
}

struct UpdateServer {
    events: mpsc::UnboundedReceiver<UpdateEvent>,
    task: JoinHandle<()>,
}

/// Push-style update endpoint. The host "flash" is a staged image file in the
/// data directory.
pub struct HttpUpdater {
    handle: Handle,
    port: u16,
    image_path: PathBuf,
    server: Option<UpdateServer>,
}

impl HttpUpdater {
    pub fn new(handle: Handle, data_dir: PathBuf) -> Self {
        let port = std::env::var("RELAY_UPDATE_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(8266);

        Self {
            handle,
            port,
            image_path: data_dir.join("firmware.bin"),
            server: None,
        }
    }
}

impl FirmwareUpdater for HttpUpdater {
    fn begin(&mut self) {
        if self.server.is_some() {
            return;
        }

        let (tx, events) = mpsc::unbounded_channel();
        let state = UpdateState {
            image_path: self.image_path.clone(),
            events: tx,
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let task = self.handle.spawn(serve_updates(addr, state));
        self.server = Some(UpdateServer { events, task });
    }

    fn service(&mut self) -> Option<UpdateEvent> {
        self.server.as_mut()?.events.try_recv().ok()
    }
}

impl Drop for HttpUpdater {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.task.abort();
        }
    }
}

async fn serve_updates(addr: SocketAddr, state: UpdateState) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            let reason = format!("failed to bind update server at {addr}: {err}");
            warn!("{reason}");
            let _ = state.events.send(UpdateEvent::Failed(reason));
            return;
        }
    };

    info!("waiting for firmware upload on http://{addr}/update");
    let app = Router::new()
        .route("/update", post(handle_upload))
        .layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES))
        .with_state(state);

    if let Err(err) = axum::serve(listener, app).await {
        warn!("update server error: {err}");
    }
}

async fn handle_upload(
    State(state): State<UpdateState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let expected = match headers.get(SHA256_HEADER).map(|value| value.to_str()) {
        None => None,
        Some(Ok(value)) => match parse_expected_sha256(value) {
            Ok(expected) => Some(expected),
            Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
        },
        Some(Err(_)) => {
            return error_response(StatusCode::BAD_REQUEST, "x-sha256 must be ASCII");
        }
    };

    let mut digest = ImageDigest::default();
    digest.update(&body);
    let sha256 = match verify_image(digest, expected.as_deref()) {
        Ok(sha256) => sha256,
        Err(reason) => {
            warn!("rejected firmware upload: {reason}");
            let _ = state.events.send(UpdateEvent::Failed(reason.clone()));
            return error_response(StatusCode::BAD_REQUEST, &reason);
        }
    };

    if let Some(parent) = state.image_path.parent() {
        if let Err(err) = tokio::fs::create_dir_all(parent).await {
            return stage_failed(&state, err);
        }
    }
    if let Err(err) = tokio::fs::write(&state.image_path, &body).await {
        return stage_failed(&state, err);
    }

    info!(
        "staged {} byte firmware image at {} (sha256 {sha256})",
        body.len(),
        state.image_path.display()
    );
    let _ = state.events.send(UpdateEvent::Applied);
    Json(UpdateResponse {
        sha256,
        bytes: body.len(),
    })
    .into_response()
}

fn stage_failed(state: &UpdateState, err: std::io::Error) -> axum::response::Response {
    let reason = format!("failed to stage firmware image: {err}");
    warn!("{reason}");
    let _ = state.events.send(UpdateEvent::Failed(reason));
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to stage firmware image")
}
