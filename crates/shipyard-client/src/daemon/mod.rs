//! Background download mode: one download session, observable and
//! stoppable over a small local HTTP surface.

pub mod liveness;
pub mod status;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::client::UpdateClient;
use crate::downloader::Sleeper;
use crate::error::UpdateError;
use liveness::{spawn_watchdog, ProcessProbe, WATCHDOG_INTERVAL};
use status::{DaemonState, DaemonStatus};

struct Shared {
    status: DaemonStatus,
    shutting_down: AtomicBool,
    stop: watch::Sender<bool>,
}

/// Cloneable control handle: status access plus a once-only shutdown.
#[derive(Clone)]
pub struct DaemonHandle {
    shared: Arc<Shared>,
}

impl DaemonHandle {
    pub fn new(status: DaemonStatus) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                status,
                shutting_down: AtomicBool::new(false),
                stop,
            }),
        }
    }

    pub fn status(&self) -> &DaemonStatus {
        &self.shared.status
    }

    /// Begin shutdown. Returns false if shutdown had already begun.
    pub fn shutdown(&self) -> bool {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.stop.send_replace(true);
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has begun.
    pub async fn stopped(&self) {
        let mut rx = self.shared.stop.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/status", get(status_handler))
            .route("/shutdown", post(shutdown_handler))
            .with_state(self.clone())
    }
}

async fn status_handler(State(handle): State<DaemonHandle>) -> impl IntoResponse {
    Json(handle.status().snapshot())
}

async fn shutdown_handler(State(handle): State<DaemonHandle>) -> impl IntoResponse {
    if handle.shutdown() {
        info!("shutdown requested");
        Json(json!({"success": true, "message": "daemon is shutting down"}))
    } else {
        Json(json!({
            "success": false,
            "error": "already_shutting_down",
            "message": "daemon is already shutting down"
        }))
    }
}

/// A daemon control server bound to a loopback port.
pub struct Daemon {
    handle: DaemonHandle,
    listener: TcpListener,
}

impl Daemon {
    pub async fn bind(port: u16, status: DaemonStatus) -> Result<Self, UpdateError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                UpdateError::Config(format!("port {port} is already in use"))
            } else {
                UpdateError::File(e)
            }
        })?;
        Ok(Self {
            handle: DaemonHandle::new(status),
            listener,
        })
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, UpdateError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until shutdown is requested, then close the listener.
    pub async fn serve(self) -> Result<(), UpdateError> {
        let handle = self.handle.clone();
        axum::serve(self.listener, self.handle.router())
            .with_graceful_shutdown(async move { handle.stopped().await })
            .await?;
        info!("daemon stopped");
        Ok(())
    }
}

/// Options for [`run`].
pub struct DaemonOptions {
    pub version: String,
    pub output: Option<PathBuf>,
    pub port: u16,
    /// Process to supervise; 0 disables supervision.
    pub parent_pid: u32,
}

/// Run one download session under a daemon control server and return once
/// the daemon has been shut down (by request or because the parent died).
pub async fn run<S, P>(
    client: UpdateClient<S>,
    options: DaemonOptions,
    probe: P,
) -> Result<(), UpdateError>
where
    S: Sleeper + 'static,
    P: ProcessProbe,
{
    let status = DaemonStatus::new(options.version.clone());
    let daemon = Daemon::bind(options.port, status.clone()).await?;
    let handle = daemon.handle();
    info!(addr = %daemon.local_addr()?, parent_pid = options.parent_pid, "daemon listening");

    spawn_watchdog(handle.clone(), options.parent_pid, probe, WATCHDOG_INTERVAL);

    tokio::spawn(async move {
        status.set_state(DaemonState::Downloading);
        let progress = status.clone();
        let result = client
            .download_update(&options.version, options.output.as_deref(), |p| {
                progress.set_progress(p)
            })
            .await;
        match result {
            Ok(done) => status.set_completed(done.file),
            Err(e) => {
                error!(error = %e, "daemon download failed");
                status.set_error(Some(&e));
            }
        }
    });

    daemon.serve().await
}
