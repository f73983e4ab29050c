use anyhow::{Context, Result};
use punch_core::{Gallery, SharedGallery};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::EnvFilter;
use zbus::object_server::SignalEmitter;

mod config;
mod dbus_interface;
mod engine;
mod provider;
mod store;

use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("punchd starting");

    let config = config::Config::load()?;
    tracing::info!(
        camera = %config.camera_device,
        db = %config.db_path.display(),
        provider = %config.provider_cmd,
        consensus_frames = config.session.consensus_frames,
        cooldown_secs = config.session.cooldown_secs,
        "configuration loaded"
    );

    let store = store::Store::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let gallery = Gallery::load(&store)?;
    tracing::info!(
        samples = gallery.len(),
        identities = gallery.identity_count(),
        "gallery loaded"
    );

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let session_bus = config.session_bus;
    let manager = engine::SessionManager::new(
        config,
        store.clone(),
        SharedGallery::new(gallery),
        Arc::new(engine::SignalNotifier::new(notify_tx)),
    );
    let manager = Arc::new(Mutex::new(manager));

    let service = AttendanceService {
        manager: Arc::clone(&manager),
        store,
    };
    let builder = if session_bus {
        tracing::warn!("using session bus (development mode)");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    let signal_conn = conn.clone();
    tokio::spawn(async move {
        while let Some((name, kind)) = notify_rx.recv().await {
            let emitter = match SignalEmitter::new(&signal_conn, OBJECT_PATH) {
                Ok(emitter) => emitter,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot build signal emitter");
                    continue;
                }
            };
            if let Err(e) =
                AttendanceService::attendance_committed(&emitter, &name, kind.as_str()).await
            {
                tracing::warn!(name = %name, error = %e, "AttendanceCommitted signal not sent");
            }
        }
    });

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "punchd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("punchd shutting down");
    tokio::task::spawn_blocking(move || manager.blocking_lock().stop()).await?;

    Ok(())
}
