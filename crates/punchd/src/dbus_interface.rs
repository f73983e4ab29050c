use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::interface;
use zbus::object_server::SignalEmitter;

use crate::engine::{SessionManager, DEFAULT_ENROLL_SAMPLES};
use crate::store::Store;

pub const BUS_NAME: &str = "org.punchclock.Attendance1";
pub const OBJECT_PATH: &str = "/org/punchclock/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.punchclock.Attendance1
/// Object path: /org/punchclock/Attendance1
///
/// Camera, thread and SQLite work runs on the blocking pool, never on the
/// executor that dispatches D-Bus calls.
pub struct AttendanceService {
    pub manager: Arc<Mutex<SessionManager>>,
    /// Shares the manager's connection; report queries do not wait on the manager.
    pub store: Store,
}

fn failed(context: &str, e: impl std::fmt::Display) -> zbus::fdo::Error {
    tracing::error!(error = %e, "{context} failed");
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| failed("serialize", e))
}

fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}

fn valid_name(name: &str) -> zbus::fdo::Result<String> {
    if name.trim().is_empty() {
        return Err(zbus::fdo::Error::InvalidArgs("name must not be empty".into()));
    }
    Ok(name.to_string())
}

impl AttendanceService {
    /// Run `f` on the blocking pool with the manager locked.
    async fn with_manager<T, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SessionManager) -> T + Send + 'static,
    {
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || f(&mut manager.blocking_lock()))
            .await
            .map_err(|e| failed("blocking task", e))
    }

    /// Run `f` on the blocking pool against the store.
    async fn with_store<T, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> T + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| failed("blocking task", e))
    }
}

#[interface(name = "org.punchclock.Attendance1")]
impl AttendanceService {
    /// Open the camera and start recognising. Returns the session id.
    async fn start_session(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start_session requested");
        self.with_manager(|m| m.start())
            .await?
            .map_err(|e| failed("start_session", e))
    }

    /// Stop the running session. Returns false if none was running.
    async fn stop_session(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop_session requested");
        self.with_manager(|m| m.stop()).await
    }

    /// Latest frame analysis as JSON; empty string before the first one.
    async fn poll_result(&self) -> zbus::fdo::Result<String> {
        let json = self
            .with_manager(|m| m.poll_result().map(serde_json::to_string).transpose())
            .await?
            .map_err(|e| failed("serialize", e))?;
        Ok(json.unwrap_or_default())
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.with_manager(|m| m.status()).await?;
        let mut value = serde_json::to_value(&status).map_err(|e| failed("status", e))?;
        value["version"] = env!("CARGO_PKG_VERSION").into();
        Ok(value.to_string())
    }

    /// Replace `name`'s samples with `embeddings_json` (an array of 128-float arrays)
    /// and reload the gallery. Returns the number of samples stored.
    async fn enroll(&self, name: &str, embeddings_json: &str) -> zbus::fdo::Result<u32> {
        tracing::info!(name, "enroll requested");
        let name = valid_name(name)?;
        let embeddings: Vec<Vec<f32>> = serde_json::from_str(embeddings_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("embeddings: {e}")))?;

        let stored = self
            .with_manager(move |m| {
                let stored = m.store().enroll(&name, &embeddings).map_err(|e| failed("enroll", e))?;
                m.reload_gallery().map_err(|e| failed("gallery reload", e))?;
                Ok::<_, zbus::fdo::Error>(stored)
            })
            .await??;
        Ok(stored as u32)
    }

    /// Capture `samples` frames' worth of embeddings for `name` from the
    /// camera (0 means the default of 20) and reload the gallery. Returns the
    /// number of samples stored. Fails while a session is running.
    async fn enroll_from_camera(&self, name: &str, samples: u32) -> zbus::fdo::Result<u32> {
        tracing::info!(name, samples, "enroll_from_camera requested");
        let name = valid_name(name)?;
        let samples = match samples {
            0 => DEFAULT_ENROLL_SAMPLES,
            n => n as usize,
        };

        let stored = self
            .with_manager(move |m| m.enroll_from_camera(&name, samples))
            .await?
            .map_err(|e| failed("enroll_from_camera", e))?;
        Ok(stored as u32)
    }

    /// Delete every sample of `name` and reload the gallery.
    async fn remove_identity(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "remove_identity requested");
        let name = name.to_string();
        self.with_manager(move |m| {
            let removed = m
                .store()
                .remove_identity(&name)
                .map_err(|e| failed("remove_identity", e))?;
            if removed {
                m.reload_gallery().map_err(|e| failed("gallery reload", e))?;
            }
            Ok::<_, zbus::fdo::Error>(removed)
        })
        .await?
    }

    /// Rebuild the gallery from storage. Returns the usable sample count.
    async fn reload_gallery(&self) -> zbus::fdo::Result<u32> {
        let samples = self
            .with_manager(|m| m.reload_gallery())
            .await?
            .map_err(|e| failed("reload_gallery", e))?;
        Ok(samples as u32)
    }

    async fn today_records(&self) -> zbus::fdo::Result<String> {
        let records = self
            .with_store(|s| s.records_on(today()))
            .await?
            .map_err(|e| failed("today_records", e))?;
        to_json(&records)
    }

    async fn present(&self) -> zbus::fdo::Result<String> {
        let present = self
            .with_store(|s| s.present_on(today()))
            .await?
            .map_err(|e| failed("present", e))?;
        to_json(&present)
    }

    async fn stats(&self) -> zbus::fdo::Result<String> {
        let stats = self
            .with_store(|s| s.stats(today()))
            .await?
            .map_err(|e| failed("stats", e))?;
        to_json(&stats)
    }

    /// Emitted once per committed attendance record.
    #[zbus(signal)]
    pub async fn attendance_committed(
        emitter: &SignalEmitter<'_>,
        name: &str,
        kind: &str,
    ) -> zbus::Result<()>;
}
