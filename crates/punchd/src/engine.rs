use crate::config::Config;
use crate::provider;
use crate::store::{Store, StoreError};
use chrono::{DateTime, Local};
use punch_core::pipeline::STOP_GRACE;
use punch_core::{
    FaceProvider, FrameAnalysis, Gallery, Notifier, PipelineParts, ProviderError, PunchType,
    RawFrame, RecognitionSession, SessionError, SessionPipeline, SharedGallery,
};
use punch_hw::{Camera, CameraError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

/// Samples captured by camera enrollment when the caller does not say.
pub const DEFAULT_ENROLL_SAMPLES: usize = 20;

/// Frames enrollment may read per requested sample before giving up.
const ENROLL_FRAMES_PER_SAMPLE: usize = 5;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("session {0} is already running")]
    AlreadyRunning(String),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("face provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(std::io::Error),
    #[error("no frame out of {frames} showed exactly one usable face")]
    NoUsableSamples { frames: usize },
}

/// Body of the capture thread: feed `pipeline` until the flag is set or the source fails.
type CaptureLoop = Box<dyn FnOnce(&SessionPipeline, &AtomicBool) -> Result<(), CameraError> + Send>;

/// Forwards committed events to the D-Bus signal task.
pub struct SignalNotifier {
    tx: mpsc::UnboundedSender<(String, PunchType)>,
}

impl SignalNotifier {
    pub fn new(tx: mpsc::UnboundedSender<(String, PunchType)>) -> Self {
        Self { tx }
    }
}

impl Notifier for SignalNotifier {
    fn notify(&self, name: &str, kind: PunchType) -> bool {
        self.tx.send((name.to_string(), kind)).is_ok()
    }
}

/// Snapshot of the session manager for `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: Option<String>,
    pub running: bool,
    pub started_at: Option<DateTime<Local>>,
    pub camera_device: String,
    pub gallery_samples: usize,
    pub gallery_identities: usize,
    pub frames_fed: u64,
    pub frames_dropped: u64,
    pub frames_analysed: u64,
    pub commits: u64,
    /// Why the last session ended on its own, if it did.
    pub failure: Option<String>,
}

struct ActiveSession {
    id: String,
    started_at: DateTime<Local>,
    pipeline: Arc<SessionPipeline>,
    capture_stop: Arc<AtomicBool>,
    capture: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl ActiveSession {
    fn failure(&self) -> Option<String> {
        self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn shutdown(&mut self) {
        self.capture_stop.store(true, Ordering::SeqCst);
        self.pipeline.stop();
        if let Some(capture) = self.capture.take() {
            join_bounded(capture, &self.id);
        }
    }
}

/// Join the capture thread, detaching it if it outlives [`STOP_GRACE`].
fn join_bounded(handle: JoinHandle<()>, session: &str) {
    let deadline = Instant::now() + STOP_GRACE;
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    if !handle.is_finished() {
        tracing::warn!(session, "capture thread still blocked; detaching it");
        return;
    }
    if handle.join().is_err() {
        tracing::error!(session, "capture thread panicked");
    }
}

/// Owns at most one recognition session and everything it needs.
pub struct SessionManager {
    config: Config,
    store: Store,
    gallery: SharedGallery,
    notifier: Arc<dyn Notifier>,
    active: Option<ActiveSession>,
    last_result: Option<FrameAnalysis>,
}

impl SessionManager {
    pub fn new(config: Config, store: Store, gallery: SharedGallery, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            store,
            gallery,
            notifier,
            active: None,
            last_result: None,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.config.provider_timeout_ms)
    }

    /// Fail if a session is still running; clean up one that ended on its own.
    fn ensure_idle(&mut self) -> Result<(), EngineError> {
        if let Some(active) = &self.active {
            if active.pipeline.is_running() {
                return Err(EngineError::AlreadyRunning(active.id.clone()));
            }
        }
        if let Some(mut ended) = self.active.take() {
            ended.shutdown();
        }
        Ok(())
    }

    /// Open the camera and start capture and analysis. Returns the session id.
    ///
    /// Fails fast if the camera or the face provider is unavailable.
    pub fn start(&mut self) -> Result<String, EngineError> {
        self.ensure_idle()?;

        let camera = Camera::open(&self.config.camera_device)?;
        let provider = provider::from_command(&self.config.provider_cmd, self.provider_timeout())?;
        let warmup = self.config.warmup_frames;
        self.launch(
            provider,
            Box::new(move |pipeline: &SessionPipeline, stop: &AtomicBool| {
                let result = run_capture(&camera, warmup, pipeline, stop);
                drop(camera);
                tracing::info!("camera released");
                result
            }),
        )
    }

    /// Start the analysis pipeline and a `punch-capture` thread running `capture`.
    fn launch(&mut self, provider: Box<dyn FaceProvider>, capture: CaptureLoop) -> Result<String, EngineError> {
        let session = RecognitionSession::from_config(&self.config.session);
        let pipeline = Arc::new(SessionPipeline::start(
            session,
            PipelineParts {
                provider,
                gallery: self.gallery.clone(),
                log: Arc::new(self.store.clone()),
                notifier: Arc::clone(&self.notifier),
            },
        )?);

        let id = uuid::Uuid::new_v4().to_string();
        let capture_stop = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(Mutex::new(None));

        let handle = {
            let pipeline = Arc::clone(&pipeline);
            let stop = Arc::clone(&capture_stop);
            let failure = Arc::clone(&failure);
            let session_id = id.clone();
            std::thread::Builder::new()
                .name("punch-capture".into())
                .spawn(move || {
                    tracing::info!(session = %session_id, "capture thread started");
                    if let Err(e) = capture(pipeline.as_ref(), stop.as_ref()) {
                        tracing::error!(session = %session_id, error = %e, "camera failed; ending session");
                        *failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                        pipeline.stop();
                    }
                    tracing::info!(session = %session_id, "capture thread exiting");
                })
        };
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                pipeline.stop();
                return Err(EngineError::Spawn(e));
            }
        };

        let started_at = Local::now();
        tracing::info!(session = %id, device = %self.config.camera_device, "session started");
        self.last_result = None;
        self.active = Some(ActiveSession {
            id: id.clone(),
            started_at,
            pipeline,
            capture_stop,
            capture: Some(handle),
            failure,
        });
        Ok(id)
    }

    /// Stop the running session. Returns `false` if none was running.
    pub fn stop(&mut self) -> bool {
        let Some(mut active) = self.active.take() else {
            return false;
        };
        let was_running = active.pipeline.is_running();
        active.shutdown();
        tracing::info!(session = %active.id, "session stopped");
        was_running
    }

    /// Newest analysis; the previous one when nothing new arrived.
    pub fn poll_result(&mut self) -> Option<&FrameAnalysis> {
        if let Some(fresh) = self.active.as_ref().and_then(|a| a.pipeline.poll_result()) {
            self.last_result = Some(fresh);
        }
        self.last_result.as_ref()
    }

    pub fn status(&self) -> SessionStatus {
        let gallery = self.gallery.snapshot();
        let mut status = SessionStatus {
            session_id: None,
            running: false,
            started_at: None,
            camera_device: self.config.camera_device.clone(),
            gallery_samples: gallery.len(),
            gallery_identities: gallery.identity_count(),
            frames_fed: 0,
            frames_dropped: 0,
            frames_analysed: 0,
            commits: 0,
            failure: None,
        };

        if let Some(active) = &self.active {
            let counters = active.pipeline.counters();
            status.session_id = Some(active.id.clone());
            status.running = active.pipeline.is_running();
            status.started_at = Some(active.started_at);
            status.frames_fed = counters.fed.load(Ordering::Relaxed);
            status.frames_dropped = counters.dropped.load(Ordering::Relaxed);
            status.frames_analysed = counters.analysed.load(Ordering::Relaxed);
            status.commits = counters.committed.load(Ordering::Relaxed);
            status.failure = active.failure();
        }
        status
    }

    /// Rebuild the gallery from the store and swap it in. Returns the usable sample count.
    pub fn reload_gallery(&self) -> Result<usize, EngineError> {
        let gallery = Gallery::load(&self.store)?;
        let samples = gallery.len();
        tracing::info!(samples, identities = gallery.identity_count(), "gallery reloaded");
        self.gallery.replace(gallery);
        Ok(samples)
    }

    /// Capture up to `samples` embeddings of `name` from the camera, replace
    /// their stored samples and reload the gallery. Returns the stored count.
    ///
    /// Refused while a session holds the camera.
    pub fn enroll_from_camera(&mut self, name: &str, samples: usize) -> Result<usize, EngineError> {
        self.ensure_idle()?;

        let camera = Camera::open(&self.config.camera_device)?;
        let mut stream = camera.stream()?;
        if self.config.warmup_frames > 0 {
            stream.discard(self.config.warmup_frames)?;
        }
        let mut provider = provider::from_command(&self.config.provider_cmd, self.provider_timeout())?;

        self.enroll_with(
            name,
            samples,
            || {
                let frame = stream.next_frame()?;
                Ok(RawFrame::new(frame.data, frame.width, frame.height))
            },
            provider.as_mut(),
        )
    }

    fn enroll_with<F>(
        &self,
        name: &str,
        samples: usize,
        next_frame: F,
        provider: &mut dyn FaceProvider,
    ) -> Result<usize, EngineError>
    where
        F: FnMut() -> Result<RawFrame, CameraError>,
    {
        let max_frames = samples.saturating_mul(ENROLL_FRAMES_PER_SAMPLE);
        let (embeddings, frames) = collect_samples(next_frame, provider, samples, max_frames)?;
        if embeddings.is_empty() {
            return Err(EngineError::NoUsableSamples { frames });
        }
        if embeddings.len() < samples {
            tracing::warn!(name, wanted = samples, got = embeddings.len(), frames, "enrollment ran out of frames");
        }

        let stored = self.store.enroll(name, &embeddings)?;
        self.reload_gallery()?;
        tracing::info!(name, stored, frames, "enrolled from camera");
        Ok(stored)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read frames until `samples` of them show exactly one well-formed face.
///
/// Returns the embeddings and the number of frames read. Provider errors
/// skip the frame; camera errors abort.
fn collect_samples<F>(
    mut next_frame: F,
    provider: &mut dyn FaceProvider,
    samples: usize,
    max_frames: usize,
) -> Result<(Vec<Vec<f32>>, usize), CameraError>
where
    F: FnMut() -> Result<RawFrame, CameraError>,
{
    let mut embeddings = Vec::with_capacity(samples);
    let mut frames = 0;
    while embeddings.len() < samples && frames < max_frames {
        let frame = next_frame()?;
        frames += 1;
        match provider.detect_and_encode(&frame) {
            Ok(faces) => match faces.as_slice() {
                [face] if face.embedding.is_well_formed() => embeddings.push(face.embedding.values.clone()),
                _ => tracing::debug!(faces = faces.len(), "enroll: frame skipped"),
            },
            Err(e) => tracing::warn!(error = %e, "enroll: face provider failed"),
        }
    }
    Ok((embeddings, frames))
}

/// Pull frames until stopped or the camera fails.
fn run_capture(
    camera: &Camera,
    warmup: usize,
    pipeline: &SessionPipeline,
    stop: &AtomicBool,
) -> Result<(), CameraError> {
    let mut stream = camera.stream()?;
    if warmup > 0 {
        tracing::debug!(count = warmup, "discarding warmup frames");
        stream.discard(warmup)?;
    }

    while !stop.load(Ordering::SeqCst) {
        let frame = stream.next_frame()?;
        if frame.is_dark() {
            tracing::trace!(seq = frame.sequence, "dark frame");
        }
        let raw = RawFrame::new(frame.data, frame.width, frame.height);
        if pipeline.feed_frame(raw).is_err() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::NoFaces;
    use punch_core::{BoundingBox, Embedding, FaceObservation, Landmarks, EMBEDDING_DIM};
    use std::path::Path;

    fn manager() -> SessionManager {
        let store = Store::open(Path::new(":memory:")).unwrap();
        let config = Config {
            camera_device: "/dev/video-punch-missing".to_string(),
            ..Config::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        SessionManager::new(
            config,
            store,
            SharedGallery::default(),
            Arc::new(SignalNotifier::new(tx)),
        )
    }

    fn observation(seed: f32) -> FaceObservation {
        FaceObservation {
            region: BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 },
            embedding: Embedding::new(vec![seed; EMBEDDING_DIM]),
            landmarks: Landmarks::new(),
        }
    }

    /// Reports `faces[i]` faces for the i-th frame, cycling.
    struct ScriptedFaces {
        faces: Vec<usize>,
        calls: usize,
    }

    impl FaceProvider for ScriptedFaces {
        fn detect_and_encode(&mut self, _frame: &RawFrame) -> Result<Vec<FaceObservation>, ProviderError> {
            let count = self.faces[self.calls % self.faces.len()];
            self.calls += 1;
            Ok((0..count).map(|i| observation(0.1 + i as f32)).collect())
        }
    }

    fn blank_frames() -> impl FnMut() -> Result<RawFrame, CameraError> {
        || Ok(RawFrame::new(vec![0; 16], 4, 4))
    }

    #[test]
    fn test_missing_camera_fails_start() {
        let mut manager = manager();
        let err = manager.start().unwrap_err();
        assert!(matches!(err, EngineError::Camera(CameraError::DeviceNotFound(_))));
        assert!(!manager.status().running);
    }

    #[test]
    fn test_stop_without_session() {
        let mut manager = manager();
        assert!(!manager.stop());
        assert!(manager.poll_result().is_none());
    }

    #[test]
    fn test_poll_keeps_previous_result() {
        let mut manager = manager();
        let id = manager
            .launch(
                Box::new(NoFaces),
                Box::new(|pipeline: &SessionPipeline, stop: &AtomicBool| {
                    let _ = pipeline.feed_frame(RawFrame::new(vec![7; 16], 4, 4));
                    while !stop.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Ok(())
                }),
            )
            .unwrap();
        assert_eq!(manager.status().session_id.as_deref(), Some(id.as_str()));

        let deadline = Instant::now() + Duration::from_secs(5);
        let first = loop {
            if let Some(result) = manager.poll_result() {
                break result.clone();
            }
            assert!(Instant::now() < deadline, "no analysis arrived");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert!(first.faces.is_empty());

        // Nothing new was fed; the previous analysis is returned again
        assert_eq!(manager.poll_result(), Some(&first));
        assert_eq!(manager.poll_result(), Some(&first));
        assert_eq!(manager.status().frames_analysed, 1);

        assert!(manager.stop());
        assert!(!manager.status().running);
    }

    #[test]
    fn test_capture_failure_ends_session() {
        let mut manager = manager();
        manager
            .launch(
                Box::new(NoFaces),
                Box::new(|_pipeline: &SessionPipeline, _stop: &AtomicBool| {
                    Err(CameraError::CaptureFailed("unplugged".into()))
                }),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.status().running {
            assert!(Instant::now() < deadline, "session kept running");
            std::thread::sleep(Duration::from_millis(5));
        }
        let failure = manager.status().failure.unwrap();
        assert!(failure.contains("unplugged"));
        // An ended session does not block the next start
        assert!(!matches!(manager.start(), Err(EngineError::AlreadyRunning(_))));
    }

    #[test]
    fn test_enroll_keeps_single_face_frames() {
        let manager = manager();
        let mut provider = ScriptedFaces { faces: vec![0, 2, 1], calls: 0 };

        let stored = manager
            .enroll_with("carol", 3, blank_frames(), &mut provider)
            .unwrap();
        assert_eq!(stored, 3);
        // Only every third frame had exactly one face
        assert_eq!(provider.calls, 9);

        let status = manager.status();
        assert_eq!(status.gallery_samples, 3);
        assert_eq!(status.gallery_identities, 1);
        assert_eq!(manager.store().identity_names().unwrap(), vec!["carol".to_string()]);
    }

    #[test]
    fn test_enroll_without_usable_frames_stores_nothing() {
        let manager = manager();
        let mut provider = ScriptedFaces { faces: vec![0, 2], calls: 0 };

        let err = manager
            .enroll_with("carol", 2, blank_frames(), &mut provider)
            .unwrap_err();
        assert!(matches!(err, EngineError::NoUsableSamples { frames: 10 }));
        assert!(manager.store().identity_names().unwrap().is_empty());
    }

    #[test]
    fn test_enroll_stops_on_camera_error() {
        let manager = manager();
        let mut provider = ScriptedFaces { faces: vec![1], calls: 0 };
        let mut remaining = 2;
        let frames = move || {
            if remaining == 0 {
                return Err(CameraError::CaptureFailed("gone".into()));
            }
            remaining -= 1;
            Ok(RawFrame::new(vec![0; 16], 4, 4))
        };

        let err = manager.enroll_with("carol", 5, frames, &mut provider).unwrap_err();
        assert!(matches!(err, EngineError::Camera(CameraError::CaptureFailed(_))));
        assert!(manager.store().identity_names().unwrap().is_empty());
    }

    #[test]
    fn test_enroll_from_camera_refused_while_session_runs() {
        let mut manager = manager();
        manager
            .launch(
                Box::new(NoFaces),
                Box::new(|_pipeline: &SessionPipeline, stop: &AtomicBool| {
                    while !stop.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Ok(())
                }),
            )
            .unwrap();

        let err = manager.enroll_from_camera("carol", 3).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning(_)));
        manager.stop();
    }

    #[test]
    fn test_reload_gallery_counts_usable_samples() {
        let manager = manager();
        manager
            .store()
            .enroll("alice", &[vec![0.5; EMBEDDING_DIM]])
            .unwrap();
        assert_eq!(manager.reload_gallery().unwrap(), 1);

        let status = manager.status();
        assert_eq!(status.gallery_samples, 1);
        assert_eq!(status.gallery_identities, 1);
        assert!(status.session_id.is_none());
    }

    #[test]
    fn test_signal_notifier_reports_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = SignalNotifier::new(tx);
        assert!(notifier.notify("bob", PunchType::PunchIn));
        drop(rx);
        assert!(!notifier.notify("bob", PunchType::PunchOut));
    }
}
