//! Bounded capture → analysis → consumer pipeline for one session.
//!
//! Frames enter through a one-frame slot: if analysis is still busy the new
//! frame is dropped, never queued. Results leave through a one-result slot
//! where the newest analysis overwrites any unread one. All session state
//! lives on the analysis thread.

use crate::attendance::{AttendanceLog, PunchType};
use crate::gallery::SharedGallery;
use crate::session::{FrameAnalysis, RecognitionSession};
use crate::types::{FaceObservation, RawFrame};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long the analysis thread waits for a frame before re-checking the stop flag.
pub const FRAME_WAIT: Duration = Duration::from_secs(1);

/// How long `stop` waits for the analysis thread before detaching it.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("face provider unavailable: {0}")]
    Unavailable(String),
    #[error("face provider protocol error: {0}")]
    Protocol(String),
    #[error("face provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("face provider I/O: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to spawn analysis thread: {0}")]
    Spawn(std::io::Error),
    #[error("session is stopped")]
    Stopped,
}

/// Detects faces in a frame and produces their embeddings and landmarks.
pub trait FaceProvider: Send {
    fn detect_and_encode(&mut self, frame: &RawFrame) -> Result<Vec<FaceObservation>, ProviderError>;
}

/// Delivers a committed attendance event somewhere outside the engine.
pub trait Notifier: Send + Sync {
    /// Returns `false` when delivery failed. A failure never undoes the commit.
    fn notify(&self, name: &str, kind: PunchType) -> bool;
}

/// Single-value mailbox; a write replaces whatever was unread.
#[derive(Debug)]
pub struct LatestSlot<T> {
    value: Mutex<Option<T>>,
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }
}

impl<T> LatestSlot<T> {
    pub fn put(&self, value: T) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
    }

    /// Take the newest value, if one arrived since the last take.
    pub fn take(&self) -> Option<T> {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Frame counters shared between the pipeline handle and its worker.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub fed: AtomicU64,
    pub dropped: AtomicU64,
    pub analysed: AtomicU64,
    pub committed: AtomicU64,
}

/// Collaborators the analysis thread needs besides the session itself.
pub struct PipelineParts {
    pub provider: Box<dyn FaceProvider>,
    pub gallery: SharedGallery,
    pub log: Arc<dyn AttendanceLog + Send + Sync>,
    pub notifier: Arc<dyn Notifier>,
}

/// A running recognition session: the analysis thread and both slots.
///
/// Every method takes `&self`, so a capture thread and a controller can
/// share one pipeline behind an `Arc`.
pub struct SessionPipeline {
    frames: Mutex<Option<SyncSender<RawFrame>>>,
    results: Arc<LatestSlot<FrameAnalysis>>,
    counters: Arc<PipelineCounters>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionPipeline {
    /// Spawn the analysis thread for `session`.
    pub fn start(session: RecognitionSession, parts: PipelineParts) -> Result<Self, SessionError> {
        let (tx, rx) = mpsc::sync_channel::<RawFrame>(1);
        let results = Arc::new(LatestSlot::default());
        let counters = Arc::new(PipelineCounters::default());
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let results = Arc::clone(&results);
            let counters = Arc::clone(&counters);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("punch-analysis".into())
                .spawn(move || {
                    let mut session = session;
                    let PipelineParts {
                        mut provider,
                        gallery,
                        log,
                        notifier,
                    } = parts;

                    tracing::info!("analysis thread started");
                    while !stop.load(Ordering::SeqCst) {
                        let frame = match rx.recv_timeout(FRAME_WAIT) {
                            Ok(frame) => frame,
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        };

                        let faces = match provider.detect_and_encode(&frame) {
                            Ok(faces) => faces,
                            Err(e) => {
                                tracing::warn!(error = %e, "face provider failed; treating frame as empty");
                                Vec::new()
                            }
                        };
                        if stop.load(Ordering::SeqCst) {
                            tracing::debug!("stopped during detection; frame discarded");
                            break;
                        }

                        let snapshot = gallery.snapshot();
                        let now = chrono::Local::now().naive_local();
                        let analysis = session.analyze(&frame.data, &faces, &snapshot, log.as_ref(), now);

                        for record in &analysis.commits {
                            counters.committed.fetch_add(1, Ordering::Relaxed);
                            if !notifier.notify(&record.name, record.kind) {
                                tracing::warn!(name = %record.name, kind = %record.kind, "attendance notification not delivered");
                            }
                        }

                        counters.analysed.fetch_add(1, Ordering::Relaxed);
                        results.put(analysis);
                    }
                    tracing::info!("analysis thread exiting");
                })
                .map_err(SessionError::Spawn)?
        };

        Ok(Self {
            frames: Mutex::new(Some(tx)),
            results,
            counters,
            stop,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Offer a frame to the analysis thread.
    ///
    /// Returns `Ok(false)` when the slot was full and the frame was dropped.
    pub fn feed_frame(&self, frame: RawFrame) -> Result<bool, SessionError> {
        let frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        let tx = frames.as_ref().ok_or(SessionError::Stopped)?;
        self.counters.fed.fetch_add(1, Ordering::Relaxed);
        match tx.try_send(frame) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("analysis busy; frame dropped");
                Ok(false)
            }
            Err(TrySendError::Disconnected(_)) => Err(SessionError::Stopped),
        }
    }

    /// Newest unread analysis, without blocking.
    pub fn poll_result(&self) -> Option<FrameAnalysis> {
        self.results.take()
    }

    pub fn counters(&self) -> &PipelineCounters {
        &self.counters
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|w| !w.is_finished())
    }

    /// Stop the analysis thread. Idempotent.
    ///
    /// Waits at most [`STOP_GRACE`]. A worker stuck in the face provider is
    /// detached; it exits without analysing once the provider returns.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).take();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(worker) = worker else {
            return;
        };

        let deadline = Instant::now() + STOP_GRACE;
        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if !worker.is_finished() {
            tracing::warn!(grace = ?STOP_GRACE, "analysis thread still busy; detaching it");
            return;
        }
        if worker.join().is_err() {
            tracing::error!("analysis thread panicked");
        }
    }
}

impl Drop for SessionPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::MemoryLog;
    use crate::gallery::Gallery;
    use crate::liveness::{Challenge, ChallengeEngine};
    use crate::session::SessionConfig;
    use crate::types::{BoundingBox, Embedding, Landmarks, EMBEDDING_DIM};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Returns one closed-eyed "alice" for every frame.
    struct AliceProvider;

    impl FaceProvider for AliceProvider {
        fn detect_and_encode(&mut self, _frame: &RawFrame) -> Result<Vec<FaceObservation>, ProviderError> {
            let eye = |cx: f32| {
                vec![
                    (cx - 15.0, 50.0),
                    (cx - 5.0, 49.5),
                    (cx + 5.0, 49.5),
                    (cx + 15.0, 50.0),
                    (cx + 5.0, 50.5),
                    (cx - 5.0, 50.5),
                ]
            };
            Ok(vec![FaceObservation {
                region: BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 },
                embedding: Embedding::new(vec![0.0; EMBEDDING_DIM]),
                landmarks: Landmarks::new()
                    .with(Landmarks::LEFT_EYE, eye(30.0))
                    .with(Landmarks::RIGHT_EYE, eye(70.0)),
            }])
        }
    }

    struct FailingProvider;

    impl FaceProvider for FailingProvider {
        fn detect_and_encode(&mut self, _frame: &RawFrame) -> Result<Vec<FaceObservation>, ProviderError> {
            Err(ProviderError::Unavailable("offline".into()))
        }
    }

    /// Blocks every detection until released.
    struct GatedProvider {
        release: mpsc::Receiver<()>,
    }

    impl FaceProvider for GatedProvider {
        fn detect_and_encode(&mut self, _frame: &RawFrame) -> Result<Vec<FaceObservation>, ProviderError> {
            let _ = self.release.recv_timeout(Duration::from_secs(5));
            Ok(Vec::new())
        }
    }

    /// Takes `delay` per detection and always sees alice.
    struct SlowProvider {
        delay: Duration,
    }

    impl FaceProvider for SlowProvider {
        fn detect_and_encode(&mut self, frame: &RawFrame) -> Result<Vec<FaceObservation>, ProviderError> {
            std::thread::sleep(self.delay);
            AliceProvider.detect_and_encode(frame)
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<(String, PunchType)>>,
        deliver: bool,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, name: &str, kind: PunchType) -> bool {
            self.seen.lock().unwrap().push((name.to_string(), kind));
            self.deliver
        }
    }

    fn blink_session() -> RecognitionSession {
        RecognitionSession::with_challenges(
            &SessionConfig::default(),
            ChallengeEngine::with_challenge(Challenge::Blink, StdRng::seed_from_u64(1)),
        )
    }

    fn alice_gallery() -> SharedGallery {
        SharedGallery::new(Gallery::from_entries(vec![("alice".to_string(), vec![0.0; EMBEDDING_DIM])]))
    }

    fn frame(fill: u8) -> RawFrame {
        RawFrame::new(vec![fill; 16], 4, 4)
    }

    fn wait_for_result(pipeline: &SessionPipeline) -> Option<FrameAnalysis> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(result) = pipeline.poll_result() {
                return Some(result);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_three_frames_commit_and_notify() {
        let log = Arc::new(MemoryLog::new());
        let notifier = Arc::new(RecordingNotifier { deliver: false, ..Default::default() });
        let pipeline = SessionPipeline::start(
            blink_session(),
            PipelineParts {
                provider: Box::new(AliceProvider),
                gallery: alice_gallery(),
                log: log.clone(),
                notifier: notifier.clone(),
            },
        )
        .unwrap();

        let mut commits = Vec::new();
        for fill in [10u8, 60, 110] {
            assert!(pipeline.feed_frame(frame(fill)).unwrap());
            let result = wait_for_result(&pipeline).expect("analysis result");
            commits.extend(result.commits);
        }

        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].kind, PunchType::PunchIn);
        // Undelivered notification leaves the record in place
        assert_eq!(log.records().len(), 1);
        assert_eq!(notifier.seen.lock().unwrap().len(), 1);
        assert_eq!(pipeline.counters().committed.load(Ordering::Relaxed), 1);

        pipeline.stop();
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_provider_error_is_an_empty_frame() {
        let pipeline = SessionPipeline::start(
            blink_session(),
            PipelineParts {
                provider: Box::new(FailingProvider),
                gallery: alice_gallery(),
                log: Arc::new(MemoryLog::new()),
                notifier: Arc::new(RecordingNotifier::default()),
            },
        )
        .unwrap();

        pipeline.feed_frame(frame(1)).unwrap();
        let result = wait_for_result(&pipeline).expect("analysis result");
        assert!(result.faces.is_empty());
        assert!(result.commits.is_empty());
        pipeline.stop();
    }

    #[test]
    fn test_busy_analysis_drops_frames() {
        let (release_tx, release_rx) = mpsc::channel();
        let pipeline = SessionPipeline::start(
            blink_session(),
            PipelineParts {
                provider: Box::new(GatedProvider { release: release_rx }),
                gallery: alice_gallery(),
                log: Arc::new(MemoryLog::new()),
                notifier: Arc::new(RecordingNotifier::default()),
            },
        )
        .unwrap();

        assert!(pipeline.feed_frame(frame(1)).unwrap());
        // Wait until the worker has taken frame 1 and is blocked in the provider
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pipeline.feed_frame(frame(2)).unwrap() {
            assert!(Instant::now() < deadline, "worker never picked up the first frame");
            std::thread::sleep(Duration::from_millis(5));
        }
        // Slot now holds frame 2; anything more is dropped
        assert!(!pipeline.feed_frame(frame(3)).unwrap());
        assert!(pipeline.counters().dropped.load(Ordering::Relaxed) >= 1);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        pipeline.stop();
    }

    #[test]
    fn test_result_slot_keeps_newest() {
        let slot = LatestSlot::default();
        assert_eq!(slot.take(), None);
        slot.put(1);
        slot.put(2);
        assert_eq!(slot.take(), Some(2));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn test_feed_after_stop_fails() {
        let pipeline = SessionPipeline::start(
            blink_session(),
            PipelineParts {
                provider: Box::new(AliceProvider),
                gallery: alice_gallery(),
                log: Arc::new(MemoryLog::new()),
                notifier: Arc::new(RecordingNotifier::default()),
            },
        )
        .unwrap();

        pipeline.stop();
        pipeline.stop();
        assert!(matches!(pipeline.feed_frame(frame(1)), Err(SessionError::Stopped)));
        assert!(pipeline.poll_result().is_none());
    }

    #[test]
    fn test_stop_is_bounded_by_a_hung_provider() {
        let log = Arc::new(MemoryLog::new());
        let pipeline = SessionPipeline::start(
            blink_session(),
            PipelineParts {
                provider: Box::new(SlowProvider { delay: Duration::from_secs(6) }),
                gallery: alice_gallery(),
                log: log.clone(),
                notifier: Arc::new(RecordingNotifier::default()),
            },
        )
        .unwrap();

        assert!(pipeline.feed_frame(frame(1)).unwrap());
        // Wait until the worker is inside the provider
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pipeline.feed_frame(frame(2)).unwrap() {
            assert!(Instant::now() < deadline, "worker never picked up the first frame");
            std::thread::sleep(Duration::from_millis(5));
        }

        let started = Instant::now();
        pipeline.stop();
        let waited = started.elapsed();
        assert!(waited < STOP_GRACE + Duration::from_secs(1), "stop took {waited:?}");
        assert!(!pipeline.is_running());
        assert!(matches!(pipeline.feed_frame(frame(3)), Err(SessionError::Stopped)));
        assert!(pipeline.poll_result().is_none());
        assert!(log.records().is_empty());
    }
}
