//! punch-core: liveness and attendance decision engine.
//!
//! Turns per-frame face observations into attendance events: an anti-spoof
//! gate over raw frames, an active liveness challenge over landmarks,
//! multi-frame recognition consensus over embeddings, and a punch-in /
//! punch-out state machine with cooldown. Detection, storage and transport
//! are collaborators behind traits; this crate does no I/O.

pub mod antispoof;
pub mod attendance;
pub mod consensus;
pub mod gallery;
pub mod liveness;
pub mod pipeline;
pub mod session;
pub mod types;

pub use antispoof::{AntiSpoofGate, GateVerdict, ReplayEviction};
pub use attendance::{
    AttendanceLog, AttendanceMachine, AttendanceRecord, CommitOutcome, CooldownScope, LogError,
    MemoryLog, PunchType,
};
pub use consensus::{ConsensusStep, ConsensusTracker};
pub use gallery::{
    EuclideanMatcher, Gallery, GalleryProvider, Identity, Matcher, Recognition, SharedGallery,
};
pub use liveness::{Challenge, ChallengeEngine};
pub use pipeline::{
    FaceProvider, LatestSlot, Notifier, PipelineParts, ProviderError, SessionError, SessionPipeline,
};
pub use session::{FaceResult, FrameAnalysis, RecognitionSession, SessionConfig};
pub use types::{BoundingBox, Embedding, FaceObservation, Landmarks, RawFrame, EMBEDDING_DIM};
