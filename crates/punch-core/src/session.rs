//! Per-session recognition state and the single-frame analysis cycle.

use crate::antispoof::{
    AntiSpoofGate, GateVerdict, ReplayEviction, DEFAULT_MOTION_THRESHOLD, DEFAULT_REPLAY_CAPACITY,
};
use crate::attendance::{
    AttendanceLog, AttendanceMachine, AttendanceRecord, CommitOutcome, CooldownScope,
    DEFAULT_COOLDOWN_SECS,
};
use crate::consensus::{ConsensusStep, ConsensusTracker, DEFAULT_CONSENSUS_FRAMES};
use crate::gallery::{EuclideanMatcher, Gallery, Matcher, Recognition, INTERACTIVE_MATCH_THRESHOLD};
use crate::liveness::{Challenge, ChallengeEngine};
use crate::types::{BoundingBox, FaceObservation};
use chrono::NaiveDateTime;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Tunables for one recognition session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Best Euclidean distance must be strictly below this to match.
    pub match_threshold: f32,
    /// Consecutive qualifying frames before an identity is confirmed.
    pub consensus_frames: u32,
    /// Seconds between two accepted commits.
    pub cooldown_secs: u64,
    pub cooldown_scope: CooldownScope,
    /// Mean absolute pixel difference a frame must exceed.
    pub motion_threshold: f32,
    /// Recent frame fingerprints kept for replay detection.
    pub replay_capacity: usize,
    pub replay_eviction: ReplayEviction,
    /// Fixed seed for challenge selection; entropy when absent.
    pub challenge_seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            match_threshold: INTERACTIVE_MATCH_THRESHOLD,
            consensus_frames: DEFAULT_CONSENSUS_FRAMES,
            cooldown_secs: DEFAULT_COOLDOWN_SECS as u64,
            cooldown_scope: CooldownScope::Session,
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            replay_eviction: ReplayEviction::Clear,
            challenge_seed: None,
        }
    }
}

/// Per-face outcome of one analysis cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceResult {
    pub region: BoundingBox,
    pub recognition: Recognition,
    /// The active challenge was satisfied by this face.
    pub challenge_ok: bool,
    /// Consecutive qualifying frames for this identity after this frame.
    pub consensus: u32,
}

/// Everything one frame produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameAnalysis {
    pub gate: GateVerdict,
    /// Challenge in effect when this frame was analysed.
    pub challenge: Challenge,
    pub faces: Vec<FaceResult>,
    /// Records written during this frame.
    pub commits: Vec<AttendanceRecord>,
}

/// All mutable state of one recognition session.
///
/// Owned by a single analysis loop; nothing here is shared.
pub struct RecognitionSession<R = StdRng> {
    match_threshold: f32,
    gate: AntiSpoofGate,
    challenges: ChallengeEngine<R>,
    consensus: ConsensusTracker,
    attendance: AttendanceMachine,
}

impl RecognitionSession<StdRng> {
    pub fn from_config(config: &SessionConfig) -> Self {
        let challenges = match config.challenge_seed {
            Some(seed) => ChallengeEngine::seeded(seed),
            None => ChallengeEngine::from_entropy(),
        };
        Self::with_challenges(config, challenges)
    }
}

impl<R: Rng> RecognitionSession<R> {
    pub fn with_challenges(config: &SessionConfig, challenges: ChallengeEngine<R>) -> Self {
        let cooldown = chrono::Duration::seconds(config.cooldown_secs.min(u64::from(u32::MAX)) as i64);
        Self {
            match_threshold: config.match_threshold,
            gate: AntiSpoofGate::new(
                config.motion_threshold,
                config.replay_capacity,
                config.replay_eviction,
            ),
            challenges,
            consensus: ConsensusTracker::new(config.consensus_frames),
            attendance: AttendanceMachine::new(cooldown, config.cooldown_scope),
        }
    }

    pub fn challenge(&self) -> Challenge {
        self.challenges.current()
    }

    pub fn consensus_count(&self, name: &str) -> u32 {
        self.consensus.count(name)
    }

    /// Analyse one frame and the faces detected in it.
    ///
    /// The anti-spoof gate runs once per frame, faces or not. Each known face
    /// then advances or resets its identity's consensus run; a confirmed
    /// identity goes to the attendance state machine, and a successful commit
    /// rotates the challenge for the faces that follow. No per-face condition
    /// is an error: persistence failures are logged and the cycle continues.
    pub fn analyze(
        &mut self,
        frame: &[u8],
        faces: &[FaceObservation],
        gallery: &Gallery,
        log: &dyn AttendanceLog,
        now: NaiveDateTime,
    ) -> FrameAnalysis {
        let gate = self.gate.check(frame);
        let challenge = self.challenges.current();
        let mut results = Vec::with_capacity(faces.len());
        let mut commits = Vec::new();

        for face in faces {
            let recognition = EuclideanMatcher.compare(&face.embedding, gallery, self.match_threshold);
            let challenge_ok = self.challenges.verify(&face.landmarks);

            let mut consensus = 0;
            if let Some(name) = recognition.name() {
                let qualified = challenge_ok && gate.passed();
                match self.consensus.observe(name, qualified) {
                    ConsensusStep::Pending(count) => consensus = count,
                    ConsensusStep::Reset => {}
                    ConsensusStep::Confirmed => {
                        consensus = self.consensus.required();
                        match self.attendance.on_confirmed(name, now, log) {
                            Ok(CommitOutcome::Committed(record)) => {
                                self.challenges.next_challenge();
                                commits.push(record);
                            }
                            Ok(CommitOutcome::CoolingDown { .. }) => {}
                            Err(e) => {
                                tracing::warn!(name, error = %e, "attendance commit failed");
                            }
                        }
                    }
                }
            }

            tracing::trace!(
                recognized = ?recognition.name(),
                challenge_ok,
                gate_ok = gate.passed(),
                consensus,
                "face analysed"
            );

            results.push(FaceResult {
                region: face.region,
                recognition,
                challenge_ok,
                consensus,
            });
        }

        FrameAnalysis {
            gate,
            challenge,
            faces: results,
            commits,
        }
    }
}
