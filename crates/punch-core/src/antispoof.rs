//! Frame-level anti-spoofing: inter-frame motion and exact-replay detection.
//!
//! A printed photograph or a paused video produces frames that barely differ
//! from one another; a replayed recording produces byte-identical frames.
//! Both checks keep per-session state and mutate it on every call, so they
//! must be driven by exactly one analysis loop.
//!
//! # Threat Coverage
//!
//! - **Blocks:** static images held in front of the camera, frozen streams,
//!   exact re-injection of previously captured frames.
//! - **Does not block:** live video replay (frames differ), 3D masks. The very
//!   first frame of a session always passes the motion check.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};

/// Mean absolute pixel difference (8-bit scale) a frame must exceed.
pub const DEFAULT_MOTION_THRESHOLD: f32 = 2.0;
/// Number of recent frame fingerprints remembered for replay detection.
pub const DEFAULT_REPLAY_CAPACITY: usize = 10;

type Fingerprint = [u8; 32];

/// What happens when the fingerprint set outgrows its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayEviction {
    /// Forget every fingerprint at once.
    #[default]
    Clear,
    /// Forget only the oldest fingerprint.
    Fifo,
}

/// Result of running both checks on one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GateVerdict {
    pub motion_ok: bool,
    pub replay_ok: bool,
    /// Mean absolute difference to the previous frame; `None` on a fresh baseline.
    pub motion_score: Option<f32>,
}

impl GateVerdict {
    pub fn passed(&self) -> bool {
        self.motion_ok && self.replay_ok
    }
}

/// Per-session motion and replay filter.
#[derive(Debug)]
pub struct AntiSpoofGate {
    motion_threshold: f32,
    capacity: usize,
    eviction: ReplayEviction,
    previous_frame: Option<Vec<u8>>,
    recent: HashSet<Fingerprint>,
    order: VecDeque<Fingerprint>,
}

impl Default for AntiSpoofGate {
    fn default() -> Self {
        Self::new(DEFAULT_MOTION_THRESHOLD, DEFAULT_REPLAY_CAPACITY, ReplayEviction::Clear)
    }
}

impl AntiSpoofGate {
    pub fn new(motion_threshold: f32, capacity: usize, eviction: ReplayEviction) -> Self {
        Self {
            motion_threshold,
            capacity: capacity.max(1),
            eviction,
            previous_frame: None,
            recent: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Run the motion check then the replay check on `frame`.
    pub fn check(&mut self, frame: &[u8]) -> GateVerdict {
        let (motion_ok, motion_score) = self.check_motion(frame);
        let replay_ok = self.check_replay(frame);
        GateVerdict {
            motion_ok,
            replay_ok,
            motion_score,
        }
    }

    /// Compare `frame` against the previous frame, then make it the new baseline.
    ///
    /// Passes when there is no comparable previous frame (first call, or the
    /// frame size changed). An empty frame never passes.
    pub fn check_motion(&mut self, frame: &[u8]) -> (bool, Option<f32>) {
        let previous = self.previous_frame.replace(frame.to_vec());

        let Some(previous) = previous.filter(|p| p.len() == frame.len()) else {
            return (!frame.is_empty(), None);
        };
        if frame.is_empty() {
            return (false, Some(0.0));
        }

        let score = mean_abs_diff(&previous, frame);
        (score > self.motion_threshold, Some(score))
    }

    /// Fail if this exact frame content was seen recently; otherwise remember it.
    pub fn check_replay(&mut self, frame: &[u8]) -> bool {
        let fingerprint: Fingerprint = Sha256::digest(frame).into();
        if self.recent.contains(&fingerprint) {
            return false;
        }

        self.recent.insert(fingerprint);
        self.order.push_back(fingerprint);

        if self.recent.len() > self.capacity {
            match self.eviction {
                ReplayEviction::Clear => {
                    tracing::trace!(capacity = self.capacity, "replay fingerprints cleared");
                    self.recent.clear();
                    self.order.clear();
                }
                ReplayEviction::Fifo => {
                    if let Some(oldest) = self.order.pop_front() {
                        self.recent.remove(&oldest);
                    }
                }
            }
        }

        true
    }

    /// Number of fingerprints currently remembered.
    pub fn remembered(&self) -> usize {
        self.recent.len()
    }
}

/// Mean absolute per-byte difference of two equally sized buffers.
pub fn mean_abs_diff(a: &[u8], b: &[u8]) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    let total: u64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| u64::from(x.abs_diff(y)))
        .sum();
    total as f32 / a.len() as f32
}
