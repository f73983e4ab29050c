//! Active liveness challenges evaluated from facial landmark geometry.
//!
//! The subject is asked to blink or to turn their head one way. A challenge
//! is checked per frame from the landmark map alone; no extra inference.
//! The active challenge changes after every accepted attendance commit so an
//! impostor cannot prepare for a fixed prompt.

use crate::types::Landmarks;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Average eye aspect ratio below which the eyes count as closed.
pub const EAR_BLINK_THRESHOLD: f32 = 0.22;
/// Nose position (fraction of jaw width) below which the head is turned left.
pub const TURN_LEFT_MAX_RATIO: f32 = 0.35;
/// Nose position (fraction of jaw width) above which the head is turned right.
pub const TURN_RIGHT_MIN_RATIO: f32 = 0.65;

/// An active liveness prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Challenge {
    Blink,
    TurnLeft,
    TurnRight,
}

impl Challenge {
    pub const ALL: [Challenge; 3] = [Challenge::Blink, Challenge::TurnLeft, Challenge::TurnRight];

    pub fn as_str(&self) -> &'static str {
        match self {
            Challenge::Blink => "blink",
            Challenge::TurnLeft => "turn_left",
            Challenge::TurnRight => "turn_right",
        }
    }

    /// Whether `landmarks` satisfy this challenge in the current frame.
    ///
    /// Missing or degenerate geometry never satisfies a challenge.
    pub fn is_satisfied_by(&self, landmarks: &Landmarks) -> bool {
        match self {
            Challenge::Blink => {
                average_eye_aspect_ratio(landmarks).is_some_and(|ear| ear < EAR_BLINK_THRESHOLD)
            }
            Challenge::TurnLeft => {
                head_turn_ratio(landmarks).is_some_and(|ratio| ratio < TURN_LEFT_MAX_RATIO)
            }
            Challenge::TurnRight => {
                head_turn_ratio(landmarks).is_some_and(|ratio| ratio > TURN_RIGHT_MIN_RATIO)
            }
        }
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown challenge: {0}")]
pub struct UnknownChallenge(pub String);

impl FromStr for Challenge {
    type Err = UnknownChallenge;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Challenge::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownChallenge(s.to_string()))
    }
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Eye aspect ratio over six ordered eye landmarks `p1..p6`:
/// `(|p2-p6| + |p3-p5|) / (2 * |p1-p4|)`.
///
/// Returns `None` for fewer than six points or a zero-width eye.
pub fn eye_aspect_ratio(eye: &[(f32, f32)]) -> Option<f32> {
    if eye.len() < 6 {
        return None;
    }
    let vertical = distance(eye[1], eye[5]) + distance(eye[2], eye[4]);
    let horizontal = distance(eye[0], eye[3]);
    if horizontal == 0.0 {
        return None;
    }
    Some(vertical / (2.0 * horizontal))
}

/// Mean of the left and right eye aspect ratios.
pub fn average_eye_aspect_ratio(landmarks: &Landmarks) -> Option<f32> {
    let left = eye_aspect_ratio(landmarks.left_eye()?)?;
    let right = eye_aspect_ratio(landmarks.right_eye()?)?;
    Some((left + right) / 2.0)
}

/// Horizontal nose position as a fraction of the jaw width.
///
/// Uses the first and last jawline points as the face edges and the first
/// nose-tip point. `0.5` is facing forward. `None` when the jaw has zero
/// width or a landmark set is missing.
pub fn head_turn_ratio(landmarks: &Landmarks) -> Option<f32> {
    let chin = landmarks.chin()?;
    let (jaw_left, jaw_right) = (chin.first()?.0, chin.last()?.0);
    let nose_x = landmarks.nose_tip()?.first()?.0;

    let width = jaw_right - jaw_left;
    if width == 0.0 {
        return None;
    }
    Some((nose_x - jaw_left) / width)
}

/// Holds the session's active challenge and the randomness used to pick it.
pub struct ChallengeEngine<R = StdRng> {
    current: Challenge,
    rng: R,
}

impl ChallengeEngine<StdRng> {
    /// Engine seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }

    /// Engine with a reproducible challenge sequence.
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> ChallengeEngine<R> {
    /// Start with a uniformly random challenge.
    pub fn new(mut rng: R) -> Self {
        let current = Challenge::ALL[rng.gen_range(0..Challenge::ALL.len())];
        Self { current, rng }
    }

    /// Start from a fixed challenge.
    pub fn with_challenge(current: Challenge, rng: R) -> Self {
        Self { current, rng }
    }

    pub fn current(&self) -> Challenge {
        self.current
    }

    /// Whether this face satisfies the active challenge right now.
    pub fn verify(&self, landmarks: &Landmarks) -> bool {
        self.current.is_satisfied_by(landmarks)
    }

    /// Switch to one of the other two challenges, uniformly.
    pub fn next_challenge(&mut self) -> Challenge {
        let others: Vec<Challenge> = Challenge::ALL
            .into_iter()
            .filter(|c| *c != self.current)
            .collect();
        if let Some(next) = others.choose(&mut self.rng) {
            self.current = *next;
        }
        tracing::debug!(challenge = %self.current, "challenge rotated");
        self.current
    }
}
