//! Multi-frame recognition consensus.
//!
//! One matching frame is not enough to act on: motion blur, partial occlusion
//! or a transient false match can all produce a single good-looking frame.
//! An identity is confirmed only after a run of consecutive qualifying frames,
//! and a single failing frame throws the whole run away.

use std::collections::HashMap;

/// Consecutive qualifying frames required before an identity is confirmed.
pub const DEFAULT_CONSENSUS_FRAMES: u32 = 3;

/// What one observation did to an identity's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusStep {
    /// Run extended; this many consecutive qualifying frames so far.
    Pending(u32),
    /// Run reached the threshold. The counter is back at zero.
    Confirmed,
    /// Frame did not qualify; the counter is back at zero.
    Reset,
}

/// Per-session consecutive-success counters, keyed by identity name.
#[derive(Debug)]
pub struct ConsensusTracker {
    required: u32,
    counts: HashMap<String, u32>,
}

impl Default for ConsensusTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CONSENSUS_FRAMES)
    }
}

impl ConsensusTracker {
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            counts: HashMap::new(),
        }
    }

    /// Record one frame's outcome for `name`.
    pub fn observe(&mut self, name: &str, qualified: bool) -> ConsensusStep {
        if !qualified {
            self.counts.insert(name.to_string(), 0);
            return ConsensusStep::Reset;
        }

        let count = self.counts.entry(name.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.required {
            *count = 0;
            tracing::debug!(name, required = self.required, "consensus reached");
            ConsensusStep::Confirmed
        } else {
            ConsensusStep::Pending(*count)
        }
    }

    /// Current run length for `name`.
    pub fn count(&self, name: &str) -> u32 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn required(&self) -> u32 {
        self.required
    }
}
