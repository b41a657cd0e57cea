//! Timed, interruptible waits between attempts.
//!
//! The tracker only records what the wait is and when it ends; the runner owns
//! the actual blocking so that a stop request can cut it short.

use std::time::{Duration, Instant};

use serde::Serialize;

use super::status::WaitReason;

/// An active wait: why, since when, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitState {
    pub reason: WaitReason,
    pub started_at: Instant,
    pub duration: Duration,
}

impl WaitState {
    pub fn begin(reason: WaitReason, duration: Duration) -> Self {
        Self {
            reason,
            started_at: Instant::now(),
            duration,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.started_at + self.duration
    }

    /// `max(0, duration - elapsed)` as observed at `now`.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.deadline()
            .checked_duration_since(now)
            .unwrap_or(Duration::ZERO)
    }

    /// Whole seconds left, rounded up so a fresh 2s wait reads as 2.
    pub fn seconds_remaining_at(&self, now: Instant) -> u64 {
        let remaining = self.remaining_at(now);
        let secs = remaining.as_secs();
        if remaining.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    pub fn is_elapsed_at(&self, now: Instant) -> bool {
        self.remaining_at(now).is_zero()
    }
}

/// Tracks at most one active wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitTracker {
    current: Option<WaitState>,
}

impl WaitTracker {
    pub fn enter(&mut self, reason: WaitReason, duration: Duration) -> WaitState {
        let state = WaitState::begin(reason, duration);
        self.current = Some(state);
        state
    }

    pub fn exit(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<&WaitState> {
        self.current.as_ref()
    }

    pub fn is_waiting(&self) -> bool {
        self.current.is_some()
    }

    pub fn reason(&self) -> Option<WaitReason> {
        self.current.map(|w| w.reason)
    }

    pub fn seconds_remaining(&self) -> u64 {
        self.current
            .map(|w| w.seconds_remaining_at(Instant::now()))
            .unwrap_or(0)
    }
}

/// Count of completed waits per reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WaitTally {
    pub checkpoint: u32,
    pub backoff: u32,
    pub cooldown: u32,
}

impl WaitTally {
    pub fn record(&mut self, reason: WaitReason) {
        match reason {
            WaitReason::Checkpoint => self.checkpoint += 1,
            WaitReason::Backoff => self.backoff += 1,
            WaitReason::Cooldown => self.cooldown += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.checkpoint + self.backoff + self.cooldown
    }
}
