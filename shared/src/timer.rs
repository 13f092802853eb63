use std::time::{Duration, Instant};

/// A single-shot timer handle.
///
/// The core never reads the wall clock; callers pass `now` into every
/// operation, which keeps rooms and adapters deterministic under test.
/// Cancelling an idle timer is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn idle() -> Self {
        Self::default()
    }

    /// Arms the timer to ring `after` from `now`, replacing any pending
    /// deadline.
    pub fn arm(&mut self, now: Instant, after: Duration) {
        self.deadline = Some(now + after);
    }

    /// Arms the timer only if it is not already pending.
    pub fn arm_if_idle(&mut self, now: Instant, after: Duration) {
        if self.deadline.is_none() {
            self.arm(now, after);
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn ringing(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if now >= deadline)
    }

    /// Returns true exactly once when the deadline has passed, disarming the
    /// timer.
    pub fn fire(&mut self, now: Instant) -> bool {
        if self.ringing(now) {
            self.deadline = None;
            true
        } else {
            false
        }
    }
}
