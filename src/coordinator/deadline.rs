//! Commit attempt deadline tracking.

use std::time::Duration;

use tokio::time::Instant;

/// The role a deadline plays within a commit attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeadlineKind {
    /// Waiting for further replica reports before forcing a committer decision.
    Decision,
    /// Bounding a decided committer's build & commit window.
    Commit,
}

/// A monotonic deadline bounding one phase of a commit attempt.
///
/// All scheduling & ordering decisions are made against the monotonic clock; the wall-clock
/// view exists only for logs & externally reported deadlines.
#[derive(Clone, Debug)]
pub struct Deadline {
    /// The role of this deadline.
    kind: DeadlineKind,
    /// The instant at which this deadline was first armed.
    armed_at: Instant,
    /// The instant at which this deadline expires.
    expires_at: Instant,
}

impl Deadline {
    /// Arm a new deadline of the given kind, expiring after the given window.
    pub fn arm(kind: DeadlineKind, now: Instant, window: Duration) -> Self {
        Self { kind, armed_at: now, expires_at: now + window }
    }

    /// The role of this deadline.
    pub fn kind(&self) -> DeadlineKind {
        self.kind
    }

    /// The instant at which this deadline expires.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Whether this deadline has expired as of the given instant.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// The window remaining before expiry as of the given instant.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Extend this deadline, bounded so the total window never exceeds `cap` past the instant
    /// the deadline was first armed.
    ///
    /// The deadline never moves backward: a request already covered by the current window is a
    /// no-op. Returns the remaining window on success, or `None` once the cap can grant nothing
    /// further.
    pub fn extend(&mut self, now: Instant, extra: Duration, cap: Duration) -> Option<Duration> {
        let ceiling = self.armed_at + cap;
        let target = (now + extra).min(ceiling);
        if target <= self.expires_at {
            if ceiling <= self.expires_at {
                return None;
            }
            return Some(self.remaining(now));
        }
        self.expires_at = target;
        Some(self.remaining(now))
    }

    /// The wall-clock time at which this deadline expires, for reporting only.
    pub fn expires_at_wall(&self, now: Instant) -> time::OffsetDateTime {
        time::OffsetDateTime::now_utc() + self.remaining(now)
    }
}
