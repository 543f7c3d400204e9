//! Watermark and session tracking.
//!
//! This module keeps the per-kind incremental sync points and the
//! coordination markers stored in the device's session record, and decides
//! when a pull or a full reconciliation pass is worth running.
//!
//! Every watermark is monotonic: advancing to an older value is a no-op, so
//! a replayed or partial cycle can never move a watermark backwards.

use std::time::Duration;
use sync_types::{EntityKind, MultiSessionMarks, SanityMarks, Session, Timestamp};

/// What started a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    /// Periodic background timer.
    Timer,
    /// The app came to the foreground.
    Foreground,
    /// The user asked to sync now.
    Manual,
}

/// Monotonic advance of an optional watermark.
pub fn advance(current: Option<Timestamp>, observed: Timestamp) -> Option<Timestamp> {
    Some(current.map_or(observed, |c| c.max(observed)))
}

/// Owns a session body while a cycle updates its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkTracker {
    session: Session,
}

impl WatermarkTracker {
    /// Start tracking from a stored session.
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// The tracked session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Pull watermark of `kind`.
    pub fn pulled(&self, kind: EntityKind) -> Option<Timestamp> {
        self.session.watermarks(kind).pulled
    }

    /// Advance the pull watermark of `kind`. Returns whether it moved.
    pub fn advance_pulled(&mut self, kind: EntityKind, observed: Timestamp) -> bool {
        let marks = self.session.watermarks.entry(kind).or_default();
        let next = advance(marks.pulled, observed);
        let moved = next != marks.pulled;
        marks.pulled = next;
        moved
    }

    /// Record the newest local modification date pushed for `kind`.
    pub fn record_pushed(&mut self, kind: EntityKind, modified: Timestamp) {
        let marks = self.session.watermarks.entry(kind).or_default();
        marks.pushed = advance(marks.pushed, modified);
    }

    /// Record a cloud deletion observed for `kind`.
    pub fn record_cloud_deletion(&mut self, kind: EntityKind, cloud_modified: Timestamp) {
        let marks = self.session.watermarks.entry(kind).or_default();
        marks.cloud_deletion = advance(marks.cloud_deletion, cloud_modified);
    }

    /// A cycle started.
    pub fn cycle_started(&mut self, trigger: SyncTrigger, now: Timestamp) {
        let marks = &mut self.session.multi_session;
        marks.latest_tried_date = advance(marks.latest_tried_date, now);
        if trigger == SyncTrigger::Timer {
            marks.latest_bg_date = advance(marks.latest_bg_date, now);
        }
    }

    /// A cycle completed without structural error.
    pub fn cycle_succeeded(&mut self, now: Timestamp) {
        let marks = &mut self.session.multi_session;
        marks.latest_successful_date = advance(marks.latest_successful_date, now);
    }

    /// A sanity pass started.
    pub fn sanity_started(&mut self, now: Timestamp) {
        let marks = &mut self.session.sanity;
        marks.latest_tried_date = advance(marks.latest_tried_date, now);
    }

    /// A sanity pass completed.
    pub fn sanity_succeeded(&mut self, now: Timestamp) {
        let marks = &mut self.session.sanity;
        marks.latest_successful_date = advance(marks.latest_successful_date, now);
    }
}

/// Whether another device of the account completed a sync after we did.
pub fn peer_progressed(own: &MultiSessionMarks, peers: &[MultiSessionMarks]) -> bool {
    peers
        .iter()
        .any(|peer| peer.latest_successful_date > own.latest_successful_date)
}

/// When to run the pull phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullPolicy {
    /// Maximum time between pulls on timer-driven cycles.
    pub interval: Duration,
}

impl Default for PullPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
        }
    }
}

impl PullPolicy {
    /// Decide whether a cycle should pull.
    ///
    /// Explicit triggers always pull. Timer cycles pull when this device
    /// never succeeded, when a peer made progress, or when the interval
    /// since the last success has elapsed.
    pub fn should_pull(
        &self,
        trigger: SyncTrigger,
        own: &MultiSessionMarks,
        peers: &[MultiSessionMarks],
        now: Timestamp,
    ) -> bool {
        if trigger != SyncTrigger::Timer {
            return true;
        }
        match own.latest_successful_date {
            None => true,
            Some(last) => {
                peer_progressed(own, peers) || now.duration_since(last) >= self.interval
            }
        }
    }
}

/// When to run the full reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanityPolicy {
    /// Time between successful passes.
    pub interval: Duration,
    /// Time to wait after a failed pass.
    pub retry_interval: Duration,
}

impl Default for SanityPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(7 * 24 * 60 * 60),
            retry_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl SanityPolicy {
    /// Decide whether the sanity pass is due.
    pub fn is_due(&self, marks: &SanityMarks, now: Timestamp) -> bool {
        if marks.skip {
            return false;
        }

        if let Some(tried) = marks.latest_tried_date {
            let last_try_failed = marks.latest_successful_date.map_or(true, |ok| ok < tried);
            if last_try_failed && now.duration_since(tried) < self.retry_interval {
                return false;
            }
        }

        match marks.latest_successful_date {
            None => true,
            Some(ok) => now.duration_since(ok) >= self.interval,
        }
    }
}
