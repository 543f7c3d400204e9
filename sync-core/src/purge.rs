//! Two-phase garbage collection of tombstones.
//!
//! A tombstone is physically removed only once the cloud confirmed the
//! deletion, the grace period has elapsed, and nothing references it any
//! more.

use std::time::Duration;
use sync_types::{SyncMeta, SynchroStatus, Timestamp};

/// Purge settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgePolicy {
    /// Minimum tombstone age before removal.
    pub grace: Duration,
}

impl Default for PurgePolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// What to do with a record during the purge phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeDecision {
    /// Remove the row.
    Purge,
    /// Live record, or tombstone still waiting for cloud confirmation.
    NotEligible,
    /// Confirmed tombstone inside its grace period.
    Wait {
        /// When the grace period ends.
        until: Timestamp,
    },
    /// Confirmed and old enough, but still referenced.
    Blocked {
        /// Number of records still referencing it.
        referrers: usize,
    },
}

impl PurgePolicy {
    /// Decide the fate of a record with `referrers` remaining references.
    pub fn evaluate(&self, meta: &SyncMeta, referrers: usize, now: Timestamp) -> PurgeDecision {
        if !meta.is_deleted || meta.status != SynchroStatus::Synced {
            return PurgeDecision::NotEligible;
        }

        let deleted_at = meta.deleted_date.unwrap_or(meta.local_modification_date);
        let until = deleted_at.saturating_add(self.grace);
        if now < until {
            return PurgeDecision::Wait { until };
        }

        if referrers > 0 {
            return PurgeDecision::Blocked { referrers };
        }
        PurgeDecision::Purge
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: i64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn policy() -> PurgePolicy {
        PurgePolicy {
            grace: Duration::from_millis(100),
        }
    }

    fn confirmed_tombstone(deleted: i64) -> SyncMeta {
        let mut meta = SyncMeta::new_local(at(0));
        meta.is_deleted = true;
        meta.deleted_date = Some(at(deleted));
        meta.status = SynchroStatus::Synced;
        meta.latest_updated_date = Some(at(deleted));
        meta
    }

    #[test]
    fn live_records_are_never_purged() {
        let meta = SyncMeta::new_local(at(0));
        assert_eq!(policy().evaluate(&meta, 0, at(10_000)), PurgeDecision::NotEligible);
    }

    #[test]
    fn unconfirmed_tombstones_are_kept() {
        let mut meta = confirmed_tombstone(0);
        meta.status = SynchroStatus::NotSynced;
        assert_eq!(policy().evaluate(&meta, 0, at(10_000)), PurgeDecision::NotEligible);
    }

    #[test]
    fn grace_period_is_honored() {
        let meta = confirmed_tombstone(50);
        assert_eq!(
            policy().evaluate(&meta, 0, at(120)),
            PurgeDecision::Wait { until: at(150) }
        );
        assert_eq!(policy().evaluate(&meta, 0, at(150)), PurgeDecision::Purge);
    }

    #[test]
    fn referenced_tombstones_are_blocked() {
        let meta = confirmed_tombstone(0);
        assert_eq!(
            policy().evaluate(&meta, 2, at(1_000)),
            PurgeDecision::Blocked { referrers: 2 }
        );
    }
}
