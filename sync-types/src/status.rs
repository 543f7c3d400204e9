//! Per-record synchronization metadata.

use crate::error::TypesError;
use crate::ids::{CloudId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Persisted reason of a failed push.
///
/// Conflicts and vanished remote records are reconciled on the spot and
/// never reach this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynchroError {
    /// Network or server hiccup.
    Transient,
    /// The cloud call did not answer in time.
    Timeout,
    /// The cloud rejected this version of the record.
    Validation,
}

impl SynchroError {
    /// Whether another attempt with the same data may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SynchroError::Transient | SynchroError::Timeout)
    }
}

/// Synchronization status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SynchroStatus {
    /// Local changes not yet pushed.
    NotSynced,
    /// A push is in flight. Doubles as the per-record mutual exclusion marker.
    Syncing,
    /// Local and cloud agree.
    Synced,
    /// The last push failed.
    Failed {
        /// What went wrong.
        error: SynchroError,
        /// When the record becomes eligible again. `None` is terminal until
        /// the next local edit.
        retry_at: Option<Timestamp>,
    },
}

impl SynchroStatus {
    /// The plain state of this status.
    pub fn state(&self) -> SynchroState {
        match self {
            SynchroStatus::NotSynced => SynchroState::NotSynced,
            SynchroStatus::Syncing => SynchroState::Syncing,
            SynchroStatus::Synced => SynchroState::Synced,
            SynchroStatus::Failed { .. } => SynchroState::Failed,
        }
    }

    /// The failure reason, only present when failed.
    pub fn error(&self) -> Option<SynchroError> {
        match self {
            SynchroStatus::Failed { error, .. } => Some(*error),
            _ => None,
        }
    }

    /// Whether a push should be attempted at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        match self {
            SynchroStatus::NotSynced => true,
            SynchroStatus::Failed {
                retry_at: Some(at), ..
            } => *at <= now,
            _ => false,
        }
    }
}

/// Discriminant of [`SynchroStatus`], used for storage and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynchroState {
    /// See [`SynchroStatus::NotSynced`].
    NotSynced,
    /// See [`SynchroStatus::Syncing`].
    Syncing,
    /// See [`SynchroStatus::Synced`].
    Synced,
    /// See [`SynchroStatus::Failed`].
    Failed,
}

impl SynchroState {
    /// Stable textual name, used as a storage key.
    pub fn as_str(&self) -> &'static str {
        match self {
            SynchroState::NotSynced => "not_synced",
            SynchroState::Syncing => "syncing",
            SynchroState::Synced => "synced",
            SynchroState::Failed => "failed",
        }
    }
}

impl FromStr for SynchroState {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_synced" => Ok(SynchroState::NotSynced),
            "syncing" => Ok(SynchroState::Syncing),
            "synced" => Ok(SynchroState::Synced),
            "failed" => Ok(SynchroState::Failed),
            other => Err(TypesError::UnknownState(other.to_string())),
        }
    }
}

impl fmt::Display for SynchroState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronization fields carried by every record.
///
/// Only the sync state machine and the orchestrator change these fields.
/// Repository consumers read them but never write them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    /// Cloud identifier, unassigned until the first acknowledged push.
    pub cloud_id: CloudId,
    /// When the record was created on this device (or on its origin device).
    pub local_creation_date: Timestamp,
    /// Bumped on every local mutation.
    pub local_modification_date: Timestamp,
    /// Cloud write time echoed back by push or observed on pull.
    pub cloud_modification_date: Option<Timestamp>,
    /// Current synchronization status.
    pub status: SynchroStatus,
    /// Last time the data of this record was successfully pushed or pulled.
    pub latest_updated_date: Option<Timestamp>,
    /// Last status transition.
    pub latest_status_date: Option<Timestamp>,
    /// Tombstone flag: pending deletion propagation.
    pub is_deleted: bool,
    /// When the tombstone was set, used for the purge grace period.
    pub deleted_date: Option<Timestamp>,
    /// Consecutive failed pushes of the current version.
    #[serde(default)]
    pub attempts: u32,
}

impl SyncMeta {
    /// Metadata of a record just created on this device.
    pub fn new_local(now: Timestamp) -> Self {
        Self {
            cloud_id: CloudId::UNASSIGNED,
            local_creation_date: now,
            local_modification_date: now,
            cloud_modification_date: None,
            status: SynchroStatus::NotSynced,
            latest_updated_date: None,
            latest_status_date: Some(now),
            is_deleted: false,
            deleted_date: None,
            attempts: 0,
        }
    }

    /// Whether the record still has local changes the cloud has not seen.
    pub fn has_pending_changes(&self) -> bool {
        matches!(
            self.status,
            SynchroStatus::NotSynced | SynchroStatus::Failed { .. }
        )
    }

    /// Whether a synced record satisfies the synced-record invariant.
    ///
    /// A synced record carries no error and its last local modification is
    /// not newer than its last successful update.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            SynchroStatus::Synced => self
                .latest_updated_date
                .is_some_and(|updated| self.local_modification_date <= updated),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_local_record_is_pending() {
        let meta = SyncMeta::new_local(Timestamp::from_millis(10));
        assert_eq!(meta.status, SynchroStatus::NotSynced);
        assert!(!meta.cloud_id.is_assigned());
        assert!(meta.has_pending_changes());
        assert!(meta.is_consistent());
    }

    #[test]
    fn error_only_exists_when_failed() {
        assert_eq!(SynchroStatus::Synced.error(), None);
        assert_eq!(SynchroStatus::NotSynced.error(), None);
        let failed = SynchroStatus::Failed {
            error: SynchroError::Validation,
            retry_at: None,
        };
        assert_eq!(failed.error(), Some(SynchroError::Validation));
        assert_eq!(failed.state(), SynchroState::Failed);
    }

    #[test]
    fn failed_is_due_only_after_retry_time() {
        let status = SynchroStatus::Failed {
            error: SynchroError::Transient,
            retry_at: Some(Timestamp::from_millis(100)),
        };
        assert!(!status.is_due(Timestamp::from_millis(99)));
        assert!(status.is_due(Timestamp::from_millis(100)));
    }

    #[test]
    fn terminal_failure_is_never_due() {
        let status = SynchroStatus::Failed {
            error: SynchroError::Validation,
            retry_at: None,
        };
        assert!(!status.is_due(Timestamp::from_millis(i64::MAX)));
    }

    #[test]
    fn synced_without_update_date_is_inconsistent() {
        let mut meta = SyncMeta::new_local(Timestamp::from_millis(10));
        meta.status = SynchroStatus::Synced;
        assert!(!meta.is_consistent());
        meta.latest_updated_date = Some(Timestamp::from_millis(9));
        assert!(!meta.is_consistent());
        meta.latest_updated_date = Some(Timestamp::from_millis(10));
        assert!(meta.is_consistent());
    }

    #[test]
    fn retryable_errors() {
        assert!(SynchroError::Transient.is_retryable());
        assert!(SynchroError::Timeout.is_retryable());
        assert!(!SynchroError::Validation.is_retryable());
    }

    #[test]
    fn state_names_parse_back() {
        for state in [
            SynchroState::NotSynced,
            SynchroState::Syncing,
            SynchroState::Synced,
            SynchroState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<SynchroState>().unwrap(), state);
        }
    }
}
