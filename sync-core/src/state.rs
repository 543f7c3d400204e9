//! Per-record synchronization state machine.
//!
//! This module provides a pure, side-effect-free state machine over the
//! [`SyncMeta`] of a single record. It takes an event and produces the new
//! metadata plus a list of actions for the caller to execute.
//!
//! Repositories feed it local edits; the orchestrator feeds it push and pull
//! outcomes. Neither writes sync fields any other way.

use crate::retry::RetryPolicy;
use sync_types::{CloudId, RemoteRecord, SyncMeta, SynchroError, SynchroStatus, Timestamp};

/// Something that happened to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    /// Content changed locally.
    LocalEdit,
    /// Soft-deleted locally.
    LocalDelete,
    /// A tombstone was revived locally (undo of a delete).
    LocalRestore,
    /// The orchestrator picked the record for a push or delete.
    PushStarted,
    /// The cloud accepted the pushed version.
    PushSucceeded {
        /// Cloud id assigned or confirmed by the cloud.
        cloud_id: CloudId,
        /// Cloud write time.
        cloud_modified: Timestamp,
    },
    /// The cloud confirmed the deletion, or there was nothing to delete.
    DeleteConfirmed {
        /// Cloud write time of the delete marker, when known.
        cloud_modified: Option<Timestamp>,
    },
    /// The push failed.
    PushFailed {
        /// Failure reason.
        error: SynchroError,
    },
    /// A cloud version replaced the local one.
    RemoteApplied {
        /// Cloud id of the remote version.
        cloud_id: CloudId,
        /// Origin modification date of the remote version.
        modified: Timestamp,
        /// Cloud write time of the remote version.
        cloud_modified: Timestamp,
        /// Whether the remote version is a delete marker.
        deleted: bool,
    },
    /// A cloud version was merged with local fields and the result differs
    /// from the cloud, so it must be pushed back.
    Remerged {
        /// Cloud id of the remote version.
        cloud_id: CloudId,
        /// Origin modification date of the remote version.
        modified: Timestamp,
        /// Cloud write time of the remote version.
        cloud_modified: Timestamp,
    },
    /// A newer local version was merged with a cloud version it was not
    /// edited from. It stays pending, now based on that cloud version.
    Rebased {
        /// Cloud id of the remote version.
        cloud_id: CloudId,
        /// Cloud write time of the remote version.
        cloud_modified: Timestamp,
    },
    /// A `syncing` marker left behind by an interrupted cycle.
    Recovered,
}

/// Instructions for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordAction {
    /// The record is being pushed: hold the local change until it lands.
    BufferEdit,
    /// The in-flight operation finished: reapply held local changes.
    ReplayBufferedEdits,
    /// The push will be retried at the given time.
    ScheduleRetry {
        /// Earliest retry time.
        at: Timestamp,
    },
    /// The push failed for good until the next local edit.
    GiveUp {
        /// Failure reason.
        error: SynchroError,
    },
}

/// Inputs every transition needs besides the event.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    /// Current time.
    pub now: Timestamp,
    /// Retry schedule for failed pushes.
    pub retry: &'a RetryPolicy,
}

/// Process an event and return the new metadata plus actions to execute.
///
/// This is a pure function. Invalid transitions leave the metadata
/// unchanged and produce no actions.
pub fn on_event(
    meta: SyncMeta,
    event: RecordEvent,
    ctx: &TransitionContext<'_>,
) -> (SyncMeta, Vec<RecordAction>) {
    let now = ctx.now;
    let syncing = meta.status == SynchroStatus::Syncing;

    match event {
        // Local mutations while a push is in flight wait for its outcome
        RecordEvent::LocalEdit | RecordEvent::LocalDelete | RecordEvent::LocalRestore
            if syncing =>
        {
            (meta, vec![RecordAction::BufferEdit])
        }

        RecordEvent::LocalEdit if !meta.is_deleted => (touched(meta, now), vec![]),
        RecordEvent::LocalRestore => {
            let mut meta = touched(meta, now);
            meta.is_deleted = false;
            meta.deleted_date = None;
            (meta, vec![])
        }
        RecordEvent::LocalDelete if !meta.is_deleted => {
            let mut meta = touched(meta, now);
            meta.is_deleted = true;
            meta.deleted_date = Some(now);
            (meta, vec![])
        }

        RecordEvent::PushStarted if meta.status.is_due(now) => {
            let mut meta = meta;
            meta.status = SynchroStatus::Syncing;
            meta.latest_status_date = Some(now);
            (meta, vec![])
        }

        RecordEvent::PushSucceeded {
            cloud_id,
            cloud_modified,
        } if syncing => {
            let mut meta = assign_cloud_id(meta, cloud_id);
            meta.cloud_modification_date = Some(cloud_modified);
            (synced(meta, now), vec![RecordAction::ReplayBufferedEdits])
        }

        RecordEvent::DeleteConfirmed { cloud_modified } if syncing && meta.is_deleted => {
            let mut meta = meta;
            if cloud_modified.is_some() {
                meta.cloud_modification_date = cloud_modified;
            }
            (synced(meta, now), vec![RecordAction::ReplayBufferedEdits])
        }

        RecordEvent::PushFailed { error } if syncing => {
            let mut meta = meta;
            meta.attempts = meta.attempts.saturating_add(1);
            let retry_at = ctx.retry.next_retry(error, meta.attempts, now);
            meta.status = SynchroStatus::Failed { error, retry_at };
            meta.latest_status_date = Some(now);
            let outcome = match retry_at {
                Some(at) => RecordAction::ScheduleRetry { at },
                None => RecordAction::GiveUp { error },
            };
            (meta, vec![outcome, RecordAction::ReplayBufferedEdits])
        }

        RecordEvent::RemoteApplied {
            cloud_id,
            modified,
            cloud_modified,
            deleted,
        } => {
            let mut meta = assign_cloud_id(meta, cloud_id);
            meta.cloud_modification_date = Some(cloud_modified);
            meta.local_modification_date = meta.local_modification_date.max(modified);
            if !deleted {
                meta.deleted_date = None;
            } else if !meta.is_deleted || meta.deleted_date.is_none() {
                meta.deleted_date = Some(now);
            }
            meta.is_deleted = deleted;
            let actions = replay_if(syncing);
            (synced(meta, now), actions)
        }

        RecordEvent::Remerged {
            cloud_id,
            modified,
            cloud_modified,
        } => {
            let mut meta = assign_cloud_id(meta, cloud_id);
            meta.cloud_modification_date = Some(cloud_modified);
            meta.is_deleted = false;
            meta.deleted_date = None;
            // The merged version must outrank the cloud version it came from
            let bumped = Timestamp::from_millis(modified.as_millis().saturating_add(1));
            let mut meta = touched(meta, now);
            meta.local_modification_date = meta.local_modification_date.max(bumped);
            meta.latest_updated_date = Some(now);
            let actions = replay_if(syncing);
            (meta, actions)
        }

        RecordEvent::Rebased {
            cloud_id,
            cloud_modified,
        } if !syncing => {
            let mut meta = assign_cloud_id(meta, cloud_id);
            meta.cloud_modification_date = Some(cloud_modified);
            meta.status = SynchroStatus::NotSynced;
            meta.latest_status_date = Some(now);
            (meta, vec![])
        }

        RecordEvent::Recovered if syncing => {
            let mut meta = meta;
            meta.status = SynchroStatus::NotSynced;
            meta.latest_status_date = Some(now);
            (meta, vec![])
        }

        // Invalid transitions - stay in current state
        _ => (meta, vec![]),
    }
}

/// Metadata of a record first seen through a pull.
pub fn meta_from_remote(remote: &RemoteRecord, now: Timestamp) -> SyncMeta {
    SyncMeta {
        cloud_id: remote.cloud_id,
        local_creation_date: remote.modified,
        local_modification_date: remote.modified,
        cloud_modification_date: Some(remote.cloud_modified),
        status: SynchroStatus::Synced,
        latest_updated_date: Some(now.max(remote.modified)),
        latest_status_date: Some(now),
        is_deleted: remote.deleted,
        deleted_date: remote.deleted.then_some(now),
        attempts: 0,
    }
}

/// Metadata of a record moved out of the account it was registered in.
///
/// This is the only way a cloud id goes back to unassigned: the record now
/// belongs to a different account and will be registered there afresh.
pub fn detach_from_account(meta: SyncMeta, now: Timestamp) -> SyncMeta {
    SyncMeta {
        cloud_id: CloudId::UNASSIGNED,
        local_creation_date: meta.local_creation_date,
        local_modification_date: meta.local_modification_date.max(now),
        cloud_modification_date: None,
        status: SynchroStatus::NotSynced,
        latest_updated_date: None,
        latest_status_date: Some(now),
        is_deleted: meta.is_deleted,
        deleted_date: meta.deleted_date,
        attempts: 0,
    }
}

/// A new local version: pending push, failure history cleared.
fn touched(mut meta: SyncMeta, now: Timestamp) -> SyncMeta {
    meta.local_modification_date = meta.local_modification_date.max(now);
    meta.status = SynchroStatus::NotSynced;
    meta.latest_status_date = Some(now);
    meta.attempts = 0;
    meta
}

fn synced(mut meta: SyncMeta, now: Timestamp) -> SyncMeta {
    meta.status = SynchroStatus::Synced;
    meta.attempts = 0;
    meta.latest_status_date = Some(now);
    meta.latest_updated_date = Some(now.max(meta.local_modification_date));
    meta
}

/// Cloud ids go from unassigned to assigned once and never change after.
fn assign_cloud_id(mut meta: SyncMeta, cloud_id: CloudId) -> SyncMeta {
    if !meta.cloud_id.is_assigned() {
        meta.cloud_id = cloud_id;
    }
    meta
}

fn replay_if(was_syncing: bool) -> Vec<RecordAction> {
    if was_syncing {
        vec![RecordAction::ReplayBufferedEdits]
    } else {
        vec![]
    }
}
