//! Sync orchestrator.
//!
//! One cycle runs, in order:
//!
//! 1. **Push**: new and modified records, kinds in dependency order
//!    (parents first), then deletions in reverse order (children first).
//! 2. **Pull**: per kind, every cloud change since the kind's watermark.
//! 3. **Purge**: synced tombstones past their grace period.
//! 4. **Sanity** (when due): full reconciliation against the cloud catalog.
//!
//! Record-level failures are persisted on the record and retried by later
//! cycles. Only local storage failures abort a cycle. Cycles never overlap:
//! a request arriving while a cycle runs is coalesced into it.

use crate::cloud::{CloudClient, CloudError};
use crate::config::Config;
use crate::error::EngineError;
use crate::records::{Records, MAX_WRITE_ATTEMPTS};
use crate::resolver::{find_orphans, has_pending_dependents, push_readiness, Readiness};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{
    meta_from_remote, on_event, resolve, DependencyOrder, PullPolicy, PurgeDecision,
    PurgePolicy, RecordEvent, SanityPolicy, SyncTrigger, WatermarkTracker, Winner,
};
use sync_store::{LocalStore, RecordFilter, WriteBatch};
use sync_types::{
    CloudId, EntityBody, EntityKind, MultiSessionMarks, PushRequest, Record, RecordUuid,
    Reference, RemoteRecord, Session, SynchroError, SynchroState, SynchroStatus, Timestamp,
};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

/// Engine tuning, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Device whose session the engine maintains.
    pub device_id: String,
    /// Upper bound of every cloud call.
    pub request_timeout: Duration,
    /// When timer cycles pull.
    pub pull: PullPolicy,
    /// When the sanity pass runs.
    pub sanity: SanityPolicy,
    /// When tombstones are purged.
    pub purge: PurgePolicy,
}

impl EngineSettings {
    /// Default settings for `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            request_timeout: Duration::from_secs(30),
            pull: PullPolicy::default(),
            sanity: SanityPolicy::default(),
            purge: PurgePolicy::default(),
        }
    }

    /// Settings from a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_id: config.sync.device_id.clone(),
            request_timeout: config.request_timeout(),
            pull: config.pull_policy(),
            sanity: config.sanity_policy(),
            purge: config.purge_policy(),
        }
    }
}

/// Observable engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStatus {
    /// A cycle is running.
    pub is_synchronizing: bool,
    /// Some record, tombstones included, is in the failed state.
    pub has_pending_errors: bool,
    /// End of the last completed cycle.
    pub last_completed: Option<Timestamp>,
}

/// What a cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records accepted by the cloud.
    pub pushed: usize,
    /// Deletions confirmed.
    pub deleted: usize,
    /// Records held back until their parents or children are synced.
    pub deferred: usize,
    /// Pushes and deletions that failed.
    pub failed: usize,
    /// Pushes answered with a newer cloud version.
    pub conflicts: usize,
    /// Cloud changes written locally.
    pub pulled: usize,
    /// Tombstones removed for good.
    pub purged: usize,
    /// Local records fixed by the sanity pass.
    pub repaired: usize,
    /// Whether the pull phase ran.
    pub pull_ran: bool,
    /// Whether the sanity pass ran.
    pub sanity_ran: bool,
}

/// Why a cycle did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Nobody is logged in.
    Anonymous,
    /// The user turned sync off.
    PrivateMode,
}

/// Result of [`SyncEngine::sync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The cycle ran to its end.
    Completed(CycleReport),
    /// A cycle completed while this request waited; nothing more was done.
    Coalesced,
    /// Sync is disabled for the current user.
    Skipped(SkipReason),
    /// [`SyncEngine::cancel`] stopped the cycle between two records.
    Cancelled(CycleReport),
}

/// Keeps cycles from starting while held. See [`SyncEngine::pause`].
#[derive(Debug)]
pub struct SyncPause {
    _guard: OwnedMutexGuard<()>,
}

/// Outcome of a cloud call, to be committed on its record.
struct PendingWrite {
    uuid: RecordUuid,
    body: Option<EntityBody>,
    events: Vec<RecordEvent>,
}

impl PendingWrite {
    fn events(uuid: RecordUuid, events: Vec<RecordEvent>) -> Self {
        Self {
            uuid,
            body: None,
            events,
        }
    }
}

/// Decision for one incoming cloud change.
enum Incoming {
    Skip,
    Create(Record),
    Update(Record),
    MissingParent(Reference),
}

enum Parents {
    Ready,
    Unregistered,
    Missing(Reference),
}

#[derive(Default)]
struct Applied {
    complete: bool,
    deletions: Vec<Timestamp>,
}

/// Runs sync cycles between the local store and the cloud.
pub struct SyncEngine {
    records: Arc<Records>,
    cloud: Arc<dyn CloudClient>,
    settings: EngineSettings,
    order: DependencyOrder,
    cycle_lock: Arc<Mutex<()>>,
    completed: AtomicU64,
    cancel: AtomicBool,
    status: watch::Sender<SyncStatus>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("settings", &self.settings)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Create an engine over `records` and `cloud`.
    pub fn new(
        records: Arc<Records>,
        cloud: Arc<dyn CloudClient>,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        let (status, _) = watch::channel(SyncStatus::default());
        Ok(Self {
            records,
            cloud,
            settings,
            order: DependencyOrder::standard()?,
            cycle_lock: Arc::new(Mutex::new(())),
            completed: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
            status,
        })
    }

    /// Engine settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Record access shared with the repositories.
    pub fn records(&self) -> &Arc<Records> {
        &self.records
    }

    /// Watch the engine state.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Ask the running cycle to stop at the next record boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Wait for the running cycle to end and keep new ones from starting
    /// until the returned guard is dropped.
    pub async fn pause(&self) -> SyncPause {
        SyncPause {
            _guard: Arc::clone(&self.cycle_lock).lock_owned().await,
        }
    }

    /// Purge eligible tombstones outside of a cycle. Returns how many
    /// records were removed.
    pub async fn purge_tombstones(&self) -> Result<usize, EngineError> {
        let _cycle = self.cycle_lock.lock().await;
        let mut report = CycleReport::default();
        self.purge(&mut report).await?;
        tracing::info!(purged = report.purged, "tombstones purged");
        Ok(report.purged)
    }

    /// Run one sync cycle.
    ///
    /// If another cycle completes while this call waits for its turn, the
    /// call returns [`CycleOutcome::Coalesced`] without running.
    pub async fn sync(&self, trigger: SyncTrigger) -> Result<CycleOutcome, EngineError> {
        let ticket = self.completed.load(Ordering::SeqCst);
        let _cycle = self.cycle_lock.lock().await;
        if self.completed.load(Ordering::SeqCst) != ticket {
            tracing::debug!(?trigger, "cycle completed while waiting, request coalesced");
            return Ok(CycleOutcome::Coalesced);
        }

        self.cancel.store(false, Ordering::SeqCst);
        self.status.send_modify(|status| status.is_synchronizing = true);

        let result = self.run_cycle(trigger).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "sync cycle aborted");
        }

        let pending_errors = self
            .records
            .store()
            .count(&RecordFilter::all().in_states([SynchroState::Failed]).with_deleted())
            .await;
        let now = self.now();
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.status.send_modify(|status| {
            status.is_synchronizing = false;
            match &pending_errors {
                Ok(count) => status.has_pending_errors = *count > 0,
                Err(e) => tracing::warn!(error = %e, "failed to count failed records"),
            }
            if matches!(result, Ok(CycleOutcome::Completed(_))) {
                status.last_completed = Some(now);
            }
        });
        result
    }

    fn now(&self) -> Timestamp {
        self.records.now()
    }

    fn store(&self) -> &dyn LocalStore {
        self.records.store()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    async fn call<T, F>(&self, request: F) -> Result<T, CloudError>
    where
        F: Future<Output = Result<T, CloudError>> + Send,
    {
        match tokio::time::timeout(self.settings.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(CloudError::Timeout),
        }
    }

    async fn run_cycle(&self, trigger: SyncTrigger) -> Result<CycleOutcome, EngineError> {
        let started = self.now();
        let (own, session) = self.own_session().await?;
        if session.user_uuid.is_anonymous() {
            tracing::debug!("no account logged in, cycle skipped");
            return Ok(CycleOutcome::Skipped(SkipReason::Anonymous));
        }
        if self.is_private(session.user_uuid).await? {
            tracing::debug!(user = %session.user_uuid, "private mode, cycle skipped");
            return Ok(CycleOutcome::Skipped(SkipReason::PrivateMode));
        }
        tracing::info!(?trigger, user = %session.user_uuid, "sync cycle started");

        self.recover_stale().await?;
        self.records.replay_all().await?;

        let mut tracker = WatermarkTracker::new(session);
        tracker.cycle_started(trigger, started);
        self.save_session(own, &tracker).await?;
        let mut report = CycleReport::default();

        // Push: upserts parents first, deletions children first
        for &kind in self.order.push_order() {
            if self.push_upserts(kind, &mut tracker, &mut report).await? {
                return self.finish_cancelled(own, tracker, report).await;
            }
        }
        let delete_order: Vec<EntityKind> = self.order.delete_order().collect();
        for kind in delete_order {
            if self.push_deletes(kind, &mut report).await? {
                return self.finish_cancelled(own, tracker, report).await;
            }
        }

        // Pull
        let mut needs_sanity = false;
        let mut pull_failed = false;
        let mut should_pull = self.should_pull(trigger, &tracker).await?;
        if !should_pull {
            // Peers announce their progress through their sessions
            if self
                .pull_kind(EntityKind::Session, own, &mut tracker, &mut report, &mut needs_sanity)
                .await?
            {
                self.save_session(own, &tracker).await?;
                should_pull = self.should_pull(trigger, &tracker).await?;
            } else {
                pull_failed = true;
            }
        }
        if should_pull && !pull_failed {
            report.pull_ran = true;
            for &kind in self.order.push_order() {
                if self.is_cancelled() {
                    return self.finish_cancelled(own, tracker, report).await;
                }
                let complete = self
                    .pull_kind(kind, own, &mut tracker, &mut report, &mut needs_sanity)
                    .await?;
                self.save_session(own, &tracker).await?;
                if !complete {
                    pull_failed = true;
                    break;
                }
            }
        }

        self.purge(&mut report).await?;

        let sanity = tracker.session().sanity;
        if !sanity.skip && (needs_sanity || self.settings.sanity.is_due(&sanity, self.now())) {
            report.sanity_ran = true;
            if self.sanity_pass(own, &mut tracker, &mut report).await? {
                return self.finish_cancelled(own, tracker, report).await;
            }
        }

        if !pull_failed {
            tracker.cycle_succeeded(self.now());
        }
        self.save_session(own, &tracker).await?;

        tracing::info!(
            pushed = report.pushed,
            deleted = report.deleted,
            deferred = report.deferred,
            failed = report.failed,
            conflicts = report.conflicts,
            pulled = report.pulled,
            purged = report.purged,
            repaired = report.repaired,
            "sync cycle finished"
        );
        Ok(CycleOutcome::Completed(report))
    }

    async fn finish_cancelled(
        &self,
        own: RecordUuid,
        tracker: WatermarkTracker,
        report: CycleReport,
    ) -> Result<CycleOutcome, EngineError> {
        tracing::info!("sync cycle cancelled");
        self.save_session(own, &tracker).await?;
        Ok(CycleOutcome::Cancelled(report))
    }

    // =========================================================================
    // Session bookkeeping
    // =========================================================================

    async fn own_session(&self) -> Result<(RecordUuid, Session), EngineError> {
        let sessions = self
            .store()
            .query(&RecordFilter::kind(EntityKind::Session))
            .await?;
        for record in sessions {
            if let EntityBody::Session(session) = &record.body {
                if session.device_id == self.settings.device_id {
                    return Ok((record.uuid, session.clone()));
                }
            }
        }
        Err(EngineError::NoSession(self.settings.device_id.clone()))
    }

    async fn peers(&self, own: &Session) -> Result<Vec<MultiSessionMarks>, EngineError> {
        let sessions = self
            .store()
            .query(&RecordFilter::kind(EntityKind::Session).owned_by(own.user_uuid))
            .await?;
        Ok(sessions
            .into_iter()
            .filter_map(|record| match record.body {
                EntityBody::Session(session) if session.device_id != own.device_id => {
                    Some(session.multi_session)
                }
                _ => None,
            })
            .collect())
    }

    async fn should_pull(
        &self,
        trigger: SyncTrigger,
        tracker: &WatermarkTracker,
    ) -> Result<bool, EngineError> {
        let peers = self.peers(tracker.session()).await?;
        Ok(self.settings.pull.should_pull(
            trigger,
            &tracker.session().multi_session,
            &peers,
            self.now(),
        ))
    }

    async fn is_private(&self, user: RecordUuid) -> Result<bool, EngineError> {
        Ok(matches!(
            self.store().get(user).await?.map(|r| r.body),
            Some(EntityBody::User(u)) if u.is_private_mode
        ))
    }

    /// Write the tracker's marks into the session record, leaving the other
    /// session fields as they are.
    async fn save_session(
        &self,
        own: RecordUuid,
        tracker: &WatermarkTracker,
    ) -> Result<(), EngineError> {
        let marks = tracker.session().clone();
        self.records
            .update_with(own, move |body| {
                if let EntityBody::Session(session) = body {
                    session.multi_session = marks.multi_session;
                    session.watermarks = marks.watermarks.clone();
                    session.sanity = marks.sanity;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Records left `syncing` by an interrupted cycle go back to the queue.
    async fn recover_stale(&self) -> Result<(), EngineError> {
        let stale = self
            .store()
            .query(&RecordFilter::all().in_states([SynchroState::Syncing]).with_deleted())
            .await?;
        if stale.is_empty() {
            return Ok(());
        }
        tracing::warn!(count = stale.len(), "recovering records left syncing");
        let writes = stale
            .iter()
            .map(|r| PendingWrite::events(r.uuid, vec![RecordEvent::Recovered]))
            .collect();
        self.commit(writes).await?;
        Ok(())
    }

    // =========================================================================
    // Local writes
    // =========================================================================

    /// Move `records` to `syncing`. Records changed since they were read are
    /// left for the next cycle.
    async fn mark_syncing(&self, records: Vec<Record>) -> Result<Vec<Record>, EngineError> {
        let now = self.now();
        let ctx = self.records.context(now);
        let mut batch = WriteBatch::new();
        for record in records {
            let (meta, _) = on_event(record.meta.clone(), RecordEvent::PushStarted, &ctx);
            batch.update(Record { meta, ..record });
        }
        let outcome = self.store().apply(batch).await?;
        if !outcome.rejected.is_empty() {
            tracing::debug!(
                count = outcome.rejected.len(),
                "records changed before push, left for next cycle"
            );
        }
        Ok(outcome.written)
    }

    /// Fold outcomes into the current version of their records.
    ///
    /// Rejected writes are re-read and retried. Returns the uuids written.
    async fn commit(&self, writes: Vec<PendingWrite>) -> Result<Vec<RecordUuid>, EngineError> {
        let mut pending = writes;
        let mut committed = Vec::with_capacity(pending.len());

        for _ in 0..MAX_WRITE_ATTEMPTS {
            if pending.is_empty() {
                break;
            }
            let uuids: Vec<RecordUuid> = pending.iter().map(|w| w.uuid).collect();
            let current: HashMap<RecordUuid, Record> = self
                .store()
                .query(&RecordFilter::all().uuids(uuids).with_deleted())
                .await?
                .into_iter()
                .map(|r| (r.uuid, r))
                .collect();

            let ctx = self.records.context(self.now());
            let mut batch = WriteBatch::new();
            for write in &pending {
                let Some(record) = current.get(&write.uuid) else {
                    tracing::debug!(uuid = %write.uuid, "record removed before commit");
                    continue;
                };
                let meta = write.events.iter().fold(record.meta.clone(), |meta, event| {
                    on_event(meta, event.clone(), &ctx).0
                });
                let body = write.body.clone().unwrap_or_else(|| record.body.clone());
                batch.update(Record {
                    uuid: record.uuid,
                    revision: record.revision,
                    meta,
                    body,
                });
            }
            if batch.is_empty() {
                break;
            }

            let outcome = self.store().apply(batch).await?;
            committed.extend(outcome.written.iter().map(|r| r.uuid));
            pending.retain(|w| outcome.rejected.contains(&w.uuid));
        }

        if !pending.is_empty() {
            tracing::warn!(count = pending.len(), "outcomes not committed, retried next cycle");
        }
        Ok(committed)
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Push new and modified records of `kind`. Returns whether the cycle
    /// was cancelled.
    async fn push_upserts(
        &self,
        kind: EntityKind,
        tracker: &mut WatermarkTracker,
        report: &mut CycleReport,
    ) -> Result<bool, EngineError> {
        let now = self.now();
        let candidates = self
            .store()
            .query(
                &RecordFilter::kind(kind)
                    .in_states([SynchroState::NotSynced, SynchroState::Failed]),
            )
            .await?;

        let mut ready = Vec::new();
        for record in candidates {
            if !record.meta.status.is_due(now) || !is_syncable(&record) {
                continue;
            }
            match push_readiness(self.store(), &record).await? {
                Readiness::Ready => ready.push(record),
                Readiness::Deferred(parent) => {
                    report.deferred += 1;
                    tracing::debug!(
                        uuid = %record.uuid,
                        %kind,
                        role = parent.role,
                        parent = %parent.target,
                        "push deferred until parent is on the cloud"
                    );
                }
                Readiness::Orphaned(parent) => {
                    report.deferred += 1;
                    tracing::warn!(
                        uuid = %record.uuid,
                        %kind,
                        role = parent.role,
                        parent = %parent.target,
                        "push skipped, parent missing"
                    );
                }
            }
        }
        if ready.is_empty() {
            return Ok(false);
        }

        let in_flight = self.mark_syncing(ready).await?;
        let mut writes = Vec::with_capacity(in_flight.len());
        let mut cancelled = false;
        for record in in_flight {
            if cancelled || self.is_cancelled() {
                cancelled = true;
                writes.push(PendingWrite::events(record.uuid, vec![RecordEvent::Recovered]));
                continue;
            }
            let request = PushRequest::from(&record);
            let mut result = self.call(self.cloud.push(kind, &request)).await;
            let rebased = match &result {
                Err(CloudError::Conflict { remote }) => self.rebase(&record, remote, report),
                _ => None,
            };
            let mut pushed_body = None;
            if let Some(rebased) = rebased {
                result = self.call(self.cloud.push(kind, &rebased)).await;
                pushed_body = Some(rebased.body);
            }
            writes.push(self.push_outcome(&record, pushed_body, result, tracker, report));
        }

        let committed = self.commit(writes).await?;
        self.records.replay_many(committed).await?;
        Ok(cancelled)
    }

    /// A newer local version hit a cloud version it was not edited from.
    /// Returns the merged version to push again, or `None` when the cloud
    /// version wins.
    fn rebase(
        &self,
        record: &Record,
        remote: &RemoteRecord,
        report: &mut CycleReport,
    ) -> Option<PushRequest> {
        let resolution = resolve(&record.body, record.meta.local_modification_date, remote);
        if resolution.winner != Winner::Local {
            return None;
        }
        report.conflicts += 1;
        tracing::warn!(
            uuid = %record.uuid,
            kind = %record.kind(),
            local_modified = %record.meta.local_modification_date,
            remote_modified = %remote.modified,
            "push conflict resolved, local version merged and pushed again"
        );
        Some(PushRequest {
            uuid: record.uuid,
            cloud_id: remote.cloud_id,
            body: resolution.body,
            modified: record.meta.local_modification_date,
            base: Some(remote.cloud_modified),
        })
    }

    fn push_outcome(
        &self,
        record: &Record,
        pushed_body: Option<EntityBody>,
        result: Result<sync_types::PushAck, CloudError>,
        tracker: &mut WatermarkTracker,
        report: &mut CycleReport,
    ) -> PendingWrite {
        let uuid = record.uuid;
        let kind = record.kind();
        match result {
            Ok(ack) => {
                report.pushed += 1;
                tracker.record_pushed(kind, record.meta.local_modification_date);
                tracing::debug!(%uuid, %kind, cloud_id = %ack.cloud_id, "pushed");
                PendingWrite {
                    uuid,
                    body: pushed_body,
                    events: vec![RecordEvent::PushSucceeded {
                        cloud_id: ack.cloud_id,
                        cloud_modified: ack.cloud_modified,
                    }],
                }
            }
            Err(CloudError::Conflict { remote }) => {
                report.conflicts += 1;
                let resolution =
                    resolve(&record.body, record.meta.local_modification_date, &remote);
                tracing::warn!(
                    %uuid,
                    %kind,
                    winner = ?resolution.winner,
                    local_modified = %record.meta.local_modification_date,
                    remote_modified = %remote.modified,
                    "push conflict resolved"
                );
                let event = if resolution.diverges_from_remote {
                    RecordEvent::Remerged {
                        cloud_id: remote.cloud_id,
                        modified: remote.modified,
                        cloud_modified: remote.cloud_modified,
                    }
                } else {
                    RecordEvent::RemoteApplied {
                        cloud_id: remote.cloud_id,
                        modified: remote.modified,
                        cloud_modified: remote.cloud_modified,
                        deleted: remote.deleted,
                    }
                };
                PendingWrite {
                    uuid,
                    body: Some(resolution.body),
                    events: vec![event],
                }
            }
            Err(CloudError::NotFound) => {
                tracing::warn!(%uuid, %kind, "record removed from cloud, kept as tombstone");
                PendingWrite::events(uuid, vec![removed_from_cloud(record)])
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(%uuid, %kind, error = %e, "push failed");
                PendingWrite::events(
                    uuid,
                    vec![RecordEvent::PushFailed {
                        error: e.as_synchro_error().unwrap_or(SynchroError::Transient),
                    }],
                )
            }
        }
    }

    /// Push tombstones of `kind`. Returns whether the cycle was cancelled.
    async fn push_deletes(
        &self,
        kind: EntityKind,
        report: &mut CycleReport,
    ) -> Result<bool, EngineError> {
        let now = self.now();
        let tombstones = self
            .store()
            .query(
                &RecordFilter::kind(kind)
                    .only_deleted()
                    .in_states([SynchroState::NotSynced, SynchroState::Failed]),
            )
            .await?;

        let mut writes = Vec::new();
        let mut remote = Vec::new();
        for record in tombstones {
            if !record.meta.status.is_due(now) {
                continue;
            }
            if !record.meta.cloud_id.is_assigned() {
                // Never reached the cloud: nothing to delete there
                report.deleted += 1;
                writes.push(PendingWrite::events(
                    record.uuid,
                    vec![
                        RecordEvent::PushStarted,
                        RecordEvent::DeleteConfirmed {
                            cloud_modified: None,
                        },
                    ],
                ));
                continue;
            }
            if !is_syncable(&record) {
                continue;
            }
            if has_pending_dependents(self.store(), record.uuid).await? {
                report.deferred += 1;
                tracing::debug!(uuid = %record.uuid, %kind, "delete deferred until dependents are synced");
                continue;
            }
            remote.push(record);
        }

        let in_flight = if remote.is_empty() {
            Vec::new()
        } else {
            self.mark_syncing(remote).await?
        };
        let mut cancelled = false;
        for record in in_flight {
            if cancelled || self.is_cancelled() {
                cancelled = true;
                writes.push(PendingWrite::events(record.uuid, vec![RecordEvent::Recovered]));
                continue;
            }
            let event = match self.call(self.cloud.delete(kind, record.meta.cloud_id)).await {
                Ok(()) | Err(CloudError::NotFound) => {
                    report.deleted += 1;
                    tracing::debug!(uuid = %record.uuid, %kind, "deletion confirmed");
                    RecordEvent::DeleteConfirmed {
                        cloud_modified: None,
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(uuid = %record.uuid, %kind, error = %e, "delete failed");
                    RecordEvent::PushFailed {
                        error: e.as_synchro_error().unwrap_or(SynchroError::Transient),
                    }
                }
            };
            writes.push(PendingWrite::events(record.uuid, vec![event]));
        }

        if writes.is_empty() {
            return Ok(cancelled);
        }
        let committed = self.commit(writes).await?;
        self.records.replay_many(committed).await?;
        Ok(cancelled)
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Fetch every page of changes of `kind` since `since`.
    async fn fetch_all(
        &self,
        kind: EntityKind,
        since: Option<Timestamp>,
    ) -> Result<Vec<RemoteRecord>, CloudError> {
        let mut changes = Vec::new();
        let mut page = 0;
        loop {
            let batch = self.call(self.cloud.fetch_changes(kind, since, page)).await?;
            changes.extend(batch.records);
            match batch.next_page {
                Some(next) => page = next,
                None => return Ok(changes),
            }
        }
    }

    /// Pull changes of `kind`. Returns whether every change was fetched and
    /// applied; the watermark only moves in that case.
    async fn pull_kind(
        &self,
        kind: EntityKind,
        own: RecordUuid,
        tracker: &mut WatermarkTracker,
        report: &mut CycleReport,
        needs_sanity: &mut bool,
    ) -> Result<bool, EngineError> {
        let changes = match self.fetch_all(kind, tracker.pulled(kind)).await {
            Ok(changes) => changes,
            Err(e) => {
                tracing::warn!(%kind, error = %e, "pull interrupted, watermark kept");
                return Ok(false);
            }
        };
        let latest = changes.iter().map(|r| r.cloud_modified).max();

        let applied = self
            .apply_remote(kind, changes, own, report, needs_sanity)
            .await?;
        if !applied.complete {
            return Ok(false);
        }
        if let Some(latest) = latest {
            tracker.advance_pulled(kind, latest);
        }
        for deleted in applied.deletions {
            tracker.record_cloud_deletion(kind, deleted);
        }
        Ok(true)
    }

    /// Write cloud changes of `kind` into the local store.
    async fn apply_remote(
        &self,
        kind: EntityKind,
        changes: Vec<RemoteRecord>,
        own: RecordUuid,
        report: &mut CycleReport,
        needs_sanity: &mut bool,
    ) -> Result<Applied, EngineError> {
        // Latest version per record
        let mut latest: HashMap<RecordUuid, RemoteRecord> = HashMap::new();
        for remote in changes {
            if remote.kind != kind || remote.body.kind() != kind || remote.uuid == own {
                continue;
            }
            match latest.get(&remote.uuid) {
                Some(seen) if seen.cloud_modified >= remote.cloud_modified => {}
                _ => {
                    latest.insert(remote.uuid, remote);
                }
            }
        }
        let mut pending: Vec<RemoteRecord> = latest.into_values().collect();
        pending.sort_by_key(|r| r.cloud_modified);

        let mut applied = Applied {
            complete: true,
            deletions: pending
                .iter()
                .filter(|r| r.deleted)
                .map(|r| r.cloud_modified)
                .collect(),
        };
        let mut written_bodies = Vec::new();

        for _ in 0..MAX_WRITE_ATTEMPTS {
            if pending.is_empty() {
                break;
            }
            let uuids: Vec<RecordUuid> = pending.iter().map(|r| r.uuid).collect();
            let local: HashMap<RecordUuid, Record> = self
                .store()
                .query(&RecordFilter::all().uuids(uuids).with_deleted())
                .await?
                .into_iter()
                .map(|r| (r.uuid, r))
                .collect();

            let now = self.now();
            let mut batch = WriteBatch::new();
            let mut queued = HashSet::new();
            for remote in &pending {
                match self.incoming(remote, local.get(&remote.uuid), now).await? {
                    Incoming::Skip => {}
                    Incoming::Create(record) => {
                        queued.insert(record.uuid);
                        batch.create(record);
                    }
                    Incoming::Update(record) => {
                        queued.insert(record.uuid);
                        batch.update(record);
                    }
                    Incoming::MissingParent(parent) => {
                        *needs_sanity = true;
                        tracing::warn!(
                            uuid = %remote.uuid,
                            %kind,
                            role = parent.role,
                            parent = %parent.target,
                            "cloud change skipped, parent missing locally"
                        );
                    }
                }
            }
            // Skipped changes are settled; only rejected writes are retried
            pending.retain(|r| queued.contains(&r.uuid));
            if batch.is_empty() {
                break;
            }

            let outcome = self.store().apply(batch).await?;
            report.pulled += outcome.written.len();
            written_bodies.extend(outcome.written.into_iter().map(|r| r.body));
            pending.retain(|r| outcome.rejected.contains(&r.uuid));
        }

        if !pending.is_empty() {
            tracing::warn!(%kind, count = pending.len(), "cloud changes not applied, pull retried");
            applied.complete = false;
        }
        self.records.refresh_projects(&written_bodies).await?;
        Ok(applied)
    }

    async fn incoming(
        &self,
        remote: &RemoteRecord,
        local: Option<&Record>,
        now: Timestamp,
    ) -> Result<Incoming, EngineError> {
        let Some(local) = local else {
            if remote.deleted {
                return Ok(Incoming::Skip);
            }
            let mut meta = meta_from_remote(remote, now);
            match self.parents(&remote.body).await? {
                Parents::Missing(parent) => return Ok(Incoming::MissingParent(parent)),
                // Synced children of parents without a cloud id are not allowed
                Parents::Unregistered => meta.status = SynchroStatus::NotSynced,
                Parents::Ready => {}
            }
            return Ok(Incoming::Create(Record {
                uuid: remote.uuid,
                revision: 0,
                meta,
                body: remote.body.clone(),
            }));
        };

        let seen = local.meta.cloud_modification_date;
        if seen.is_some_and(|seen| seen >= remote.cloud_modified)
            || local.meta.status == SynchroStatus::Syncing
        {
            return Ok(Incoming::Skip);
        }
        if !remote.deleted {
            if let Parents::Missing(parent) = self.parents(&remote.body).await? {
                return Ok(Incoming::MissingParent(parent));
            }
        }

        let ctx = self.records.context(now);
        let (body, event) = if local.meta.has_pending_changes() {
            let resolution = resolve(&local.body, local.meta.local_modification_date, remote);
            if resolution.winner == Winner::Local {
                tracing::debug!(uuid = %local.uuid, "local version newer than cloud, kept for push");
                let (meta, _) = on_event(
                    local.meta.clone(),
                    RecordEvent::Rebased {
                        cloud_id: remote.cloud_id,
                        cloud_modified: remote.cloud_modified,
                    },
                    &ctx,
                );
                return Ok(Incoming::Update(Record {
                    uuid: local.uuid,
                    revision: local.revision,
                    meta,
                    body: resolution.body,
                }));
            }
            tracing::warn!(
                uuid = %local.uuid,
                kind = %local.kind(),
                local_modified = %local.meta.local_modification_date,
                remote_modified = %remote.modified,
                "local change overridden by newer cloud version"
            );
            let event = if resolution.diverges_from_remote {
                RecordEvent::Remerged {
                    cloud_id: remote.cloud_id,
                    modified: remote.modified,
                    cloud_modified: remote.cloud_modified,
                }
            } else {
                remote_applied(remote)
            };
            (resolution.body, event)
        } else if remote.deleted {
            (local.body.clone(), remote_applied(remote))
        } else {
            (remote.body.clone(), remote_applied(remote))
        };

        let (meta, _) = on_event(local.meta.clone(), event, &ctx);
        Ok(Incoming::Update(Record {
            uuid: local.uuid,
            revision: local.revision,
            meta,
            body,
        }))
    }

    async fn parents(&self, body: &EntityBody) -> Result<Parents, EngineError> {
        let mut state = Parents::Ready;
        for reference in body.references() {
            if !reference.strength.is_dependency() {
                continue;
            }
            match self.store().get(reference.target).await? {
                Some(parent) if !parent.is_deleted() && parent.kind() == reference.kind => {
                    if !parent.meta.cloud_id.is_assigned() {
                        state = Parents::Unregistered;
                    }
                }
                _ => return Ok(Parents::Missing(reference)),
            }
        }
        Ok(state)
    }

    // =========================================================================
    // Purge
    // =========================================================================

    async fn purge(&self, report: &mut CycleReport) -> Result<(), EngineError> {
        let now = self.now();
        let delete_order: Vec<EntityKind> = self.order.delete_order().collect();
        for kind in delete_order {
            let tombstones = self
                .store()
                .query(
                    &RecordFilter::kind(kind)
                        .only_deleted()
                        .in_states([SynchroState::Synced]),
                )
                .await?;

            let mut batch = WriteBatch::new();
            for record in &tombstones {
                let referrers = self.store().referrers(record.uuid).await?.len();
                match self.settings.purge.evaluate(&record.meta, referrers, now) {
                    PurgeDecision::Purge => {
                        batch.remove(record);
                    }
                    PurgeDecision::Blocked { referrers } => {
                        tracing::debug!(uuid = %record.uuid, %kind, referrers, "purge blocked");
                    }
                    PurgeDecision::NotEligible | PurgeDecision::Wait { .. } => {}
                }
            }
            if batch.is_empty() {
                continue;
            }
            let outcome = self.store().apply(batch).await?;
            report.purged += outcome.removed.len();
            if !outcome.removed.is_empty() {
                tracing::debug!(%kind, count = outcome.removed.len(), "tombstones purged");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Sanity
    // =========================================================================

    /// Full reconciliation. Returns whether the cycle was cancelled.
    async fn sanity_pass(
        &self,
        own: RecordUuid,
        tracker: &mut WatermarkTracker,
        report: &mut CycleReport,
    ) -> Result<bool, EngineError> {
        tracing::info!("sanity pass started");
        tracker.sanity_started(self.now());
        self.save_session(own, tracker).await?;

        let mut clean = true;
        let mut needs_sanity = false;
        for &kind in self.order.push_order() {
            if self.is_cancelled() {
                return Ok(true);
            }

            match self.fetch_all(kind, None).await {
                Ok(changes) => {
                    let applied = self
                        .apply_remote(kind, changes, own, report, &mut needs_sanity)
                        .await?;
                    clean &= applied.complete;
                    for deleted in applied.deletions {
                        tracker.record_cloud_deletion(kind, deleted);
                    }
                }
                Err(e) => {
                    tracing::warn!(%kind, error = %e, "sanity fetch failed");
                    clean = false;
                    continue;
                }
            }

            let live: HashSet<CloudId> = match self.call(self.cloud.fetch_all_ids(kind)).await {
                Ok(ids) => ids.into_iter().collect(),
                Err(e) => {
                    tracing::warn!(%kind, error = %e, "sanity id listing failed");
                    clean = false;
                    continue;
                }
            };
            report.repaired += self.apply_missed_deletions(kind, own, &live).await?;
        }

        for (orphan, parent) in find_orphans(self.store()).await? {
            tracing::warn!(
                uuid = %orphan.uuid,
                kind = %orphan.kind(),
                role = parent.role,
                parent = %parent.target,
                "orphan tombstoned"
            );
            match self.records.soft_delete(orphan.uuid).await {
                Ok(removed) if !removed.is_empty() => report.repaired += 1,
                Ok(_) => {}
                Err(crate::error::RepositoryError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if clean {
            tracker.sanity_succeeded(self.now());
        }
        self.save_session(own, tracker).await?;
        tracing::info!(clean, repaired = report.repaired, "sanity pass finished");
        Ok(false)
    }

    /// Synced records absent from the cloud were deleted there without a
    /// marker reaching us.
    async fn apply_missed_deletions(
        &self,
        kind: EntityKind,
        own: RecordUuid,
        live: &HashSet<CloudId>,
    ) -> Result<usize, EngineError> {
        let synced = self
            .store()
            .query(
                &RecordFilter::kind(kind)
                    .in_states([SynchroState::Synced])
                    .cloud_assigned(true),
            )
            .await?;
        let writes: Vec<PendingWrite> = synced
            .iter()
            .filter(|r| r.uuid != own && !live.contains(&r.meta.cloud_id))
            .map(|r| {
                tracing::warn!(uuid = %r.uuid, %kind, "missed cloud deletion applied");
                PendingWrite::events(r.uuid, vec![removed_from_cloud(r)])
            })
            .collect();
        if writes.is_empty() {
            return Ok(0);
        }
        Ok(self.commit(writes).await?.len())
    }
}

/// Records owned by nobody stay local.
fn is_syncable(record: &Record) -> bool {
    !record.uuid.is_anonymous() && !record.body.owner().is_some_and(|o| o.is_anonymous())
}

fn remote_applied(remote: &RemoteRecord) -> RecordEvent {
    RecordEvent::RemoteApplied {
        cloud_id: remote.cloud_id,
        modified: remote.modified,
        cloud_modified: remote.cloud_modified,
        deleted: remote.deleted,
    }
}

/// The cloud no longer knows the record. Cloud dates are kept: local time
/// and cloud time are not comparable.
fn removed_from_cloud(record: &Record) -> RecordEvent {
    RecordEvent::RemoteApplied {
        cloud_id: record.meta.cloud_id,
        modified: record.meta.local_modification_date,
        cloud_modified: record
            .meta
            .cloud_modification_date
            .unwrap_or(Timestamp::EPOCH),
        deleted: true,
    }
}
