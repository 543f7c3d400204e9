//! Local mutation of records, shared by every repository.
//!
//! All local writes go through [`Records`]: it runs the sync state machine
//! on every mutation, enforces referential integrity, cascades
//! soft-deletes and holds edits of records with a push in flight. Local
//! mutations are serialized among themselves; against the orchestrator
//! they rely on revision guards.

use crate::buffer::{EditBuffer, PendingOp};
use crate::error::RepositoryError;
use crate::resolver::{cascade_targets, check_parents, projects_of, refresh_project_derived};
use std::collections::BTreeSet;
use std::sync::Arc;
use sync_core::{on_event, Clock, RecordEvent, RetryPolicy, TransitionContext};
use sync_store::{LocalStore, StoreError, WriteBatch};
use sync_types::{EntityBody, Record, RecordUuid, SyncMeta, SynchroStatus, Timestamp};
use tokio::sync::Mutex;

/// Attempts of a guarded write before giving up with `Contended`.
pub(crate) const MAX_WRITE_ATTEMPTS: usize = 5;

/// Untyped record access with sync bookkeeping.
pub struct Records {
    store: Arc<dyn LocalStore>,
    buffer: EditBuffer,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    gate: Mutex<()>,
}

impl std::fmt::Debug for Records {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Records")
            .field("buffered", &self.buffer.len())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Records {
    /// Wrap a store.
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            store,
            buffer: EditBuffer::new(),
            clock,
            retry,
            gate: Mutex::new(()),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &dyn LocalStore {
        &*self.store
    }

    /// Edits held for records with a push in flight.
    pub fn buffer(&self) -> &EditBuffer {
        &self.buffer
    }

    /// Current time.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Retry schedule of failed pushes.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// State machine context at `now`.
    pub fn context(&self, now: Timestamp) -> TransitionContext<'_> {
        TransitionContext {
            now,
            retry: &self.retry,
        }
    }

    /// A record as its owner sees it, buffered edits applied, tombstones
    /// included.
    pub async fn get(&self, uuid: RecordUuid) -> Result<Option<Record>, RepositoryError> {
        Ok(self.store.get(uuid).await?.map(|r| self.buffer.overlay(r)))
    }

    /// Insert a new record.
    pub async fn create(&self, body: EntityBody) -> Result<Record, RepositoryError> {
        self.create_with_uuid(RecordUuid::new(), body).await
    }

    /// Insert a new record with a caller-chosen uuid.
    pub async fn create_with_uuid(
        &self,
        uuid: RecordUuid,
        body: EntityBody,
    ) -> Result<Record, RepositoryError> {
        check_parents(self.store(), &body).await?;

        let record = Record {
            uuid,
            revision: 0,
            meta: SyncMeta::new_local(self.now()),
            body,
        };
        let mut batch = WriteBatch::new();
        batch.create(record);
        let outcome = self.store.apply(batch).await?;
        let written = outcome
            .written(uuid)
            .cloned()
            .ok_or(RepositoryError::AlreadyExists(uuid))?;

        tracing::debug!(%uuid, kind = %written.kind(), "record created");
        self.refresh_projects([&written.body]).await?;
        Ok(written)
    }

    /// Apply `mutate` to a live record.
    ///
    /// Fails with `NotFound` on tombstones. While a push of the record is in
    /// flight the new body is buffered and the returned record is the
    /// buffered view.
    pub async fn update_with<F>(&self, uuid: RecordUuid, mut mutate: F) -> Result<Record, RepositoryError>
    where
        F: FnMut(&mut EntityBody) -> Result<(), RepositoryError> + Send,
    {
        let _gate = self.gate.lock().await;
        self.update_locked(uuid, &mut mutate).await
    }

    async fn update_locked<F>(&self, uuid: RecordUuid, mutate: &mut F) -> Result<Record, RepositoryError>
    where
        F: FnMut(&mut EntityBody) -> Result<(), RepositoryError> + Send,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let stored = self
                .store
                .get(uuid)
                .await?
                .ok_or(RepositoryError::NotFound(uuid))?;
            let current = self.buffer.overlay(stored.clone());
            if current.is_deleted() {
                return Err(RepositoryError::NotFound(uuid));
            }

            let body = self.mutated(&stored, &current.body, mutate).await?;
            if stored.meta.status == SynchroStatus::Syncing {
                tracing::debug!(%uuid, "push in flight, edit buffered");
                self.buffer.push(uuid, PendingOp::Update(body.clone()));
                return Ok(Record { body, ..current });
            }

            if let Some(written) = self
                .write_local(&stored, body, RecordEvent::LocalEdit)
                .await?
            {
                self.buffer.discard(uuid);
                self.refresh_projects([&current.body, &written.body]).await?;
                return Ok(written);
            }
        }
        Err(RepositoryError::Contended(uuid))
    }

    /// Soft-delete a record and everything it owns.
    ///
    /// Returns the uuids tombstoned, now or once their in-flight push
    /// lands. Deleting a tombstone is a no-op.
    pub async fn soft_delete(&self, uuid: RecordUuid) -> Result<Vec<RecordUuid>, RepositoryError> {
        let _gate = self.gate.lock().await;

        let root = self.get(uuid).await?.ok_or(RepositoryError::NotFound(uuid))?;
        if root.is_deleted() {
            return Ok(Vec::new());
        }

        let mut affected = Vec::new();
        let mut bodies = Vec::new();
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let root = self
                .store
                .get(uuid)
                .await?
                .ok_or(RepositoryError::NotFound(uuid))?;
            let targets = cascade_targets(self.store(), &root).await?;

            let ctx = self.context(self.now());
            let mut batch = WriteBatch::new();
            let mut buffered = Vec::new();
            for target in targets {
                let view = self.buffer.overlay(target.clone());
                if view.is_deleted() {
                    continue;
                }
                if target.meta.status == SynchroStatus::Syncing {
                    buffered.push(target.uuid);
                    continue;
                }
                let (meta, _) = on_event(target.meta.clone(), RecordEvent::LocalDelete, &ctx);
                bodies.push(view.body.clone());
                batch.update(Record {
                    meta,
                    body: view.body,
                    ..target
                });
            }

            let outcome = if batch.is_empty() {
                Default::default()
            } else {
                self.store.apply(batch).await?
            };
            for record in &outcome.written {
                self.buffer.discard(record.uuid);
                affected.push(record.uuid);
            }
            if !outcome.is_clean() {
                continue;
            }

            for target in buffered {
                self.buffer.push(target, PendingOp::Delete);
                affected.push(target);
            }
            tracing::debug!(%uuid, tombstoned = affected.len(), "record soft-deleted");
            self.refresh_projects(&bodies).await?;
            return Ok(affected);
        }
        Err(RepositoryError::Contended(uuid))
    }

    /// Revive a tombstone, applying `mutate` on the way.
    ///
    /// The record is pushed as an update, never as a delete. Every parent
    /// must be live. On a live record this is a plain update.
    pub async fn restore_with<F>(&self, uuid: RecordUuid, mut mutate: F) -> Result<Record, RepositoryError>
    where
        F: FnMut(&mut EntityBody) -> Result<(), RepositoryError> + Send,
    {
        let _gate = self.gate.lock().await;

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let stored = self
                .store
                .get(uuid)
                .await?
                .ok_or(RepositoryError::NotFound(uuid))?;
            let current = self.buffer.overlay(stored.clone());
            if !current.is_deleted() {
                return self.update_locked(uuid, &mut mutate).await;
            }

            let body = self.mutated(&stored, &current.body, &mut mutate).await?;
            if stored.meta.status == SynchroStatus::Syncing {
                tracing::debug!(%uuid, "push in flight, restore buffered");
                self.buffer.push(uuid, PendingOp::Restore(body));
                return Ok(self.buffer.overlay(stored));
            }

            if let Some(written) = self
                .write_local(&stored, body, RecordEvent::LocalRestore)
                .await?
            {
                self.buffer.discard(uuid);
                tracing::debug!(%uuid, "record restored");
                self.refresh_projects([&written.body]).await?;
                return Ok(written);
            }
        }
        Err(RepositoryError::Contended(uuid))
    }

    /// Apply the edit held for `uuid`, if its push is over.
    ///
    /// Returns whether something was written. Held edits that no longer
    /// apply (record gone, tombstoned remotely, parent gone) are dropped.
    pub async fn replay(&self, uuid: RecordUuid) -> Result<bool, RepositoryError> {
        let _gate = self.gate.lock().await;

        let Some(op) = self.buffer.take(uuid) else {
            return Ok(false);
        };
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(stored) = self.store.get(uuid).await? else {
                tracing::debug!(%uuid, "record gone, buffered edit dropped");
                return Ok(false);
            };
            if stored.meta.status == SynchroStatus::Syncing {
                self.buffer.restore_if_vacant(uuid, op);
                return Ok(false);
            }

            let (body, event) = match &op {
                PendingOp::Update(body) if !stored.is_deleted() => {
                    (body.clone(), RecordEvent::LocalEdit)
                }
                PendingOp::Update(_) => {
                    tracing::debug!(%uuid, "record deleted meanwhile, buffered edit dropped");
                    return Ok(false);
                }
                PendingOp::Delete if stored.is_deleted() => return Ok(false),
                PendingOp::Delete => (stored.body.clone(), RecordEvent::LocalDelete),
                PendingOp::Restore(body) => match check_parents(self.store(), body).await {
                    Ok(()) => (body.clone(), RecordEvent::LocalRestore),
                    Err(RepositoryError::MissingParent { role, target }) => {
                        tracing::debug!(%uuid, role, %target, "parent gone, buffered restore dropped");
                        return Ok(false);
                    }
                    Err(e) => return Err(e),
                },
            };

            if let Some(written) = self.write_local(&stored, body, event).await? {
                tracing::debug!(%uuid, "buffered edit replayed");
                self.refresh_projects([&stored.body, &written.body]).await?;
                return Ok(true);
            }
        }
        self.buffer.restore_if_vacant(uuid, op);
        Err(RepositoryError::Contended(uuid))
    }

    /// Replay the held edits of `uuids`. Contended records stay held.
    pub async fn replay_many(
        &self,
        uuids: impl IntoIterator<Item = RecordUuid> + Send,
    ) -> Result<usize, StoreError> {
        let mut replayed = 0;
        for uuid in uuids {
            match self.replay(uuid).await {
                Ok(true) => replayed += 1,
                Ok(false) => {}
                Err(RepositoryError::Storage(e)) => return Err(e),
                Err(e) => tracing::debug!(%uuid, error = %e, "buffered edit kept"),
            }
        }
        Ok(replayed)
    }

    /// Replay every held edit.
    pub async fn replay_all(&self) -> Result<usize, StoreError> {
        self.replay_many(self.buffer.uuids()).await
    }

    /// Recompute derived fields of the projects these bodies belong to.
    pub async fn refresh_projects<'a>(
        &self,
        bodies: impl IntoIterator<Item = &'a EntityBody>,
    ) -> Result<(), StoreError> {
        let projects: BTreeSet<RecordUuid> = projects_of(bodies);
        if !projects.is_empty() {
            refresh_project_derived(self.store(), projects).await?;
        }
        Ok(())
    }

    async fn mutated<F>(
        &self,
        stored: &Record,
        current: &EntityBody,
        mutate: &mut F,
    ) -> Result<EntityBody, RepositoryError>
    where
        F: FnMut(&mut EntityBody) -> Result<(), RepositoryError> + Send,
    {
        let mut body = current.clone();
        mutate(&mut body)?;
        if body.kind() != stored.kind() {
            return Err(RepositoryError::WrongKind {
                uuid: stored.uuid,
                expected: stored.kind(),
                found: body.kind(),
            });
        }
        check_parents(self.store(), &body).await?;
        Ok(body)
    }

    async fn write_local(
        &self,
        stored: &Record,
        body: EntityBody,
        event: RecordEvent,
    ) -> Result<Option<Record>, StoreError> {
        let (meta, _) = on_event(stored.meta.clone(), event, &self.context(self.now()));
        let mut batch = WriteBatch::new();
        batch.update(Record {
            uuid: stored.uuid,
            revision: stored.revision,
            meta,
            body,
        });
        let outcome = self.store.apply(batch).await?;
        Ok(outcome.written(stored.uuid).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{anonymous_user, at, flight, link, plan, project, thumbnail, Fixture};
    use std::time::Duration;
    use sync_core::ManualClock;
    use sync_store::SqliteStore;
    use sync_types::{Entity, FlightPlanState, SynchroError};

    async fn setup() -> (Records, SqliteStore, ManualClock) {
        let store = SqliteStore::in_memory().await.unwrap();
        store.seed_record(anonymous_user()).await;
        let clock = ManualClock::new(at(10_000));
        let records = Records::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            RetryPolicy::default(),
        );
        (records, store, clock)
    }

    fn rename(name: &'static str) -> impl FnMut(&mut EntityBody) -> Result<(), RepositoryError> + Send {
        move |body| {
            if let EntityBody::Project(p) = body {
                p.title = name.into();
            }
            Ok(())
        }
    }

    fn title(record: &Record) -> String {
        match &record.body {
            EntityBody::Project(p) => p.title.clone(),
            other => panic!("not a project: {other:?}"),
        }
    }

    // =========================================================================
    // Create / Update
    // =========================================================================

    #[tokio::test]
    async fn create_starts_not_synced_without_cloud_id() {
        let (records, _, _) = setup().await;
        let p = records.create(project("p").into_body()).await.unwrap();
        assert_eq!(p.meta.status, SynchroStatus::NotSynced);
        assert!(!p.meta.cloud_id.is_assigned());
        assert_eq!(p.meta.local_creation_date, at(10_000));
    }

    #[tokio::test]
    async fn create_requires_parents() {
        let (records, _, _) = setup().await;
        let err = records
            .create(plan(RecordUuid::new()).into_body())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::MissingParent { .. }));
    }

    #[tokio::test]
    async fn create_with_taken_uuid_fails() {
        let (records, _, _) = setup().await;
        let p = records.create(project("p").into_body()).await.unwrap();
        let err = records
            .create_with_uuid(p.uuid, project("q").into_body())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::AlreadyExists(u) if u == p.uuid));
    }

    #[tokio::test]
    async fn update_resets_failed_record_and_bumps_date() {
        let (records, store, clock) = setup().await;
        let p = records.create(project("p").into_body()).await.unwrap();
        store
            .set_status(
                p.uuid,
                SynchroStatus::Failed {
                    error: SynchroError::Validation,
                    retry_at: None,
                },
            )
            .await;

        clock.advance(Duration::from_secs(5));
        let updated = records.update_with(p.uuid, rename("q")).await.unwrap();
        assert_eq!(title(&updated), "q");
        assert_eq!(updated.meta.status, SynchroStatus::NotSynced);
        assert_eq!(updated.meta.local_modification_date, at(15_000));
    }

    #[tokio::test]
    async fn update_of_tombstone_is_not_found() {
        let (records, _, _) = setup().await;
        let p = records.create(project("p").into_body()).await.unwrap();
        records.soft_delete(p.uuid).await.unwrap();
        let err = records.update_with(p.uuid, rename("q")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_cannot_change_kind() {
        let (records, _, _) = setup().await;
        let p = records.create(project("p").into_body()).await.unwrap();
        let err = records
            .update_with(p.uuid, |body| {
                *body = flight("f").into_body();
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::WrongKind { .. }));
    }

    // =========================================================================
    // Edits While Syncing
    // =========================================================================

    #[tokio::test]
    async fn edit_while_syncing_is_buffered_then_replayed() {
        let (records, store, _) = setup().await;
        let p = records.create(project("p").into_body()).await.unwrap();
        store.set_status(p.uuid, SynchroStatus::Syncing).await;

        let seen = records.update_with(p.uuid, rename("q")).await.unwrap();
        assert_eq!(title(&seen), "q");
        assert_eq!(title(&store.get(p.uuid).await.unwrap().unwrap()), "p");
        assert_eq!(title(&records.get(p.uuid).await.unwrap().unwrap()), "q");

        // Still syncing: replay keeps the edit
        assert!(!records.replay(p.uuid).await.unwrap());
        assert_eq!(records.buffer().len(), 1);

        store.set_status(p.uuid, SynchroStatus::Synced).await;
        assert!(records.replay(p.uuid).await.unwrap());
        let stored = store.get(p.uuid).await.unwrap().unwrap();
        assert_eq!(title(&stored), "q");
        assert_eq!(stored.meta.status, SynchroStatus::NotSynced);
        assert!(records.buffer().is_empty());
    }

    #[tokio::test]
    async fn delete_while_syncing_hides_record_until_replayed() {
        let (records, store, _) = setup().await;
        let p = records.create(project("p").into_body()).await.unwrap();
        store.set_status(p.uuid, SynchroStatus::Syncing).await;

        records.soft_delete(p.uuid).await.unwrap();
        assert!(records.get(p.uuid).await.unwrap().unwrap().is_deleted());
        assert!(!store.get(p.uuid).await.unwrap().unwrap().is_deleted());

        store.set_status(p.uuid, SynchroStatus::Synced).await;
        assert_eq!(records.replay_all().await.unwrap(), 1);
        let stored = store.get(p.uuid).await.unwrap().unwrap();
        assert!(stored.is_deleted());
        assert_eq!(stored.meta.status, SynchroStatus::NotSynced);
    }

    // =========================================================================
    // Soft Delete / Restore
    // =========================================================================

    #[tokio::test]
    async fn soft_delete_cascades_to_owned_children_only() {
        let (records, store, _) = setup().await;
        let p = records.create(project("p").into_body()).await.unwrap();
        let fp = records.create(plan(p.uuid).into_body()).await.unwrap();
        let f = records.create(flight("f").into_body()).await.unwrap();
        let l = records
            .create(link(fp.uuid, f.uuid).into_body())
            .await
            .unwrap();

        let deleted = records.soft_delete(p.uuid).await.unwrap();
        assert_eq!(deleted, vec![p.uuid, fp.uuid, l.uuid]);
        assert!(store.get(l.uuid).await.unwrap().unwrap().is_deleted());
        assert!(!store.get(f.uuid).await.unwrap().unwrap().is_deleted());

        // Idempotent
        assert!(records.soft_delete(p.uuid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_referrer_takes_shared_thumbnail_along() {
        let (records, store, _) = setup().await;
        let thumb = records.create(thumbnail().into_body()).await.unwrap();
        let mut a = flight("a");
        a.thumbnail_uuid = Some(thumb.uuid);
        let a = records.create(a.into_body()).await.unwrap();
        let mut b = flight("b");
        b.thumbnail_uuid = Some(thumb.uuid);
        let b = records.create(b.into_body()).await.unwrap();

        records.soft_delete(a.uuid).await.unwrap();
        assert!(!store.get(thumb.uuid).await.unwrap().unwrap().is_deleted());
        records.soft_delete(b.uuid).await.unwrap();
        assert!(store.get(thumb.uuid).await.unwrap().unwrap().is_deleted());
    }

    #[tokio::test]
    async fn restore_revives_as_update() {
        let (records, store, _) = setup().await;
        let p = records.create(project("p").into_body()).await.unwrap();
        records.soft_delete(p.uuid).await.unwrap();

        let revived = records.restore_with(p.uuid, rename("back")).await.unwrap();
        assert!(!revived.is_deleted());
        assert_eq!(revived.meta.deleted_date, None);
        assert_eq!(revived.meta.status, SynchroStatus::NotSynced);
        assert_eq!(title(&store.get(p.uuid).await.unwrap().unwrap()), "back");
    }

    #[tokio::test]
    async fn restore_needs_live_parent() {
        let (records, _, _) = setup().await;
        let p = records.create(project("p").into_body()).await.unwrap();
        let fp = records.create(plan(p.uuid).into_body()).await.unwrap();
        records.soft_delete(p.uuid).await.unwrap();

        let err = records.restore_with(fp.uuid, |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, RepositoryError::MissingParent { role: "project", .. }));
    }

    // =========================================================================
    // Derived Fields
    // =========================================================================

    #[tokio::test]
    async fn plan_changes_refresh_project_without_marking_it() {
        let (records, store, _) = setup().await;
        let p = records.create(project("p").into_body()).await.unwrap();
        store.set_status(p.uuid, SynchroStatus::Synced).await;

        let fp = records.create(plan(p.uuid).into_body()).await.unwrap();
        let stored = store.get(p.uuid).await.unwrap().unwrap();
        let EntityBody::Project(body) = &stored.body else {
            panic!("not a project");
        };
        assert!(body.has_editable_flight_plan);
        assert_eq!(stored.meta.status, SynchroStatus::Synced);

        records
            .update_with(fp.uuid, |body| {
                if let EntityBody::FlightPlan(plan) = body {
                    plan.state = FlightPlanState::Completed;
                }
                Ok(())
            })
            .await
            .unwrap();
        let EntityBody::Project(body) = store.get(p.uuid).await.unwrap().unwrap().body else {
            panic!("not a project");
        };
        assert!(!body.has_editable_flight_plan);
    }
}
