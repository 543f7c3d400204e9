//! Typed entity repositories.
//!
//! One [`Repository`] per entity kind, all sharing the same [`Records`].
//! Consumers create, update, soft-delete, restore and query typed
//! entities; sync fields are readable on [`Stored`] but never writable.

use crate::error::RepositoryError;
use crate::records::Records;
use std::marker::PhantomData;
use std::sync::Arc;
use sync_store::{Change, RecordFilter};
use sync_types::{
    CloudId, Entity, EntityKind, ExecutionLink, Flight, FlightPlan, Record, RecordUuid, SyncMeta,
};
use tokio::sync::{broadcast, watch};

/// A typed entity with its identity and sync fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<E> {
    /// Local primary key.
    pub uuid: RecordUuid,
    /// Store revision.
    pub revision: u64,
    /// Sync fields, read-only for consumers.
    pub meta: SyncMeta,
    /// Entity payload.
    pub entity: E,
}

impl<E: Entity> Stored<E> {
    fn from_record(record: Record) -> Result<Self, RepositoryError> {
        let found = record.kind();
        let entity = E::from_body(record.body).ok_or(RepositoryError::WrongKind {
            uuid: record.uuid,
            expected: E::KIND,
            found,
        })?;
        Ok(Self {
            uuid: record.uuid,
            revision: record.revision,
            meta: record.meta,
            entity,
        })
    }

    /// Whether this is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.meta.is_deleted
    }
}

/// Flight statistics of one user.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FlightSummary {
    /// Number of live flights.
    pub count: u64,
    /// Total flight time in seconds.
    pub total_duration_secs: f64,
    /// Total flown distance in meters.
    pub total_distance_m: f64,
}

/// Repository of one entity kind.
pub struct Repository<E> {
    records: Arc<Records>,
    _kind: PhantomData<fn() -> E>,
}

impl<E> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            _kind: PhantomData,
        }
    }
}

impl<E> std::fmt::Debug for Repository<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

impl<E: Entity> Repository<E> {
    /// Create a repository over shared records.
    pub fn new(records: Arc<Records>) -> Self {
        Self {
            records,
            _kind: PhantomData,
        }
    }

    /// Insert a new entity: fresh uuid, not synced, no cloud id.
    pub async fn create(&self, entity: E) -> Result<Stored<E>, RepositoryError> {
        Stored::from_record(self.records.create(entity.into_body()).await?)
    }

    /// Apply `mutate` to a live entity.
    ///
    /// Fails with `NotFound` if the entity is absent or tombstoned.
    pub async fn update<F>(&self, uuid: RecordUuid, mut mutate: F) -> Result<Stored<E>, RepositoryError>
    where
        F: FnMut(&mut E) + Send,
    {
        let record = self
            .records
            .update_with(uuid, |body| {
                let mut entity = typed::<E>(uuid, body.clone())?;
                mutate(&mut entity);
                *body = entity.into_body();
                Ok(())
            })
            .await?;
        Stored::from_record(record)
    }

    /// Soft-delete an entity and everything it owns.
    pub async fn soft_delete(&self, uuid: RecordUuid) -> Result<(), RepositoryError> {
        self.expect_kind(uuid).await?;
        self.records.soft_delete(uuid).await?;
        Ok(())
    }

    /// Undo a soft-delete, applying `mutate` to the revived entity.
    pub async fn restore<F>(&self, uuid: RecordUuid, mut mutate: F) -> Result<Stored<E>, RepositoryError>
    where
        F: FnMut(&mut E) + Send,
    {
        let record = self
            .records
            .restore_with(uuid, |body| {
                let mut entity = typed::<E>(uuid, body.clone())?;
                mutate(&mut entity);
                *body = entity.into_body();
                Ok(())
            })
            .await?;
        Stored::from_record(record)
    }

    /// A live entity.
    pub async fn get(&self, uuid: RecordUuid) -> Result<Option<Stored<E>>, RepositoryError> {
        Ok(self
            .get_including_deleted(uuid)
            .await?
            .filter(|stored| !stored.is_deleted()))
    }

    /// An entity, tombstones included.
    pub async fn get_including_deleted(
        &self,
        uuid: RecordUuid,
    ) -> Result<Option<Stored<E>>, RepositoryError> {
        match self.records.get(uuid).await? {
            Some(record) if record.kind() == E::KIND => Ok(Some(Stored::from_record(record)?)),
            _ => Ok(None),
        }
    }

    /// An entity by its cloud id, tombstones included.
    pub async fn get_by_cloud_id(
        &self,
        cloud_id: CloudId,
    ) -> Result<Option<Stored<E>>, RepositoryError> {
        match self.records.store().get_by_cloud_id(E::KIND, cloud_id).await? {
            Some(record) => Ok(Some(Stored::from_record(self.records.buffer().overlay(record))?)),
            None => Ok(None),
        }
    }

    /// Entities matching `filter`, oldest first. The filter's kind is
    /// forced to this repository's kind.
    pub async fn query(&self, filter: RecordFilter) -> Result<Vec<Stored<E>>, RepositoryError> {
        let filter = RecordFilter {
            kind: Some(E::KIND),
            ..filter
        };
        self.records
            .store()
            .query(&filter)
            .await?
            .into_iter()
            .map(|record| self.records.buffer().overlay(record))
            .filter(|record| filter.matches(record))
            .map(Stored::from_record)
            .collect()
    }

    /// Every live entity.
    pub async fn all(&self) -> Result<Vec<Stored<E>>, RepositoryError> {
        self.query(RecordFilter::default()).await
    }

    /// Live entities with these uuids.
    pub async fn by_uuids(
        &self,
        uuids: impl IntoIterator<Item = RecordUuid>,
    ) -> Result<Vec<Stored<E>>, RepositoryError> {
        self.query(RecordFilter::default().uuids(uuids)).await
    }

    /// Live entities owned by `user`.
    pub async fn owned_by(&self, user: RecordUuid) -> Result<Vec<Stored<E>>, RepositoryError> {
        self.query(RecordFilter::default().owned_by(user)).await
    }

    /// Number of stored entities matching `filter`, buffered edits ignored.
    pub async fn count(&self, filter: RecordFilter) -> Result<u64, RepositoryError> {
        let filter = RecordFilter {
            kind: Some(E::KIND),
            ..filter
        };
        Ok(self.records.store().count(&filter).await?)
    }

    /// Entities of `user` that were pushed or pulled at least once.
    pub async fn modified_for_session(
        &self,
        user: RecordUuid,
    ) -> Result<Vec<Stored<E>>, RepositoryError> {
        Ok(self
            .owned_by(user)
            .await?
            .into_iter()
            .filter(|stored| stored.meta.latest_updated_date.is_some())
            .collect())
    }

    /// Uuids of the entities of `user` known to the cloud.
    pub async fn synchronized_uuids_for_session(
        &self,
        user: RecordUuid,
    ) -> Result<Vec<RecordUuid>, RepositoryError> {
        let filter = RecordFilter::default().owned_by(user).cloud_assigned(true);
        Ok(self
            .query(filter)
            .await?
            .into_iter()
            .map(|stored| stored.uuid)
            .collect())
    }

    /// Committed changes of this kind.
    pub fn subscribe(&self) -> ChangeSubscription<E> {
        ChangeSubscription {
            rx: self.records.store().subscribe(),
            _kind: PhantomData,
        }
    }

    /// Live results of `filter`, re-queried after every relevant change.
    ///
    /// The background task stops once every receiver is dropped.
    pub async fn watch(
        &self,
        filter: RecordFilter,
    ) -> Result<watch::Receiver<Vec<Stored<E>>>, RepositoryError> {
        let mut changes = self.subscribe();
        let initial = self.query(filter.clone()).await?;
        let (tx, rx) = watch::channel(initial);

        let repo = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    batch = changes.recv() => {
                        if batch.is_none() {
                            break;
                        }
                        match repo.query(filter.clone()).await {
                            Ok(results) => {
                                if tx.send(results).is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!(kind = %E::KIND, error = %e, "watch query failed"),
                        }
                    }
                }
            }
            tracing::debug!(kind = %E::KIND, "watch stopped");
        });
        Ok(rx)
    }

    async fn expect_kind(&self, uuid: RecordUuid) -> Result<(), RepositoryError> {
        match self.records.store().get(uuid).await? {
            None => Err(RepositoryError::NotFound(uuid)),
            Some(record) if record.kind() != E::KIND => Err(RepositoryError::WrongKind {
                uuid,
                expected: E::KIND,
                found: record.kind(),
            }),
            Some(_) => Ok(()),
        }
    }
}

impl Repository<Flight> {
    /// Count, total duration and total distance of the live flights of
    /// `user`.
    pub async fn summary(&self, user: RecordUuid) -> Result<FlightSummary, RepositoryError> {
        let flights = self.owned_by(user).await?;
        Ok(flights
            .iter()
            .fold(FlightSummary::default(), |mut acc, stored| {
                acc.count += 1;
                acc.total_duration_secs += stored.entity.duration_secs;
                acc.total_distance_m += stored.entity.distance_m;
                acc
            }))
    }

    /// Live flights that executed `flight_plan`.
    pub async fn executing(&self, flight_plan: RecordUuid) -> Result<Vec<Stored<Flight>>, RepositoryError> {
        let links = Repository::<ExecutionLink>::new(Arc::clone(&self.records))
            .query(RecordFilter::default().referencing(flight_plan))
            .await?;
        let flights = links
            .into_iter()
            .filter(|link| link.entity.flight_plan_uuid == flight_plan)
            .map(|link| link.entity.flight_uuid);
        self.by_uuids(flights).await
    }
}

impl Repository<FlightPlan> {
    /// Live flight plans of `project`.
    pub async fn in_project(&self, project: RecordUuid) -> Result<Vec<Stored<FlightPlan>>, RepositoryError> {
        Ok(self
            .query(RecordFilter::default().referencing(project))
            .await?
            .into_iter()
            .filter(|plan| plan.entity.project_uuid == project)
            .collect())
    }

    /// Live flight plans executed by `flight`.
    pub async fn executed_by(&self, flight: RecordUuid) -> Result<Vec<Stored<FlightPlan>>, RepositoryError> {
        let links = Repository::<ExecutionLink>::new(Arc::clone(&self.records))
            .query(RecordFilter::default().referencing(flight))
            .await?;
        let plans = links
            .into_iter()
            .filter(|link| link.entity.flight_uuid == flight)
            .map(|link| link.entity.flight_plan_uuid);
        self.by_uuids(plans).await
    }
}

/// Change notifications of one kind.
pub struct ChangeSubscription<E> {
    rx: broadcast::Receiver<Vec<Change>>,
    _kind: PhantomData<fn() -> E>,
}

impl<E: Entity> ChangeSubscription<E> {
    /// Next batch of changes of this kind, `None` once the store is gone.
    ///
    /// A lagging subscriber gets an empty batch: it missed changes and
    /// should re-query.
    pub async fn recv(&mut self) -> Option<Vec<Change>> {
        loop {
            match self.rx.recv().await {
                Ok(changes) => {
                    let mine: Vec<Change> = changes
                        .into_iter()
                        .filter(|change| change.kind == E::KIND)
                        .collect();
                    if !mine.is_empty() {
                        return Some(mine);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(kind = %E::KIND, missed, "change subscriber lagged");
                    return Some(Vec::new());
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Kind observed by this subscription.
    pub fn kind(&self) -> EntityKind {
        E::KIND
    }
}

fn typed<E: Entity>(uuid: RecordUuid, body: sync_types::EntityBody) -> Result<E, RepositoryError> {
    let found = body.kind();
    E::from_body(body).ok_or(RepositoryError::WrongKind {
        uuid,
        expected: E::KIND,
        found,
    })
}
