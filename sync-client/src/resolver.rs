//! Relationship resolver.
//!
//! Keeps the entity graph consistent: parents exist before children point
//! at them, children are pushed only once their parents are known to the
//! cloud, soft-deletes cascade along owned references, and shared
//! thumbnails go away only with their last referrer.

use crate::error::RepositoryError;
use std::collections::{BTreeSet, HashSet, VecDeque};
use sync_store::{LocalStore, RecordFilter, StoreResult, WriteBatch};
use sync_types::{
    EntityBody, EntityKind, FlightPlanState, Record, RecordUuid, RefStrength, Reference,
    SynchroStatus, Timestamp,
};

/// Whether a record can be pushed this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every dependency is known to the cloud.
    Ready,
    /// A dependency has no cloud id yet.
    Deferred(Reference),
    /// A dependency is absent or tombstoned.
    Orphaned(Reference),
}

/// Check that every reference of `body` points at a live record of the
/// right kind.
pub async fn check_parents(store: &dyn LocalStore, body: &EntityBody) -> Result<(), RepositoryError> {
    for reference in body.references() {
        let parent = store.get(reference.target).await?;
        let valid = parent
            .as_ref()
            .is_some_and(|p| !p.is_deleted() && p.kind() == reference.kind);
        if !valid {
            return Err(RepositoryError::MissingParent {
                role: reference.role,
                target: reference.target,
            });
        }
    }
    Ok(())
}

/// Decide whether `record` can be pushed.
pub async fn push_readiness(store: &dyn LocalStore, record: &Record) -> StoreResult<Readiness> {
    for reference in record.body.references() {
        if !reference.strength.is_dependency() {
            continue;
        }
        match store.get(reference.target).await? {
            Some(parent) if !parent.is_deleted() => {
                if !parent.meta.cloud_id.is_assigned() {
                    return Ok(Readiness::Deferred(reference));
                }
            }
            _ => return Ok(Readiness::Orphaned(reference)),
        }
    }
    Ok(Readiness::Ready)
}

/// Whether any record still depends on `target` without being a confirmed
/// tombstone. Such a record must reach the cloud before `target` goes.
pub async fn has_pending_dependents(store: &dyn LocalStore, target: RecordUuid) -> StoreResult<bool> {
    let referrers = store.referrers(target).await?;
    Ok(referrers.iter().any(|referrer| {
        depends_on(referrer, target)
            && !(referrer.is_deleted() && referrer.meta.status == SynchroStatus::Synced)
    }))
}

/// Records a soft-delete of `root` takes down with it, `root` first.
///
/// Follows owned references transitively, then adds every shared target
/// left without a live referrer outside the deleted set. Tombstones are not
/// included.
pub async fn cascade_targets(store: &dyn LocalStore, root: &Record) -> StoreResult<Vec<Record>> {
    let mut seen: HashSet<RecordUuid> = HashSet::from([root.uuid]);
    let mut targets = vec![root.clone()];
    let mut queue = VecDeque::from([root.uuid]);

    while let Some(parent) = queue.pop_front() {
        for referrer in store.referrers(parent).await? {
            if referrer.is_deleted() || seen.contains(&referrer.uuid) {
                continue;
            }
            let owned = referrer
                .body
                .references()
                .iter()
                .any(|r| r.target == parent && r.strength == RefStrength::Owned);
            if owned {
                seen.insert(referrer.uuid);
                queue.push_back(referrer.uuid);
                targets.push(referrer);
            }
        }
    }

    let shared: BTreeSet<RecordUuid> = targets
        .iter()
        .flat_map(|t| t.body.references())
        .filter(|r| r.strength == RefStrength::Shared)
        .map(|r| r.target)
        .collect();
    for target in shared {
        if seen.contains(&target) {
            continue;
        }
        let still_used = store
            .referrers(target)
            .await?
            .iter()
            .any(|r| !r.is_deleted() && !seen.contains(&r.uuid));
        if still_used {
            continue;
        }
        if let Some(record) = store.get(target).await? {
            if !record.is_deleted() {
                seen.insert(target);
                targets.push(record);
            }
        }
    }

    Ok(targets)
}

/// Live records with a dependency on an absent or tombstoned record.
pub async fn find_orphans(store: &dyn LocalStore) -> StoreResult<Vec<(Record, Reference)>> {
    let live = store.query(&RecordFilter::all()).await?;
    let live_uuids: HashSet<RecordUuid> = live.iter().map(|r| r.uuid).collect();

    Ok(live
        .into_iter()
        .filter_map(|record| {
            let missing = record
                .body
                .references()
                .into_iter()
                .find(|r| r.strength.is_dependency() && !live_uuids.contains(&r.target))?;
            Some((record, missing))
        })
        .collect())
}

/// Projects whose derived fields depend on these bodies.
pub fn projects_of<'a>(bodies: impl IntoIterator<Item = &'a EntityBody>) -> BTreeSet<RecordUuid> {
    bodies
        .into_iter()
        .filter_map(|body| match body {
            EntityBody::FlightPlan(plan) => Some(plan.project_uuid),
            _ => None,
        })
        .collect()
}

/// Recompute the locally derived fields of `projects`.
///
/// Only bodies change: derived fields are never pushed on their own, so the
/// sync metadata is left untouched. A project written concurrently is left
/// for the next refresh.
pub async fn refresh_project_derived(
    store: &dyn LocalStore,
    projects: impl IntoIterator<Item = RecordUuid>,
) -> StoreResult<usize> {
    let mut batch = WriteBatch::new();
    for uuid in projects {
        let Some(mut record) = store.get(uuid).await? else {
            continue;
        };
        let EntityBody::Project(project) = &mut record.body else {
            continue;
        };

        let filter = RecordFilter::kind(EntityKind::FlightPlan).referencing(uuid);
        let plans: Vec<_> = store
            .query(&filter)
            .await?
            .into_iter()
            .filter_map(|r| match r.body {
                EntityBody::FlightPlan(plan) if plan.project_uuid == uuid => Some(plan),
                _ => None,
            })
            .collect();

        let has_editable = plans.iter().any(|p| p.state == FlightPlanState::Editable);
        let latest_executed: Option<Timestamp> = plans
            .iter()
            .filter(|p| {
                p.state != FlightPlanState::Editable && p.has_reached_first_waypoint == Some(true)
            })
            .map(|p| p.last_updated)
            .max();

        if project.has_editable_flight_plan == has_editable
            && project.latest_executed_flight_plan_date == latest_executed
        {
            continue;
        }
        project.has_editable_flight_plan = has_editable;
        project.latest_executed_flight_plan_date = latest_executed;
        batch.update(record);
    }

    if batch.is_empty() {
        return Ok(0);
    }
    let outcome = store.apply(batch).await?;
    if !outcome.rejected.is_empty() {
        tracing::debug!(
            rejected = outcome.rejected.len(),
            "project refresh lost a revision race"
        );
    }
    Ok(outcome.written.len())
}

fn depends_on(record: &Record, target: RecordUuid) -> bool {
    record
        .body
        .references()
        .iter()
        .any(|r| r.target == target && r.strength.is_dependency())
}
