//! Mock cloud for testing.
//!
//! An in-process cloud catalog with the same contract as the real one:
//! uuid deduplication, conditional last-writer-wins pushes, delete markers,
//! paginated change feeds. Clones share state, so several devices can sync
//! against one instance.

use super::{CloudClient, CloudError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use sync_types::{
    ChangePage, CloudId, EntityBody, EntityKind, PushAck, PushRequest, RecordUuid, RemoteRecord,
    Timestamp,
};

const DEFAULT_PAGE_SIZE: usize = 50;

/// One push received by the mock, for ordering assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushLogEntry {
    /// Kind pushed.
    pub kind: EntityKind,
    /// Uuid pushed.
    pub uuid: RecordUuid,
    /// Whether the push was accepted.
    pub accepted: bool,
}

/// Serializable content of a [`MockCloud`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MockCloudSnapshot {
    clock: i64,
    next_id: i64,
    records: Vec<RemoteRecord>,
}

/// Mock cloud for testing.
#[derive(Debug, Clone)]
pub struct MockCloud {
    inner: Arc<Mutex<MockCloudInner>>,
}

#[derive(Debug)]
struct MockCloudInner {
    clock: i64,
    next_id: i64,
    records: BTreeMap<(EntityKind, CloudId), RemoteRecord>,
    by_uuid: HashMap<RecordUuid, (EntityKind, CloudId)>,
    page_size: usize,
    offline: bool,
    latency: Option<Duration>,
    fail_next_push: Option<CloudError>,
    fail_next_fetch: Option<CloudError>,
    fail_next_delete: Option<CloudError>,
    push_log: Vec<PushLogEntry>,
}

impl Default for MockCloudInner {
    fn default() -> Self {
        Self {
            clock: 0,
            next_id: 1,
            records: BTreeMap::new(),
            by_uuid: HashMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
            offline: false,
            latency: None,
            fail_next_push: None,
            fail_next_fetch: None,
            fail_next_delete: None,
            push_log: Vec::new(),
        }
    }
}

impl MockCloudInner {
    /// Cloud write times are strictly increasing.
    fn tick(&mut self) -> Timestamp {
        self.clock += 1;
        Timestamp::from_millis(self.clock)
    }

    fn get_by_uuid(&self, uuid: RecordUuid) -> Option<&RemoteRecord> {
        self.by_uuid
            .get(&uuid)
            .and_then(|key| self.records.get(key))
    }

    fn get_by_uuid_mut(&mut self, uuid: RecordUuid) -> Option<&mut RemoteRecord> {
        let key = *self.by_uuid.get(&uuid)?;
        self.records.get_mut(&key)
    }

    fn check_parents(&self, body: &EntityBody) -> Result<(), CloudError> {
        for reference in body.references() {
            if !reference.strength.is_dependency() {
                continue;
            }
            let known = self
                .get_by_uuid(reference.target)
                .is_some_and(|parent| parent.kind == reference.kind && !parent.deleted);
            if !known {
                return Err(CloudError::Validation(format!(
                    "unknown {} {}",
                    reference.role, reference.target
                )));
            }
        }
        Ok(())
    }

    fn push(&mut self, kind: EntityKind, request: &PushRequest) -> Result<PushAck, CloudError> {
        if request.body.kind() != kind {
            return Err(CloudError::Validation(format!(
                "{} body pushed as {}",
                request.body.kind(),
                kind
            )));
        }
        self.check_parents(&request.body)?;

        if let Some(existing) = self.get_by_uuid(request.uuid).cloned() {
            if request.cloud_id.is_assigned() && request.cloud_id != existing.cloud_id {
                return Err(CloudError::Validation("cloud id mismatch".into()));
            }
            if existing.modified == request.modified && existing.body == request.body {
                // Retried push of the version already stored
                return Ok(PushAck {
                    cloud_id: existing.cloud_id,
                    cloud_modified: existing.cloud_modified,
                });
            }
            // Older than the cloud copy, or edited from a version it replaced
            let stale = request
                .base
                .map_or(true, |base| base < existing.cloud_modified);
            if existing.modified >= request.modified || stale {
                return Err(CloudError::Conflict {
                    remote: Box::new(existing),
                });
            }

            let cloud_modified = self.tick();
            let stored = self
                .get_by_uuid_mut(request.uuid)
                .ok_or(CloudError::NotFound)?;
            stored.body = request.body.clone();
            stored.modified = request.modified;
            stored.cloud_modified = cloud_modified;
            stored.deleted = false;
            return Ok(PushAck {
                cloud_id: stored.cloud_id,
                cloud_modified,
            });
        }

        if request.cloud_id.is_assigned() {
            // Known to the client but removed from the cloud
            return Err(CloudError::NotFound);
        }

        let cloud_id = CloudId::new(self.next_id);
        self.next_id += 1;
        let cloud_modified = self.tick();
        self.records.insert(
            (kind, cloud_id),
            RemoteRecord {
                cloud_id,
                uuid: request.uuid,
                kind,
                body: request.body.clone(),
                modified: request.modified,
                cloud_modified,
                deleted: false,
            },
        );
        self.by_uuid.insert(request.uuid, (kind, cloud_id));
        Ok(PushAck {
            cloud_id,
            cloud_modified,
        })
    }
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloud {
    /// Create an empty mock cloud.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockCloudInner::default())),
        }
    }

    /// Create a mock cloud serving change feeds in pages of `page_size`.
    pub fn with_page_size(page_size: usize) -> Self {
        let cloud = Self::new();
        cloud.set_page_size(page_size);
        cloud
    }

    /// Change the page size of change feeds.
    pub fn set_page_size(&self, page_size: usize) {
        self.lock().page_size = page_size.max(1);
    }

    fn lock(&self) -> MutexGuard<'_, MockCloudInner> {
        // A panicking test thread must not wedge every other device
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Make every call fail with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Cause the next push to fail with the given error.
    pub fn fail_next_push(&self, error: CloudError) {
        self.lock().fail_next_push = Some(error);
    }

    /// Cause the next change feed or id list fetch to fail.
    pub fn fail_next_fetch(&self, error: CloudError) {
        self.lock().fail_next_fetch = Some(error);
    }

    /// Cause the next delete to fail with the given error.
    pub fn fail_next_delete(&self, error: CloudError) {
        self.lock().fail_next_delete = Some(error);
    }

    /// Every push received, in order.
    pub fn push_log(&self) -> Vec<PushLogEntry> {
        self.lock().push_log.clone()
    }

    /// Forget the push log.
    pub fn clear_push_log(&self) {
        self.lock().push_log.clear();
    }

    /// The cloud copy of a record.
    pub fn remote_get(&self, uuid: RecordUuid) -> Option<RemoteRecord> {
        self.lock().get_by_uuid(uuid).cloned()
    }

    /// Every record of `kind`, delete markers included.
    pub fn records(&self, kind: EntityKind) -> Vec<RemoteRecord> {
        self.lock()
            .records
            .values()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect()
    }

    /// Simulate an edit written by another client.
    pub fn remote_edit(
        &self,
        uuid: RecordUuid,
        modified: Timestamp,
        edit: impl FnOnce(&mut EntityBody),
    ) -> Option<RemoteRecord> {
        let mut inner = self.lock();
        let cloud_modified = inner.tick();
        let record = inner.get_by_uuid_mut(uuid)?;
        edit(&mut record.body);
        record.modified = modified;
        record.cloud_modified = cloud_modified;
        Some(record.clone())
    }

    /// Simulate a delete issued by another client.
    pub fn remote_delete(&self, uuid: RecordUuid) -> Option<RemoteRecord> {
        let mut inner = self.lock();
        let cloud_modified = inner.tick();
        let record = inner.get_by_uuid_mut(uuid)?;
        record.deleted = true;
        record.cloud_modified = cloud_modified;
        Some(record.clone())
    }

    /// Remove a record without leaving a delete marker.
    pub fn purge_remote(&self, uuid: RecordUuid) -> bool {
        let mut inner = self.lock();
        match inner.by_uuid.remove(&uuid) {
            Some(key) => inner.records.remove(&key).is_some(),
            None => false,
        }
    }

    /// Copy the catalog out.
    pub fn snapshot(&self) -> MockCloudSnapshot {
        let inner = self.lock();
        MockCloudSnapshot {
            clock: inner.clock,
            next_id: inner.next_id,
            records: inner.records.values().cloned().collect(),
        }
    }

    /// Build a mock cloud holding a previously taken snapshot.
    pub fn from_snapshot(snapshot: MockCloudSnapshot) -> Self {
        let cloud = Self::new();
        {
            let mut inner = cloud.lock();
            inner.clock = snapshot.clock;
            inner.next_id = snapshot.next_id.max(1);
            for record in snapshot.records {
                let key = (record.kind, record.cloud_id);
                inner.by_uuid.insert(record.uuid, key);
                inner.records.insert(key, record);
            }
        }
        cloud
    }
}

#[async_trait]
impl CloudClient for MockCloud {
    async fn fetch_changes(
        &self,
        kind: EntityKind,
        since: Option<Timestamp>,
        page: u32,
    ) -> Result<ChangePage, CloudError> {
        self.simulate_latency().await;
        let mut inner = self.lock();

        if inner.offline {
            return Err(CloudError::Transient("offline".into()));
        }
        if let Some(error) = inner.fail_next_fetch.take() {
            return Err(error);
        }

        let mut changes: Vec<RemoteRecord> = inner
            .records
            .values()
            .filter(|record| record.kind == kind)
            .filter(|record| since.map_or(true, |since| record.cloud_modified > since))
            .cloned()
            .collect();
        changes.sort_by_key(|record| record.cloud_modified);

        let start = (page as usize).saturating_mul(inner.page_size);
        let records: Vec<RemoteRecord> = changes
            .iter()
            .skip(start)
            .take(inner.page_size)
            .cloned()
            .collect();
        let next_page = (start + records.len() < changes.len()).then_some(page + 1);

        Ok(ChangePage { records, next_page })
    }

    async fn fetch_all_ids(&self, kind: EntityKind) -> Result<Vec<CloudId>, CloudError> {
        self.simulate_latency().await;
        let mut inner = self.lock();

        if inner.offline {
            return Err(CloudError::Transient("offline".into()));
        }
        if let Some(error) = inner.fail_next_fetch.take() {
            return Err(error);
        }

        Ok(inner
            .records
            .values()
            .filter(|record| record.kind == kind && !record.deleted)
            .map(|record| record.cloud_id)
            .collect())
    }

    async fn push(&self, kind: EntityKind, request: &PushRequest) -> Result<PushAck, CloudError> {
        self.simulate_latency().await;
        let mut inner = self.lock();

        if inner.offline {
            return Err(CloudError::Transient("offline".into()));
        }
        if let Some(error) = inner.fail_next_push.take() {
            return Err(error);
        }

        let result = inner.push(kind, request);
        inner.push_log.push(PushLogEntry {
            kind,
            uuid: request.uuid,
            accepted: result.is_ok(),
        });
        result
    }

    async fn delete(&self, kind: EntityKind, cloud_id: CloudId) -> Result<(), CloudError> {
        self.simulate_latency().await;
        let mut inner = self.lock();

        if inner.offline {
            return Err(CloudError::Transient("offline".into()));
        }
        if let Some(error) = inner.fail_next_delete.take() {
            return Err(error);
        }

        let cloud_modified = inner.tick();
        let record = inner
            .records
            .get_mut(&(kind, cloud_id))
            .ok_or(CloudError::NotFound)?;
        if !record.deleted {
            record.deleted = true;
            record.cloud_modified = cloud_modified;
        }
        Ok(())
    }
}
