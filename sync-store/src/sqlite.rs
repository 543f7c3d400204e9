//! SQLite storage backend for sync-store.

use crate::batch::{BatchOutcome, Change, ChangeOp, Guard, WriteBatch, WriteOp};
use crate::error::{StoreError, StoreResult};
use crate::filter::{RecordFilter, Tombstones};
use crate::LocalStore;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use sync_types::{CloudId, EntityKind, Record, RecordUuid};
use tokio::sync::{broadcast, Mutex};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// SQLite-based record store.
///
/// Uses WAL mode for concurrent reads. Batches are serialized by an
/// in-process writer lock so a guard check and the write it protects see
/// the same data.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    changes: broadcast::Sender<Vec<Change>>,
}

impl SqliteStore {
    /// Open (or create) a store at `path`.
    pub async fn new(path: &Path) -> StoreResult<Self> {
        if path.is_dir() {
            return Err(StoreError::InvalidPath {
                path: path.to_path_buf(),
            });
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        tracing::debug!(path = %path.display(), "opened record store");
        Self::with_pool(pool).await
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StoreError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> StoreResult<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            changes,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                uuid TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                owner_uuid TEXT,
                cloud_id INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                local_creation_date INTEGER NOT NULL,
                local_modification_date INTEGER NOT NULL,
                revision INTEGER NOT NULL,
                meta TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS record_refs (
                uuid TEXT NOT NULL,
                role TEXT NOT NULL,
                target_uuid TEXT NOT NULL,
                strength TEXT NOT NULL,
                PRIMARY KEY (uuid, role)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        // A cloud id identifies at most one record per kind
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_records_cloud_id
            ON records(kind, cloud_id) WHERE cloud_id != 0
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_kind_state ON records(kind, state)")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_owner ON records(owner_uuid)")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_refs_target ON record_refs(target_uuid)")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        Ok(())
    }

    async fn write_record(conn: &mut SqliteConnection, record: &Record) -> StoreResult<()> {
        let uuid = record.uuid.to_string();
        let meta = serde_json::to_string(&record.meta)?;
        let body = serde_json::to_string(&record.body)?;

        sqlx::query(
            r#"
            INSERT INTO records (uuid, kind, owner_uuid, cloud_id, state, is_deleted,
                                 local_creation_date, local_modification_date, revision, meta, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(uuid) DO UPDATE SET
                kind = excluded.kind,
                owner_uuid = excluded.owner_uuid,
                cloud_id = excluded.cloud_id,
                state = excluded.state,
                is_deleted = excluded.is_deleted,
                local_creation_date = excluded.local_creation_date,
                local_modification_date = excluded.local_modification_date,
                revision = excluded.revision,
                meta = excluded.meta,
                body = excluded.body
            "#,
        )
        .bind(uuid.as_str())
        .bind(record.kind().as_str())
        .bind(record.body.owner().map(|owner| owner.to_string()))
        .bind(record.meta.cloud_id.value())
        .bind(record.meta.status.state().as_str())
        .bind(record.meta.is_deleted)
        .bind(record.meta.local_creation_date.as_millis())
        .bind(record.meta.local_modification_date.as_millis())
        .bind(record.revision as i64)
        .bind(meta)
        .bind(body)
        .execute(&mut *conn)
        .await
        .map_err(StoreError::Database)?;

        sqlx::query("DELETE FROM record_refs WHERE uuid = ?1")
            .bind(uuid.as_str())
            .execute(&mut *conn)
            .await
            .map_err(StoreError::Database)?;

        for reference in record.body.references() {
            sqlx::query(
                r#"
                INSERT INTO record_refs (uuid, role, target_uuid, strength)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(uuid.as_str())
            .bind(reference.role)
            .bind(reference.target.to_string())
            .bind(reference.strength.as_str())
            .execute(&mut *conn)
            .await
            .map_err(StoreError::Database)?;
        }

        Ok(())
    }

    async fn remove_record(conn: &mut SqliteConnection, uuid: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM record_refs WHERE uuid = ?1")
            .bind(uuid)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::Database)?;

        sqlx::query("DELETE FROM records WHERE uuid = ?1")
            .bind(uuid)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::Database)?;

        Ok(())
    }
}

fn guard_holds(guard: Guard, current: Option<u64>) -> bool {
    match (guard, current) {
        (Guard::Any, _) => true,
        (Guard::Absent, None) => true,
        (Guard::Revision(expected), Some(actual)) => expected == actual,
        _ => false,
    }
}

/// Append the WHERE conditions of `filter`.
fn push_conditions(qb: &mut QueryBuilder<'_, Sqlite>, filter: &RecordFilter) {
    qb.push(" WHERE 1 = 1");

    if let Some(kind) = filter.kind {
        qb.push(" AND kind = ").push_bind(kind.as_str());
    }
    if let Some(owner) = filter.owner {
        qb.push(" AND owner_uuid = ").push_bind(owner.to_string());
    }
    if let Some(target) = filter.referencing {
        qb.push(" AND uuid IN (SELECT uuid FROM record_refs WHERE target_uuid = ")
            .push_bind(target.to_string())
            .push(")");
    }
    if let Some(uuids) = &filter.uuids {
        qb.push(" AND uuid IN (");
        let mut list = qb.separated(", ");
        for uuid in uuids {
            list.push_bind(uuid.to_string());
        }
        list.push_unseparated(")");
    }
    if !filter.states.is_empty() {
        qb.push(" AND state IN (");
        let mut list = qb.separated(", ");
        for state in &filter.states {
            list.push_bind(state.as_str());
        }
        list.push_unseparated(")");
    }
    match filter.cloud_assigned {
        Some(true) => {
            qb.push(" AND cloud_id != 0");
        }
        Some(false) => {
            qb.push(" AND cloud_id = 0");
        }
        None => {}
    }
    match filter.tombstones {
        Tombstones::Exclude => {
            qb.push(" AND is_deleted = 0");
        }
        Tombstones::Include => {}
        Tombstones::Only => {
            qb.push(" AND is_deleted = 1");
        }
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn get(&self, uuid: RecordUuid) -> StoreResult<Option<Record>> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT uuid, revision, meta, body
            FROM records
            WHERE uuid = ?1
            "#,
        )
        .bind(uuid.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        match row {
            Some(r) => Ok(Some(r.try_into()?)),
            None => Ok(None),
        }
    }

    async fn get_by_cloud_id(
        &self,
        kind: EntityKind,
        cloud_id: CloudId,
    ) -> StoreResult<Option<Record>> {
        if !cloud_id.is_assigned() {
            return Ok(None);
        }

        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT uuid, revision, meta, body
            FROM records
            WHERE kind = ?1 AND cloud_id = ?2
            "#,
        )
        .bind(kind.as_str())
        .bind(cloud_id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        match row {
            Some(r) => Ok(Some(r.try_into()?)),
            None => Ok(None),
        }
    }

    async fn query(&self, filter: &RecordFilter) -> StoreResult<Vec<Record>> {
        if filter.uuids.as_ref().is_some_and(|uuids| uuids.is_empty()) {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT uuid, revision, meta, body FROM records");
        push_conditions(&mut qb, filter);
        qb.push(" ORDER BY local_creation_date ASC, uuid ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = qb
            .build_query_as::<RecordRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        rows.into_iter().map(|row| row.try_into()).collect()
    }

    async fn count(&self, filter: &RecordFilter) -> StoreResult<u64> {
        if filter.uuids.as_ref().is_some_and(|uuids| uuids.is_empty()) {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM records");
        push_conditions(&mut qb, filter);

        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Database)?;

        Ok(count as u64)
    }

    async fn apply(&self, batch: WriteBatch) -> StoreResult<BatchOutcome> {
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Database)?;
        let mut outcome = BatchOutcome::default();
        let mut changes = Vec::with_capacity(batch.len());

        for op in batch.into_ops() {
            let uuid = op.uuid();
            let key = uuid.to_string();
            let current: Option<(i64, String)> =
                sqlx::query_as("SELECT revision, kind FROM records WHERE uuid = ?1")
                    .bind(&key)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(StoreError::Database)?;

            let guard = match &op {
                WriteOp::Put { guard, .. } | WriteOp::Remove { guard, .. } => *guard,
            };
            if !guard_holds(guard, current.as_ref().map(|(rev, _)| *rev as u64)) {
                tracing::debug!(?uuid, ?guard, "write rejected by guard");
                outcome.rejected.push(uuid);
                continue;
            }

            match op {
                WriteOp::Put { mut record, .. } => {
                    record.revision = current.as_ref().map_or(1, |(rev, _)| *rev as u64 + 1);
                    Self::write_record(&mut *tx, &record).await?;
                    changes.push(Change {
                        kind: record.kind(),
                        uuid,
                        op: if current.is_some() {
                            ChangeOp::Updated
                        } else {
                            ChangeOp::Created
                        },
                    });
                    outcome.written.push(record);
                }
                WriteOp::Remove { .. } => {
                    // Removing an absent row under `Guard::Any` is a no-op
                    let Some((_, kind)) = current else {
                        continue;
                    };
                    let kind = EntityKind::from_str(&kind).map_err(|e| StoreError::Corrupt {
                        uuid: key.clone(),
                        reason: e.to_string(),
                    })?;
                    Self::remove_record(&mut *tx, &key).await?;
                    changes.push(Change {
                        kind,
                        uuid,
                        op: ChangeOp::Removed,
                    });
                    outcome.removed.push(uuid);
                }
            }
        }

        tx.commit().await.map_err(StoreError::Database)?;

        if !changes.is_empty() {
            // No subscriber is fine
            let _ = self.changes.send(changes);
        }
        Ok(outcome)
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<Change>> {
        self.changes.subscribe()
    }
}

/// Internal row type for SQLite queries.
#[derive(sqlx::FromRow)]
struct RecordRow {
    uuid: String,
    revision: i64,
    meta: String,
    body: String,
}

impl TryFrom<RecordRow> for Record {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(Record {
            uuid: RecordUuid::from_str(&row.uuid).map_err(|e| StoreError::Corrupt {
                uuid: row.uuid.clone(),
                reason: e.to_string(),
            })?,
            revision: row.revision as u64,
            meta: serde_json::from_str(&row.meta)?,
            body: serde_json::from_str(&row.body)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{
        Drone, Entity, FlightPlan, FlightPlanState, Project, ProjectType, SyncMeta, SynchroState,
        SynchroStatus, Timestamp,
    };

    fn at(millis: i64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn record(body: sync_types::EntityBody, created: i64) -> Record {
        Record {
            uuid: RecordUuid::new(),
            revision: 0,
            meta: SyncMeta::new_local(at(created)),
            body,
        }
    }

    fn drone(owner: RecordUuid, created: i64) -> Record {
        record(
            Drone {
                user_uuid: owner,
                serial: "PI040".into(),
                model_id: "anafi".into(),
                name: "my drone".into(),
                is_paired: true,
            }
            .into_body(),
            created,
        )
    }

    fn project(owner: RecordUuid) -> Record {
        record(
            Project {
                user_uuid: owner,
                title: "roof".into(),
                project_type: ProjectType::Classic,
                last_opened: None,
                last_updated: at(1),
                has_editable_flight_plan: false,
                latest_executed_flight_plan_date: None,
            }
            .into_body(),
            1,
        )
    }

    fn plan(owner: RecordUuid, project: RecordUuid) -> Record {
        record(
            FlightPlan {
                user_uuid: owner,
                project_uuid: project,
                project_external_uuid: None,
                name: "survey".into(),
                state: FlightPlanState::Editable,
                flight_plan_type: "classic".into(),
                file_type: "mavlink".into(),
                format_version: "1".into(),
                media_count: 0,
                uploaded_media_count: 0,
                last_mission_item_executed: 0,
                data_setting: None,
                last_updated: at(2),
                execution_rank: None,
                has_reached_first_waypoint: None,
                thumbnail_uuid: None,
            }
            .into_body(),
            2,
        )
    }

    async fn insert(store: &SqliteStore, record: Record) -> Record {
        let mut batch = WriteBatch::new();
        batch.create(record.clone());
        let outcome = store.apply(batch).await.unwrap();
        outcome.written(record.uuid).cloned().unwrap()
    }

    // ===========================================
    // Writes and guards
    // ===========================================

    #[tokio::test]
    async fn create_assigns_first_revision() {
        let store = SqliteStore::in_memory().await.unwrap();
        let stored = insert(&store, drone(RecordUuid::new(), 1)).await;
        assert_eq!(stored.revision, 1);

        let fetched = store.get(stored.uuid).await.unwrap().unwrap();
        assert_eq!(fetched, stored);
    }

    #[tokio::test]
    async fn update_bumps_revision() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut stored = insert(&store, drone(RecordUuid::new(), 1)).await;
        stored.meta.status = SynchroStatus::Syncing;

        let mut batch = WriteBatch::new();
        batch.update(stored.clone());
        let outcome = store.apply(batch).await.unwrap();

        assert!(outcome.is_clean());
        assert_eq!(outcome.written(stored.uuid).unwrap().revision, 2);
    }

    #[tokio::test]
    async fn stale_revision_is_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        let stored = insert(&store, drone(RecordUuid::new(), 1)).await;

        let mut first = WriteBatch::new();
        first.update(stored.clone());
        store.apply(first).await.unwrap();

        // Second writer still holds revision 1
        let mut second = WriteBatch::new();
        second.update(stored.clone());
        let outcome = store.apply(second).await.unwrap();

        assert_eq!(outcome.rejected, vec![stored.uuid]);
        assert_eq!(store.get(stored.uuid).await.unwrap().unwrap().revision, 2);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        let stored = insert(&store, drone(RecordUuid::new(), 1)).await;

        let mut batch = WriteBatch::new();
        batch.create(stored.clone());
        let outcome = store.apply(batch).await.unwrap();
        assert_eq!(outcome.rejected, vec![stored.uuid]);
    }

    #[tokio::test]
    async fn remove_drops_row_and_references() {
        let store = SqliteStore::in_memory().await.unwrap();
        let owner = RecordUuid::new();
        let stored = insert(&store, drone(owner, 1)).await;
        assert_eq!(store.referrers(owner).await.unwrap().len(), 1);

        let mut batch = WriteBatch::new();
        batch.remove(&stored);
        let outcome = store.apply(batch).await.unwrap();

        assert_eq!(outcome.removed, vec![stored.uuid]);
        assert!(store.get(stored.uuid).await.unwrap().is_none());
        assert!(store.referrers(owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_batch_rolls_back_entirely() {
        let store = SqliteStore::in_memory().await.unwrap();
        let owner = RecordUuid::new();
        let mut a = drone(owner, 1);
        let mut b = drone(owner, 2);
        // Same cloud id twice for one kind violates the unique index
        a.meta.cloud_id = CloudId::new(7);
        b.meta.cloud_id = CloudId::new(7);

        let mut batch = WriteBatch::new();
        batch.create(a.clone()).create(b);
        assert!(store.apply(batch).await.is_err());

        assert!(store.get(a.uuid).await.unwrap().is_none());
    }

    // ===========================================
    // Queries
    // ===========================================

    #[tokio::test]
    async fn query_filters_by_kind_and_owner() {
        let store = SqliteStore::in_memory().await.unwrap();
        let alice = RecordUuid::new();
        let bob = RecordUuid::new();
        insert(&store, drone(alice, 1)).await;
        insert(&store, drone(bob, 2)).await;
        insert(&store, project(alice)).await;

        let drones = store
            .query(&RecordFilter::kind(EntityKind::Drone).owned_by(alice))
            .await
            .unwrap();
        assert_eq!(drones.len(), 1);
        assert_eq!(drones[0].body.owner(), Some(alice));

        let count = store
            .count(&RecordFilter::all().owned_by(alice))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn query_orders_by_creation_and_limits() {
        let store = SqliteStore::in_memory().await.unwrap();
        let owner = RecordUuid::new();
        let late = insert(&store, drone(owner, 30)).await;
        let early = insert(&store, drone(owner, 10)).await;

        let all = store.query(&RecordFilter::kind(EntityKind::Drone)).await.unwrap();
        assert_eq!(all[0].uuid, early.uuid);
        assert_eq!(all[1].uuid, late.uuid);

        let one = store
            .query(&RecordFilter::kind(EntityKind::Drone).limit(1))
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn tombstones_are_hidden_by_default() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut stored = insert(&store, drone(RecordUuid::new(), 1)).await;
        stored.meta.is_deleted = true;
        stored.meta.deleted_date = Some(at(5));
        let mut batch = WriteBatch::new();
        batch.update(stored.clone());
        store.apply(batch).await.unwrap();

        let filter = RecordFilter::kind(EntityKind::Drone);
        assert!(store.query(&filter).await.unwrap().is_empty());
        assert_eq!(store.query(&filter.clone().with_deleted()).await.unwrap().len(), 1);
        assert_eq!(store.count(&filter.only_deleted()).await.unwrap(), 1);
        // Direct lookups still see tombstones
        assert!(store.get(stored.uuid).await.unwrap().unwrap().is_deleted());
    }

    #[tokio::test]
    async fn query_by_state_and_cloud_assignment() {
        let store = SqliteStore::in_memory().await.unwrap();
        let owner = RecordUuid::new();
        insert(&store, drone(owner, 1)).await;
        let mut synced = drone(owner, 2);
        synced.meta.cloud_id = CloudId::new(3);
        synced.meta.status = SynchroStatus::Synced;
        synced.meta.latest_updated_date = Some(at(2));
        insert(&store, synced.clone()).await;

        let pending = store
            .query(&RecordFilter::all().in_states([SynchroState::NotSynced]))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        let assigned = store
            .query(&RecordFilter::all().cloud_assigned(true))
            .await
            .unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].uuid, synced.uuid);

        let found = store
            .get_by_cloud_id(EntityKind::Drone, CloudId::new(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.uuid, synced.uuid);
        assert!(store
            .get_by_cloud_id(EntityKind::Drone, CloudId::UNASSIGNED)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn query_by_uuid_list() {
        let store = SqliteStore::in_memory().await.unwrap();
        let owner = RecordUuid::new();
        let a = insert(&store, drone(owner, 1)).await;
        insert(&store, drone(owner, 2)).await;

        let found = store.query(&RecordFilter::all().uuids([a.uuid])).await.unwrap();
        assert_eq!(found.len(), 1);
        let none = store
            .query(&RecordFilter::all().uuids(Vec::new()))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn referrers_follow_body_references() {
        let store = SqliteStore::in_memory().await.unwrap();
        let owner = RecordUuid::new();
        let project = insert(&store, project(owner)).await;
        let plan = insert(&store, plan(owner, project.uuid)).await;

        let referrers = store.referrers(project.uuid).await.unwrap();
        assert_eq!(referrers.len(), 1);
        assert_eq!(referrers[0].uuid, plan.uuid);
    }

    // ===========================================
    // Notifications and persistence
    // ===========================================

    #[tokio::test]
    async fn subscribers_receive_committed_changes() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut rx = store.subscribe();

        let stored = insert(&store, drone(RecordUuid::new(), 1)).await;
        let changes = rx.recv().await.unwrap();
        assert_eq!(
            changes,
            vec![Change {
                kind: EntityKind::Drone,
                uuid: stored.uuid,
                op: ChangeOp::Created,
            }]
        );

        let mut batch = WriteBatch::new();
        batch.remove(&stored);
        store.apply(batch).await.unwrap();
        assert_eq!(rx.recv().await.unwrap()[0].op, ChangeOp::Removed);
    }

    #[tokio::test]
    async fn rejected_writes_are_not_broadcast() {
        let store = SqliteStore::in_memory().await.unwrap();
        let stored = insert(&store, drone(RecordUuid::new(), 1)).await;
        let mut rx = store.subscribe();

        let mut batch = WriteBatch::new();
        batch.create(stored);
        store.apply(batch).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pictor.db");
        let owner = RecordUuid::new();

        let uuid = {
            let store = SqliteStore::new(&path).await.unwrap();
            insert(&store, drone(owner, 1)).await.uuid
        };

        let store = SqliteStore::new(&path).await.unwrap();
        let fetched = store.get(uuid).await.unwrap().unwrap();
        assert_eq!(fetched.body.owner(), Some(owner));
    }

    #[tokio::test]
    async fn directory_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = SqliteStore::new(dir.path()).await.err().unwrap();
        assert!(matches!(err, StoreError::InvalidPath { .. }));
    }
}
