//! # sync-store
//!
//! Local record store for the Pictor sync engine.
//!
//! Every record of every kind lives in one table keyed by its uuid, with the
//! columns needed to filter (kind, owner, state, cloud id, tombstone) broken
//! out of the JSON payload. Foreign keys are indexed separately so that
//! referrer lookups (cascades, purge blocking, orphan detection) stay cheap.
//!
//! Writes go through [`WriteBatch`]: a batch commits in one transaction,
//! each write guarded by the revision the caller read. Committed changes are
//! broadcast to subscribers.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod batch;
mod error;
mod filter;
mod sqlite;

pub use batch::{BatchOutcome, Change, ChangeOp, Guard, WriteBatch, WriteOp};
pub use error::{StoreError, StoreResult};
pub use filter::{RecordFilter, Tombstones};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use sync_types::{CloudId, EntityKind, Record, RecordUuid};
use tokio::sync::broadcast;

/// Trait for local record store backends.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get a record by uuid, tombstones included.
    async fn get(&self, uuid: RecordUuid) -> StoreResult<Option<Record>>;

    /// Get a record by its cloud id, tombstones included.
    async fn get_by_cloud_id(
        &self,
        kind: EntityKind,
        cloud_id: CloudId,
    ) -> StoreResult<Option<Record>>;

    /// Get every record matching `filter`, oldest creation first.
    async fn query(&self, filter: &RecordFilter) -> StoreResult<Vec<Record>>;

    /// Count records matching `filter`. `limit` is ignored.
    async fn count(&self, filter: &RecordFilter) -> StoreResult<u64>;

    /// Records holding a reference to `target`, tombstones included.
    async fn referrers(&self, target: RecordUuid) -> StoreResult<Vec<Record>> {
        self.query(&RecordFilter::all().referencing(target).with_deleted())
            .await
    }

    /// Commit a batch in one transaction.
    async fn apply(&self, batch: WriteBatch) -> StoreResult<BatchOutcome>;

    /// Receive the changes of every committed batch.
    fn subscribe(&self) -> broadcast::Receiver<Vec<Change>>;
}
