//! Cloud catalog abstraction.
//!
//! The engine talks to the cloud only through [`CloudClient`]. The real
//! HTTP client lives in the app; [`MockCloud`] is a complete in-process
//! implementation used by tests and the CLI.
//!
//! # Contract
//!
//! - `fetch_changes` is idempotent and safe to re-fetch.
//! - `push` is idempotent given the same uuid (the cloud deduplicates), and
//!   conditional: a version older than the cloud's, or edited from a cloud
//!   version that has since been replaced (see `PushRequest::base`), is
//!   answered with [`CloudError::Conflict`] carrying the cloud's copy.
//! - `delete` of an already deleted record succeeds.

mod mock;

pub use mock::{MockCloud, MockCloudSnapshot, PushLogEntry};

use async_trait::async_trait;
use sync_types::{
    ChangePage, CloudId, EntityKind, PushAck, PushRequest, RemoteRecord, SynchroError, Timestamp,
};
use thiserror::Error;

/// Cloud call errors.
#[derive(Debug, Clone, Error)]
pub enum CloudError {
    /// Network or server hiccup, worth retrying.
    #[error("transient cloud error: {0}")]
    Transient(String),

    /// The call did not answer in time.
    #[error("cloud call timed out")]
    Timeout,

    /// The cloud rejected this version of the record.
    #[error("rejected by cloud: {0}")]
    Validation(String),

    /// The record does not exist (any more) on the cloud.
    #[error("record not found on cloud")]
    NotFound,

    /// The cloud holds a newer version.
    #[error("cloud holds a newer version of {}", remote.uuid)]
    Conflict {
        /// The cloud's current copy.
        remote: Box<RemoteRecord>,
    },
}

impl CloudError {
    /// The persisted failure kind, for errors that leave a record failed.
    ///
    /// `NotFound` and `Conflict` are reconciled on the spot and map to
    /// `None`.
    pub fn as_synchro_error(&self) -> Option<SynchroError> {
        match self {
            CloudError::Transient(_) => Some(SynchroError::Transient),
            CloudError::Timeout => Some(SynchroError::Timeout),
            CloudError::Validation(_) => Some(SynchroError::Validation),
            CloudError::NotFound | CloudError::Conflict { .. } => None,
        }
    }
}

/// Client of the cloud catalog.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Changes of `kind` written after `since` (everything when `None`),
    /// ordered by cloud write time, delete markers included.
    async fn fetch_changes(
        &self,
        kind: EntityKind,
        since: Option<Timestamp>,
        page: u32,
    ) -> Result<ChangePage, CloudError>;

    /// Cloud ids of every live record of `kind`.
    async fn fetch_all_ids(&self, kind: EntityKind) -> Result<Vec<CloudId>, CloudError>;

    /// Create or update a record.
    async fn push(&self, kind: EntityKind, request: &PushRequest) -> Result<PushAck, CloudError>;

    /// Delete a record.
    async fn delete(&self, kind: EntityKind, cloud_id: CloudId) -> Result<(), CloudError>;
}
