//! Error types of the repository, engine and client layers.

use crate::config::ConfigError;
use sync_store::StoreError;
use sync_types::{EntityKind, RecordUuid};
use thiserror::Error;

/// Errors returned by repositories.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The record is absent or tombstoned.
    #[error("record not found: {0}")]
    NotFound(RecordUuid),

    /// A referenced record is absent, tombstoned or of the wrong kind.
    #[error("missing {role} parent {target}")]
    MissingParent {
        /// Field holding the reference.
        role: &'static str,
        /// Referenced uuid.
        target: RecordUuid,
    },

    /// The record exists with another kind.
    #[error("record {uuid} is a {found}, expected a {expected}")]
    WrongKind {
        /// Record uuid.
        uuid: RecordUuid,
        /// Kind the caller asked for.
        expected: EntityKind,
        /// Kind actually stored.
        found: EntityKind,
    },

    /// A record with this uuid already exists.
    #[error("record already exists: {0}")]
    AlreadyExists(RecordUuid),

    /// Concurrent writers kept winning the revision race.
    #[error("record {0} is contended, try again")]
    Contended(RecordUuid),

    /// Local store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Errors that abort a sync cycle.
///
/// Record-level cloud failures never show up here: they are persisted on
/// the record and retried.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Local store failure. The current phase is abandoned without moving
    /// any watermark.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// No session record for this device.
    #[error("no session for device {0}")]
    NoSession(String),

    /// The declared entity dependencies do not form an order.
    #[error("invalid dependency order: {0}")]
    InvalidOrder(#[from] sync_core::OrderError),
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Storage(e) => EngineError::Storage(e),
            other => EngineError::Storage(StoreError::Unavailable(other.to_string())),
        }
    }
}

/// Errors returned by [`PictorClient`](crate::PictorClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Repository failure.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Sync cycle failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Local store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The operation needs a logged-in account.
    #[error("no account is logged in")]
    NotLoggedIn,

    /// Another account is logged in.
    #[error("account {0} is logged in, log out first")]
    AlreadyLoggedIn(RecordUuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let uuid = RecordUuid::ANONYMOUS_USER;
        let err = RepositoryError::WrongKind {
            uuid,
            expected: EntityKind::Project,
            found: EntityKind::Flight,
        };
        assert_eq!(
            err.to_string(),
            format!("record {uuid} is a flight, expected a project")
        );
    }

    #[test]
    fn repository_storage_maps_to_engine_storage() {
        let err: EngineError = RepositoryError::Storage(StoreError::Unavailable("gone".into())).into();
        assert!(matches!(err, EngineError::Storage(StoreError::Unavailable(_))));
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RepositoryError>();
        assert_send_sync::<EngineError>();
        assert_send_sync::<ClientError>();
    }
}
