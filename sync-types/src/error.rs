//! Error types for the Pictor data model.

use thiserror::Error;

/// Errors raised while parsing or converting data model values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypesError {
    /// A string is not a valid uuid.
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),

    /// A string does not name an entity kind.
    #[error("unknown entity kind: {0}")]
    UnknownKind(String),

    /// A string does not name a synchronization state.
    #[error("unknown synchro state: {0}")]
    UnknownState(String),
}
