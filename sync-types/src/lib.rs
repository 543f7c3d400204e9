//! # sync-types
//!
//! Data model of the Pictor sync engine.
//!
//! This crate provides the foundational types used across all Pictor crates:
//! - [`RecordUuid`], [`CloudId`], [`Timestamp`] - Identity and time
//! - [`EntityKind`], [`EntityBody`], [`Record`] - The nine record kinds and their payloads
//! - [`SyncMeta`], [`SynchroStatus`], [`SynchroError`] - Per-record sync state
//! - [`Session`] - Per-device watermarks and coordination markers
//! - [`RemoteRecord`], [`PushRequest`], [`PushAck`] - Cloud-side shapes
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod entity;
mod error;
mod ids;
mod kind;
mod remote;
mod session;
mod status;

pub use entity::{
    Drone, Entity, EntityBody, ExecutionLink, Flight, FlightPlan, FlightPlanState, Project,
    ProjectExternal, ProjectType, Record, RefStrength, Reference, Thumbnail, User,
};
pub use error::TypesError;
pub use ids::{CloudId, RecordUuid, Timestamp};
pub use kind::EntityKind;
pub use remote::{ChangePage, PushAck, PushRequest, RemoteRecord};
pub use session::{KindWatermarks, MultiSessionMarks, SanityMarks, Session};
pub use status::{SyncMeta, SynchroError, SynchroState, SynchroStatus};
