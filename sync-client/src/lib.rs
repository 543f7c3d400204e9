//! # sync-client
//!
//! Data layer of the Pictor drone app: typed repositories over a local
//! store, and the engine keeping that store in sync with the cloud catalog.
//!
//! This is the library the app uses to read and write its data.
//!
//! ## Features
//!
//! - **Offline-first**: every write lands locally first; sync is a
//!   background concern
//! - **Dependency-ordered sync**: parents are pushed before children,
//!   deletions propagate children first
//! - **Last-writer-wins conflicts** with field-level merge of flight plan
//!   execution state
//! - **Soft-delete with grace**: tombstones are purged once synced and old
//!   enough
//! - **Pure State Machine**: uses sync-core for side-effect-free decisions
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{Config, MockCloud, PictorClient};
//! use sync_types::Project;
//!
//! let client = PictorClient::open_sqlite(Config::default(), Arc::new(MockCloud::new())).await?;
//!
//! // Local write, pushed by the next cycle
//! let project = client.repository::<Project>().create(draft).await?;
//!
//! // Run a cycle now
//! client.sync_now().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod client;
pub mod cloud;
pub mod config;
pub mod engine;
pub mod error;
pub mod records;
pub mod repository;
pub mod resolver;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use buffer::{EditBuffer, PendingOp};
pub use client::{force_sanity, AccountProfile, PictorClient};
pub use cloud::{CloudClient, CloudError, MockCloud, MockCloudSnapshot, PushLogEntry};
pub use config::{Config, ConfigError};
pub use engine::{
    CycleOutcome, CycleReport, EngineSettings, SkipReason, SyncEngine, SyncPause, SyncStatus,
};
pub use error::{ClientError, EngineError, RepositoryError};
pub use records::Records;
pub use repository::{ChangeSubscription, FlightSummary, Repository, Stored};
pub use resolver::Readiness;
pub use scheduler::{spawn_scheduler, SchedulerCommand, SchedulerHandle};
