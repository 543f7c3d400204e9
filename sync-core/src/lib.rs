//! # sync-core
//!
//! Pure logic for the Pictor sync engine (no I/O, instant tests).
//!
//! This crate implements the state machines and policies of synchronization
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (local store, cloud) is performed by `sync-client`, which
//! interprets the decisions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod conflict;
pub mod order;
pub mod purge;
pub mod retry;
pub mod state;
pub mod watermark;

pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::{last_writer, merge_bodies, merge_flight_plan, resolve, Resolution, Winner};
pub use order::{Dependency, DependencyOrder, OrderError, DEPENDENCIES};
pub use purge::{PurgeDecision, PurgePolicy};
pub use retry::RetryPolicy;
pub use state::{
    detach_from_account, meta_from_remote, on_event, RecordAction, RecordEvent,
    TransitionContext,
};
pub use watermark::{
    advance, peer_progressed, PullPolicy, SanityPolicy, SyncTrigger, WatermarkTracker,
};
