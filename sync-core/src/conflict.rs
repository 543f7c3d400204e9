//! Conflict policy between a pending local version and a cloud version.
//!
//! Whole-record last-writer-wins on the origin modification dates, with a
//! field-level merge for flight plan execution progress. Execution progress
//! only ever moves forward, so losing it to an unrelated edit from another
//! device would be silent data loss.

use sync_types::{EntityBody, FlightPlan, RemoteRecord, Timestamp};

/// Which side of a conflict wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// The pending local version is kept and pushed again.
    Local,
    /// The cloud version replaces the local one.
    Remote,
}

/// Outcome of a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Winning side.
    pub winner: Winner,
    /// Body to store locally.
    pub body: EntityBody,
    /// The stored body differs from the cloud version and must be pushed.
    pub diverges_from_remote: bool,
}

/// Last-writer-wins on origin modification dates. Ties go to the cloud.
pub fn last_writer(local_modified: Timestamp, remote_modified: Timestamp) -> Winner {
    if local_modified > remote_modified {
        Winner::Local
    } else {
        Winner::Remote
    }
}

/// Resolve a pending local version against a cloud version.
pub fn resolve(local: &EntityBody, local_modified: Timestamp, remote: &RemoteRecord) -> Resolution {
    match last_writer(local_modified, remote.modified) {
        Winner::Local => {
            let body = merge_bodies(local, &remote.body);
            let diverges_from_remote = remote.deleted || body != remote.body;
            Resolution {
                winner: Winner::Local,
                body,
                diverges_from_remote,
            }
        }
        Winner::Remote if remote.deleted => Resolution {
            winner: Winner::Remote,
            body: local.clone(),
            diverges_from_remote: false,
        },
        Winner::Remote => {
            let body = merge_bodies(&remote.body, local);
            let diverges_from_remote = body != remote.body;
            Resolution {
                winner: Winner::Remote,
                body,
                diverges_from_remote,
            }
        }
    }
}

/// Merge the losing body into the winning one.
///
/// Only flight plans carry mergeable fields; every other kind takes the
/// winner wholesale.
pub fn merge_bodies(winner: &EntityBody, loser: &EntityBody) -> EntityBody {
    match (winner, loser) {
        (EntityBody::FlightPlan(w), EntityBody::FlightPlan(l)) => {
            EntityBody::FlightPlan(merge_flight_plan(w, l))
        }
        _ => winner.clone(),
    }
}

/// Field-level merge of flight plan execution progress.
///
/// - `has_reached_first_waypoint` is sticky: `Some(true)` on either side wins.
/// - `execution_rank`, `last_mission_item_executed` and
///   `uploaded_media_count` take the maximum.
/// - Everything else follows the winner.
pub fn merge_flight_plan(winner: &FlightPlan, loser: &FlightPlan) -> FlightPlan {
    let mut merged = winner.clone();
    merged.has_reached_first_waypoint = match (
        winner.has_reached_first_waypoint,
        loser.has_reached_first_waypoint,
    ) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (w, l) => w.or(l),
    };
    merged.execution_rank = winner.execution_rank.max(loser.execution_rank);
    merged.last_mission_item_executed = winner
        .last_mission_item_executed
        .max(loser.last_mission_item_executed);
    merged.uploaded_media_count = winner.uploaded_media_count.max(loser.uploaded_media_count);
    merged
}
