//! The nine record kinds of the Pictor data layer.

use crate::error::TypesError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of a synchronizable record.
///
/// Variants are declared in parent-before-child order, which is also the
/// tie-break used when computing the push order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Account owning every other record.
    User,
    /// Per-device bookkeeping record.
    Session,
    /// A paired drone.
    Drone,
    /// A flight plan container.
    Project,
    /// A project managed by an external processing service.
    ProjectExternal,
    /// A mission belonging to a project.
    FlightPlan,
    /// A recorded flight.
    Flight,
    /// Join record linking a flight plan to a flight that executed it.
    ExecutionLink,
    /// Shared image blob.
    Thumbnail,
}

impl EntityKind {
    /// Every kind, in declaration order.
    pub const ALL: [EntityKind; 9] = [
        EntityKind::User,
        EntityKind::Session,
        EntityKind::Drone,
        EntityKind::Project,
        EntityKind::ProjectExternal,
        EntityKind::FlightPlan,
        EntityKind::Flight,
        EntityKind::ExecutionLink,
        EntityKind::Thumbnail,
    ];

    /// Stable textual name, used as a storage key.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Session => "session",
            EntityKind::Drone => "drone",
            EntityKind::Project => "project",
            EntityKind::ProjectExternal => "project_external",
            EntityKind::FlightPlan => "flight_plan",
            EntityKind::Flight => "flight",
            EntityKind::ExecutionLink => "execution_link",
            EntityKind::Thumbnail => "thumbnail",
        }
    }
}

impl FromStr for EntityKind {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TypesError::UnknownKind(s.to_string()))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
