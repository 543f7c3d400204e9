//! Dependency order across entity kinds.
//!
//! Parent/child dependencies are declared as data. The push order is the
//! topological sort of that graph (ties broken by declaration order of
//! [`EntityKind`]); deletes run in the reverse order so children leave the
//! cloud before their parents.

use std::collections::{BTreeMap, BTreeSet};
use sync_types::EntityKind;
use thiserror::Error;

/// A child kind whose records reference records of a parent kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    /// Referencing kind.
    pub child: EntityKind,
    /// Referenced kind.
    pub parent: EntityKind,
}

const fn dep(child: EntityKind, parent: EntityKind) -> Dependency {
    Dependency { child, parent }
}

/// Push dependencies of the Pictor data model.
///
/// Thumbnails are shared blobs, referenced but never depended upon.
pub const DEPENDENCIES: &[Dependency] = &[
    dep(EntityKind::Session, EntityKind::User),
    dep(EntityKind::Drone, EntityKind::User),
    dep(EntityKind::Project, EntityKind::User),
    dep(EntityKind::ProjectExternal, EntityKind::User),
    dep(EntityKind::FlightPlan, EntityKind::User),
    dep(EntityKind::FlightPlan, EntityKind::Project),
    dep(EntityKind::FlightPlan, EntityKind::ProjectExternal),
    dep(EntityKind::Flight, EntityKind::User),
    dep(EntityKind::ExecutionLink, EntityKind::User),
    dep(EntityKind::ExecutionLink, EntityKind::FlightPlan),
    dep(EntityKind::ExecutionLink, EntityKind::Flight),
    dep(EntityKind::Thumbnail, EntityKind::User),
];

/// Dependency graph errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    /// The declared dependencies contain a cycle.
    #[error("dependency cycle involving {0}")]
    Cycle(EntityKind),
}

/// Topologically sorted entity kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyOrder {
    order: Vec<EntityKind>,
}

impl DependencyOrder {
    /// Sort all kinds according to `deps` (Kahn's algorithm).
    pub fn new(deps: &[Dependency]) -> Result<Self, OrderError> {
        let mut indegree: BTreeMap<EntityKind, usize> =
            EntityKind::ALL.iter().map(|kind| (*kind, 0)).collect();
        for d in deps {
            *indegree.entry(d.child).or_default() += 1;
        }

        let mut ready: BTreeSet<EntityKind> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(kind, _)| *kind)
            .collect();
        let mut order = Vec::with_capacity(indegree.len());

        while let Some(kind) = ready.pop_first() {
            order.push(kind);
            for d in deps.iter().filter(|d| d.parent == kind) {
                if let Some(degree) = indegree.get_mut(&d.child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(d.child);
                    }
                }
            }
        }

        if let Some((kind, _)) = indegree.iter().find(|(_, degree)| **degree > 0) {
            return Err(OrderError::Cycle(*kind));
        }
        Ok(Self { order })
    }

    /// Order of the Pictor data model.
    pub fn standard() -> Result<Self, OrderError> {
        Self::new(DEPENDENCIES)
    }

    /// Parents before children.
    pub fn push_order(&self) -> &[EntityKind] {
        &self.order
    }

    /// Children before parents.
    pub fn delete_order(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.order.iter().rev().copied()
    }

    /// Position of `kind` in the push order.
    pub fn rank(&self, kind: EntityKind) -> usize {
        self.order
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(self.order.len())
    }

    /// Whether every declared parent precedes its children.
    pub fn respects(&self, deps: &[Dependency]) -> bool {
        deps.iter()
            .all(|d| self.rank(d.parent) < self.rank(d.child))
    }
}
