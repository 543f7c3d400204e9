//! Query filters over stored records.

use sync_types::{EntityKind, Record, RecordUuid, SynchroState};

/// How tombstoned records are treated by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tombstones {
    /// Live records only (the default).
    #[default]
    Exclude,
    /// Live records and tombstones.
    Include,
    /// Tombstones only.
    Only,
}

/// Conjunctive filter over stored records.
///
/// Every field left unset matches everything. The default filter returns
/// all live records of all kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Restrict to one kind.
    pub kind: Option<EntityKind>,
    /// Restrict to records owned by a user.
    pub owner: Option<RecordUuid>,
    /// Restrict to records holding a reference to this uuid.
    pub referencing: Option<RecordUuid>,
    /// Restrict to these uuids.
    pub uuids: Option<Vec<RecordUuid>>,
    /// Restrict to these synchronization states (empty matches any).
    pub states: Vec<SynchroState>,
    /// Restrict on whether a cloud id is assigned.
    pub cloud_assigned: Option<bool>,
    /// Tombstone handling.
    pub tombstones: Tombstones,
    /// Maximum number of rows.
    pub limit: Option<u32>,
}

impl RecordFilter {
    /// Live records of one kind.
    pub fn kind(kind: EntityKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Live records of any kind.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only records owned by `user`.
    pub fn owned_by(mut self, user: RecordUuid) -> Self {
        self.owner = Some(user);
        self
    }

    /// Only records referencing `target`.
    pub fn referencing(mut self, target: RecordUuid) -> Self {
        self.referencing = Some(target);
        self
    }

    /// Only these uuids.
    pub fn uuids(mut self, uuids: impl IntoIterator<Item = RecordUuid>) -> Self {
        self.uuids = Some(uuids.into_iter().collect());
        self
    }

    /// Only records in one of these states.
    pub fn in_states(mut self, states: impl IntoIterator<Item = SynchroState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    /// Only records with (or without) a cloud id.
    pub fn cloud_assigned(mut self, assigned: bool) -> Self {
        self.cloud_assigned = Some(assigned);
        self
    }

    /// Include tombstones.
    pub fn with_deleted(mut self) -> Self {
        self.tombstones = Tombstones::Include;
        self
    }

    /// Only tombstones.
    pub fn only_deleted(mut self) -> Self {
        self.tombstones = Tombstones::Only;
        self
    }

    /// Set the tombstone handling.
    pub fn tombstones(mut self, tombstones: Tombstones) -> Self {
        self.tombstones = tombstones;
        self
    }

    /// At most `limit` rows.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate the filter against an in-memory record.
    ///
    /// Mirrors the SQL evaluation, except for `limit`.
    pub fn matches(&self, record: &Record) -> bool {
        if self.kind.is_some_and(|kind| kind != record.kind()) {
            return false;
        }
        if let Some(owner) = self.owner {
            if record.body.owner() != Some(owner) {
                return false;
            }
        }
        if let Some(target) = self.referencing {
            if !record.body.references().iter().any(|r| r.target == target) {
                return false;
            }
        }
        if let Some(uuids) = &self.uuids {
            if !uuids.contains(&record.uuid) {
                return false;
            }
        }
        if !self.states.is_empty() && !self.states.contains(&record.meta.status.state()) {
            return false;
        }
        if let Some(assigned) = self.cloud_assigned {
            if record.meta.cloud_id.is_assigned() != assigned {
                return false;
            }
        }
        match self.tombstones {
            Tombstones::Exclude => !record.meta.is_deleted,
            Tombstones::Include => true,
            Tombstones::Only => record.meta.is_deleted,
        }
    }
}
