//! Transactional write batches with optimistic revision guards.

use sync_types::{EntityKind, Record, RecordUuid};

/// Precondition checked before a write is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// The uuid must not exist yet.
    Absent,
    /// The stored revision must equal this value.
    Revision(u64),
    /// No precondition.
    Any,
}

/// One write of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or replace a record. Its `revision` field is ignored; the
    /// store assigns the next one.
    Put {
        /// Record to store.
        record: Record,
        /// Precondition.
        guard: Guard,
    },
    /// Physically remove a record.
    Remove {
        /// Uuid to remove.
        uuid: RecordUuid,
        /// Precondition.
        guard: Guard,
    },
}

impl WriteOp {
    /// Uuid targeted by this write.
    pub fn uuid(&self) -> RecordUuid {
        match self {
            WriteOp::Put { record, .. } => record.uuid,
            WriteOp::Remove { uuid, .. } => *uuid,
        }
    }
}

/// Writes committed together in one transaction.
///
/// A write whose guard does not hold is skipped and reported in
/// [`BatchOutcome::rejected`]; the rest of the batch still commits. Any
/// storage error rolls the whole batch back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// An empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record that must not exist yet.
    pub fn create(&mut self, record: Record) -> &mut Self {
        self.ops.push(WriteOp::Put {
            record,
            guard: Guard::Absent,
        });
        self
    }

    /// Replace a record read at `record.revision`.
    pub fn update(&mut self, record: Record) -> &mut Self {
        let guard = Guard::Revision(record.revision);
        self.ops.push(WriteOp::Put { record, guard });
        self
    }

    /// Insert or replace a record with an explicit guard.
    pub fn put(&mut self, record: Record, guard: Guard) -> &mut Self {
        self.ops.push(WriteOp::Put { record, guard });
        self
    }

    /// Remove a record read at `record.revision`.
    pub fn remove(&mut self, record: &Record) -> &mut Self {
        self.ops.push(WriteOp::Remove {
            uuid: record.uuid,
            guard: Guard::Revision(record.revision),
        });
        self
    }

    /// Append every write of `other`.
    pub fn extend(&mut self, other: WriteBatch) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    /// Number of writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch holds no write.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The writes, in order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consume into the writes.
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Result of a committed batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Records as stored, with their new revisions.
    pub written: Vec<Record>,
    /// Uuids physically removed.
    pub removed: Vec<RecordUuid>,
    /// Uuids whose guard did not hold.
    pub rejected: Vec<RecordUuid>,
}

impl BatchOutcome {
    /// Stored version of `uuid`, if it was written.
    pub fn written(&self, uuid: RecordUuid) -> Option<&Record> {
        self.written.iter().find(|r| r.uuid == uuid)
    }

    /// Whether every guard held.
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    /// First write of the uuid.
    Created,
    /// Later write, including tombstoning.
    Updated,
    /// Physical removal.
    Removed,
}

/// One committed change, broadcast to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Change {
    /// Kind of the changed record.
    pub kind: EntityKind,
    /// Uuid of the changed record.
    pub uuid: RecordUuid,
    /// What happened.
    pub op: ChangeOp,
}
