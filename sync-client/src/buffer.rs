//! Edit buffer for records with a push in flight.
//!
//! A record in the `syncing` state must not be rewritten by its repository:
//! the push outcome would clobber the edit, or the edit would clobber the
//! outcome. Local mutations of such records are held here, one entry per
//! uuid, and replayed once the outcome is committed.

use dashmap::DashMap;
use sync_types::{EntityBody, Record, RecordUuid};

/// A local mutation waiting for an in-flight push to finish.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    /// Replace the body.
    Update(EntityBody),
    /// Soft-delete the record.
    Delete,
    /// Revive the record with this body.
    Restore(EntityBody),
}

impl PendingOp {
    /// Fold a newer operation into this one.
    fn merge(self, newer: PendingOp) -> PendingOp {
        match (self, newer) {
            // Editing a revived record keeps it revived
            (PendingOp::Restore(_), PendingOp::Update(body)) => PendingOp::Restore(body),
            (_, newer) => newer,
        }
    }
}

/// Pending local mutations keyed by record uuid.
#[derive(Debug, Default)]
pub struct EditBuffer {
    pending: DashMap<RecordUuid, PendingOp>,
}

impl EditBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `op` for `uuid`, merged with any operation already held.
    pub fn push(&self, uuid: RecordUuid, op: PendingOp) {
        let merged = match self.pending.remove(&uuid) {
            Some((_, held)) => held.merge(op),
            None => op,
        };
        self.pending.insert(uuid, merged);
    }

    /// Remove and return the operation held for `uuid`.
    pub fn take(&self, uuid: RecordUuid) -> Option<PendingOp> {
        self.pending.remove(&uuid).map(|(_, op)| op)
    }

    /// Put back an operation taken too early, unless a newer one arrived.
    pub fn restore_if_vacant(&self, uuid: RecordUuid, op: PendingOp) {
        self.pending.entry(uuid).or_insert(op);
    }

    /// The operation held for `uuid`.
    pub fn peek(&self, uuid: RecordUuid) -> Option<PendingOp> {
        self.pending.get(&uuid).map(|entry| entry.value().clone())
    }

    /// Drop the operation held for `uuid`.
    pub fn discard(&self, uuid: RecordUuid) {
        self.pending.remove(&uuid);
    }

    /// Uuids with a held operation.
    pub fn uuids(&self) -> Vec<RecordUuid> {
        self.pending.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of held operations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.pending.clear();
    }

    /// The record as its owner sees it, held operation applied.
    ///
    /// Only the body and the tombstone flag are overlaid; sync fields stay
    /// as stored.
    pub fn overlay(&self, mut record: Record) -> Record {
        match self.peek(record.uuid) {
            None => record,
            Some(PendingOp::Update(body)) => {
                record.body = body;
                record
            }
            Some(PendingOp::Delete) => {
                record.meta.is_deleted = true;
                record
            }
            Some(PendingOp::Restore(body)) => {
                record.body = body;
                record.meta.is_deleted = false;
                record.meta.deleted_date = None;
                record
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{Drone, Entity, SyncMeta, Timestamp};

    fn drone(name: &str) -> EntityBody {
        Drone {
            user_uuid: RecordUuid::ANONYMOUS_USER,
            serial: "PI040".into(),
            model_id: "anafi".into(),
            name: name.into(),
            is_paired: false,
        }
        .into_body()
    }

    fn record(name: &str) -> Record {
        Record {
            uuid: RecordUuid::new(),
            revision: 3,
            meta: SyncMeta::new_local(Timestamp::from_millis(1)),
            body: drone(name),
        }
    }

    // =========================================================================
    // Merge Tests
    // =========================================================================

    #[test]
    fn newest_update_wins() {
        let buffer = EditBuffer::new();
        let uuid = RecordUuid::new();
        buffer.push(uuid, PendingOp::Update(drone("a")));
        buffer.push(uuid, PendingOp::Update(drone("b")));

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.take(uuid), Some(PendingOp::Update(drone("b"))));
        assert!(buffer.is_empty());
    }

    #[test]
    fn delete_supersedes_update() {
        let buffer = EditBuffer::new();
        let uuid = RecordUuid::new();
        buffer.push(uuid, PendingOp::Update(drone("a")));
        buffer.push(uuid, PendingOp::Delete);
        assert_eq!(buffer.peek(uuid), Some(PendingOp::Delete));
    }

    #[test]
    fn restore_supersedes_delete() {
        let buffer = EditBuffer::new();
        let uuid = RecordUuid::new();
        buffer.push(uuid, PendingOp::Delete);
        buffer.push(uuid, PendingOp::Restore(drone("back")));
        assert_eq!(buffer.peek(uuid), Some(PendingOp::Restore(drone("back"))));
    }

    #[test]
    fn edit_after_restore_stays_a_restore() {
        let buffer = EditBuffer::new();
        let uuid = RecordUuid::new();
        buffer.push(uuid, PendingOp::Restore(drone("back")));
        buffer.push(uuid, PendingOp::Update(drone("edited")));
        assert_eq!(buffer.peek(uuid), Some(PendingOp::Restore(drone("edited"))));
    }

    #[test]
    fn restore_if_vacant_keeps_newer_op() {
        let buffer = EditBuffer::new();
        let uuid = RecordUuid::new();
        buffer.push(uuid, PendingOp::Update(drone("newer")));
        buffer.restore_if_vacant(uuid, PendingOp::Update(drone("older")));
        assert_eq!(buffer.peek(uuid), Some(PendingOp::Update(drone("newer"))));

        buffer.discard(uuid);
        buffer.restore_if_vacant(uuid, PendingOp::Update(drone("older")));
        assert_eq!(buffer.peek(uuid), Some(PendingOp::Update(drone("older"))));
    }

    // =========================================================================
    // Overlay Tests
    // =========================================================================

    #[test]
    fn overlay_without_op_is_identity() {
        let buffer = EditBuffer::new();
        let r = record("a");
        assert_eq!(buffer.overlay(r.clone()), r);
    }

    #[test]
    fn overlay_applies_update_and_keeps_meta() {
        let buffer = EditBuffer::new();
        let r = record("a");
        buffer.push(r.uuid, PendingOp::Update(drone("b")));

        let seen = buffer.overlay(r.clone());
        assert_eq!(seen.body, drone("b"));
        assert_eq!(seen.meta, r.meta);
        assert_eq!(seen.revision, 3);
    }

    #[test]
    fn overlay_hides_deleted_and_revives_restored() {
        let buffer = EditBuffer::new();
        let mut r = record("a");
        buffer.push(r.uuid, PendingOp::Delete);
        assert!(buffer.overlay(r.clone()).is_deleted());

        r.meta.is_deleted = true;
        r.meta.deleted_date = Some(Timestamp::from_millis(2));
        buffer.push(r.uuid, PendingOp::Restore(drone("c")));
        let seen = buffer.overlay(r);
        assert!(!seen.is_deleted());
        assert_eq!(seen.meta.deleted_date, None);
    }

    #[test]
    fn clear_drops_everything() {
        let buffer = EditBuffer::new();
        buffer.push(RecordUuid::new(), PendingOp::Delete);
        buffer.push(RecordUuid::new(), PendingOp::Delete);
        assert_eq!(buffer.uuids().len(), 2);
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
