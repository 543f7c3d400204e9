//! Records as exchanged with the cloud catalog.

use crate::entity::{EntityBody, Record};
use crate::ids::{CloudId, RecordUuid, Timestamp};
use crate::kind::EntityKind;
use serde::{Deserialize, Serialize};

/// A record as the cloud holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Cloud identifier.
    pub cloud_id: CloudId,
    /// Uuid assigned by the origin device.
    pub uuid: RecordUuid,
    /// Kind of the record.
    pub kind: EntityKind,
    /// Last known payload. Kept on delete markers.
    pub body: EntityBody,
    /// Local modification date of the edit that produced this version.
    pub modified: Timestamp,
    /// Cloud write time of this version. Strictly increasing per cloud.
    pub cloud_modified: Timestamp,
    /// Delete marker.
    pub deleted: bool,
}

/// One page of a change feed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangePage {
    /// Changes ordered by `cloud_modified`.
    pub records: Vec<RemoteRecord>,
    /// Index of the next page, `None` on the last one.
    pub next_page: Option<u32>,
}

/// A record version sent to the cloud.
#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    /// Local uuid, used by the cloud to deduplicate retried creations.
    pub uuid: RecordUuid,
    /// Known cloud id, unassigned for a first push.
    pub cloud_id: CloudId,
    /// Payload.
    pub body: EntityBody,
    /// Local modification date of this version.
    pub modified: Timestamp,
    /// Cloud write time of the version this one was edited from, `None`
    /// when the record never came back from the cloud.
    pub base: Option<Timestamp>,
}

impl From<&Record> for PushRequest {
    fn from(record: &Record) -> Self {
        Self {
            uuid: record.uuid,
            cloud_id: record.meta.cloud_id,
            body: record.body.clone(),
            modified: record.meta.local_modification_date,
            base: record.meta.cloud_modification_date,
        }
    }
}

/// Cloud acknowledgement of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushAck {
    /// Assigned (or confirmed) cloud id.
    pub cloud_id: CloudId,
    /// Cloud write time of the accepted version.
    pub cloud_modified: Timestamp,
}
