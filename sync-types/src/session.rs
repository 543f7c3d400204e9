//! Session record: per-device bookkeeping of sync progress.

use crate::ids::{RecordUuid, Timestamp};
use crate::kind::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Incremental sync points for one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KindWatermarks {
    /// Latest cloud-side timestamp consumed by pull.
    pub pulled: Option<Timestamp>,
    /// Latest local modification date successfully pushed.
    pub pushed: Option<Timestamp>,
    /// Latest cloud deletion observed (pull or sanity pass).
    pub cloud_deletion: Option<Timestamp>,
}

/// Markers other devices of the same account read to detect progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MultiSessionMarks {
    /// Last cycle started by the background timer.
    pub latest_bg_date: Option<Timestamp>,
    /// Last cycle that completed without a structural error.
    pub latest_successful_date: Option<Timestamp>,
    /// Last cycle started, whatever its outcome.
    pub latest_tried_date: Option<Timestamp>,
}

/// Gate of the full reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SanityMarks {
    /// Last completed sanity pass.
    pub latest_successful_date: Option<Timestamp>,
    /// Last attempted sanity pass.
    pub latest_tried_date: Option<Timestamp>,
    /// Disables the pass entirely.
    pub skip: bool,
}

/// One session per device and account.
///
/// The session is itself synchronized, which is how devices sharing an
/// account see each other's [`MultiSessionMarks`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Owning user.
    pub user_uuid: RecordUuid,
    /// Identifier of the device this session belongs to.
    pub device_id: String,
    /// Set once the app has completed its first launch flow.
    pub inc_should_launch: bool,
    /// Multi-device coordination markers.
    pub multi_session: MultiSessionMarks,
    /// Incremental watermarks per kind.
    #[serde(default)]
    pub watermarks: BTreeMap<EntityKind, KindWatermarks>,
    /// Full reconciliation markers.
    pub sanity: SanityMarks,
}

impl Session {
    /// A fresh session with no sync history.
    pub fn new(user_uuid: RecordUuid, device_id: impl Into<String>) -> Self {
        Self {
            user_uuid,
            device_id: device_id.into(),
            inc_should_launch: false,
            multi_session: MultiSessionMarks::default(),
            watermarks: BTreeMap::new(),
            sanity: SanityMarks::default(),
        }
    }

    /// Watermarks of `kind`, defaulted when the kind was never synced.
    pub fn watermarks(&self, kind: EntityKind) -> KindWatermarks {
        self.watermarks.get(&kind).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_has_empty_watermarks() {
        let session = Session::new(RecordUuid::new(), "device-a");
        assert_eq!(session.watermarks(EntityKind::Flight), KindWatermarks::default());
    }

    #[test]
    fn watermarks_survive_json() {
        let mut session = Session::new(RecordUuid::new(), "device-a");
        session.watermarks.insert(
            EntityKind::FlightPlan,
            KindWatermarks {
                pulled: Some(Timestamp::from_millis(42)),
                ..Default::default()
            },
        );
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"flight_plan\""));
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.watermarks(EntityKind::FlightPlan).pulled,
            Some(Timestamp::from_millis(42))
        );
    }
}
