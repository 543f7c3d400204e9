//! Identity and time types for the Pictor data layer.

use crate::error::TypesError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Locally generated primary key of a record.
///
/// Assigned once at creation and never reused. Devices keep the uuid of the
/// origin device when they pull a record, so the same uuid identifies a
/// record everywhere.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordUuid(Uuid);

impl RecordUuid {
    /// The fixed uuid of the anonymous user owning data created before login.
    pub const ANONYMOUS_USER: Self = Self(Uuid::nil());

    /// Generate a new random uuid.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing uuid.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying uuid.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Whether this is the anonymous user uuid.
    pub fn is_anonymous(&self) -> bool {
        *self == Self::ANONYMOUS_USER
    }
}

impl Default for RecordUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for RecordUuid {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| TypesError::InvalidUuid(s.to_string()))
    }
}

impl fmt::Display for RecordUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for RecordUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordUuid({})", &self.to_string()[..8])
    }
}

/// Cloud-side identifier of a record.
///
/// `0` until the cloud first acknowledges the record. Once non-zero it is
/// globally unique per kind and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloudId(i64);

impl CloudId {
    /// The unassigned cloud id.
    pub const UNASSIGNED: Self = Self(0);

    /// Create a cloud id from its raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    pub fn value(&self) -> i64 {
        self.0
    }

    /// Whether the cloud has assigned this id.
    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for CloudId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the Unix epoch.
///
/// Used for every local and cloud date in the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Self = Self(0);

    /// Create a timestamp from milliseconds since the epoch.
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(millis)
    }

    /// Milliseconds since the epoch.
    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// This timestamp shifted forward by `duration`.
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        let diff = self.0.saturating_sub(earlier.0);
        Duration::from_millis(diff.max(0) as u64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
